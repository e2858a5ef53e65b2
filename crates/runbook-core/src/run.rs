//! Run records, the closed `RunEvent` type and the run state machine.

use crate::types::{OutputStream, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Allocate a fresh, opaque run id.
pub fn generate_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ---------------------------------------------------------------------------
// RunEvent
// ---------------------------------------------------------------------------

/// One event in a run's ordered stream. Exactly one of `Completed` / `Error`
/// ends every run that terminates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    #[serde(rename = "run_started")]
    Started { started_at: DateTime<Utc> },
    #[serde(rename = "run_output")]
    Output { stream: OutputStream, chunk: String },
    #[serde(rename = "run_completed")]
    Completed {
        exit_code: Option<i32>,
        signal: Option<String>,
        success: bool,
        completed_at: DateTime<Utc>,
    },
    #[serde(rename = "run_error")]
    Error { message: String },
}

impl RunEvent {
    /// Wire name of the event, also used as the SSE `event:` field.
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::Started { .. } => "run_started",
            RunEvent::Output { .. } => "run_output",
            RunEvent::Completed { .. } => "run_completed",
            RunEvent::Error { .. } => "run_error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::Completed { .. } | RunEvent::Error { .. })
    }
}

/// A `RunEvent` addressed to a run, as published on the event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMessage {
    pub run_id: String,
    pub server_id: String,
    pub action_id: String,
    #[serde(flatten)]
    pub event: RunEvent,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub server_id: String,
    pub action_id: String,
    pub requested_by: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub signal: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(skip)]
    started_reported: bool,
}

/// Outcome of feeding an event into [`Run::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Accepted,
    Dropped(&'static str),
}

impl Run {
    pub fn new(
        run_id: impl Into<String>,
        server_id: impl Into<String>,
        action_id: impl Into<String>,
        requested_by: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            server_id: server_id.into(),
            action_id: action_id.into(),
            requested_by: requested_by.into(),
            status: RunStatus::Requested,
            started_at: Utc::now(),
            completed_at: None,
            exit_code: None,
            signal: None,
            error: None,
            started_reported: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Dispatch acknowledged by the executor: `Requested → Running`.
    pub fn acknowledge(&mut self) -> Applied {
        self.advance(RunStatus::Running)
    }

    /// Wrap an event with this run's addressing.
    pub fn message(&self, event: RunEvent) -> RunMessage {
        RunMessage {
            run_id: self.run_id.clone(),
            server_id: self.server_id.clone(),
            action_id: self.action_id.clone(),
            event,
        }
    }

    /// Apply `event` if it is legal in the current state.
    ///
    /// Dropped events leave the run untouched and must not be published.
    pub fn apply(&mut self, event: &RunEvent) -> Applied {
        if self.is_terminal() {
            return Applied::Dropped("run already terminal");
        }
        match event {
            RunEvent::Started { started_at } => {
                if self.started_reported {
                    return Applied::Dropped("duplicate start");
                }
                if self.status == RunStatus::Requested {
                    self.advance(RunStatus::Running);
                }
                self.started_at = *started_at;
                self.started_reported = true;
                Applied::Accepted
            }
            RunEvent::Output { .. } => {
                if self.status == RunStatus::Running {
                    Applied::Accepted
                } else {
                    Applied::Dropped("output before dispatch")
                }
            }
            RunEvent::Completed {
                exit_code,
                signal,
                success,
                completed_at,
            } => {
                let next = if *success {
                    RunStatus::Success
                } else {
                    RunStatus::Failure
                };
                if let Applied::Dropped(why) = self.advance(next) {
                    return Applied::Dropped(why);
                }
                self.exit_code = *exit_code;
                self.signal = signal.clone();
                self.completed_at = Some(*completed_at);
                Applied::Accepted
            }
            RunEvent::Error { message } => {
                if let Applied::Dropped(why) = self.advance(RunStatus::Error) {
                    return Applied::Dropped(why);
                }
                self.error = Some(message.clone());
                self.completed_at = Some(Utc::now());
                Applied::Accepted
            }
        }
    }

    /// The terminal event this run ended with, rebuilt from the record.
    /// `None` while the run is still in flight.
    pub fn outcome(&self) -> Option<RunEvent> {
        let completed_at = self.completed_at.unwrap_or(self.started_at);
        match self.status {
            RunStatus::Requested | RunStatus::Running => None,
            RunStatus::Success | RunStatus::Failure => Some(RunEvent::Completed {
                exit_code: self.exit_code,
                signal: self.signal.clone(),
                success: self.status == RunStatus::Success,
                completed_at,
            }),
            RunStatus::Error => Some(RunEvent::Error {
                message: self.error.clone().unwrap_or_default(),
            }),
        }
    }

    fn advance(&mut self, next: RunStatus) -> Applied {
        if self.status.can_transition_to(next) {
            self.status = next;
            Applied::Accepted
        } else {
            Applied::Dropped("illegal transition")
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> Run {
        let mut run = Run::new("r1", "web-1", "deploy", "alice");
        assert_eq!(run.acknowledge(), Applied::Accepted);
        run
    }

    fn completed(success: bool, exit_code: i32) -> RunEvent {
        RunEvent::Completed {
            exit_code: Some(exit_code),
            signal: None,
            success,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn new_run_is_requested() {
        let run = Run::new("r1", "web-1", "deploy", "alice");
        assert_eq!(run.status, RunStatus::Requested);
        assert!(!run.is_terminal());
    }

    #[test]
    fn happy_path_reaches_success() {
        let mut run = running();
        let started = RunEvent::Started {
            started_at: Utc::now(),
        };
        assert_eq!(run.apply(&started), Applied::Accepted);
        let out = RunEvent::Output {
            stream: OutputStream::Stdout,
            chunk: "Deploying...\n".into(),
        };
        assert_eq!(run.apply(&out), Applied::Accepted);
        assert_eq!(run.apply(&completed(true, 0)), Applied::Accepted);
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.exit_code, Some(0));
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn outcome_rebuilds_terminal_event() {
        let mut run = running();
        assert!(run.outcome().is_none());
        run.apply(&completed(false, 2));
        match run.outcome() {
            Some(RunEvent::Completed {
                exit_code, success, ..
            }) => {
                assert_eq!(exit_code, Some(2));
                assert!(!success);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn killed_process_is_failure_not_error() {
        let mut run = running();
        let event = RunEvent::Completed {
            exit_code: Some(137),
            signal: Some("SIGKILL".into()),
            success: false,
            completed_at: Utc::now(),
        };
        run.apply(&event);
        assert_eq!(run.status, RunStatus::Failure);
        assert_eq!(run.signal.as_deref(), Some("SIGKILL"));
    }

    #[test]
    fn transport_error_is_error() {
        let mut run = running();
        run.apply(&RunEvent::Error {
            message: "connection reset".into(),
        });
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn terminal_run_drops_everything() {
        let mut run = running();
        run.apply(&completed(true, 0));
        let snapshot = run.clone();

        assert_eq!(
            run.apply(&completed(false, 1)),
            Applied::Dropped("run already terminal")
        );
        assert!(matches!(
            run.apply(&RunEvent::Error {
                message: "late".into()
            }),
            Applied::Dropped(_)
        ));
        assert!(matches!(
            run.apply(&RunEvent::Output {
                stream: OutputStream::Stderr,
                chunk: "late\n".into()
            }),
            Applied::Dropped(_)
        ));
        assert_eq!(run, snapshot);
    }

    #[test]
    fn duplicate_start_is_dropped() {
        let mut run = running();
        let started = RunEvent::Started {
            started_at: Utc::now(),
        };
        assert_eq!(run.apply(&started), Applied::Accepted);
        assert_eq!(run.apply(&started), Applied::Dropped("duplicate start"));
    }

    #[test]
    fn output_requires_running() {
        let mut run = Run::new("r1", "web-1", "deploy", "alice");
        let out = RunEvent::Output {
            stream: OutputStream::Stdout,
            chunk: "early".into(),
        };
        assert!(matches!(run.apply(&out), Applied::Dropped(_)));
    }

    #[test]
    fn completion_before_ack_is_dropped() {
        let mut run = Run::new("r1", "web-1", "deploy", "alice");
        assert!(matches!(run.apply(&completed(true, 0)), Applied::Dropped(_)));
        assert_eq!(run.status, RunStatus::Requested);
    }

    #[test]
    fn message_serializes_with_flat_tag() {
        let run = running();
        let msg = run.message(RunEvent::Output {
            stream: OutputStream::Stderr,
            chunk: "oops\n".into(),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "run_output");
        assert_eq!(json["run_id"], "r1");
        assert_eq!(json["server_id"], "web-1");
        assert_eq!(json["stream"], "stderr");
        let back: RunMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(generate_run_id(), generate_run_id());
    }
}
