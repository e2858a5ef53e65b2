//! Folds a run's ordered event stream into an append-only display log.

use crate::run::RunEvent;
use crate::types::{OutputStream, RunStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Marker,
    Stdout,
    Stderr,
    Summary,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub kind: LineKind,
    pub text: String,
}

impl fmt::Display for OutputLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Observer-side view of one run.
///
/// Lines are only ever appended. Once a terminal event has been folded in,
/// further events are ignored.
#[derive(Debug, Clone)]
pub struct OutputAssembler {
    run_id: String,
    status: RunStatus,
    lines: Vec<OutputLine>,
}

impl OutputAssembler {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Requested,
            lines: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn lines(&self) -> &[OutputLine] {
        &self.lines
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Fold one event in. Returns the number of lines appended.
    pub fn apply(&mut self, event: &RunEvent) -> usize {
        if self.is_finished() {
            return 0;
        }
        let before = self.lines.len();
        match event {
            RunEvent::Started { started_at } => {
                self.push(
                    LineKind::Marker,
                    format!("started at {}", started_at.format("%Y-%m-%d %H:%M:%S UTC")),
                );
                self.status = RunStatus::Running;
            }
            RunEvent::Output { stream, chunk } => {
                for line in chunk.split('\n') {
                    let line = line.strip_suffix('\r').unwrap_or(line);
                    if line.is_empty() {
                        continue;
                    }
                    match stream {
                        OutputStream::Stdout => self.push(LineKind::Stdout, line.to_string()),
                        OutputStream::Stderr => {
                            self.push(LineKind::Stderr, format!("[stderr] {line}"))
                        }
                    }
                }
            }
            RunEvent::Completed {
                exit_code,
                signal,
                success,
                ..
            } => {
                let code = exit_code.map_or_else(|| "none".to_string(), |c| c.to_string());
                self.push(LineKind::Summary, format!("exit code: {code}"));
                if let Some(signal) = signal {
                    self.push(LineKind::Summary, format!("signal: {signal}"));
                }
                self.status = if *success {
                    RunStatus::Success
                } else {
                    RunStatus::Failure
                };
            }
            RunEvent::Error { message } => {
                self.push(LineKind::Error, format!("error: {message}"));
                self.status = RunStatus::Error;
            }
        }
        self.lines.len() - before
    }

    fn push(&mut self, kind: LineKind, text: String) {
        self.lines.push(OutputLine { kind, text });
    }
}
