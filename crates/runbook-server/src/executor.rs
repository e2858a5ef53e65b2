//! Boundary to whatever actually runs a command on a host.
//!
//! The coordinator hands an [`Executor`] a [`DispatchRequest`] and a
//! [`SignalSink`]. `dispatch` resolves once execution has begun (the dispatch
//! ack); everything after that arrives as [`RawSignal`]s through the sink.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use runbook_core::registry::{Action, Server};
use runbook_core::run::RunEvent;
use runbook_core::types::OutputStream;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Unvalidated signal from an executor. The coordinator decides whether it
/// is legal before anything is published.
#[derive(Debug, Clone, PartialEq)]
pub enum RawSignal {
    ProcessStarted {
        at: DateTime<Utc>,
    },
    OutputChunk {
        stream: OutputStream,
        chunk: String,
    },
    ProcessExited {
        exit_code: Option<i32>,
        signal: Option<String>,
        success: bool,
        at: DateTime<Utc>,
    },
    TransportFailure {
        message: String,
    },
}

impl RawSignal {
    pub fn into_event(self) -> RunEvent {
        match self {
            RawSignal::ProcessStarted { at } => RunEvent::Started { started_at: at },
            RawSignal::OutputChunk { stream, chunk } => RunEvent::Output { stream, chunk },
            RawSignal::ProcessExited {
                exit_code,
                signal,
                success,
                at,
            } => RunEvent::Completed {
                exit_code,
                signal,
                success,
                completed_at: at,
            },
            RawSignal::TransportFailure { message } => RunEvent::Error { message },
        }
    }
}

/// Sending half handed to an executor for one run.
///
/// Sends never fail from the executor's point of view: once the coordinator
/// has closed the run, further signals are discarded.
#[derive(Debug, Clone)]
pub struct SignalSink {
    tx: mpsc::UnboundedSender<RawSignal>,
}

impl SignalSink {
    pub fn new(tx: mpsc::UnboundedSender<RawSignal>) -> Self {
        Self { tx }
    }

    pub fn send(&self, signal: RawSignal) {
        let _ = self.tx.send(signal);
    }

    pub fn started(&self) {
        self.send(RawSignal::ProcessStarted { at: Utc::now() });
    }

    pub fn output(&self, stream: OutputStream, chunk: impl Into<String>) {
        self.send(RawSignal::OutputChunk {
            stream,
            chunk: chunk.into(),
        });
    }

    pub fn exited(&self, exit_code: Option<i32>, signal: Option<String>, success: bool) {
        self.send(RawSignal::ProcessExited {
            exit_code,
            signal,
            success,
            at: Utc::now(),
        });
    }

    pub fn failed(&self, message: impl Into<String>) {
        self.send(RawSignal::TransportFailure {
            message: message.into(),
        });
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub run_id: String,
    pub server: Server,
    pub action: Action,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("executor unreachable: {0}")]
    Unreachable(String),

    #[error("action command not found: {0}")]
    CommandMissing(String),

    #[error("failed to start '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("dispatch task ended before reporting")]
    Interrupted,
}

pub trait Executor: Send + Sync + 'static {
    /// Begin executing `request`. Resolves `Ok` once the command is running;
    /// progress and completion are reported through `sink`.
    fn dispatch(
        &self,
        request: DispatchRequest,
        sink: SignalSink,
    ) -> BoxFuture<'_, Result<(), DispatchError>>;
}

// ---------------------------------------------------------------------------
// ProcessExecutor
// ---------------------------------------------------------------------------

/// Runs actions as child processes: directly for local hosts, through the
/// `ssh` client for everything else.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    ssh_program: String,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
        }
    }
}

/// ssh's own exit status for connection and authentication failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ssh_program(mut self, program: impl Into<String>) -> Self {
        self.ssh_program = program.into();
        self
    }

    pub fn is_local(host: &str) -> bool {
        matches!(host, "localhost" | "127.0.0.1" | "::1" | "local")
    }

    /// The argv used to run `action` on `server`.
    pub fn build_argv(&self, server: &Server, action: &Action) -> Vec<String> {
        if Self::is_local(&server.host) {
            return vec![action.command_path.clone()];
        }
        let mut argv = vec![
            self.ssh_program.clone(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(port) = server.auth.port {
            argv.push("-p".to_string());
            argv.push(port.to_string());
        }
        if let Some(identity) = &server.auth.identity_file {
            argv.push("-i".to_string());
            argv.push(identity.clone());
        }
        let target = match &server.auth.user {
            Some(user) => format!("{user}@{}", server.host),
            None => server.host.clone(),
        };
        argv.push(target);
        argv.push(action.command_path.clone());
        argv
    }

    fn preflight(&self, server: &Server, action: &Action) -> Result<(), DispatchError> {
        if Self::is_local(&server.host) {
            if !Path::new(&action.command_path).is_file() {
                return Err(DispatchError::CommandMissing(action.command_path.clone()));
            }
        } else {
            which::which(&self.ssh_program).map_err(|e| {
                DispatchError::Unreachable(format!("ssh client '{}': {e}", self.ssh_program))
            })?;
        }
        Ok(())
    }
}

impl Executor for ProcessExecutor {
    fn dispatch(
        &self,
        request: DispatchRequest,
        sink: SignalSink,
    ) -> BoxFuture<'_, Result<(), DispatchError>> {
        Box::pin(async move {
            self.preflight(&request.server, &request.action)?;
            let argv = self.build_argv(&request.server, &request.action);
            let remote = !Self::is_local(&request.server.host);

            let mut child = Command::new(&argv[0])
                .args(&argv[1..])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| DispatchError::Spawn {
                    command: argv[0].clone(),
                    reason: e.to_string(),
                })?;

            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let run_id = request.run_id;

            tokio::spawn(async move {
                sink.started();

                let stdout_task =
                    stdout.map(|s| tokio::spawn(pump(s, OutputStream::Stdout, sink.clone())));
                let stderr_task =
                    stderr.map(|s| tokio::spawn(pump(s, OutputStream::Stderr, sink.clone())));
                if let Some(task) = stdout_task {
                    let _ = task.await;
                }
                if let Some(task) = stderr_task {
                    let _ = task.await;
                }

                match child.wait().await {
                    Ok(status) => {
                        let code = status.code();
                        if remote && code == Some(SSH_TRANSPORT_FAILURE) {
                            sink.failed(format!(
                                "ssh exited with {SSH_TRANSPORT_FAILURE}: \
                                 connection or authentication failure"
                            ));
                        } else {
                            sink.exited(code, exit_signal(&status), status.success());
                        }
                    }
                    Err(e) => {
                        tracing::warn!(run_id = %run_id, error = %e, "wait on child failed");
                        sink.failed(format!("wait failed: {e}"));
                    }
                }
            });

            Ok(())
        })
    }
}

async fn pump<R>(reader: R, stream: OutputStream, sink: SignalSink)
where
    R: AsyncRead + Unpin,
{
    // Lines are split on raw bytes so undecodable output is kept (lossily)
    // and the pipe keeps draining.
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if line.last() != Some(&b'\n') {
                    line.push(b'\n');
                }
                sink.output(stream, String::from_utf8_lossy(&line).into_owned());
            }
            Err(e) => {
                tracing::warn!(?stream, error = %e, "stopped reading command output");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(signal_name)
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        3 => "SIGQUIT".to_string(),
        6 => "SIGABRT".to_string(),
        9 => "SIGKILL".to_string(),
        11 => "SIGSEGV".to_string(),
        13 => "SIGPIPE".to_string(),
        15 => "SIGTERM".to_string(),
        n => format!("signal {n}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use runbook_core::registry::AuthConfig;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn server(host: &str, auth: AuthConfig) -> Server {
        Server {
            id: "s".into(),
            name: "S".into(),
            host: host.into(),
            auth,
        }
    }

    fn action(path: &str) -> Action {
        Action {
            id: "a".into(),
            name: "A".into(),
            description: String::new(),
            command_path: path.into(),
            dangerous: false,
        }
    }

    fn script(dir: &TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    /// Collect signals until a terminal one (or channel closure).
    async fn collect(mut rx: mpsc::UnboundedReceiver<RawSignal>) -> Vec<RawSignal> {
        let mut signals = vec![];
        loop {
            match tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv()).await {
                Ok(Some(signal)) => {
                    let done = matches!(
                        signal,
                        RawSignal::ProcessExited { .. } | RawSignal::TransportFailure { .. }
                    );
                    signals.push(signal);
                    if done {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => panic!("timed out waiting for executor signals"),
            }
        }
        signals
    }

    async fn run_script(path: String) -> Vec<RawSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        let request = DispatchRequest {
            run_id: "r1".into(),
            server: server("localhost", AuthConfig::default()),
            action: action(&path),
        };
        ProcessExecutor::new()
            .dispatch(request, SignalSink::new(tx))
            .await
            .unwrap();
        collect(rx).await
    }

    #[test]
    fn local_argv_is_the_script() {
        let exec = ProcessExecutor::new();
        let argv = exec.build_argv(
            &server("localhost", AuthConfig::default()),
            &action("/opt/x.sh"),
        );
        assert_eq!(argv, ["/opt/x.sh"]);
    }

    #[test]
    fn remote_argv_uses_ssh_options() {
        let exec = ProcessExecutor::new();
        let auth = AuthConfig {
            user: Some("deploy".into()),
            port: Some(2222),
            identity_file: Some("/keys/id".into()),
        };
        let argv = exec.build_argv(&server("web1.internal", auth), &action("/opt/x.sh"));
        assert_eq!(
            argv,
            [
                "ssh",
                "-o",
                "BatchMode=yes",
                "-p",
                "2222",
                "-i",
                "/keys/id",
                "deploy@web1.internal",
                "/opt/x.sh"
            ]
        );
    }

    #[tokio::test]
    async fn missing_local_script_is_dispatch_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let request = DispatchRequest {
            run_id: "r1".into(),
            server: server("localhost", AuthConfig::default()),
            action: action("/nonexistent/__runbook_missing__.sh"),
        };
        let err = ProcessExecutor::new()
            .dispatch(request, SignalSink::new(tx))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::CommandMissing(_)));
    }

    #[tokio::test]
    async fn missing_ssh_client_is_unreachable() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let request = DispatchRequest {
            run_id: "r1".into(),
            server: server("web1.internal", AuthConfig::default()),
            action: action("/opt/x.sh"),
        };
        let err = ProcessExecutor::new()
            .with_ssh_program("__runbook_no_such_ssh__")
            .dispatch(request, SignalSink::new(tx))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unreachable(_)));
    }

    #[tokio::test]
    async fn successful_script_reports_output_and_exit() {
        let dir = TempDir::new().unwrap();
        let path = script(&dir, "ok.sh", "echo Deploying...\necho warn >&2");
        let signals = run_script(path).await;

        assert!(matches!(signals[0], RawSignal::ProcessStarted { .. }));
        assert!(signals.iter().any(|s| matches!(
            s,
            RawSignal::OutputChunk { stream: OutputStream::Stdout, chunk } if chunk == "Deploying...\n"
        )));
        assert!(signals.iter().any(|s| matches!(
            s,
            RawSignal::OutputChunk { stream: OutputStream::Stderr, chunk } if chunk == "warn\n"
        )));
        assert!(matches!(
            signals.last(),
            Some(RawSignal::ProcessExited {
                exit_code: Some(0),
                success: true,
                ..
            })
        ));
    }

    fn stdout_chunks(signals: &[RawSignal]) -> Vec<String> {
        signals
            .iter()
            .filter_map(|s| match s {
                RawSignal::OutputChunk {
                    stream: OutputStream::Stdout,
                    chunk,
                } => Some(chunk.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn invalid_utf8_line_does_not_stop_output() {
        let dir = TempDir::new().unwrap();
        let path = script(&dir, "bytes.sh", r"printf 'first\n\377\nsecond\nthird'");
        let signals = run_script(path).await;
        assert_eq!(
            stdout_chunks(&signals),
            ["first\n", "\u{FFFD}\n", "second\n", "third\n"]
        );
        assert!(matches!(
            signals.last(),
            Some(RawSignal::ProcessExited { success: true, .. })
        ));
    }

    #[tokio::test]
    async fn large_output_after_invalid_utf8_is_drained() {
        let dir = TempDir::new().unwrap();
        let path = script(
            &dir,
            "flood.sh",
            r"printf '\377\n'; i=0; while [ $i -lt 5000 ]; do echo 'xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx'; i=$((i+1)); done",
        );
        let signals = run_script(path).await;
        assert_eq!(stdout_chunks(&signals).len(), 5001);
        assert!(matches!(
            signals.last(),
            Some(RawSignal::ProcessExited { success: true, .. })
        ));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_as_unsuccessful() {
        let dir = TempDir::new().unwrap();
        let path = script(&dir, "fail.sh", "exit 3");
        let signals = run_script(path).await;
        assert!(matches!(
            signals.last(),
            Some(RawSignal::ProcessExited {
                exit_code: Some(3),
                success: false,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn killed_script_reports_signal() {
        let dir = TempDir::new().unwrap();
        let path = script(&dir, "kill.sh", "kill -9 $$");
        let signals = run_script(path).await;
        match signals.last() {
            Some(RawSignal::ProcessExited {
                exit_code,
                signal,
                success,
                ..
            }) => {
                assert_eq!(*exit_code, None);
                assert_eq!(signal.as_deref(), Some("SIGKILL"));
                assert!(!success);
            }
            other => panic!("expected ProcessExited, got {other:?}"),
        }
    }

    #[test]
    fn signals_map_to_events() {
        let event = RawSignal::TransportFailure {
            message: "boom".into(),
        }
        .into_event();
        assert_eq!(
            event,
            RunEvent::Error {
                message: "boom".into()
            }
        );
    }
}
