//! The run coordinator: sole authority over run state.
//!
//! `submit` validates and authorizes a request, then hands it to one task
//! per run that dispatches it to the executor and, once dispatch is
//! acknowledged, drives the run to a terminal state. That task is the only
//! writer for the run: it applies each raw executor signal to the state
//! machine and publishes accepted events, so state changes and
//! publications for a run are serialized.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use runbook_core::gate;
use runbook_core::registry::Registry;
use runbook_core::run::{generate_run_id, Applied, Run, RunEvent};
use runbook_core::store::RunHistory;
use runbook_core::types::{validate_id, PermissionTier};
use runbook_core::RunbookError;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};

use crate::channel::{EventChannel, Subscription};
use crate::executor::{DispatchError, DispatchRequest, Executor, RawSignal, SignalSink};

/// The authenticated identity behind a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Caller {
    pub name: String,
    pub tier: PermissionTier,
}

/// Why a submission was refused. None of these create a run.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid run request: {0}")]
    Validation(#[source] RunbookError),

    #[error("not authorized: {0}")]
    Authorization(#[source] RunbookError),

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}

pub struct RunCoordinator {
    registry: Arc<Registry>,
    executor: Arc<dyn Executor>,
    channel: Arc<EventChannel>,
    store: Option<Arc<dyn RunHistory>>,
    runs: RwLock<HashMap<String, Run>>,
    watchdog: Duration,
}

impl RunCoordinator {
    pub fn new(
        registry: Arc<Registry>,
        executor: Arc<dyn Executor>,
        channel: Arc<EventChannel>,
        watchdog: Duration,
    ) -> Self {
        Self {
            registry,
            executor,
            channel,
            store: None,
            runs: RwLock::new(HashMap::new()),
            watchdog,
        }
    }

    /// Persist run records to `store`. Terminal runs are then served from
    /// the store instead of being kept in memory.
    pub fn with_store(mut self, store: Arc<dyn RunHistory>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn channel(&self) -> &Arc<EventChannel> {
        &self.channel
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Create and dispatch a run of `action_id` on `server_id`.
    ///
    /// Returns once the executor has acknowledged dispatch; the run is then
    /// `Running` and its event channel is open.
    pub async fn submit(
        self: &Arc<Self>,
        server_id: &str,
        action_id: &str,
        caller: &Caller,
    ) -> Result<Run, SubmitError> {
        validate_id(server_id).map_err(SubmitError::Validation)?;
        validate_id(action_id).map_err(SubmitError::Validation)?;
        let (server, action) = self
            .registry
            .lookup(server_id, action_id)
            .map_err(SubmitError::Validation)?;

        if let Err(e) = gate::authorize(action, caller.tier) {
            warn!(
                server_id,
                action_id,
                caller = %caller.name,
                tier = %caller.tier,
                "submit rejected: insufficient tier"
            );
            return Err(SubmitError::Authorization(e));
        }

        let run_id = generate_run_id();
        let run = Run::new(&run_id, server_id, action_id, &caller.name);
        let request = DispatchRequest {
            run_id,
            server: server.clone(),
            action: action.clone(),
        };

        // The launch task owns the run from here; dropping this future does
        // not cancel it.
        let (ack_tx, ack_rx) = oneshot::channel();
        let coordinator = Arc::clone(self);
        let requested_by = caller.name.clone();
        tokio::spawn(async move { coordinator.launch(run, request, requested_by, ack_tx).await });

        ack_rx.await.unwrap_or(Err(SubmitError::Dispatch(DispatchError::Interrupted)))
    }

    /// Dispatch, register the run, report back to `submit`, then drive it.
    async fn launch(
        self: Arc<Self>,
        mut run: Run,
        request: DispatchRequest,
        requested_by: String,
        ack: oneshot::Sender<Result<Run, SubmitError>>,
    ) {
        let run_id = run.run_id.clone();
        let server_id = request.server.id.clone();
        let action_id = request.action.id.clone();
        let dangerous = request.action.dangerous;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = self.executor.dispatch(request, SignalSink::new(tx)).await {
            error!(server_id, action_id, error = %e, "dispatch failed");
            let _ = ack.send(Err(SubmitError::Dispatch(e)));
            return;
        }

        run.acknowledge();
        self.channel.open(&run_id);
        self.runs.write().await.insert(run_id.clone(), run.clone());
        self.persist(&run).await;

        info!(
            run_id = %run_id,
            server_id,
            action_id,
            caller = %requested_by,
            dangerous,
            "run dispatched"
        );

        if ack.send(Ok(run)).is_err() {
            debug!(run_id = %run_id, "submitter went away; run continues");
        }
        self.drive(run_id, rx).await;
    }

    /// Per-run worker loop. Exits once the run is terminal.
    async fn drive(&self, run_id: String, mut rx: mpsc::UnboundedReceiver<RawSignal>) {
        loop {
            let signal = match tokio::time::timeout(self.watchdog, rx.recv()).await {
                Ok(Some(signal)) => signal,
                Ok(None) => RawSignal::TransportFailure {
                    message: "executor disconnected before reporting completion".into(),
                },
                Err(_) => {
                    warn!(run_id = %run_id, watchdog_secs = self.watchdog.as_secs(), "watchdog expired");
                    RawSignal::TransportFailure {
                        message: format!(
                            "executor silent for {}s",
                            self.watchdog.as_secs()
                        ),
                    }
                }
            };
            if self.handle_signal(&run_id, signal).await {
                break;
            }
        }

        rx.close();
        while let Ok(late) = rx.try_recv() {
            warn!(run_id = %run_id, signal = ?late, "dropping signal for terminal run");
        }
    }

    /// Apply one signal. Returns `true` once the run is terminal.
    async fn handle_signal(&self, run_id: &str, signal: RawSignal) -> bool {
        let event = signal.into_event();
        let (applied, run) = {
            let mut runs = self.runs.write().await;
            let Some(run) = runs.get_mut(run_id) else {
                return true;
            };
            (run.apply(&event), run.clone())
        };

        match applied {
            Applied::Dropped(reason) => {
                warn!(run_id, event = event.name(), reason, "dropping executor signal");
            }
            Applied::Accepted => {
                match &event {
                    RunEvent::Output { .. } => {}
                    _ => info!(run_id, event = event.name(), status = %run.status, "run advanced"),
                }
                self.channel.publish(run_id, run.message(event));
                // Only a stored terminal record may replace the in-memory one.
                if run.is_terminal() && self.persist(&run).await {
                    self.runs.write().await.remove(run_id);
                }
            }
        }
        run.is_terminal()
    }

    /// Write `run` to the store. `true` only if the record was written.
    async fn persist(&self, run: &Run) -> bool {
        let Some(store) = self.store.clone() else {
            return false;
        };
        let record = run.clone();
        let result = tokio::task::spawn_blocking(move || store.put(&record)).await;
        match result {
            Ok(Ok(())) => {
                debug!(run_id = %run.run_id, status = %run.status, "run persisted");
                true
            }
            Ok(Err(e)) => {
                error!(run_id = %run.run_id, error = %e, "failed to persist run");
                false
            }
            Err(e) => {
                error!(run_id = %run.run_id, error = %e, "persist task panicked");
                false
            }
        }
    }

    pub async fn get(&self, run_id: &str) -> Result<Run, RunbookError> {
        if let Some(run) = self.runs.read().await.get(run_id) {
            return Ok(run.clone());
        }
        if let Some(store) = self.store.clone() {
            let id = run_id.to_string();
            let found = tokio::task::spawn_blocking(move || store.get(&id))
                .await
                .map_err(|e| RunbookError::Store(e.to_string()))??;
            if let Some(run) = found {
                return Ok(run);
            }
        }
        Err(RunbookError::RunNotFound(run_id.to_string()))
    }

    /// All known runs, newest first.
    pub async fn list(&self) -> Result<Vec<Run>, RunbookError> {
        let mut runs: HashMap<String, Run> = HashMap::new();
        if let Some(store) = self.store.clone() {
            let stored = tokio::task::spawn_blocking(move || store.list())
                .await
                .map_err(|e| RunbookError::Store(e.to_string()))??;
            runs.extend(stored.into_iter().map(|r| (r.run_id.clone(), r)));
        }
        for (id, run) in self.runs.read().await.iter() {
            runs.insert(id.clone(), run.clone());
        }
        let mut runs: Vec<Run> = runs.into_values().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    /// Join a run's event stream. `None` if the run has no open channel.
    pub fn join(&self, run_id: &str, observer_id: &str, after: Option<u64>) -> Option<Subscription> {
        self.channel.join(run_id, observer_id, after)
    }

    #[cfg(test)]
    pub async fn active_count(&self) -> usize {
        self.runs
            .read()
            .await
            .values()
            .filter(|r| r.status == runbook_core::types::RunStatus::Running)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
