use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Extension, Json,
};
use futures::stream::BoxStream;
use runbook_core::run::{Run, RunMessage};
use runbook_core::types::validate_id;
use serde::Deserialize;
use tokio_stream::StreamExt as _;
use tracing::{debug, warn};

use crate::coordinator::Caller;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub server_id: String,
    pub action_id: String,
}

/// POST /api/runs: submit a run; answers once dispatch is acknowledged.
pub async fn submit_run(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let run = app
        .coordinator
        .submit(&body.server_id, &body.action_id, &caller)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "run_id": run.run_id,
            "status": run.status,
        })),
    ))
}

/// GET /api/runs: run records, most recent first.
pub async fn list_runs(State(app): State<AppState>) -> Result<Json<Vec<Run>>, AppError> {
    Ok(Json(app.coordinator.list().await?))
}

/// GET /api/runs/{run_id}
pub async fn get_run(
    State(app): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, AppError> {
    validate_id(&run_id)?;
    Ok(Json(app.coordinator.get(&run_id).await?))
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Stable observer name; reconnecting with the same name replaces the
    /// previous stream instead of adding a second one.
    pub observer: Option<String>,
    /// Resume after this sequence number. `Last-Event-ID` takes precedence.
    pub after: Option<u64>,
}

type EventStream = BoxStream<'static, Result<Event, Infallible>>;

/// GET /api/runs/{run_id}/events: SSE stream of one run's events.
///
/// Opening the stream joins the run's channel; dropping it leaves. The
/// stream ends after the terminal event. Runs whose channel has already
/// been evicted get their outcome rebuilt from the run record.
pub async fn run_events(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(run_id): Path<String>,
    Query(params): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    validate_id(&run_id)?;

    let after = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .or(params.after);
    let observer_id = format!(
        "{}/{}",
        caller.name,
        params
            .observer
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
    );

    let stream: EventStream = match app.coordinator.join(&run_id, &observer_id, after) {
        Some(subscription) => {
            debug!(run_id = %run_id, observer = %observer_id, ?after, "observer joined");
            Box::pin(subscription.filter_map(|s| {
                sse_event(Some(s.seq), &s.message).map(Ok::<Event, Infallible>)
            }))
        }
        None => {
            let run = app.coordinator.get(&run_id).await?;
            let Some(event) = run.outcome() else {
                return Err(AppError::run_not_found(run_id));
            };
            let message = run.message(event);
            match sse_event(None, &message) {
                Some(event) => Box::pin(tokio_stream::once(Ok(event))),
                None => Box::pin(tokio_stream::empty()),
            }
        }
    };

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

fn sse_event(seq: Option<u64>, message: &RunMessage) -> Option<Event> {
    let mut event = Event::default().event(message.event.name());
    if let Some(seq) = seq {
        event = event.id(seq.to_string());
    }
    match event.json_data(message) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(run_id = %message.run_id, error = %e, "failed to encode run event");
            None
        }
    }
}
