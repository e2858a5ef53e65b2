use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use runbook_core::RunbookError;

use crate::coordinator::SubmitError;
use crate::executor::DispatchError;

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    /// Construct a 404 for an unknown run.
    pub fn run_not_found(run_id: impl Into<String>) -> Self {
        Self(RunbookError::RunNotFound(run_id.into()).into())
    }
}

fn runbook_status(e: &RunbookError) -> StatusCode {
    match e {
        RunbookError::ServerNotFound(_)
        | RunbookError::ActionNotFound { .. }
        | RunbookError::RunNotFound(_) => StatusCode::NOT_FOUND,
        RunbookError::InvalidId(_) | RunbookError::InvalidTier(_) => StatusCode::BAD_REQUEST,
        RunbookError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
        RunbookError::InvalidConfig(_)
        | RunbookError::Store(_)
        | RunbookError::Io(_)
        | RunbookError::Yaml(_)
        | RunbookError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if let Some(e) = self.0.downcast_ref::<SubmitError>() {
            match e {
                SubmitError::Validation(inner) => match runbook_status(inner) {
                    StatusCode::NOT_FOUND => StatusCode::NOT_FOUND,
                    _ => StatusCode::BAD_REQUEST,
                },
                SubmitError::Authorization(_) => StatusCode::FORBIDDEN,
                SubmitError::Dispatch(_) => StatusCode::BAD_GATEWAY,
            }
        } else if self.0.downcast_ref::<DispatchError>().is_some() {
            StatusCode::BAD_GATEWAY
        } else if let Some(e) = self.0.downcast_ref::<RunbookError>() {
            runbook_status(e)
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
