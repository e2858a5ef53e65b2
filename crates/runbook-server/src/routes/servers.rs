use axum::extract::State;
use axum::{Extension, Json};
use runbook_core::registry::ServerListing;

use crate::coordinator::Caller;
use crate::state::AppState;

/// GET /api/servers: every server with its actions and danger flags.
pub async fn list_servers(State(app): State<AppState>) -> Json<Vec<ServerListing>> {
    Json(app.registry.listing())
}

/// GET /api/whoami: the authenticated caller and its permission tier.
pub async fn whoami(Extension(caller): Extension<Caller>) -> Json<Caller> {
    Json(caller)
}
