use std::sync::Arc;

use runbook_core::registry::Registry;

use crate::auth::Operators;
use crate::coordinator::RunCoordinator;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub operators: Arc<Operators>,
    pub coordinator: Arc<RunCoordinator>,
}

impl AppState {
    pub fn new(operators: Operators, coordinator: Arc<RunCoordinator>) -> Self {
        Self {
            registry: Arc::clone(coordinator.registry()),
            operators: Arc::new(operators),
            coordinator,
        }
    }
}
