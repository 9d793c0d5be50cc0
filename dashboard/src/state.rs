//! Shared application state for the dashboard server.

use std::sync::Arc;

use orchestrator::workflow::Orchestrator;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The orchestrator every route reads from or drives. Agents are
    /// registered before it is shared.
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }
}
