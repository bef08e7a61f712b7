//! Shared state for the HTTP API.

use crate::dispatcher::CommandDispatcher;
use crate::fleet::FleetRegistry;
use crate::orchestrator::BuildOrchestrator;
use crate::queue::ControlQueue;
use crate::store::MetadataStore;

use std::sync::Arc;
use std::time::Instant;

/// State shared across all API handlers.
pub struct ApiState {
    pub started_at: Instant,
    pub queue: Arc<ControlQueue>,
    pub store: Arc<dyn MetadataStore>,
    pub fleet: Arc<FleetRegistry>,
    pub orchestrator: Arc<BuildOrchestrator>,
    pub dispatcher: Arc<CommandDispatcher>,
}

impl ApiState {
    pub fn new(
        queue: Arc<ControlQueue>,
        store: Arc<dyn MetadataStore>,
        fleet: Arc<FleetRegistry>,
        orchestrator: Arc<BuildOrchestrator>,
        dispatcher: Arc<CommandDispatcher>,
    ) -> Self {
        Self {
            started_at: Instant::now(),
            queue,
            store,
            fleet,
            orchestrator,
            dispatcher,
        }
    }
}
