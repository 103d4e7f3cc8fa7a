use std::sync::Arc;

use crate::services::queue::QueueTransport;
use crate::store::{JobStore, PatternStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobStore>,
    pub patterns: Arc<dyn PatternStore>,
    pub queue: Arc<dyn QueueTransport>,
}

impl AppState {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        patterns: Arc<dyn PatternStore>,
        queue: Arc<dyn QueueTransport>,
    ) -> Self {
        Self {
            jobs,
            patterns,
            queue,
        }
    }
}
