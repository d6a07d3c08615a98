use std::sync::Arc;

use crate::coordinator::Coordinator;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    /// Shared secret expected on `/internal` calls; `None` disables the check.
    pub agent_key: Option<String>,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>, agent_key: Option<String>) -> Self {
        Self {
            coordinator,
            agent_key,
        }
    }
}
