use std::sync::Arc;

use tokio::sync::mpsc;

use crate::coordinator::JobCoordinator;
use crate::hooks::CallbackItem;
use crate::tree::FlowRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<JobCoordinator>,
    pub flows: Arc<FlowRegistry>,
    /// Bounded callback queue; a full queue back-pressures the webhook.
    pub callbacks: mpsc::Sender<CallbackItem>,
}

impl AppState {
    pub fn new(
        coordinator: Arc<JobCoordinator>,
        flows: Arc<FlowRegistry>,
        callbacks: mpsc::Sender<CallbackItem>,
    ) -> Self {
        Self {
            coordinator,
            flows,
            callbacks,
        }
    }
}
