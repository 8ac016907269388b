use std::sync::Arc;

use crate::services::{invoker::ProcessingStep, storage::ObjectStore};

/// Shared handles to the poller's external collaborators.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ObjectStore>,
    pub engine: Arc<dyn ProcessingStep>,
}

impl AppState {
    pub fn new(
        store: impl ObjectStore + 'static,
        engine: impl ProcessingStep + 'static,
    ) -> Self {
        Self::from_shared(Arc::new(store), Arc::new(engine))
    }

    /// For callers that keep their own handle, e.g. tests inspecting a store.
    pub fn from_shared(store: Arc<dyn ObjectStore>, engine: Arc<dyn ProcessingStep>) -> Self {
        Self { store, engine }
    }
}
