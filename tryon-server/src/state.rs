use std::sync::Arc;

use tokio::sync::RwLock;
use tryon_core::TryOnModel;

/// Shared handler state: the model stack once it has been loaded.
///
/// The slot stays empty while models load, which is what the readiness gate
/// reports.
#[derive(Clone, Default)]
pub struct AppState {
    model: Arc<RwLock<Option<Arc<dyn TryOnModel>>>>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    /// State that is ready from the start.
    pub fn with_model(model: Arc<dyn TryOnModel>) -> Self {
        Self {
            model: Arc::new(RwLock::new(Some(model))),
        }
    }

    pub async fn install(&self, model: Arc<dyn TryOnModel>) {
        *self.model.write().await = Some(model);
    }

    /// Empties the slot; the models are freed once in-flight requests finish.
    pub async fn unload(&self) -> bool {
        self.model.write().await.take().is_some()
    }

    pub async fn model(&self) -> Option<Arc<dyn TryOnModel>> {
        self.model.read().await.clone()
    }

    pub async fn is_ready(&self) -> bool {
        self.model.read().await.is_some()
    }
}
