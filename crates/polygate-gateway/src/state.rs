//! Shared gateway state.

use std::sync::Arc;

use tokio::sync::RwLock;

use polygate_core::config::Config;
use polygate_providers::http::ClientPool;
use polygate_translate::TranslatorRegistry;

use crate::manager::CredentialManager;

/// State shared by every route handler.
pub struct GatewayState {
    /// Live config; replaced wholesale by the reconciler.
    pub config: Arc<RwLock<Arc<Config>>>,
    pub manager: Arc<CredentialManager>,
    pub translators: Arc<TranslatorRegistry>,
    pub pool: Arc<ClientPool>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl GatewayState {
    pub fn new(
        config: Arc<RwLock<Arc<Config>>>,
        manager: Arc<CredentialManager>,
        translators: Arc<TranslatorRegistry>,
        pool: Arc<ClientPool>,
    ) -> Self {
        Self {
            config,
            manager,
            translators,
            pool,
            started_at: chrono::Utc::now(),
        }
    }

    /// Client-facing API keys currently in effect.
    pub async fn client_keys(&self) -> Vec<String> {
        self.config.read().await.client_api_keys()
    }
}
