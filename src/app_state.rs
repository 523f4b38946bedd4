use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::{
    ai::OpenAiClient,
    controller::JobController,
    dispatcher::DispatchSignal,
    executors::ExecutorSet,
    extraction::ExtractionClient,
    renderer::RendererClient,
    validation::UploadLimits,
};
use crate::store::{JobStore, MemoryJobStore, RedisJobStore, StoreError};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub controller: JobController,
    pub store: Arc<dyn JobStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>, signal: DispatchSignal, limits: UploadLimits) -> Self {
        Self {
            controller: JobController::new(store.clone(), signal, limits),
            store,
        }
    }
}

impl From<&AppConfig> for UploadLimits {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_upload_bytes: config.max_upload_bytes,
            min_import_chars: config.min_import_chars,
        }
    }
}

/// Job store selected by configuration: Redis when `REDIS_URL` is set,
/// otherwise an in-process store.
pub fn build_store(config: &AppConfig) -> Result<Arc<dyn JobStore>, StoreError> {
    match config.redis_url.as_deref() {
        Some(url) => {
            tracing::info!("Using Redis job store");
            Ok(Arc::new(RedisJobStore::new(url, config.job_ttl_secs)?))
        }
        None => {
            tracing::warn!("REDIS_URL not set, using in-memory job store");
            Ok(Arc::new(MemoryJobStore::new()))
        }
    }
}

/// Stage executors wired to the HTTP collaborators named in configuration.
pub fn build_executors(config: &AppConfig, store: Arc<dyn JobStore>) -> ExecutorSet {
    let ai = OpenAiClient::new(
        &config.ai_base_url,
        &config.ai_api_key,
        &config.ai_model,
        config.ai_max_retries,
    );
    ExecutorSet::new(
        store,
        Arc::new(ExtractionClient::new(&config.extraction_url)),
        Arc::new(ai),
        Arc::new(RendererClient::new(&config.renderer_url)),
    )
}
