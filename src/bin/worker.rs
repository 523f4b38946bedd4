//! Standalone dispatcher process. Shares the Redis job store with the API
//! servers and advances jobs without serving HTTP.

use essayflow::{
    app_state,
    config::AppConfig,
    services::dispatcher::{DispatchSignal, Dispatcher, DispatcherConfig},
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting essay worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");
    if config.redis_url.is_none() {
        // an in-memory store would never see jobs created by the API server
        tracing::error!("REDIS_URL must be set for a standalone worker");
        std::process::exit(1);
    }

    let store = app_state::build_store(&config).expect("Failed to initialize job store");
    let executors = app_state::build_executors(&config, store.clone());
    let dispatcher_config = DispatcherConfig::from_config(&config);

    tracing::info!(
        workers = dispatcher_config.worker_count,
        max_attempts = dispatcher_config.max_attempts,
        stage_timeout_secs = dispatcher_config.stage_timeout.as_secs(),
        "Worker ready, starting job processing loop"
    );

    let handle = Dispatcher::new(store, executors, dispatcher_config, DispatchSignal::new()).spawn();

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutting down, waiting for in-flight stages");
    handle.shutdown().await;
}
