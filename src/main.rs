use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

use essayflow::app_state::{self, AppState};
use essayflow::build_router;
use essayflow::config::AppConfig;
use essayflow::routes::metrics::describe_metrics;
use essayflow::services::dispatcher::{DispatchSignal, Dispatcher, DispatcherConfig};
use essayflow::services::validation::UploadLimits;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing essayflow server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    describe_metrics();

    let store = app_state::build_store(&config).expect("Failed to initialize job store");
    let signal = DispatchSignal::new();

    // Workers can also run out of process via the `worker` binary
    let dispatcher = if config.embedded_workers {
        let executors = app_state::build_executors(&config, store.clone());
        let dispatcher = Dispatcher::new(
            store.clone(),
            executors,
            DispatcherConfig::from_config(&config),
            signal.clone(),
        );
        Some(dispatcher.spawn())
    } else {
        tracing::info!("Embedded workers disabled; jobs wait for an external worker");
        None
    };

    let state = AppState::new(store, signal, UploadLimits::from(&config));
    let app = build_router(state, prometheus_handle);

    tracing::info!("Starting essayflow on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    if let Some(dispatcher) = dispatcher {
        dispatcher.shutdown().await;
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
