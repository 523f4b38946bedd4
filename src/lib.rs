//! Essay generation job orchestration.
//!
//! Jobs created over HTTP are persisted in a job store and advanced stage by
//! stage by a pool of dispatcher workers: extract, research, write,
//! humanize, an optional review and refine cycle, and finally rendering to
//! PDF and DOCX. Clients poll for status and download the result.

pub mod app_state;
pub mod config;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use app_state::AppState;
use services::validation::MAX_REFERENCE_IMAGES;

/// Build the HTTP API. `/metrics` renders from `prometheus`.
pub fn build_router(state: AppState, prometheus: Arc<PrometheusHandle>) -> Router {
    // one document plus every reference image, with room for form fields
    let body_limit =
        state.controller.limits().max_upload_bytes * (MAX_REFERENCE_IMAGES + 1) + 1024 * 1024;

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/health", get(routes::health::health_check))
        .route("/api/upload", post(routes::jobs::upload_essay))
        .route("/api/import", post(routes::jobs::import_essay))
        .route("/api/task/{job_id}", get(routes::jobs::task_status))
        .route("/api/essay/{job_id}/review", get(routes::review::get_review))
        .route("/api/essay/{job_id}/refine", post(routes::review::refine_essay))
        .route(
            "/api/essay/{job_id}/finalize",
            post(routes::review::finalize_essay),
        )
        .route("/api/download/{job_id}", get(routes::jobs::download_essay))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(body_limit))
}
