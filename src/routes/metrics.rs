use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus metrics scrape endpoint.
/// Returns metrics in Prometheus text exposition format.
pub async fn prometheus_metrics(
    axum::extract::State(handle): axum::extract::State<Arc<PrometheusHandle>>,
) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for the pipeline's metrics.
pub fn describe_metrics() {
    metrics::describe_counter!("essay_jobs_created_total", "Essay jobs created, by flow");
    metrics::describe_counter!("essay_jobs_completed_total", "Essay jobs that reached completed");
    metrics::describe_counter!(
        "essay_jobs_failed_total",
        "Essay jobs that failed, by the stage that exhausted its retries"
    );
    metrics::describe_counter!("essay_stage_retries_total", "Stage attempts that will be retried");
    metrics::describe_histogram!(
        "essay_stage_duration_seconds",
        "Time spent in one stage executor call"
    );
    metrics::describe_counter!("essay_refinements_total", "Refinements applied to essays");
}
