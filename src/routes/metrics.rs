use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;

/// Prometheus scrape endpoint in text exposition format.
pub async fn prometheus_metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every metric the pipeline emits.
pub fn describe_metrics() {
    metrics::describe_counter!("manifest_jobs_submitted_total", "Jobs accepted and queued");
    metrics::describe_counter!("manifest_jobs_succeeded_total", "Jobs that reached succeeded");
    metrics::describe_counter!("manifest_jobs_failed_total", "Jobs that reached failed");
    metrics::describe_counter!(
        "manifest_jobs_enqueue_failed_total",
        "Jobs created but left queued because the queue rejected the message"
    );
    metrics::describe_histogram!(
        "inference_latency_seconds",
        "Duration of successful inference provider calls"
    );
    metrics::describe_counter!(
        "webhook_deliveries_total",
        "Webhook delivery attempts by outcome"
    );
    metrics::describe_gauge!(
        "manifest_queue_depth",
        "Messages in the active queue, leased or not"
    );
}
