use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::app_state::AppState;
use crate::services::queue::QueueName;

/// GET /metrics — Prometheus text exposition. Queue depths are sampled at
/// scrape time so the gauges track the broker without a polling task.
pub async fn prometheus_metrics(
    State((handle, state)): State<(Arc<PrometheusHandle>, AppState)>,
) -> impl IntoResponse {
    for queue in [QueueName::Standard, QueueName::MlInference] {
        match state.broker.queue_depth(queue).await {
            Ok(depth) => {
                metrics::gauge!("queue_depth", "queue" => queue.as_str()).set(depth as f64);
            }
            Err(e) => {
                tracing::warn!(queue = %queue, error = %e, "Failed to sample queue depth");
            }
        }
    }

    handle.render()
}
