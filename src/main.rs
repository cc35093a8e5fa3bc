use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use pixtools::app_state::AppState;
use pixtools::config::AppConfig;
use pixtools::{db, routes};

/// Slack for multipart framing on top of the file-size ceiling.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() {
    pixtools::init_logging();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing pixtools API server");

    // Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("jobs_submitted_total", "Total jobs accepted for processing");
    metrics::describe_counter!("job_status_total", "Terminal job transitions by status");
    metrics::describe_histogram!(
        "job_end_to_end_seconds",
        "Time from submission to terminal state"
    );
    metrics::describe_histogram!("task_processing_seconds", "Per-task processing time");
    metrics::describe_counter!("tasks_retried_total", "Task attempts retried after failure");
    metrics::describe_counter!(
        "dead_letter_messages_total",
        "Messages parked on the dead-letter queue"
    );
    metrics::describe_counter!(
        "webhook_breaker_transitions_total",
        "Circuit breaker state transitions"
    );
    metrics::describe_counter!("jobs_pruned_total", "Expired job records removed");
    metrics::describe_gauge!("queue_depth", "Pending messages per queue, sampled at scrape");

    let state = AppState::init(config.clone())
        .await
        .expect("Failed to initialize services");

    tracing::info!("Running database migrations");
    db::run_migrations(&state.db)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Ensuring object-store retention rules");
    state
        .storage
        .ensure_retention(config.s3_retention_days)
        .await
        .expect("Failed to configure object-store retention");

    let body_limit = config.max_upload_bytes + MULTIPART_OVERHEAD_BYTES;

    let app = Router::new()
        .route("/api/process", post(routes::jobs::submit_job))
        .route("/api/jobs/:job_id", get(routes::jobs::get_job))
        .route("/api/health", get(routes::health::health_check))
        .with_state(state.clone())
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state((prometheus_handle, state)),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        // The handler enforces the exact file-size ceiling; this bounds
        // the whole request body including multipart framing.
        .layer(RequestBodyLimitLayer::new(body_limit));

    tracing::info!("Starting pixtools on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
