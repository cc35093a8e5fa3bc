//! Standard-queue worker: conversions, metadata extraction, finalization,
//! and archive bundling, with a small number of cooperative task slots.

use pixtools::app_state::AppState;
use pixtools::config::AppConfig;
use pixtools::services::queue::QueueName;
use pixtools::worker;

#[tokio::main]
async fn main() {
    pixtools::init_logging();

    tracing::info!("Starting standard worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let concurrency = config.standard_queue_concurrency;

    let state = AppState::init(config)
        .await
        .expect("Failed to initialize services");

    worker::run(state, QueueName::Standard, concurrency).await;
}
