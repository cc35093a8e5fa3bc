//! ML-inference worker: drains the ml_inference queue strictly serially so
//! heavy denoising runs one image at a time with bounded memory.

use pixtools::app_state::AppState;
use pixtools::config::AppConfig;
use pixtools::services::queue::QueueName;
use pixtools::worker;

#[tokio::main]
async fn main() {
    pixtools::init_logging();

    tracing::info!("Starting ml-inference worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    // Defaults to 1: inference is serialized per process.
    let concurrency = config.ml_queue_concurrency;

    let state = AppState::init(config)
        .await
        .expect("Failed to initialize services");

    worker::run(state, QueueName::MlInference, concurrency).await;
}
