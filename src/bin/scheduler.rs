//! Maintenance scheduler: a dedicated process that prunes expired job
//! records (and their artifacts) at a fixed cadence.

use std::time::Duration;

use pixtools::app_state::AppState;
use pixtools::config::AppConfig;
use pixtools::tasks::maintenance;

#[tokio::main]
async fn main() {
    pixtools::init_logging();

    tracing::info!("Starting maintenance scheduler");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let interval = Duration::from_secs(config.maintenance_interval_seconds);

    let state = AppState::init(config)
        .await
        .expect("Failed to initialize services");

    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match maintenance::prune_expired_jobs(&state).await {
            Ok(pruned) => {
                tracing::info!(pruned, "Maintenance tick complete");
            }
            Err(e) => {
                tracing::error!(error = %e, "Maintenance tick failed");
            }
        }
    }
}
