use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::config::AppConfig;
use crate::db;
use crate::services::idempotency::IdempotencyCache;
use crate::services::queue::Broker;
use crate::services::storage::ObjectStore;
use crate::services::webhook::WebhookDelivery;

/// Shared application state passed to route handlers and task runners.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<AppConfig>,
    pub storage: Arc<ObjectStore>,
    pub idempotency: Arc<IdempotencyCache>,
    pub broker: Arc<Broker>,
    pub webhook: Arc<WebhookDelivery>,
}

impl AppState {
    /// Wire every service from configuration. Used by the API server and
    /// all worker binaries so the processes agree on one setup path.
    pub async fn init(config: AppConfig) -> Result<Self, InitError> {
        tracing::info!("Connecting to PostgreSQL");
        let db = db::init_pool(&config.database_url, config.db_pool_size).await?;

        tracing::info!("Initializing object store client");
        let storage = ObjectStore::new(
            &config.s3_bucket,
            &config.s3_endpoint,
            &config.s3_region,
            &config.s3_access_key,
            &config.s3_secret_key,
        )
        .map_err(|e| InitError::Storage(e.to_string()))?;

        tracing::info!("Connecting to Redis");
        let idempotency = IdempotencyCache::new(&config.redis_url, config.idempotency_ttl_seconds)?;
        let broker = Broker::new(&config.redis_url).map_err(|e| InitError::Broker(e.to_string()))?;

        let webhook = WebhookDelivery::new(
            config.webhook_cb_fail_threshold,
            Duration::from_secs(config.webhook_cb_reset_timeout),
            Duration::from_secs(config.webhook_timeout_seconds),
        )
        .map_err(|e| InitError::Webhook(e.to_string()))?;

        Ok(Self {
            db,
            config: Arc::new(config),
            storage: Arc::new(storage),
            idempotency: Arc::new(idempotency),
            broker: Arc::new(broker),
            webhook: Arc::new(webhook),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("database connection failed: {0}")]
    Db(#[from] sqlx::Error),

    #[error("object store setup failed: {0}")]
    Storage(String),

    #[error("Redis connection failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("broker setup failed: {0}")]
    Broker(String),

    #[error("webhook client setup failed: {0}")]
    Webhook(String),
}
