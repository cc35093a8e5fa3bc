use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Upper bound on PostgreSQL connections held by this process
    #[serde(default = "default_db_pool_size")]
    pub db_pool_size: u32,

    /// Redis connection string (idempotency cache + broker transport)
    pub redis_url: String,

    /// S3 bucket name
    pub s3_bucket: String,

    /// S3 endpoint URL (MinIO/LocalStack in dev, AWS otherwise)
    pub s3_endpoint: String,

    /// S3 region
    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    /// S3 access key ID
    pub s3_access_key: String,

    /// S3 secret access key
    pub s3_secret_key: String,

    /// Expiry in days for the object-store retention rules
    #[serde(default = "default_s3_retention_days")]
    pub s3_retention_days: u32,

    /// Upload size ceiling; one byte more is a 413
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// TTL applied to every signed URL
    #[serde(default = "default_presigned_url_expiry_seconds")]
    pub presigned_url_expiry_seconds: u32,

    /// Terminal jobs older than this are pruned
    #[serde(default = "default_job_retention_hours")]
    pub job_retention_hours: i64,

    /// TTL for idempotency records
    #[serde(default = "default_idempotency_ttl_seconds")]
    pub idempotency_ttl_seconds: u64,

    /// Consecutive webhook failures before the breaker opens
    #[serde(default = "default_webhook_cb_fail_threshold")]
    pub webhook_cb_fail_threshold: u32,

    /// Seconds an open breaker waits before allowing a probe
    #[serde(default = "default_webhook_cb_reset_timeout")]
    pub webhook_cb_reset_timeout: u64,

    /// Per-attempt webhook POST timeout
    #[serde(default = "default_webhook_timeout_seconds")]
    pub webhook_timeout_seconds: u64,

    /// Concurrent task slots in a standard worker process
    #[serde(default = "default_standard_queue_concurrency")]
    pub standard_queue_concurrency: usize,

    /// Concurrent task slots in the ml worker process
    #[serde(default = "default_ml_queue_concurrency")]
    pub ml_queue_concurrency: usize,

    /// Soft timeout for standard-queue tasks
    #[serde(default = "default_standard_task_timeout_seconds")]
    pub standard_task_timeout_seconds: u64,

    /// Soft timeout for ml-queue tasks
    #[serde(default = "default_ml_task_timeout_seconds")]
    pub ml_task_timeout_seconds: u64,

    /// Seconds between maintenance ticks
    #[serde(default = "default_maintenance_interval_seconds")]
    pub maintenance_interval_seconds: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_db_pool_size() -> u32 {
    16
}

fn default_s3_retention_days() -> u32 {
    1
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_presigned_url_expiry_seconds() -> u32 {
    3600
}

fn default_job_retention_hours() -> i64 {
    24
}

fn default_idempotency_ttl_seconds() -> u64 {
    86_400
}

fn default_webhook_cb_fail_threshold() -> u32 {
    5
}

fn default_webhook_cb_reset_timeout() -> u64 {
    60
}

fn default_webhook_timeout_seconds() -> u64 {
    5
}

fn default_standard_queue_concurrency() -> usize {
    4
}

fn default_ml_queue_concurrency() -> usize {
    1
}

fn default_standard_task_timeout_seconds() -> u64 {
    60
}

fn default_ml_task_timeout_seconds() -> u64 {
    300
}

fn default_maintenance_interval_seconds() -> u64 {
    3600
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
