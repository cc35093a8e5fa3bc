use uuid::Uuid;

const KEY_PREFIX: &str = "idempotency:";

/// Redis-backed idempotency cache mapping a client-supplied key to the job
/// it produced. Lookup errors degrade to a miss and set errors are only
/// logged: a duplicate job on a Redis outage beats a failed submission.
pub struct IdempotencyCache {
    client: redis::Client,
    ttl_seconds: u64,
}

impl IdempotencyCache {
    pub fn new(redis_url: &str, ttl_seconds: u64) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            ttl_seconds,
        })
    }

    /// Return the job a key already maps to, if any. Fails open.
    pub async fn check(&self, key: &str) -> Option<Uuid> {
        let result: Result<Option<String>, redis::RedisError> = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            redis::cmd("GET")
                .arg(format!("{KEY_PREFIX}{key}"))
                .query_async(&mut conn)
                .await
        }
        .await;

        match result {
            Ok(Some(raw)) => match raw.parse::<Uuid>() {
                Ok(id) => Some(id),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "Discarding malformed idempotency record");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "Idempotency lookup failed, treating as miss");
                None
            }
        }
    }

    /// Record the key → job mapping with the configured TTL. Set-if-absent:
    /// at most one concurrent caller wins and the return value says whether
    /// we did. Errors are logged and reported as a loss.
    pub async fn set(&self, key: &str, job_id: Uuid) -> bool {
        let result: Result<Option<String>, redis::RedisError> = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            redis::cmd("SET")
                .arg(format!("{KEY_PREFIX}{key}"))
                .arg(job_id.to_string())
                .arg("NX")
                .arg("EX")
                .arg(self.ttl_seconds)
                .query_async(&mut conn)
                .await
        }
        .await;

        match result {
            Ok(Some(_)) => {
                tracing::info!(key, job_id = %job_id, "Idempotency key recorded");
                true
            }
            Ok(None) => {
                tracing::info!(key, job_id = %job_id, "Idempotency key already taken");
                false
            }
            Err(e) => {
                tracing::warn!(key, job_id = %job_id, error = %e, "Failed to record idempotency key");
                false
            }
        }
    }

    /// Connectivity probe for health checks.
    pub async fn health_check(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
