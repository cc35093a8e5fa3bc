use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::operation::{Operation, OperationParams};

const DEAD_LETTER_KEY: &str = "pixtools:queue:dead_letter";

/// The two logical work queues. Heavy inference is isolated on its own
/// queue so a strictly serial worker can drain it with bounded memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Standard,
    MlInference,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Standard => "standard",
            QueueName::MlInference => "ml_inference",
        }
    }

    fn pending_key(&self) -> String {
        format!("pixtools:queue:{}", self.as_str())
    }

    /// In-flight messages live here until acknowledged, so a lost worker
    /// leaves its message recoverable instead of dropped.
    fn processing_key(&self) -> String {
        format!("pixtools:queue:{}:processing", self.as_str())
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a queued message asks a worker to run: a processing operation, the
/// chord join callback, or the post-completion archive bundling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOp {
    Jpg,
    Png,
    Webp,
    Avif,
    Denoise,
    Metadata,
    Finalize,
    Archive,
}

impl TaskOp {
    /// The processing operation behind this task, when it is one.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            TaskOp::Jpg => Some(Operation::Jpg),
            TaskOp::Png => Some(Operation::Png),
            TaskOp::Webp => Some(Operation::Webp),
            TaskOp::Avif => Some(Operation::Avif),
            TaskOp::Denoise => Some(Operation::Denoise),
            TaskOp::Metadata => Some(Operation::Metadata),
            TaskOp::Finalize | TaskOp::Archive => None,
        }
    }

    /// Routing table: denoise goes to the ml queue, everything else to
    /// standard.
    pub fn queue(&self) -> QueueName {
        match self {
            TaskOp::Denoise => QueueName::MlInference,
            _ => QueueName::Standard,
        }
    }
}

impl From<Operation> for TaskOp {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Jpg => TaskOp::Jpg,
            Operation::Png => TaskOp::Png,
            Operation::Webp => TaskOp::Webp,
            Operation::Avif => TaskOp::Avif,
            Operation::Denoise => TaskOp::Denoise,
            Operation::Metadata => TaskOp::Metadata,
        }
    }
}

/// Task message serialized onto the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub job_id: Uuid,
    pub operation: TaskOp,
    pub source_key: String,
    #[serde(default, skip_serializing_if = "OperationParams::is_empty")]
    pub params: OperationParams,
    pub correlation_id: String,
    #[serde(default)]
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskMessage {
    pub fn new(
        job_id: Uuid,
        operation: TaskOp,
        source_key: impl Into<String>,
        params: OperationParams,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            operation,
            source_key: source_key.into(),
            params,
            correlation_id: correlation_id.into(),
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }
}

/// Per-sibling result collected by the finalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// An image-producing operation succeeded with this object key.
    Success { operation: Operation, key: String },
    /// The metadata operation succeeded with these extracted fields.
    Metadata {
        operation: Operation,
        fields: serde_json::Value,
    },
    /// The operation failed after its retry budget.
    Failure { operation: Operation, error: String },
}

impl TaskOutcome {
    pub fn operation(&self) -> Operation {
        match self {
            TaskOutcome::Success { operation, .. }
            | TaskOutcome::Metadata { operation, .. }
            | TaskOutcome::Failure { operation, .. } => *operation,
        }
    }
}

/// Envelope for messages parked on the dead-letter queue.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: TaskMessage,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Redis-backed broker with two work queues, late acknowledgement, a
/// dead-letter side channel, and chord join bookkeeping.
pub struct Broker {
    client: redis::Client,
}

impl Broker {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    /// Publish a message, routed by its task op.
    pub async fn publish(&self, message: &TaskMessage) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(message).map_err(QueueError::Serialize)?;
        let queue = message.operation.queue();
        conn.lpush::<_, _, ()>(queue.pending_key(), &payload)
            .await
            .map_err(QueueError::Redis)?;
        tracing::debug!(
            job_id = %message.job_id,
            operation = ?message.operation,
            queue = %queue,
            "Task published"
        );
        Ok(())
    }

    /// Pop the next message into the queue's processing list. The message
    /// is only removed for good by `ack`; acknowledgement is late.
    pub async fn reserve(&self, queue: QueueName) -> Result<Option<TaskMessage>, QueueError> {
        let mut conn = self.conn().await?;
        let result: Option<String> = conn
            .rpoplpush(queue.pending_key(), queue.processing_key())
            .await
            .map_err(QueueError::Redis)?;

        match result {
            Some(payload) => {
                let message =
                    serde_json::from_str(&payload).map_err(QueueError::Serialize)?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Acknowledge a message after the task terminated (success or final
    /// failure): drop it from the processing list.
    pub async fn ack(&self, queue: QueueName, message: &TaskMessage) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(message).map_err(QueueError::Serialize)?;
        conn.lrem::<_, _, ()>(queue.processing_key(), 1, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Park a message on the dead-letter queue for operator inspection.
    /// Nothing is silently dropped: the caller still records a failure
    /// outcome so the chord completes.
    pub async fn dead_letter(&self, message: &TaskMessage, reason: &str) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let envelope = DeadLetter {
            message: message.clone(),
            reason: reason.to_string(),
            failed_at: Utc::now(),
        };
        let payload = serde_json::to_string(&envelope).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(DEAD_LETTER_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        metrics::counter!("dead_letter_messages_total").increment(1);
        tracing::warn!(
            job_id = %envelope.message.job_id,
            operation = ?envelope.message.operation,
            reason,
            "Message routed to dead-letter queue"
        );
        Ok(())
    }

    fn chord_pending_key(job_id: Uuid) -> String {
        format!("pixtools:chord:{job_id}:pending")
    }

    fn chord_outcomes_key(job_id: Uuid) -> String {
        format!("pixtools:chord:{job_id}:outcomes")
    }

    /// Arm the chord join for a job with the number of sibling tasks.
    pub async fn init_chord(&self, job_id: Uuid, size: usize) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        conn.set::<_, _, ()>(Self::chord_pending_key(job_id), size as i64)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Record one sibling's outcome and decrement the countdown. The DECR
    /// is atomic, so exactly one caller observes zero; every sibling
    /// pushes its outcome before decrementing, so the observer of zero
    /// sees the complete list. Returns true for that last caller.
    pub async fn record_outcome(
        &self,
        job_id: Uuid,
        outcome: &TaskOutcome,
    ) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(outcome).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(Self::chord_outcomes_key(job_id), &payload)
            .await
            .map_err(QueueError::Redis)?;
        let remaining: i64 = conn
            .decr(Self::chord_pending_key(job_id), 1)
            .await
            .map_err(QueueError::Redis)?;
        if remaining <= 0 {
            conn.del::<_, ()>(Self::chord_pending_key(job_id))
                .await
                .map_err(QueueError::Redis)?;
        }
        Ok(remaining <= 0)
    }

    /// Collect and clear the aggregated outcomes for the finalize task.
    pub async fn take_outcomes(&self, job_id: Uuid) -> Result<Vec<TaskOutcome>, QueueError> {
        let mut conn = self.conn().await?;
        let key = Self::chord_outcomes_key(job_id);
        let raw: Vec<String> = conn.lrange(&key, 0, -1).await.map_err(QueueError::Redis)?;
        conn.del::<_, ()>(&key).await.map_err(QueueError::Redis)?;
        raw.iter()
            .map(|payload| serde_json::from_str(payload).map_err(QueueError::Serialize))
            .collect()
    }

    /// Pending messages on a queue.
    pub async fn queue_depth(&self, queue: QueueName) -> Result<u64, QueueError> {
        let mut conn = self.conn().await?;
        conn.llen(queue.pending_key()).await.map_err(QueueError::Redis)
    }

    /// Connectivity probe for health checks.
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
