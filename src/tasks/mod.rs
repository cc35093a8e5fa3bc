use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::operation::Operation;
use crate::services::queue::{QueueError, TaskMessage, TaskOutcome};
use crate::services::storage::StorageError;

pub mod archive;
pub mod convert;
pub mod denoise;
pub mod finalize;
pub mod maintenance;
pub mod metadata;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("image processing failed: {0}")]
    Image(String),

    #[error("archive bundling failed: {0}")]
    Archive(String),

    #[error("job {0} no longer exists")]
    JobGone(Uuid),

    #[error("task timed out after {0}s")]
    Timeout(u64),
}

impl TaskError {
    /// Transient failures are worth another attempt; everything else goes
    /// straight to the dead-letter queue.
    pub fn is_transient(&self) -> bool {
        match self {
            TaskError::Storage(e) => e.is_transient(),
            TaskError::Queue(_) | TaskError::Db(_) => true,
            TaskError::Image(_)
            | TaskError::Archive(_)
            | TaskError::JobGone(_)
            | TaskError::Timeout(_) => false,
        }
    }
}

/// Run one processing operation and wrap its result as the fan-out outcome
/// the finalizer will aggregate.
pub async fn run_operation(
    state: &AppState,
    message: &TaskMessage,
    operation: Operation,
) -> Result<TaskOutcome, TaskError> {
    match operation {
        Operation::Metadata => {
            let fields = metadata::run(state, message).await?;
            Ok(TaskOutcome::Metadata { operation, fields })
        }
        Operation::Denoise => {
            let key = denoise::run(state, message).await?;
            Ok(TaskOutcome::Success { operation, key })
        }
        Operation::Jpg | Operation::Png | Operation::Webp | Operation::Avif => {
            let key = convert::run(state, message, operation).await?;
            Ok(TaskOutcome::Success { operation, key })
        }
    }
}
