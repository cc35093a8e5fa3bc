use std::time::Duration;

use tokio::time::{sleep, timeout};

use crate::app_state::AppState;
use crate::db::queries;
use crate::services::queue::{QueueName, TaskMessage, TaskOp, TaskOutcome};
use crate::tasks::{self, TaskError};

/// Attempts per message for transient failures.
const MAX_TASK_ATTEMPTS: u32 = 3;
/// Attempts for the non-fatal archive task.
const MAX_ARCHIVE_ATTEMPTS: u32 = 2;
const POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Run a worker pool over one queue. Each slot is an independent
/// cooperative loop; the process exits only on shutdown.
pub async fn run(state: AppState, queue: QueueName, concurrency: usize) {
    tracing::info!(queue = %queue, concurrency, "Worker pool starting");

    let mut slots = tokio::task::JoinSet::new();
    for slot in 0..concurrency.max(1) {
        let state = state.clone();
        slots.spawn(async move {
            tracing::debug!(queue = %queue, slot, "Worker slot ready");
            work_loop(state, queue).await;
        });
    }

    // Slots never return; this parks the pool until shutdown.
    while slots.join_next().await.is_some() {}
}

async fn work_loop(state: AppState, queue: QueueName) {
    loop {
        match state.broker.reserve(queue).await {
            Ok(Some(message)) => {
                handle_message(&state, queue, &message).await;
            }
            Ok(None) => {
                sleep(POLL_INTERVAL).await;
            }
            Err(e) => {
                tracing::error!(queue = %queue, error = %e, "Failed to reserve message");
                sleep(POLL_INTERVAL).await;
            }
        }
    }
}

/// Process one reserved message to termination and acknowledge it. The
/// message stays on the processing list until this returns, so a killed
/// worker leaves it recoverable.
pub async fn handle_message(state: &AppState, queue: QueueName, message: &TaskMessage) {
    let start = std::time::Instant::now();

    match message.operation {
        TaskOp::Finalize => run_control_task(state, message, MAX_TASK_ATTEMPTS).await,
        TaskOp::Archive => run_control_task(state, message, MAX_ARCHIVE_ATTEMPTS).await,
        _ => run_process_task(state, queue, message).await,
    }

    // Ack with the exact payload that was reserved; late acknowledgement
    // means a lost worker requeues the in-flight message instead of
    // dropping it.
    if let Err(e) = state.broker.ack(queue, message).await {
        tracing::error!(
            job_id = %message.job_id,
            operation = ?message.operation,
            error = %e,
            "Failed to acknowledge message"
        );
    }

    metrics::histogram!(
        "task_processing_seconds",
        "operation" => format!("{:?}", message.operation).to_lowercase(),
    )
    .record(start.elapsed().as_secs_f64());
}

/// Execute a processing operation with its timeout and retry budget, then
/// record the fan-out outcome. Whichever sibling completes the chord
/// enqueues the finalize callback.
async fn run_process_task(state: &AppState, queue: QueueName, message: &TaskMessage) {
    let Some(operation) = message.operation.operation() else {
        tracing::error!(operation = ?message.operation, "Not a processing operation");
        return;
    };

    if let Err(e) = queries::mark_processing(&state.db, message.job_id).await {
        tracing::warn!(job_id = %message.job_id, error = %e, "Failed to mark job processing");
    }

    let task_timeout = Duration::from_secs(match queue {
        QueueName::Standard => state.config.standard_task_timeout_seconds,
        QueueName::MlInference => state.config.ml_task_timeout_seconds,
    });

    let mut attempt = message.attempt;
    let outcome = loop {
        attempt += 1;
        tracing::info!(
            job_id = %message.job_id,
            operation = %operation,
            attempt,
            correlation_id = %message.correlation_id,
            "Running task"
        );

        let result = match timeout(task_timeout, tasks::run_operation(state, message, operation))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(TaskError::Timeout(task_timeout.as_secs())),
        };

        match result {
            Ok(outcome) => break outcome,
            Err(e) if e.is_transient() && attempt < MAX_TASK_ATTEMPTS => {
                tracing::warn!(
                    job_id = %message.job_id,
                    operation = %operation,
                    attempt,
                    error = %e,
                    "Transient task failure, backing off"
                );
                metrics::counter!("tasks_retried_total", "operation" => operation.as_str())
                    .increment(1);
                if let Err(db_err) = queries::increment_retry_count(&state.db, message.job_id).await
                {
                    tracing::warn!(job_id = %message.job_id, error = %db_err, "Retry count update failed");
                }
                sleep(backoff(attempt)).await;
            }
            Err(e) => {
                tracing::error!(
                    job_id = %message.job_id,
                    operation = %operation,
                    attempt,
                    error = %e,
                    "Task failed for good"
                );
                // Timeouts are plain failures; anything else that
                // exhausted its budget is parked for inspection.
                if !matches!(e, TaskError::Timeout(_)) {
                    let mut poisoned = message.clone();
                    poisoned.attempt = attempt;
                    if let Err(dlq_err) =
                        state.broker.dead_letter(&poisoned, &e.to_string()).await
                    {
                        tracing::error!(job_id = %message.job_id, error = %dlq_err, "Dead-letter push failed");
                    }
                }
                break TaskOutcome::Failure {
                    operation,
                    error: e.to_string(),
                };
            }
        }
    };

    record_outcome(state, message, outcome).await;
}

async fn record_outcome(state: &AppState, message: &TaskMessage, outcome: TaskOutcome) {
    match state.broker.record_outcome(message.job_id, &outcome).await {
        Ok(chord_complete) => {
            if chord_complete {
                let finalize = TaskMessage::new(
                    message.job_id,
                    TaskOp::Finalize,
                    message.source_key.clone(),
                    Default::default(),
                    message.correlation_id.clone(),
                );
                if let Err(e) = state.broker.publish(&finalize).await {
                    tracing::error!(job_id = %message.job_id, error = %e, "Failed to enqueue finalize");
                }
            }
        }
        Err(e) => {
            tracing::error!(
                job_id = %message.job_id,
                error = %e,
                "Failed to record task outcome"
            );
        }
    }
}

/// Shared retry shell for the finalize and archive control tasks.
async fn run_control_task(state: &AppState, message: &TaskMessage, max_attempts: u32) {
    let mut attempt = message.attempt;
    loop {
        attempt += 1;
        let result = match message.operation {
            TaskOp::Finalize => tasks::finalize::run(state, message).await,
            TaskOp::Archive => tasks::archive::run(state, message).await,
            _ => return,
        };
        match result {
            Ok(()) => return,
            Err(e) if e.is_transient() && attempt < max_attempts => {
                tracing::warn!(
                    job_id = %message.job_id,
                    operation = ?message.operation,
                    attempt,
                    error = %e,
                    "Control task failed, backing off"
                );
                sleep(backoff(attempt)).await;
            }
            Err(e) => {
                tracing::error!(
                    job_id = %message.job_id,
                    operation = ?message.operation,
                    error = %e,
                    "Control task failed for good"
                );
                let mut poisoned = message.clone();
                poisoned.attempt = attempt;
                if let Err(dlq_err) = state.broker.dead_letter(&poisoned, &e.to_string()).await {
                    tracing::error!(job_id = %message.job_id, error = %dlq_err, "Dead-letter push failed");
                }
                return;
            }
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << (attempt.clamp(1, 4) - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(2));
        assert_eq!(backoff(3), Duration::from_secs(4));
        // Clamped so a runaway attempt counter cannot stall a slot.
        assert_eq!(backoff(10), Duration::from_secs(8));
    }
}
