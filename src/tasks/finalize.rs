use std::collections::BTreeMap;

use chrono::Utc;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::job::JobStatus;
use crate::services::queue::{TaskMessage, TaskOp, TaskOutcome};
use crate::services::webhook::{DeliveryOutcome, WebhookPayload};
use crate::tasks::TaskError;

/// Chord join callback: aggregate the fan-out outcomes, apply the terminal
/// transition, kick off bundling, and notify the webhook.
pub async fn run(state: &AppState, message: &TaskMessage) -> Result<(), TaskError> {
    let job_id = message.job_id;

    let Some(job) = queries::get_job(&state.db, job_id).await? else {
        tracing::warn!(job_id = %job_id, "Finalize invoked for unknown job");
        return Ok(());
    };

    // Redelivered finalize messages must not touch a settled job. Drain
    // any stray outcomes so redelivery leaves no state behind.
    if job.status.is_terminal() {
        let _ = state.broker.take_outcomes(job_id).await;
        tracing::info!(
            job_id = %job_id,
            status = %job.status,
            "Job already terminal, finalize is a no-op"
        );
        return Ok(());
    }

    let outcomes = state.broker.take_outcomes(job_id).await?;
    tracing::info!(
        job_id = %job_id,
        correlation_id = %message.correlation_id,
        outcomes = outcomes.len(),
        "Finalizing job"
    );

    let Aggregation {
        result_keys,
        exif_metadata,
        error_message,
        all_failed,
    } = aggregate(&outcomes);

    if all_failed {
        let transitioned = queries::finalize_job(
            &state.db,
            job_id,
            JobStatus::Failed,
            &result_keys,
            None,
            error_message.as_deref(),
        )
        .await?;
        if transitioned {
            observe_terminal(&job.created_at, JobStatus::Failed);
            tracing::warn!(job_id = %job_id, error = ?error_message, "Job failed");
        }
        return Ok(());
    }

    // Sign fresh URLs for the webhook payload before committing state, so
    // a signing hiccup retries the whole finalization cleanly.
    let mut result_urls = BTreeMap::new();
    for (operation, key) in &result_keys {
        let ext = key.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("bin");
        let download_name = format!("pixtools_{operation}_{}.{ext}", job.original_stem());
        let url = state
            .storage
            .sign(
                key,
                state.config.presigned_url_expiry_seconds,
                Some(&download_name),
            )
            .await?;
        result_urls.insert(operation.clone(), url);
    }

    let transitioned = queries::finalize_job(
        &state.db,
        job_id,
        JobStatus::Completed,
        &result_keys,
        exif_metadata.as_ref(),
        error_message.as_deref(),
    )
    .await?;
    if !transitioned {
        tracing::info!(job_id = %job_id, "Lost the terminal transition race, exiting");
        return Ok(());
    }

    let mut status = JobStatus::Completed;

    // Bundling is fire-and-forget: the archive task races the client's
    // next poll and the job stays COMPLETED even if it never lands.
    if !result_keys.is_empty() {
        let archive = TaskMessage::new(
            job_id,
            TaskOp::Archive,
            job.raw_key.clone(),
            Default::default(),
            message.correlation_id.clone(),
        );
        if let Err(e) = state.broker.publish(&archive).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to dispatch archive task");
        }
    }

    if !job.webhook_url.is_empty() {
        let payload = WebhookPayload {
            job_id,
            status: status.to_string(),
            result_urls,
            archive_url: None,
            metadata: exif_metadata.clone(),
            error: error_message.clone(),
        };
        match state.webhook.deliver(&job.webhook_url, &payload).await {
            DeliveryOutcome::Delivered => {}
            DeliveryOutcome::Skipped | DeliveryOutcome::Failed => {
                queries::mark_webhook_failed(&state.db, job_id).await?;
                status = JobStatus::CompletedWebhookFailed;
            }
        }
    }

    observe_terminal(&job.created_at, status);
    tracing::info!(
        job_id = %job_id,
        status = %status,
        results = result_keys.len(),
        "Job finalized"
    );
    Ok(())
}

/// Fan-out outcomes folded into the fields the terminal transition writes.
#[derive(Debug, Default, PartialEq)]
pub struct Aggregation {
    pub result_keys: BTreeMap<String, String>,
    pub exif_metadata: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub all_failed: bool,
}

/// Partition sibling outcomes: image successes become result keys, the
/// metadata outcome feeds the metadata field, failures concatenate into
/// the error description. A job fails outright only when nothing it asked
/// for succeeded.
pub fn aggregate(outcomes: &[TaskOutcome]) -> Aggregation {
    let mut result_keys: BTreeMap<String, String> = BTreeMap::new();
    let mut exif_metadata: Option<serde_json::Value> = None;
    let mut failures: Vec<String> = Vec::new();
    let mut image_outcomes = 0usize;

    for outcome in outcomes {
        match outcome {
            TaskOutcome::Success { operation, key } => {
                image_outcomes += 1;
                result_keys.insert(operation.to_string(), key.clone());
            }
            TaskOutcome::Metadata { fields, .. } => {
                exif_metadata = Some(fields.clone());
            }
            TaskOutcome::Failure { operation, error } => {
                if operation.produces_image() {
                    image_outcomes += 1;
                }
                failures.push(format!("{operation}: {error}"));
            }
        }
    }

    let all_failed = if image_outcomes > 0 {
        result_keys.is_empty()
    } else {
        exif_metadata.is_none() && !failures.is_empty()
    };

    Aggregation {
        result_keys,
        exif_metadata,
        error_message: if failures.is_empty() {
            None
        } else {
            Some(failures.join("; "))
        },
        all_failed,
    }
}

fn observe_terminal(created_at: &chrono::DateTime<Utc>, status: JobStatus) {
    let elapsed = (Utc::now() - *created_at).num_milliseconds().max(0) as f64 / 1000.0;
    metrics::histogram!("job_end_to_end_seconds").record(elapsed);
    metrics::counter!("job_status_total", "status" => status.as_str()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::operation::Operation;
    use serde_json::json;

    fn success(op: Operation, key: &str) -> TaskOutcome {
        TaskOutcome::Success {
            operation: op,
            key: key.to_string(),
        }
    }

    fn failure(op: Operation, error: &str) -> TaskOutcome {
        TaskOutcome::Failure {
            operation: op,
            error: error.to_string(),
        }
    }

    #[test]
    fn partial_failure_still_completes() {
        let agg = aggregate(&[
            success(Operation::Webp, "processed/x/webp.webp"),
            failure(Operation::Denoise, "inference crashed"),
        ]);

        assert!(!agg.all_failed);
        assert_eq!(agg.result_keys.len(), 1);
        assert!(agg.result_keys.contains_key("webp"));
        assert!(agg.error_message.unwrap().contains("denoise"));
    }

    #[test]
    fn all_image_failures_fail_the_job() {
        let agg = aggregate(&[
            failure(Operation::Webp, "boom"),
            failure(Operation::Avif, "boom"),
        ]);

        assert!(agg.all_failed);
        assert!(agg.result_keys.is_empty());
    }

    #[test]
    fn metadata_feeds_the_metadata_field_not_result_keys() {
        let agg = aggregate(&[
            success(Operation::Webp, "processed/x/webp.webp"),
            TaskOutcome::Metadata {
                operation: Operation::Metadata,
                fields: json!({"camera_make": "Canon"}),
            },
        ]);

        assert!(!agg.result_keys.contains_key("metadata"));
        assert_eq!(agg.exif_metadata, Some(json!({"camera_make": "Canon"})));
    }

    #[test]
    fn metadata_only_job_completes_with_empty_results() {
        let agg = aggregate(&[TaskOutcome::Metadata {
            operation: Operation::Metadata,
            fields: json!({}),
        }]);

        assert!(!agg.all_failed);
        assert!(agg.result_keys.is_empty());
    }

    #[test]
    fn metadata_only_failure_fails_the_job() {
        let agg = aggregate(&[failure(Operation::Metadata, "unreadable")]);
        assert!(agg.all_failed);
    }

    #[test]
    fn image_failure_with_metadata_success_fails_the_job() {
        // Metadata alone cannot save a job whose image work all failed.
        let agg = aggregate(&[
            failure(Operation::Webp, "boom"),
            TaskOutcome::Metadata {
                operation: Operation::Metadata,
                fields: json!({}),
            },
        ]);
        assert!(agg.all_failed);
    }
}
