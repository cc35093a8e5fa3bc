use chrono::{Duration, Utc};

use crate::app_state::AppState;
use crate::db::queries;
use crate::tasks::TaskError;

/// Delete terminal jobs past the retention window along with any artifacts
/// still in the object store. Returns the number of records pruned.
pub async fn prune_expired_jobs(state: &AppState) -> Result<usize, TaskError> {
    let cutoff = Utc::now() - Duration::hours(state.config.job_retention_hours);
    let pruned = queries::prune_before(&state.db, cutoff).await?;

    for job in &pruned {
        let mut keys: Vec<&str> = vec![job.raw_key.as_str()];
        keys.extend(job.result_keys.values().map(String::as_str));
        if let Some(archive) = &job.archive_key {
            keys.push(archive);
        }
        for key in keys {
            // Retention rules expire objects on their own; deletion here
            // is best-effort cleanup for artifacts that outlive the row.
            if let Err(e) = state.storage.delete(key).await {
                tracing::warn!(job_id = %job.id, key, error = %e, "Failed to delete artifact");
            }
        }
    }

    metrics::counter!("jobs_pruned_total").increment(pruned.len() as u64);
    tracing::info!(
        pruned = pruned.len(),
        cutoff = %cutoff,
        "Pruned expired job records"
    );
    Ok(pruned.len())
}
