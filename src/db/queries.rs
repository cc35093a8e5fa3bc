use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};
use crate::models::operation::Operation;

const TERMINAL_STATUSES: [&str; 3] = ["COMPLETED", "COMPLETED_WEBHOOK_FAILED", "FAILED"];

/// Artifact keys released by pruning a job record.
#[derive(Debug)]
pub struct PrunedJob {
    pub id: Uuid,
    pub raw_key: String,
    pub result_keys: BTreeMap<String, String>,
    pub archive_key: Option<String>,
}

fn row_to_job(row: &PgRow) -> Result<Job, sqlx::Error> {
    let status_raw: String = row.try_get("status")?;
    let status = JobStatus::parse(&status_raw).ok_or_else(|| sqlx::Error::Decode(
        format!("unknown job status '{status_raw}'").into(),
    ))?;

    let operations: serde_json::Value = row.try_get("operations")?;
    let operations: Vec<Operation> =
        serde_json::from_value(operations).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    let result_keys: Option<serde_json::Value> = row.try_get("result_keys")?;
    let result_keys: BTreeMap<String, String> = match result_keys {
        Some(value) => serde_json::from_value(value).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        None => BTreeMap::new(),
    };

    Ok(Job {
        id: row.try_get("id")?,
        status,
        operations,
        result_keys,
        exif_metadata: row.try_get("exif_metadata")?,
        archive_key: row.try_get("archive_key")?,
        raw_key: row.try_get("raw_key")?,
        original_filename: row.try_get("original_filename")?,
        webhook_url: row.try_get("webhook_url")?,
        error_message: row.try_get("error_message")?,
        retry_count: row.try_get("retry_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new job with PENDING status.
pub async fn create_job(
    pool: &PgPool,
    id: Uuid,
    operations: &[Operation],
    raw_key: &str,
    original_filename: Option<&str>,
    webhook_url: &str,
) -> Result<Job, sqlx::Error> {
    let operations_json =
        serde_json::to_value(operations).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    let row = sqlx::query(
        r#"
        INSERT INTO jobs (id, status, operations, raw_key, original_filename, webhook_url)
        VALUES ($1, 'PENDING', $2, $3, $4, $5)
        RETURNING id, status, operations, result_keys, exif_metadata, archive_key, raw_key,
                  original_filename, webhook_url, error_message, retry_count, created_at, updated_at
        "#,
    )
    .bind(id)
    .bind(operations_json)
    .bind(raw_key)
    .bind(original_filename)
    .bind(webhook_url)
    .fetch_one(pool)
    .await?;

    row_to_job(&row)
}

/// Get a job by ID.
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, status, operations, result_keys, exif_metadata, archive_key, raw_key,
               original_filename, webhook_url, error_message, retry_count, created_at, updated_at
        FROM jobs
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_job).transpose()
}

/// Move a PENDING job to PROCESSING when its first task starts. A no-op
/// for any other state, so redelivered messages cannot regress a job.
pub async fn mark_processing(pool: &PgPool, job_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'PROCESSING', updated_at = NOW()
        WHERE id = $1 AND status = 'PENDING'
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Apply the terminal transition, writing result keys, extracted metadata,
/// and the error description in one statement. Guarded so a job becomes
/// terminal exactly once: returns false when the job was already terminal
/// (or unknown) and nothing was written.
pub async fn finalize_job(
    pool: &PgPool,
    job_id: Uuid,
    status: JobStatus,
    result_keys: &BTreeMap<String, String>,
    exif_metadata: Option<&serde_json::Value>,
    error_message: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let result_keys_json =
        serde_json::to_value(result_keys).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = $1,
            result_keys = $2,
            exif_metadata = COALESCE($3, exif_metadata),
            error_message = $4,
            updated_at = NOW()
        WHERE id = $5 AND status NOT IN ($6, $7, $8)
        "#,
    )
    .bind(status.as_str())
    .bind(result_keys_json)
    .bind(exif_metadata)
    .bind(error_message)
    .bind(job_id)
    .bind(TERMINAL_STATUSES[0])
    .bind(TERMINAL_STATUSES[1])
    .bind(TERMINAL_STATUSES[2])
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Demote COMPLETED to COMPLETED_WEBHOOK_FAILED after delivery gave up.
pub async fn mark_webhook_failed(pool: &PgPool, job_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'COMPLETED_WEBHOOK_FAILED', updated_at = NOW()
        WHERE id = $1 AND status = 'COMPLETED'
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Record the archive object key once bundling finished.
pub async fn set_archive_key(
    pool: &PgPool,
    job_id: Uuid,
    archive_key: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET archive_key = $1, updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(archive_key)
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Increment the retry counter, returning the new value.
pub async fn increment_retry_count(pool: &PgPool, job_id: Uuid) -> Result<i32, sqlx::Error> {
    let row = sqlx::query(
        r#"
        UPDATE jobs
        SET retry_count = retry_count + 1, updated_at = NOW()
        WHERE id = $1
        RETURNING retry_count
        "#,
    )
    .bind(job_id)
    .fetch_one(pool)
    .await?;

    row.try_get("retry_count")
}

/// Delete terminal jobs created before the cutoff. Returns the deleted
/// rows' artifact keys so the caller can release the objects too.
pub async fn prune_before(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<PrunedJob>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        DELETE FROM jobs
        WHERE created_at < $1 AND status IN ($2, $3, $4)
        RETURNING id, raw_key, result_keys, archive_key
        "#,
    )
    .bind(cutoff)
    .bind(TERMINAL_STATUSES[0])
    .bind(TERMINAL_STATUSES[1])
    .bind(TERMINAL_STATUSES[2])
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let result_keys: Option<serde_json::Value> = row.try_get("result_keys")?;
            let result_keys: BTreeMap<String, String> = match result_keys {
                Some(value) => {
                    serde_json::from_value(value).map_err(|e| sqlx::Error::Decode(Box::new(e)))?
                }
                None => BTreeMap::new(),
            };
            Ok(PrunedJob {
                id: row.try_get("id")?,
                raw_key: row.try_get("raw_key")?,
                result_keys,
                archive_key: row.try_get("archive_key")?,
            })
        })
        .collect()
}
