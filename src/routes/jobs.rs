use std::collections::BTreeMap;
use std::time::Duration;

use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use garde::Validate;
use image::ImageFormat;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::api::{JobStatusResponse, SubmitResponse};
use crate::models::job::JobStatus;
use crate::models::operation::{Operation, OperationParams};
use crate::services::{dag, storage};

const MAX_OPERATIONS: usize = 6;
const MAX_IDEMPOTENCY_KEY_BYTES: usize = 128;
const RAW_UPLOAD_ATTEMPTS: u32 = 3;

type ApiError = (StatusCode, String);

/// POST /api/process — upload an image and queue processing operations.
pub async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut file_name: Option<String> = None;
    let mut operations_raw: Option<String> = None;
    let mut params_raw: Option<String> = None;
    let mut webhook_url_raw: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Multipart error: {e}")))?
    {
        match field.name() {
            Some("file") => {
                file_name = field.file_name().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, format!("Failed to read file: {e}")))?;
                if data.len() > state.config.max_upload_bytes {
                    return Err((
                        StatusCode::PAYLOAD_TOO_LARGE,
                        format!(
                            "File exceeds {} byte limit",
                            state.config.max_upload_bytes
                        ),
                    ));
                }
                file_bytes = Some(data.to_vec());
            }
            Some("operations") => {
                let text = field.text().await.map_err(|_| {
                    (
                        StatusCode::UNPROCESSABLE_ENTITY,
                        "Invalid operations field".to_string(),
                    )
                })?;
                operations_raw = Some(text);
            }
            Some("operation_params") => {
                let text = field.text().await.map_err(|_| {
                    (
                        StatusCode::UNPROCESSABLE_ENTITY,
                        "Invalid operation_params field".to_string(),
                    )
                })?;
                params_raw = Some(text);
            }
            Some("webhook_url") => {
                let text = field.text().await.map_err(|_| {
                    (
                        StatusCode::UNPROCESSABLE_ENTITY,
                        "Invalid webhook_url field".to_string(),
                    )
                })?;
                webhook_url_raw = Some(text);
            }
            _ => {}
        }
    }

    let file_bytes = file_bytes.ok_or((
        StatusCode::UNPROCESSABLE_ENTITY,
        "Missing 'file' field in multipart upload".to_string(),
    ))?;
    let operations_raw = operations_raw.ok_or((
        StatusCode::UNPROCESSABLE_ENTITY,
        "Missing 'operations' field".to_string(),
    ))?;

    // The source format comes from the bytes, not the filename.
    let source_format = match image::guess_format(&file_bytes) {
        Ok(format @ (ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP | ImageFormat::Avif)) => {
            format
        }
        _ => {
            return Err((
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "Only JPEG, PNG, WebP, and AVIF uploads are supported".to_string(),
            ));
        }
    };

    let operations = parse_operations(&operations_raw)?;
    reject_same_format(&operations, source_format)?;
    let params = parse_operation_params(params_raw.as_deref(), &operations)?;
    let webhook_url = validate_webhook_url(webhook_url_raw.as_deref())?;

    let idempotency_key = idempotency_key(&headers)?;
    if let Some(key) = idempotency_key {
        if let Some(existing) = state.idempotency.check(key).await {
            tracing::info!(key, job_id = %existing, "Idempotent replay, returning existing job");
            return Ok((
                StatusCode::ACCEPTED,
                Json(SubmitResponse {
                    job_id: existing,
                    status: JobStatus::Pending.to_string(),
                }),
            ));
        }
    }

    let correlation_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let job_id = Uuid::new_v4();

    // Reserve the key before doing any work: set-if-absent serializes
    // concurrent submissions, so at most one of them uploads bytes and
    // creates a record. A losing racer hands back the winner's job.
    if let Some(key) = idempotency_key {
        if !state.idempotency.set(key, job_id).await {
            if let Some(winner) = state.idempotency.check(key).await {
                tracing::info!(key, job_id = %winner, "Lost idempotency race, returning winner");
                return Ok((
                    StatusCode::ACCEPTED,
                    Json(SubmitResponse {
                        job_id: winner,
                        status: JobStatus::Pending.to_string(),
                    }),
                ));
            }
            // Cache trouble: proceed fail-open, risking a duplicate job.
        }
    }
    let original_name = file_name.as_deref().unwrap_or("upload.bin");
    let raw_key = storage::raw_key(job_id, original_name);
    let content_type = source_format.to_mime_type();

    upload_raw_with_retry(&state, &raw_key, &file_bytes, content_type).await?;

    let job = queries::create_job(
        &state.db,
        job_id,
        &operations,
        &raw_key,
        file_name.as_deref(),
        &webhook_url,
    )
    .await
    .map_err(|e| {
        tracing::error!(job_id = %job_id, error = %e, "Failed to create job record");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "Job store unavailable".to_string(),
        )
    })?;

    let plan = dag::build(job_id, &raw_key, &operations, &params, &correlation_id)
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    plan.dispatch(&state.broker).await.map_err(|e| {
        tracing::error!(job_id = %job_id, error = %e, "Failed to dispatch plan");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "Task broker unavailable".to_string(),
        )
    })?;

    metrics::counter!("jobs_submitted_total").increment(1);
    tracing::info!(
        job_id = %job_id,
        correlation_id = %correlation_id,
        operations = ?operations,
        upload_bytes = file_bytes.len(),
        "Job created and dispatched"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: job.id,
            status: job.status.to_string(),
        }),
    ))
}

/// GET /api/jobs/{id} — poll job status. Every poll signs fresh URLs.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = queries::get_job(&state.db, job_id)
        .await
        .map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Failed to load job");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Job store unavailable".to_string(),
            )
        })?
        .ok_or((StatusCode::NOT_FOUND, format!("Job {job_id} not found")))?;

    let ttl = state.config.presigned_url_expiry_seconds;
    let stem = job.original_stem().to_string();

    let mut result_urls = BTreeMap::new();
    for (operation, key) in &job.result_keys {
        let ext = key.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("bin");
        let download_name = format!("pixtools_{operation}_{stem}.{ext}");
        match state.storage.sign(key, ttl, Some(&download_name)).await {
            Ok(url) => {
                result_urls.insert(operation.clone(), url);
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, key, error = %e, "Failed to sign result URL");
            }
        }
    }

    let archive_url = match &job.archive_key {
        Some(key) => {
            let download_name = format!("pixtools_bundle_{stem}.zip");
            state
                .storage
                .sign(key, ttl, Some(&download_name))
                .await
                .map_err(|e| {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to sign archive URL");
                    e
                })
                .ok()
        }
        None => None,
    };

    Ok(Json(JobStatusResponse {
        job_id: job.id,
        status: job.status.to_string(),
        operations: job.operations.iter().map(|op| op.to_string()).collect(),
        result_urls,
        archive_url,
        metadata: job.exif_metadata,
        error_message: job.error_message,
        created_at: job.created_at,
    }))
}

async fn upload_raw_with_retry(
    state: &AppState,
    key: &str,
    bytes: &[u8],
    content_type: &str,
) -> Result<(), ApiError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match state.storage.put_raw(key, bytes, content_type).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < RAW_UPLOAD_ATTEMPTS => {
                tracing::warn!(key, attempt, error = %e, "Raw upload failed, retrying");
                tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
            }
            Err(e) if e.is_transient() => {
                tracing::error!(key, error = %e, "Raw upload retries exhausted");
                return Err((
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Object store unavailable".to_string(),
                ));
            }
            Err(e) => {
                tracing::error!(key, error = %e, "Raw upload failed permanently");
                return Err((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to store upload".to_string(),
                ));
            }
        }
    }
}

fn idempotency_key(headers: &HeaderMap) -> Result<Option<&str>, ApiError> {
    let Some(value) = headers.get("idempotency-key") else {
        return Ok(None);
    };
    let key = value.to_str().map_err(|_| {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            "Idempotency-Key must be visible ASCII".to_string(),
        )
    })?;
    if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_BYTES {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("Idempotency-Key must be 1..={MAX_IDEMPOTENCY_KEY_BYTES} bytes"),
        ));
    }
    Ok(Some(key))
}

fn parse_operations(raw: &str) -> Result<Vec<Operation>, ApiError> {
    let operations: Vec<Operation> = serde_json::from_str(raw).map_err(|e| {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("Invalid operations: {e}"),
        )
    })?;

    if operations.is_empty() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "At least one operation is required".to_string(),
        ));
    }
    if operations.len() > MAX_OPERATIONS {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("At most {MAX_OPERATIONS} operations per job"),
        ));
    }
    Ok(operations)
}

fn source_tag(format: ImageFormat) -> Option<Operation> {
    match format {
        ImageFormat::Jpeg => Some(Operation::Jpg),
        ImageFormat::Png => Some(Operation::Png),
        ImageFormat::WebP => Some(Operation::Webp),
        ImageFormat::Avif => Some(Operation::Avif),
        _ => None,
    }
}

fn reject_same_format(operations: &[Operation], source: ImageFormat) -> Result<(), ApiError> {
    let Some(source_op) = source_tag(source) else {
        return Ok(());
    };
    if operations
        .iter()
        .any(|op| op.is_conversion() && *op == source_op)
    {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            format!(
                "Cannot convert to {source_op}: source and target formats are the same"
            ),
        ));
    }
    Ok(())
}

fn parse_operation_params(
    raw: Option<&str>,
    operations: &[Operation],
) -> Result<BTreeMap<Operation, OperationParams>, ApiError> {
    let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
        return Ok(BTreeMap::new());
    };

    let parsed: BTreeMap<String, OperationParams> = serde_json::from_str(raw).map_err(|e| {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("Invalid operation_params: {e}"),
        )
    })?;

    let mut out = BTreeMap::new();
    for (tag, params) in parsed {
        // Params for operations that were not requested are dropped.
        let Some(op) = operations.iter().find(|op| op.as_str() == tag) else {
            continue;
        };

        params.validate().map_err(|e| {
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("operation_params['{tag}']: {e}"),
            )
        })?;

        if params.quality.is_some() && !op.supports_quality() {
            return Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("operation_params['{tag}'].quality is only supported for jpg/webp"),
            ));
        }
        if let Some(resize) = &params.resize {
            if resize.is_empty() {
                return Err((
                    StatusCode::UNPROCESSABLE_ENTITY,
                    format!("operation_params['{tag}'].resize requires width or height"),
                ));
            }
            if !op.produces_image() {
                return Err((
                    StatusCode::UNPROCESSABLE_ENTITY,
                    format!("operation_params['{tag}'].resize does not apply to {tag}"),
                ));
            }
        }

        if !params.is_empty() {
            out.insert(*op, params);
        }
    }
    Ok(out)
}

fn validate_webhook_url(raw: Option<&str>) -> Result<String, ApiError> {
    let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
        return Ok(String::new());
    };

    let parsed = url::Url::parse(raw).map_err(|_| {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            "webhook_url must be a valid http(s) URL".to_string(),
        )
    })?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "webhook_url must be a valid http(s) URL".to_string(),
        ));
    }
    Ok(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::operation::Resize;

    #[test]
    fn operations_must_be_one_to_six() {
        assert!(parse_operations("[]").is_err());
        assert!(parse_operations(r#"["webp"]"#).is_ok());
        assert!(parse_operations(
            r#"["jpg","png","webp","avif","denoise","metadata","jpg"]"#
        )
        .is_err());
    }

    #[test]
    fn bad_operations_json_is_rejected() {
        assert!(parse_operations("not json").is_err());
        assert!(parse_operations(r#"["gif"]"#).is_err());
    }

    #[test]
    fn same_format_conversion_is_rejected() {
        let err =
            reject_same_format(&[Operation::Png], ImageFormat::Png).unwrap_err();
        assert_eq!(err.0, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn denoise_and_metadata_are_exempt_from_same_format() {
        assert!(reject_same_format(
            &[Operation::Denoise, Operation::Metadata],
            ImageFormat::Png
        )
        .is_ok());
    }

    #[test]
    fn params_for_unrequested_operations_are_dropped() {
        let params = parse_operation_params(
            Some(r#"{"avif":{"resize":{"width":100}}}"#),
            &[Operation::Webp],
        )
        .unwrap();
        assert!(params.is_empty());
    }

    #[test]
    fn quality_on_png_is_rejected() {
        let err = parse_operation_params(
            Some(r#"{"png":{"quality":80}}"#),
            &[Operation::Png],
        )
        .unwrap_err();
        assert_eq!(err.0, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn quality_out_of_range_is_rejected() {
        let err = parse_operation_params(
            Some(r#"{"webp":{"quality":101}}"#),
            &[Operation::Webp],
        )
        .unwrap_err();
        assert_eq!(err.0, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn empty_resize_is_rejected() {
        let err = parse_operation_params(
            Some(r#"{"webp":{"resize":{}}}"#),
            &[Operation::Webp],
        )
        .unwrap_err();
        assert_eq!(err.0, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn valid_params_survive() {
        let params = parse_operation_params(
            Some(r#"{"webp":{"quality":80,"resize":{"width":640}}}"#),
            &[Operation::Webp],
        )
        .unwrap();
        assert_eq!(
            params.get(&Operation::Webp),
            Some(&OperationParams {
                quality: Some(80),
                resize: Some(Resize {
                    width: Some(640),
                    height: None
                }),
            })
        );
    }

    #[test]
    fn webhook_url_must_be_http() {
        assert!(validate_webhook_url(Some("ftp://example.com/hook")).is_err());
        assert!(validate_webhook_url(Some("not a url")).is_err());
        assert_eq!(
            validate_webhook_url(Some("https://example.com/hook")).unwrap(),
            "https://example.com/hook"
        );
        assert_eq!(validate_webhook_url(None).unwrap(), "");
    }
}
