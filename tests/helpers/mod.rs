//! Helpers for end-to-end tests against a running API server.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::multipart;
use serde::Deserialize;
use tokio::time::sleep;
use uuid::Uuid;

/// Response from POST /api/process.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: String,
}

/// Response from GET /api/jobs/{job_id}.
#[derive(Debug, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: String,
    pub operations: Vec<String>,
    pub result_urls: BTreeMap<String, String>,
    pub archive_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

pub struct Submission<'a> {
    pub file_name: &'a str,
    pub file_bytes: Vec<u8>,
    pub operations: &'a str,
    pub operation_params: Option<&'a str>,
    pub webhook_url: Option<&'a str>,
    pub idempotency_key: Option<&'a str>,
}

impl<'a> Submission<'a> {
    pub fn new(file_name: &'a str, file_bytes: Vec<u8>, operations: &'a str) -> Self {
        Self {
            file_name,
            file_bytes,
            operations,
            operation_params: None,
            webhook_url: None,
            idempotency_key: None,
        }
    }
}

/// POST a submission, returning the raw response for status assertions.
pub async fn submit(
    client: &reqwest::Client,
    base_url: &str,
    submission: Submission<'_>,
) -> reqwest::Response {
    let mut form = multipart::Form::new()
        .part(
            "file",
            multipart::Part::bytes(submission.file_bytes)
                .file_name(submission.file_name.to_string()),
        )
        .text("operations", submission.operations.to_string());

    if let Some(params) = submission.operation_params {
        form = form.text("operation_params", params.to_string());
    }
    if let Some(url) = submission.webhook_url {
        form = form.text("webhook_url", url.to_string());
    }

    let mut request = client
        .post(format!("{base_url}/api/process"))
        .multipart(form);
    if let Some(key) = submission.idempotency_key {
        request = request.header("Idempotency-Key", key);
    }

    request.send().await.expect("submission request failed")
}

/// Poll the status endpoint until the job reaches a terminal state.
pub async fn poll_until_terminal(
    client: &reqwest::Client,
    base_url: &str,
    job_id: Uuid,
    timeout: Duration,
) -> JobStatusResponse {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let response = client
            .get(format!("{base_url}/api/jobs/{job_id}"))
            .send()
            .await
            .expect("status request failed");
        assert!(
            response.status().is_success(),
            "status poll returned {}",
            response.status()
        );
        let status: JobStatusResponse = response.json().await.expect("bad status body");

        match status.status.as_str() {
            "COMPLETED" | "COMPLETED_WEBHOOK_FAILED" | "FAILED" => return status,
            _ => {
                assert!(
                    std::time::Instant::now() < deadline,
                    "job {job_id} did not settle within {timeout:?} (last: {})",
                    status.status
                );
                sleep(Duration::from_millis(500)).await;
            }
        }
    }
}
