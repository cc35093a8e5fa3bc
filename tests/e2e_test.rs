//! End-to-end scenarios against a running deployment.
//!
//! These require:
//! 1. PostgreSQL, Redis, and an S3-compatible object store
//! 2. The API server (`pixtools`)
//! 3. A standard worker and the ml worker
//!
//! Run with: cargo test --test e2e_test -- --ignored --nocapture
//!
//! Set API_BASE_URL to override the default (http://localhost:3000).

mod fixtures;
mod helpers;

use std::time::Duration;

use helpers::{poll_until_terminal, submit, Submission, SubmitResponse};

fn base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

const SETTLE_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::test]
#[ignore] // Requires the full deployment
async fn test_health_endpoint() {
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/api/health", base_url()))
        .send()
        .await
        .expect("health request failed");
    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.expect("bad health body");
    assert_eq!(body["status"], "healthy");
    for dependency in ["database", "redis", "broker", "objectstore"] {
        assert_eq!(body["dependencies"][dependency], "ok", "{dependency}");
    }
}

/// Single conversion: PNG in, one webp URL out.
#[tokio::test]
#[ignore] // Requires the full deployment
async fn test_single_conversion() {
    let client = reqwest::Client::new();
    let base = base_url();

    let response = submit(
        &client,
        &base,
        Submission::new("photo.png", fixtures::sample_png(), r#"["webp"]"#),
    )
    .await;
    assert_eq!(response.status().as_u16(), 202);
    let accepted: SubmitResponse = response.json().await.expect("bad submit body");
    assert_eq!(accepted.status, "PENDING");

    let status = poll_until_terminal(&client, &base, accepted.job_id, SETTLE_TIMEOUT).await;
    assert_eq!(status.status, "COMPLETED");
    assert_eq!(status.operations, vec!["webp"]);
    assert_eq!(status.result_urls.len(), 1);
    assert!(status.error_message.is_none());

    let url = status.result_urls.get("webp").expect("webp URL missing");
    let artifact = reqwest::get(url).await.expect("artifact fetch failed");
    assert!(artifact.status().is_success());
    let bytes = artifact.bytes().await.expect("artifact body");
    assert_eq!(
        image::guess_format(&bytes).expect("artifact not an image"),
        image::ImageFormat::WebP
    );
}

/// Multi-op fan-out with metadata: result URLs for the conversions only,
/// metadata populated, and the archive appearing shortly after.
#[tokio::test]
#[ignore] // Requires the full deployment
async fn test_fan_out_with_metadata_and_archive() {
    let client = reqwest::Client::new();
    let base = base_url();

    let response = submit(
        &client,
        &base,
        Submission {
            operation_params: Some(r#"{"webp":{"quality":80}}"#),
            ..Submission::new(
                "photo.png",
                fixtures::sample_png(),
                r#"["webp","avif","metadata"]"#,
            )
        },
    )
    .await;
    assert_eq!(response.status().as_u16(), 202);
    let accepted: SubmitResponse = response.json().await.expect("bad submit body");

    let status = poll_until_terminal(&client, &base, accepted.job_id, SETTLE_TIMEOUT).await;
    assert_eq!(status.status, "COMPLETED");
    assert_eq!(status.result_urls.len(), 2);
    assert!(status.result_urls.contains_key("webp"));
    assert!(status.result_urls.contains_key("avif"));
    assert!(!status.result_urls.contains_key("metadata"));
    assert!(status.metadata.is_some());

    // The archive task races the first poll; give it a moment.
    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    let archive_url = loop {
        let poll: helpers::JobStatusResponse = client
            .get(format!("{base}/api/jobs/{}", accepted.job_id))
            .send()
            .await
            .expect("status request failed")
            .json()
            .await
            .expect("bad status body");
        if let Some(url) = poll.archive_url {
            break url;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "archive never appeared"
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
    };

    let archive = reqwest::get(&archive_url).await.expect("archive fetch failed");
    assert!(archive.status().is_success());
    let bytes = archive.bytes().await.expect("archive body").to_vec();
    let zip = zip_entry_names(&bytes);
    assert_eq!(zip.len(), 2, "archive must hold both conversions: {zip:?}");
}

fn zip_entry_names(bytes: &[u8]) -> Vec<String> {
    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).expect("not a zip");
    (0..archive.len())
        .map(|i| archive.by_index(i).expect("zip entry").name().to_string())
        .collect()
}

/// Same-format conversion is rejected with 422 and creates no job.
#[tokio::test]
#[ignore] // Requires the full deployment
async fn test_same_format_rejection() {
    let client = reqwest::Client::new();
    let response = submit(
        &client,
        &base_url(),
        Submission::new("photo.png", fixtures::sample_png(), r#"["png"]"#),
    )
    .await;
    assert_eq!(response.status().as_u16(), 422);
}

/// Concurrent submissions with the same idempotency key yield one job.
#[tokio::test]
#[ignore] // Requires the full deployment
async fn test_idempotent_replay() {
    let client = reqwest::Client::new();
    let base = base_url();
    let key = format!("e2e-{}", uuid::Uuid::new_v4());

    let submit_once = || async {
        let response = submit(
            &client,
            &base,
            Submission {
                idempotency_key: Some(&key),
                ..Submission::new("photo.png", fixtures::sample_png(), r#"["webp"]"#)
            },
        )
        .await;
        assert_eq!(response.status().as_u16(), 202);
        let body: SubmitResponse = response.json().await.expect("bad submit body");
        body.job_id
    };

    let first = submit_once().await;
    let second = submit_once().await;
    assert_eq!(first, second, "replay must return the original job");
}

/// Webhook outage: the job completes but records the failed delivery.
#[tokio::test]
#[ignore] // Requires the full deployment; the webhook target must be unreachable
async fn test_unreachable_webhook_marks_job() {
    let client = reqwest::Client::new();
    let base = base_url();

    let response = submit(
        &client,
        &base,
        Submission {
            webhook_url: Some("http://127.0.0.1:9/hook"),
            ..Submission::new("photo.png", fixtures::sample_png(), r#"["webp"]"#)
        },
    )
    .await;
    assert_eq!(response.status().as_u16(), 202);
    let accepted: SubmitResponse = response.json().await.expect("bad submit body");

    let status = poll_until_terminal(&client, &base, accepted.job_id, SETTLE_TIMEOUT).await;
    assert_eq!(status.status, "COMPLETED_WEBHOOK_FAILED");
    assert_eq!(status.result_urls.len(), 1, "results survive webhook failure");
}

/// Unknown job ids are a 404.
#[tokio::test]
#[ignore] // Requires the full deployment
async fn test_unknown_job_is_404() {
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/api/jobs/{}", base_url(), uuid::Uuid::new_v4()))
        .send()
        .await
        .expect("status request failed");
    assert_eq!(response.status().as_u16(), 404);
}

/// Metadata-only jobs complete with no result URLs.
#[tokio::test]
#[ignore] // Requires the full deployment
async fn test_metadata_only_job() {
    let client = reqwest::Client::new();
    let base = base_url();

    let response = submit(
        &client,
        &base,
        Submission::new("photo.jpg", fixtures::sample_jpeg(), r#"["metadata"]"#),
    )
    .await;
    assert_eq!(response.status().as_u16(), 202);
    let accepted: SubmitResponse = response.json().await.expect("bad submit body");

    let status = poll_until_terminal(&client, &base, accepted.job_id, SETTLE_TIMEOUT).await;
    assert_eq!(status.status, "COMPLETED");
    assert!(status.result_urls.is_empty());
    assert!(status.archive_url.is_none());
    assert!(status.metadata.is_some());
}
