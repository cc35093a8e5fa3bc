use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::operation::Operation;

/// Lifecycle state of a processing job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    CompletedWebhookFailed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::CompletedWebhookFailed => "COMPLETED_WEBHOOK_FAILED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(JobStatus::Pending),
            "PROCESSING" => Some(JobStatus::Processing),
            "COMPLETED" => Some(JobStatus::Completed),
            "COMPLETED_WEBHOOK_FAILED" => Some(JobStatus::CompletedWebhookFailed),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states are reached exactly once and never left.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWebhookFailed | JobStatus::Failed
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An image processing job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub operations: Vec<Operation>,
    /// Operation tag → object-store key of the produced artifact.
    pub result_keys: BTreeMap<String, String>,
    /// EXIF fields extracted by the metadata operation.
    pub exif_metadata: Option<serde_json::Value>,
    pub archive_key: Option<String>,
    pub raw_key: String,
    pub original_filename: Option<String>,
    pub webhook_url: String,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Base name used for download filenames, derived from the original
    /// upload ("photo.png" → "photo").
    pub fn original_stem(&self) -> &str {
        match self.original_filename.as_deref() {
            Some(name) => name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name),
            None => "image",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_screaming_snake() {
        let s = serde_json::to_string(&JobStatus::CompletedWebhookFailed).unwrap();
        assert_eq!(s, r#""COMPLETED_WEBHOOK_FAILED""#);
        assert_eq!(
            JobStatus::parse("COMPLETED_WEBHOOK_FAILED"),
            Some(JobStatus::CompletedWebhookFailed)
        );
    }

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::CompletedWebhookFailed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }
}
