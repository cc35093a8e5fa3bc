use std::collections::HashMap;

use s3::creds::Credentials;
use s3::serde_types::{BucketLifecycleConfiguration, Expiration, LifecycleFilter, LifecycleRule};
use s3::{Bucket, Region};
use uuid::Uuid;

use crate::models::operation::Operation;

const RAW_PREFIX: &str = "raw/";
const PROCESSED_PREFIX: &str = "processed/";
const ARCHIVES_PREFIX: &str = "archives/";

/// Object key for the raw upload of a job.
pub fn raw_key(job_id: Uuid, original_name: &str) -> String {
    let safe: String = original_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{RAW_PREFIX}{job_id}/{safe}")
}

/// Object key for a processed artifact.
pub fn processed_key(job_id: Uuid, operation: Operation) -> String {
    let ext = operation.output_extension().unwrap_or("bin");
    format!("{PROCESSED_PREFIX}{job_id}/{operation}.{ext}")
}

/// Object key for the ZIP bundle of a job.
pub fn archive_key(job_id: Uuid) -> String {
    format!("{ARCHIVES_PREFIX}{job_id}.zip")
}

/// Gateway to the S3-compatible object store.
pub struct ObjectStore {
    bucket: Box<Bucket>,
    bucket_name: String,
    region: Region,
    credentials: Credentials,
}

impl ObjectStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region.clone(), credentials.clone())
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self {
            bucket,
            bucket_name: bucket_name.to_string(),
            region,
            credentials,
        })
    }

    /// Create the bucket when missing (dev object stores) and apply the
    /// retention rules for all three key prefixes. Safe to call on every
    /// startup.
    pub async fn ensure_retention(&self, expiry_days: u32) -> Result<(), StorageError> {
        let exists = self.bucket.exists().await.map_err(classify)?;
        if !exists {
            Bucket::create_with_path_style(
                &self.bucket_name,
                self.region.clone(),
                self.credentials.clone(),
                s3::BucketConfiguration::default(),
            )
            .await
            .map_err(classify)?;
            tracing::info!(bucket = %self.bucket_name, "Created object-store bucket");
        }

        let rules = [RAW_PREFIX, PROCESSED_PREFIX, ARCHIVES_PREFIX]
            .into_iter()
            .map(|prefix| LifecycleRule {
                id: Some(format!("expire-{}", prefix.trim_end_matches('/'))),
                status: "Enabled".to_string(),
                expiration: Some(Expiration {
                    date: None,
                    days: Some(expiry_days),
                    expired_object_delete_marker: None,
                }),
                filter: Some(LifecycleFilter {
                    and: None,
                    object_size_greater_than: None,
                    object_size_less_than: None,
                    prefix: Some(prefix.to_string()),
                    tag: None,
                }),
                ..Default::default()
            })
            .collect();

        self.bucket
            .put_bucket_lifecycle(BucketLifecycleConfiguration::new(rules))
            .await
            .map_err(classify)?;

        tracing::info!(
            bucket = %self.bucket_name,
            expiry_days,
            "Object-store retention rules ensured"
        );
        Ok(())
    }

    /// Upload raw user bytes.
    pub async fn put_raw(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.bucket
            .put_object_with_content_type(key, data, content_type)
            .await
            .map_err(classify)?;
        Ok(())
    }

    /// Upload a processed artifact.
    pub async fn put_processed(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.bucket
            .put_object_with_content_type(key, data, content_type)
            .await
            .map_err(classify)?;
        Ok(())
    }

    /// Download object bytes by key.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await.map_err(classify)?;
        Ok(response.to_vec())
    }

    /// Issue a signed GET URL. The expiry is embedded in the URL; callers
    /// must tolerate a URL that 404s after retention kicked in.
    pub async fn sign(
        &self,
        key: &str,
        ttl_seconds: u32,
        download_filename: Option<&str>,
    ) -> Result<String, StorageError> {
        let queries = download_filename.map(|name| {
            let mut q = HashMap::new();
            q.insert(
                "response-content-disposition".to_string(),
                format!("attachment; filename=\"{name}\""),
            );
            q
        });

        self.bucket
            .presign_get(key, ttl_seconds, queries)
            .await
            .map_err(classify)
    }

    /// Delete an object. Missing keys are not an error.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self.bucket.delete_object(key).await.map_err(classify) {
            Ok(_) | Err(StorageError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Connectivity probe for health checks.
    pub async fn health_check(&self) -> Result<(), StorageError> {
        self.bucket.exists().await.map_err(classify)?;
        Ok(())
    }
}

/// Map an S3 error onto the three kinds callers branch on: missing key,
/// retryable upstream trouble, or a definitive failure.
fn classify(err: s3::error::S3Error) -> StorageError {
    match err {
        s3::error::S3Error::HttpFailWithBody(404, _) => StorageError::NotFound,
        s3::error::S3Error::HttpFailWithBody(status, body) if status >= 500 || status == 429 => {
            StorageError::Transient(format!("object store returned {status}: {body}"))
        }
        s3::error::S3Error::HttpFailWithBody(status, body) => {
            StorageError::Permanent(format!("object store returned {status}: {body}"))
        }
        // Transport-level failures (connection refused, timeouts) are
        // worth retrying.
        other => StorageError::Transient(other.to_string()),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found")]
    NotFound,

    #[error("transient object-store failure: {0}")]
    Transient(String),

    #[error("permanent object-store failure: {0}")]
    Permanent(String),

    #[error("storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let id = Uuid::nil();
        assert_eq!(
            raw_key(id, "photo.png"),
            format!("raw/{id}/photo.png")
        );
        assert_eq!(
            processed_key(id, Operation::Webp),
            format!("processed/{id}/webp.webp")
        );
        assert_eq!(
            processed_key(id, Operation::Denoise),
            format!("processed/{id}/denoise.png")
        );
        assert_eq!(archive_key(id), format!("archives/{id}.zip"));
    }

    #[test]
    fn raw_key_sanitizes_hostile_filenames() {
        let id = Uuid::nil();
        let key = raw_key(id, "../../etc/passwd");
        let filename = &key[format!("raw/{id}/").len()..];
        assert!(!filename.contains('/'), "slashes must not survive: {key}");
    }
}
