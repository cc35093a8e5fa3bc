use std::io::{Cursor, Write};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::app_state::AppState;
use crate::db::queries;
use crate::services::queue::TaskMessage;
use crate::services::storage;
use crate::tasks::TaskError;

/// Bundle a completed job's artifacts into a ZIP object and record the
/// archive key. Failures here leave the job COMPLETED without an archive;
/// the status endpoint simply keeps returning no archive URL.
pub async fn run(state: &AppState, message: &TaskMessage) -> Result<(), TaskError> {
    let job = queries::get_job(&state.db, message.job_id)
        .await?
        .ok_or_else(|| TaskError::JobGone(message.job_id))?;

    if job.result_keys.is_empty() {
        tracing::warn!(job_id = %job.id, "No artifacts to bundle, skipping archive");
        return Ok(());
    }

    // Entry names are deterministic: the artifact's own basename,
    // `{operation}.{ext}`.
    let mut entries = Vec::with_capacity(job.result_keys.len());
    for (operation, key) in &job.result_keys {
        let bytes = state.storage.get(key).await?;
        let ext = key.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("bin");
        entries.push((format!("{operation}.{ext}"), bytes));
    }

    let zip_bytes = tokio::task::spawn_blocking(move || build_zip(&entries))
        .await
        .map_err(|e| TaskError::Archive(format!("bundling task panicked: {e}")))??;

    let archive_key = storage::archive_key(job.id);
    state
        .storage
        .put_processed(&archive_key, &zip_bytes, "application/zip")
        .await?;
    queries::set_archive_key(&state.db, job.id, &archive_key).await?;

    tracing::info!(
        job_id = %job.id,
        archive_key = %archive_key,
        entries = job.result_keys.len(),
        bytes = zip_bytes.len(),
        "Archive bundled"
    );
    Ok(())
}

fn build_zip(entries: &[(String, Vec<u8>)]) -> Result<Vec<u8>, TaskError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, bytes) in entries {
        writer
            .start_file(name.as_str(), options)
            .map_err(|e| TaskError::Archive(format!("zip entry '{name}' failed: {e}")))?;
        writer
            .write_all(bytes)
            .map_err(|e| TaskError::Archive(format!("zip write '{name}' failed: {e}")))?;
    }

    let cursor = writer
        .finish()
        .map_err(|e| TaskError::Archive(format!("zip finalize failed: {e}")))?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_readable_zip_with_deterministic_names() {
        let entries = vec![
            ("webp.webp".to_string(), vec![1u8, 2, 3]),
            ("avif.avif".to_string(), vec![4u8, 5]),
        ];
        let bytes = build_zip(&entries).unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"webp.webp".to_string()));
        assert!(names.contains(&"avif.avif".to_string()));
    }
}
