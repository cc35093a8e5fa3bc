use std::io::Cursor;

use image::{DynamicImage, ImageFormat};

use crate::app_state::AppState;
use crate::models::operation::Operation;
use crate::services::queue::TaskMessage;
use crate::services::storage;
use crate::tasks::convert::apply_resize;
use crate::tasks::TaskError;

/// Blur radius for the noise-suppression pass.
const SIGMA: f32 = 0.8;

/// Denoise the raw upload and store the result. Output is always a
/// lossless PNG so the cleaned image is never re-compressed.
pub async fn run(state: &AppState, message: &TaskMessage) -> Result<String, TaskError> {
    let raw = state.storage.get(&message.source_key).await?;

    let resize = message.params.resize;
    let bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, TaskError> {
        let img = image::load_from_memory(&raw)
            .map_err(|e| TaskError::Image(format!("failed to decode source image: {e}")))?;
        let img = apply_resize(img, resize);
        let cleaned = DynamicImage::ImageRgb8(image::imageops::blur(&img.to_rgb8(), SIGMA));

        let mut out = Vec::new();
        cleaned
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .map_err(|e| TaskError::Image(format!("png encode failed: {e}")))?;
        Ok(out)
    })
    .await
    .map_err(|e| TaskError::Image(format!("denoise task panicked: {e}")))??;

    let key = storage::processed_key(message.job_id, Operation::Denoise);
    state.storage.put_processed(&key, &bytes, "image/png").await?;

    tracing::info!(
        job_id = %message.job_id,
        key = %key,
        bytes = bytes.len(),
        "Denoising complete"
    );
    Ok(key)
}
