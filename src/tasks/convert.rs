use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};

use crate::app_state::AppState;
use crate::models::operation::{Operation, OperationParams, Resize};
use crate::services::queue::TaskMessage;
use crate::services::storage;
use crate::tasks::TaskError;

const DEFAULT_JPEG_QUALITY: u8 = 85;
const DEFAULT_WEBP_QUALITY: u8 = 80;

/// Convert the raw upload into the target format and upload the artifact.
/// Returns the processed object key.
pub async fn run(
    state: &AppState,
    message: &TaskMessage,
    operation: Operation,
) -> Result<String, TaskError> {
    let raw = state.storage.get(&message.source_key).await?;

    let params = message.params.clone();
    let (bytes, content_type) =
        tokio::task::spawn_blocking(move || encode(&raw, operation, &params))
            .await
            .map_err(|e| TaskError::Image(format!("encode task panicked: {e}")))??;

    let key = storage::processed_key(message.job_id, operation);
    state
        .storage
        .put_processed(&key, &bytes, content_type)
        .await?;

    tracing::info!(
        job_id = %message.job_id,
        operation = %operation,
        key = %key,
        bytes = bytes.len(),
        "Conversion complete"
    );
    Ok(key)
}

/// Decode, optionally resize, and re-encode in the requested format.
pub fn encode(
    raw: &[u8],
    operation: Operation,
    params: &OperationParams,
) -> Result<(Vec<u8>, &'static str), TaskError> {
    let img = image::load_from_memory(raw)
        .map_err(|e| TaskError::Image(format!("failed to decode source image: {e}")))?;
    let img = apply_resize(img, params.resize);

    let mut out = Vec::new();
    let content_type = match operation {
        Operation::Jpg => {
            // JPEG has no alpha channel.
            let rgb = img.to_rgb8();
            let quality = params.quality.unwrap_or(DEFAULT_JPEG_QUALITY);
            JpegEncoder::new_with_quality(&mut Cursor::new(&mut out), quality)
                .encode_image(&rgb)
                .map_err(|e| TaskError::Image(format!("jpeg encode failed: {e}")))?;
            "image/jpeg"
        }
        Operation::Png => {
            img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
                .map_err(|e| TaskError::Image(format!("png encode failed: {e}")))?;
            "image/png"
        }
        Operation::Webp => {
            let quality = params.quality.unwrap_or(DEFAULT_WEBP_QUALITY);
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            let encoder = webp::Encoder::from_image(&rgba)
                .map_err(|e| TaskError::Image(format!("webp encoder rejected image: {e}")))?;
            out = encoder.encode(f32::from(quality)).to_vec();
            "image/webp"
        }
        Operation::Avif => {
            img.write_to(&mut Cursor::new(&mut out), ImageFormat::Avif)
                .map_err(|e| TaskError::Image(format!("avif encode failed: {e}")))?;
            "image/avif"
        }
        Operation::Denoise | Operation::Metadata => {
            return Err(TaskError::Image(format!(
                "{operation} is not a format conversion"
            )));
        }
    };

    Ok((out, content_type))
}

/// Resize with both dimensions honored verbatim; a single dimension
/// preserves aspect ratio.
pub fn apply_resize(img: DynamicImage, resize: Option<Resize>) -> DynamicImage {
    let Some(resize) = resize else {
        return img;
    };

    match (resize.width, resize.height) {
        (Some(w), Some(h)) => img.resize_exact(w, h, FilterType::Lanczos3),
        (Some(w), None) => {
            let h = scaled_dimension(img.height(), img.width(), w);
            img.resize_exact(w, h, FilterType::Lanczos3)
        }
        (None, Some(h)) => {
            let w = scaled_dimension(img.width(), img.height(), h);
            img.resize_exact(w, h, FilterType::Lanczos3)
        }
        (None, None) => img,
    }
}

fn scaled_dimension(other: u32, this: u32, this_target: u32) -> u32 {
    ((u64::from(other) * u64::from(this_target)) / u64::from(this.max(1))).max(1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
            image::Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
        }));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn converts_png_to_jpeg() {
        let raw = sample_png(32, 24);
        let (bytes, content_type) =
            encode(&raw, Operation::Jpg, &OperationParams::default()).unwrap();
        assert_eq!(content_type, "image/jpeg");
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn converts_png_to_webp_with_quality() {
        let raw = sample_png(32, 24);
        let params = OperationParams {
            quality: Some(50),
            resize: None,
        };
        let (bytes, content_type) = encode(&raw, Operation::Webp, &params).unwrap();
        assert_eq!(content_type, "image/webp");
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::WebP);
    }

    #[test]
    fn garbage_input_is_a_permanent_failure() {
        let err = encode(b"not an image", Operation::Png, &OperationParams::default())
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn resize_both_dimensions_is_verbatim() {
        let raw = sample_png(64, 48);
        let params = OperationParams {
            quality: None,
            resize: Some(Resize {
                width: Some(10),
                height: Some(30),
            }),
        };
        let (bytes, _) = encode(&raw, Operation::Png, &params).unwrap();
        let img = image::load_from_memory(&bytes).unwrap();
        assert_eq!((img.width(), img.height()), (10, 30));
    }

    #[test]
    fn resize_single_dimension_preserves_aspect() {
        let raw = sample_png(64, 32);
        let params = OperationParams {
            quality: None,
            resize: Some(Resize {
                width: Some(32),
                height: None,
            }),
        };
        let (bytes, _) = encode(&raw, Operation::Png, &params).unwrap();
        let img = image::load_from_memory(&bytes).unwrap();
        assert_eq!((img.width(), img.height()), (32, 16));
    }
}
