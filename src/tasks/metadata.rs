use std::io::Cursor;

use exif::{Exif, In, Tag, Value};
use serde_json::{json, Map};

use crate::app_state::AppState;
use crate::services::queue::TaskMessage;
use crate::tasks::TaskError;

/// Extract EXIF metadata from the raw upload. An image without EXIF (or
/// with an unreadable block) yields an empty field map, not a failure.
pub async fn run(state: &AppState, message: &TaskMessage) -> Result<serde_json::Value, TaskError> {
    let raw = state.storage.get(&message.source_key).await?;
    let fields = extract(&raw);

    tracing::info!(
        job_id = %message.job_id,
        field_count = fields.as_object().map(Map::len).unwrap_or(0),
        "EXIF metadata extracted"
    );
    Ok(fields)
}

pub fn extract(raw: &[u8]) -> serde_json::Value {
    let exif = match exif::Reader::new().read_from_container(&mut Cursor::new(raw)) {
        Ok(exif) => exif,
        Err(_) => return serde_json::Value::Object(Map::new()),
    };

    let mut fields = Map::new();

    if let Some(make) = ascii_field(&exif, Tag::Make) {
        fields.insert("camera_make".into(), json!(make));
    }
    if let Some(model) = ascii_field(&exif, Tag::Model) {
        fields.insert("camera_model".into(), json!(model));
    }
    if let Some(lens) = ascii_field(&exif, Tag::LensModel) {
        fields.insert("lens_model".into(), json!(lens));
    }
    if let Some(captured) = ascii_field(&exif, Tag::DateTimeOriginal) {
        fields.insert("captured_at".into(), json!(captured));
    }

    if let Some((num, denom)) = rational_field(&exif, Tag::ExposureTime) {
        if denom != 0 {
            fields.insert("exposure_time".into(), json!(format!("{num}/{denom}s")));
        }
    }

    if let Some((num, denom)) = rational_field(&exif, Tag::FNumber) {
        if denom != 0 {
            let f_number = (f64::from(num) / f64::from(denom) * 100.0).round() / 100.0;
            fields.insert("aperture".into(), json!(format!("f/{f_number}")));
        }
    }

    if let Some(iso) = uint_field(&exif, Tag::PhotographicSensitivity) {
        fields.insert("iso".into(), json!(iso));
    }

    if let Some(gps) = gps_decimal(&exif) {
        fields.insert("gps".into(), gps);
    }

    serde_json::Value::Object(fields)
}

fn ascii_field(exif: &Exif, tag: Tag) -> Option<String> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    match &field.value {
        Value::Ascii(chunks) => {
            let text = chunks
                .iter()
                .map(|chunk| String::from_utf8_lossy(chunk))
                .collect::<Vec<_>>()
                .join(" ");
            let text = text.trim().to_string();
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}

fn rational_field(exif: &Exif, tag: Tag) -> Option<(u32, u32)> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    match &field.value {
        Value::Rational(values) => values.first().map(|r| (r.num, r.denom)),
        _ => None,
    }
}

fn uint_field(exif: &Exif, tag: Tag) -> Option<u32> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    field.value.get_uint(0)
}

/// Convert the degree/minute/second GPS triplets to decimal lat/lon.
fn gps_decimal(exif: &Exif) -> Option<serde_json::Value> {
    let latitude = gps_coordinate(exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, "S");
    let longitude = gps_coordinate(exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, "W");
    if latitude.is_none() && longitude.is_none() {
        return None;
    }
    Some(json!({ "latitude": latitude, "longitude": longitude }))
}

fn gps_coordinate(exif: &Exif, coord_tag: Tag, ref_tag: Tag, negative_ref: &str) -> Option<f64> {
    let field = exif.get_field(coord_tag, In::PRIMARY)?;
    let Value::Rational(parts) = &field.value else {
        return None;
    };
    if parts.len() != 3 || parts.iter().any(|r| r.denom == 0) {
        return None;
    }

    let decimal =
        parts[0].to_f64() + parts[1].to_f64() / 60.0 + parts[2].to_f64() / 3600.0;
    let decimal = match ascii_field_ref(exif, ref_tag) {
        Some(reference) if reference == negative_ref => -decimal,
        _ => decimal,
    };
    Some((decimal * 1_000_000.0).round() / 1_000_000.0)
}

fn ascii_field_ref(exif: &Exif, tag: Tag) -> Option<String> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    match &field.value {
        Value::Ascii(chunks) => chunks
            .first()
            .map(|chunk| String::from_utf8_lossy(chunk).trim().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_without_exif_yields_empty_map() {
        // A PNG with no eXIf chunk.
        let img = image::DynamicImage::new_rgb8(4, 4);
        let mut raw = Vec::new();
        img.write_to(&mut Cursor::new(&mut raw), image::ImageFormat::Png)
            .unwrap();

        let fields = extract(&raw);
        assert_eq!(fields, serde_json::Value::Object(Map::new()));
    }

    #[test]
    fn garbage_bytes_yield_empty_map() {
        let fields = extract(b"definitely not an image");
        assert_eq!(fields, serde_json::Value::Object(Map::new()));
    }
}
