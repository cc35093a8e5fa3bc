use garde::Validate;
use serde::{Deserialize, Serialize};

/// A processing operation a client can request for an uploaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Jpg,
    Png,
    Webp,
    Avif,
    Denoise,
    Metadata,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Jpg => "jpg",
            Operation::Png => "png",
            Operation::Webp => "webp",
            Operation::Avif => "avif",
            Operation::Denoise => "denoise",
            Operation::Metadata => "metadata",
        }
    }

    /// Whether this operation writes an artifact into `result_keys`.
    pub fn produces_image(&self) -> bool {
        !matches!(self, Operation::Metadata)
    }

    /// Format-conversion operations are rejected when they match the
    /// source format; denoise and metadata are exempt.
    pub fn is_conversion(&self) -> bool {
        matches!(
            self,
            Operation::Jpg | Operation::Png | Operation::Webp | Operation::Avif
        )
    }

    /// File extension of the produced artifact. Denoise always emits a
    /// lossless PNG so inference output is never re-compressed.
    pub fn output_extension(&self) -> Option<&'static str> {
        match self {
            Operation::Jpg => Some("jpg"),
            Operation::Png | Operation::Denoise => Some("png"),
            Operation::Webp => Some("webp"),
            Operation::Avif => Some("avif"),
            Operation::Metadata => None,
        }
    }

    pub fn supports_quality(&self) -> bool {
        matches!(self, Operation::Jpg | Operation::Webp)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target dimensions for a resize. At least one of width/height must be
/// given; a single dimension preserves aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Resize {
    #[garde(inner(range(min = 1)))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,

    #[garde(inner(range(min = 1)))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl Resize {
    pub fn is_empty(&self) -> bool {
        self.width.is_none() && self.height.is_none()
    }
}

/// Per-operation tuning knobs. Unknown fields are dropped during
/// deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct OperationParams {
    #[garde(inner(range(min = 1, max = 100)))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,

    #[garde(dive)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize: Option<Resize>,
}

impl OperationParams {
    pub fn is_empty(&self) -> bool {
        self.quality.is_none() && self.resize.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_round_trips_through_lowercase_json() {
        let ops: Vec<Operation> = serde_json::from_str(r#"["webp","denoise","metadata"]"#).unwrap();
        assert_eq!(
            ops,
            vec![Operation::Webp, Operation::Denoise, Operation::Metadata]
        );
        assert_eq!(serde_json::to_string(&Operation::Avif).unwrap(), r#""avif""#);
    }

    #[test]
    fn unknown_operation_is_rejected() {
        assert!(serde_json::from_str::<Operation>(r#""tiff""#).is_err());
    }

    #[test]
    fn unknown_params_are_ignored() {
        let params: OperationParams =
            serde_json::from_str(r#"{"quality":80,"sharpen":true}"#).unwrap();
        assert_eq!(params.quality, Some(80));
        assert!(params.resize.is_none());
    }

    #[test]
    fn quality_bounds_are_enforced() {
        let params = OperationParams {
            quality: Some(0),
            resize: None,
        };
        assert!(params.validate().is_err());

        let params = OperationParams {
            quality: Some(100),
            resize: None,
        };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn zero_dimension_resize_is_rejected() {
        let params = OperationParams {
            quality: None,
            resize: Some(Resize {
                width: Some(0),
                height: None,
            }),
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn denoise_always_produces_png() {
        assert_eq!(Operation::Denoise.output_extension(), Some("png"));
        assert!(!Operation::Denoise.is_conversion());
        assert!(Operation::Denoise.produces_image());
    }
}
