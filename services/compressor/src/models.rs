use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Target encoding of a compressed image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Webp,
    Avif,
    Png,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 4] = [
        OutputFormat::Jpeg,
        OutputFormat::Webp,
        OutputFormat::Avif,
        OutputFormat::Png,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Webp => "webp",
            OutputFormat::Avif => "avif",
            OutputFormat::Png => "png",
        }
    }

    /// File extension for compressed blobs
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Webp => "webp",
            OutputFormat::Avif => "avif",
            OutputFormat::Png => "png",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Webp => "image/webp",
            OutputFormat::Avif => "image/avif",
            OutputFormat::Png => "image/png",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFormat(pub String);

impl fmt::Display for UnknownFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Unsupported format '{}' (expected jpeg, webp, avif or png)",
            self.0
        )
    }
}

impl std::error::Error for UnknownFormat {}

impl FromStr for OutputFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "webp" => Ok(OutputFormat::Webp),
            "avif" => Ok(OutputFormat::Avif),
            "png" => Ok(OutputFormat::Png),
            _ => Err(UnknownFormat(s.to_string())),
        }
    }
}

/// Bounding box as returned by the detection API (pixel coordinates)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

/// A labeled region found by the object-detection API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedRegion {
    pub label: String,
    pub score: f64,
    #[serde(rename = "box", default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
}

/// A persisted compression result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionRecord {
    pub id: Uuid,
    pub original_name: String,
    pub original_size: u64,
    pub compressed_size: u64,
    /// Percentage saved, rounded to two decimals
    pub compression_ratio: f64,
    /// Blob name of the original, relative to the upload directory
    pub original_path: String,
    /// Blob name of the compressed file, relative to the upload directory
    pub compressed_path: String,
    pub detected_regions: Vec<DetectedRegion>,
    pub format: OutputFormat,
    pub quality: u8,
    pub ai_suggestion: Option<String>,
    pub prompt_used: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything needed to create a record. The store assigns the id and the
/// creation time and derives the ratio from the two sizes.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCompressionRecord {
    pub original_name: String,
    pub original_size: u64,
    pub compressed_size: u64,
    pub original_path: String,
    pub compressed_path: String,
    pub detected_regions: Vec<DetectedRegion>,
    pub format: OutputFormat,
    pub quality: u8,
    pub ai_suggestion: Option<String>,
    pub prompt_used: Option<String>,
}

impl NewCompressionRecord {
    pub fn compression_ratio(&self) -> f64 {
        compression_ratio(self.original_size, self.compressed_size)
    }

    /// Materialize the record with store-assigned identity
    pub fn into_record(self, id: Uuid, created_at: DateTime<Utc>) -> CompressionRecord {
        let compression_ratio = self.compression_ratio();
        CompressionRecord {
            id,
            original_name: self.original_name,
            original_size: self.original_size,
            compressed_size: self.compressed_size,
            compression_ratio,
            original_path: self.original_path,
            compressed_path: self.compressed_path,
            detected_regions: self.detected_regions,
            format: self.format,
            quality: self.quality,
            ai_suggestion: self.ai_suggestion,
            prompt_used: self.prompt_used,
            created_at,
        }
    }
}

/// `(original - compressed) / original * 100`, rounded to two decimals.
/// Negative when the encode grew the file.
pub fn compression_ratio(original_size: u64, compressed_size: u64) -> f64 {
    if original_size == 0 {
        return 0.0;
    }
    let ratio = (original_size as f64 - compressed_size as f64) / original_size as f64 * 100.0;
    (ratio * 100.0).round() / 100.0
}

/// Aggregate numbers over all records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionStats {
    pub total_records: i64,
    pub total_original_bytes: i64,
    pub total_compressed_bytes: i64,
    pub average_ratio: f64,
}
