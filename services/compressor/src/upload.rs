use crate::blob_store::BlobStore;
use crate::compression::CompressionEngine;
use crate::config::Config;
use crate::detection::RegionDetector;
use crate::error::ApiError;
use crate::models::{CompressionRecord, NewCompressionRecord, OutputFormat};
use crate::recommendation::Recommender;
use crate::record_store::RecordStore;
use anyhow::Result;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{info, instrument};

/// An image received in a multipart upload
#[derive(Debug, Clone)]
pub struct UploadedImage {
    /// Client-supplied file name
    pub file_name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

/// Per-request upload limits
#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub max_files: usize,
    pub max_file_size: usize,
}

impl UploadLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_files: config.api.max_files,
            max_file_size: config.api.max_file_size_bytes,
        }
    }

    /// Upper bound for a whole multipart body: every file at full size plus form overhead
    pub fn body_limit(&self) -> usize {
        self.max_files
            .saturating_mul(self.max_file_size)
            .saturating_add(1024 * 1024)
    }
}

/// Options shared by every file of one upload request
#[derive(Debug, Clone, PartialEq)]
pub struct UploadOptions {
    pub format: OutputFormat,
    pub quality: u8,
    /// Free-text description; when present the recommender picks format and quality
    pub prompt: Option<String>,
}

impl UploadOptions {
    /// Build options from raw form fields, falling back to configured defaults
    pub fn parse(
        format: Option<&str>,
        quality: Option<&str>,
        prompt: Option<&str>,
        default_format: OutputFormat,
        default_quality: u8,
    ) -> Result<Self, ApiError> {
        let format = match format.map(str::trim).filter(|f| !f.is_empty()) {
            Some(raw) => raw
                .parse::<OutputFormat>()
                .map_err(|e| ApiError::validation(e.to_string()))?,
            None => default_format,
        };

        let quality = match quality.map(str::trim).filter(|q| !q.is_empty()) {
            Some(raw) => raw
                .parse::<u8>()
                .ok()
                .filter(|q| *q <= 100)
                .ok_or_else(|| {
                    ApiError::validation(format!(
                        "Invalid quality '{raw}' (expected an integer between 0 and 100)"
                    ))
                })?,
            None => default_quality,
        };

        let prompt = prompt
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from);

        Ok(Self {
            format,
            quality,
            prompt,
        })
    }
}

/// Reject a single file before anything touches disk
pub fn validate_image(image: &UploadedImage, max_file_size: usize) -> Result<(), ApiError> {
    if !image.content_type.starts_with("image/") {
        return Err(ApiError::validation(format!(
            "Only image files are allowed ('{}' is {})",
            image.file_name, image.content_type
        )));
    }
    if image.bytes.is_empty() {
        return Err(ApiError::validation(format!(
            "File '{}' is empty",
            image.file_name
        )));
    }
    if image.bytes.len() > max_file_size {
        return Err(ApiError::validation(format!(
            "File '{}' is too large (max {} bytes)",
            image.file_name, max_file_size
        )));
    }
    Ok(())
}

/// Reject a whole upload request before anything touches disk
pub fn validate_batch(images: &[UploadedImage], limits: UploadLimits) -> Result<(), ApiError> {
    if images.is_empty() {
        return Err(ApiError::validation("No image files provided"));
    }
    if images.len() > limits.max_files {
        return Err(ApiError::validation(format!(
            "Too many files (max {})",
            limits.max_files
        )));
    }
    images
        .iter()
        .try_for_each(|image| validate_image(image, limits.max_file_size))
}

/// Runs detection, recommendation, compression and persistence for uploads
pub struct UploadPipeline {
    detector: Arc<dyn RegionDetector>,
    recommender: Arc<dyn Recommender>,
    engine: CompressionEngine,
    blobs: Arc<BlobStore>,
    store: Arc<dyn RecordStore>,
}

impl UploadPipeline {
    pub fn new(
        detector: Arc<dyn RegionDetector>,
        recommender: Arc<dyn Recommender>,
        engine: CompressionEngine,
        blobs: Arc<BlobStore>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            detector,
            recommender,
            engine,
            blobs,
            store,
        }
    }

    /// Process files one after another, in upload order.
    ///
    /// The first failure aborts the batch. Records of files that finished
    /// before it stay persisted; the failing file leaves nothing behind.
    #[instrument(skip(self, images, options), fields(file_count = images.len()))]
    pub async fn process_batch(
        &self,
        images: Vec<UploadedImage>,
        options: &UploadOptions,
    ) -> Result<Vec<CompressionRecord>> {
        let mut records = Vec::with_capacity(images.len());
        for image in images {
            records.push(self.process(image, options).await?);
        }
        Ok(records)
    }

    /// Process a single validated file
    #[instrument(skip(self, image, options), fields(file_name = %image.file_name))]
    pub async fn process(
        &self,
        image: UploadedImage,
        options: &UploadOptions,
    ) -> Result<CompressionRecord> {
        let original_name = self.blobs.original_name(&image.bytes);
        let original = self.blobs.put(&original_name, &image.bytes).await?;

        let regions = self.detector.detect(&image.bytes).await;

        let (format, quality, ai_suggestion, prompt_used) = match &options.prompt {
            Some(prompt) => {
                let rec = self.recommender.recommend_quality(prompt).await;
                (rec.format, rec.quality, Some(rec.context), Some(prompt.clone()))
            }
            None => (options.format, options.quality, None, None),
        };

        let compressed = self
            .engine
            .compress(original.path(), format, quality, &regions)
            .await?;

        let compressed_name = self.blobs.compressed_name(compressed.format);
        let compressed_blob = self.blobs.put(&compressed_name, &compressed.bytes).await?;

        let record = self
            .store
            .create(NewCompressionRecord {
                original_name: image.file_name,
                original_size: original.size(),
                compressed_size: compressed_blob.size(),
                original_path: original.name().to_string(),
                compressed_path: compressed_blob.name().to_string(),
                detected_regions: regions,
                format: compressed.format,
                quality: compressed.quality,
                ai_suggestion,
                prompt_used,
            })
            .await?;

        // The record exists now, so its blobs must survive
        original.keep();
        compressed_blob.keep();

        metrics::counter!("compressor.images.processed").increment(1);
        metrics::counter!("compressor.bytes.saved")
            .increment(record.original_size.saturating_sub(record.compressed_size));
        metrics::histogram!("compressor.compression.ratio").record(record.compression_ratio);

        info!(
            record_id = %record.id,
            format = %record.format,
            quality = record.quality,
            original_size = record.original_size,
            compressed_size = record.compressed_size,
            compression_ratio = record.compression_ratio,
            region_count = record.detected_regions.len(),
            "Image compressed"
        );

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlobConfig, CompressionConfig};
    use crate::detection::MockRegionDetector;
    use crate::models::DetectedRegion;
    use crate::recommendation::{MockRecommender, QualityRecommendation};
    use crate::record_store::MemoryRecordStore;
    use crate::test_support::sample_png;

    struct Fixture {
        _dir: tempfile::TempDir,
        blobs: Arc<BlobStore>,
        store: Arc<MemoryRecordStore>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::new(
            &BlobConfig {
                upload_dir: dir.path().to_path_buf(),
            },
            "",
        )
        .await
        .unwrap();
        Fixture {
            _dir: dir,
            blobs: Arc::new(blobs),
            store: Arc::new(MemoryRecordStore::new()),
        }
    }

    fn pipeline(
        fixture: &Fixture,
        detector: MockRegionDetector,
        recommender: MockRecommender,
    ) -> UploadPipeline {
        UploadPipeline::new(
            Arc::new(detector),
            Arc::new(recommender),
            CompressionEngine::new(&CompressionConfig::default()),
            fixture.blobs.clone(),
            fixture.store.clone(),
        )
    }

    fn png_upload(name: &str) -> UploadedImage {
        UploadedImage {
            file_name: name.to_string(),
            content_type: "image/png".to_string(),
            bytes: Bytes::from(sample_png(40, 30)),
        }
    }

    fn options(format: OutputFormat, quality: u8, prompt: Option<&str>) -> UploadOptions {
        UploadOptions {
            format,
            quality,
            prompt: prompt.map(String::from),
        }
    }

    fn file_count(fixture: &Fixture) -> usize {
        std::fs::read_dir(fixture.blobs.root()).unwrap().count()
    }

    #[test]
    fn test_parse_options() {
        let parsed =
            UploadOptions::parse(Some("avif"), Some("55"), Some("  "), OutputFormat::Webp, 80)
                .unwrap();
        assert_eq!(parsed, options(OutputFormat::Avif, 55, None));

        let parsed = UploadOptions::parse(None, None, Some("hero"), OutputFormat::Webp, 80).unwrap();
        assert_eq!(parsed, options(OutputFormat::Webp, 80, Some("hero")));

        assert!(UploadOptions::parse(Some("bmp"), None, None, OutputFormat::Webp, 80).is_err());
        assert!(UploadOptions::parse(None, Some("101"), None, OutputFormat::Webp, 80).is_err());
        assert!(UploadOptions::parse(None, Some("high"), None, OutputFormat::Webp, 80).is_err());
    }

    #[test]
    fn test_validate_batch() {
        let limits = UploadLimits {
            max_files: 2,
            max_file_size: 1024 * 1024,
        };

        assert!(validate_batch(&[], limits).is_err());
        assert!(validate_batch(&[png_upload("a.png")], limits).is_ok());
        assert!(validate_batch(
            &[png_upload("a.png"), png_upload("b.png"), png_upload("c.png")],
            limits
        )
        .is_err());

        let mut text = png_upload("notes.txt");
        text.content_type = "text/plain".to_string();
        let err = validate_batch(&[png_upload("a.png"), text], limits).unwrap_err();
        assert!(err.to_string().contains("Only image files"));

        let mut empty = png_upload("empty.png");
        empty.bytes = Bytes::new();
        assert!(validate_batch(&[empty], limits).is_err());

        let mut big = png_upload("big.png");
        big.bytes = Bytes::from(vec![0u8; 1024 * 1024 + 1]);
        let err = validate_batch(&[big], limits).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_body_limit_covers_a_full_batch() {
        let limits = UploadLimits::from_config(&Config::default());
        assert_eq!(limits.max_files, 10);
        assert_eq!(limits.body_limit(), 101 * 1024 * 1024);

        let huge = UploadLimits {
            max_files: usize::MAX,
            max_file_size: 2,
        };
        assert_eq!(huge.body_limit(), usize::MAX);
    }

    #[tokio::test]
    async fn test_process_stores_regions_and_boosts_quality() {
        let fixture = fixture().await;

        let mut detector = MockRegionDetector::new();
        detector.expect_detect().times(1).returning(|_| {
            vec![DetectedRegion {
                label: "person".to_string(),
                score: 0.97,
                bbox: None,
            }]
        });
        let mut recommender = MockRecommender::new();
        recommender.expect_recommend_quality().times(0);

        let record = pipeline(&fixture, detector, recommender)
            .process(png_upload("me.png"), &options(OutputFormat::Jpeg, 70, None))
            .await
            .unwrap();

        assert_eq!(record.original_name, "me.png");
        assert_eq!(record.format, OutputFormat::Jpeg);
        assert_eq!(record.quality, 80);
        assert_eq!(record.detected_regions.len(), 1);
        assert!(record.original_path.starts_with("original-"));
        assert!(record.compressed_path.starts_with("compressed-jpeg-"));
        assert!(record.ai_suggestion.is_none());
        assert_eq!(
            record.compression_ratio,
            crate::models::compression_ratio(record.original_size, record.compressed_size)
        );

        assert!(fixture.blobs.exists(&record.original_path).await);
        assert!(fixture.blobs.exists(&record.compressed_path).await);
        let compressed = fixture.blobs.read(&record.compressed_path).await.unwrap();
        assert_eq!(compressed.len() as u64, record.compressed_size);
        assert_eq!(fixture.store.len(), 1);
    }

    #[tokio::test]
    async fn test_prompt_overrides_request_parameters() {
        let fixture = fixture().await;

        let mut detector = MockRegionDetector::new();
        detector.expect_detect().returning(|_| Vec::new());
        let mut recommender = MockRecommender::new();
        recommender
            .expect_recommend_quality()
            .withf(|prompt| prompt == "thumbnail for a shop")
            .times(2)
            .returning(|_| QualityRecommendation {
                quality: 55,
                format: OutputFormat::Png,
                context: "Shop thumbnail".to_string(),
            });

        let records = pipeline(&fixture, detector, recommender)
            .process_batch(
                vec![png_upload("a.png"), png_upload("b.png")],
                &options(OutputFormat::Jpeg, 90, Some("thumbnail for a shop")),
            )
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].original_name, "a.png");
        assert_eq!(records[1].original_name, "b.png");
        for record in &records {
            assert_eq!(record.format, OutputFormat::Png);
            assert_eq!(record.quality, 55);
            assert_eq!(record.ai_suggestion.as_deref(), Some("Shop thumbnail"));
            assert_eq!(record.prompt_used.as_deref(), Some("thumbnail for a shop"));
        }
    }

    #[tokio::test]
    async fn test_codec_failure_leaves_no_files_or_records() {
        let fixture = fixture().await;

        let mut detector = MockRegionDetector::new();
        detector.expect_detect().returning(|_| Vec::new());
        let recommender = MockRecommender::new();

        let mut corrupt = png_upload("broken.png");
        corrupt.bytes = Bytes::from_static(b"\x89PNG but not really");

        let result = pipeline(&fixture, detector, recommender)
            .process_batch(
                vec![png_upload("good.png"), corrupt],
                &options(OutputFormat::Webp, 70, None),
            )
            .await;

        assert!(result.is_err());
        // The first file completed before the failure and stays
        assert_eq!(fixture.store.len(), 1);
        assert_eq!(file_count(&fixture), 2);
    }
}
