use crate::config::CompressionConfig;
use crate::models::{DetectedRegion, OutputFormat};
use anyhow::{anyhow, Context, Result};
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{DynamicImage, ExtendedColorType, ImageEncoder};
use std::path::Path;
use tracing::{debug, instrument};

/// Result of a single encode
#[derive(Debug, Clone)]
pub struct CompressedImage {
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    /// Quality actually used, after content adjustment and encoder limits
    pub quality: u8,
}

/// Re-encodes images at a target format and quality.
///
/// Quality is raised when detected regions include important content
/// (people, faces, text, ...). Encoder settings are otherwise fixed, and
/// every image gets exactly one deterministic encode.
#[derive(Debug, Clone)]
pub struct CompressionEngine {
    important_labels: Vec<String>,
    importance_boost: u8,
    importance_cap: u8,
    avif_speed: u8,
    webp_method: i32,
}

impl CompressionEngine {
    pub fn new(config: &CompressionConfig) -> Self {
        Self {
            important_labels: config
                .important_labels
                .iter()
                .map(|l| l.to_lowercase())
                .collect(),
            importance_boost: config.importance_boost,
            importance_cap: config.importance_cap.min(100),
            avif_speed: config.avif_speed.clamp(1, 10),
            webp_method: config.webp_method.clamp(0, 6),
        }
    }

    /// Whether any region label loosely matches an important keyword
    pub fn has_important_content(&self, regions: &[DetectedRegion]) -> bool {
        regions.iter().any(|region| {
            let label = region.label.to_lowercase();
            self.important_labels
                .iter()
                .any(|keyword| label.contains(keyword.as_str()))
        })
    }

    /// Requested quality, boosted up to the cap for important content.
    /// Never lower than requested.
    pub fn adjust_quality(&self, requested: u8, regions: &[DetectedRegion]) -> u8 {
        let requested = requested.min(100);
        if !self.has_important_content(regions) {
            return requested;
        }
        let boosted = requested
            .saturating_add(self.importance_boost)
            .min(self.importance_cap);
        boosted.max(requested)
    }

    /// Decode the image at `source` and re-encode it
    #[instrument(skip(self, regions), fields(source = %source.display(), format = %format))]
    pub async fn compress(
        &self,
        source: &Path,
        format: OutputFormat,
        requested_quality: u8,
        regions: &[DetectedRegion],
    ) -> Result<CompressedImage> {
        let quality = encoder_quality(format, self.adjust_quality(requested_quality, regions));
        if quality != requested_quality {
            debug!(
                requested_quality,
                quality, "Adjusted requested quality"
            );
        }

        let data = tokio::fs::read(source)
            .await
            .with_context(|| format!("Failed to read source image {}", source.display()))?;

        let engine = self.clone();
        let bytes = tokio::task::spawn_blocking(move || engine.encode(&data, format, quality))
            .await
            .context("Encoder task panicked")??;

        debug!(size_bytes = bytes.len(), quality, "Image encoded");

        Ok(CompressedImage {
            bytes,
            format,
            quality,
        })
    }

    /// Decode `data` and encode it as `format` at `quality`. CPU bound.
    pub fn encode(&self, data: &[u8], format: OutputFormat, quality: u8) -> Result<Vec<u8>> {
        let img = image::load_from_memory(data).context("Unsupported or corrupt image")?;

        match format {
            OutputFormat::Jpeg => encode_jpeg(&img, quality),
            OutputFormat::Webp => encode_webp(&img, quality, self.webp_method),
            OutputFormat::Avif => encode_avif(&img, quality, self.avif_speed),
            OutputFormat::Png => encode_png(&img),
        }
    }
}

/// Quality the encoder for `format` will really apply. JPEG and AVIF have
/// no quality 0.
pub fn encoder_quality(format: OutputFormat, quality: u8) -> u8 {
    match format {
        OutputFormat::Jpeg | OutputFormat::Avif => quality.clamp(1, 100),
        OutputFormat::Webp | OutputFormat::Png => quality.min(100),
    }
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = img.to_rgb8();
    let mut buf = Vec::new();

    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
        .write_image(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            ExtendedColorType::Rgb8,
        )
        .context("JPEG encoding failed")?;

    Ok(buf)
}

fn encode_webp(img: &DynamicImage, quality: u8, method: i32) -> Result<Vec<u8>> {
    let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
    let encoder =
        webp::Encoder::from_image(&rgba).map_err(|e| anyhow!("WebP encoding failed: {e}"))?;

    let mut config =
        webp::WebPConfig::new().map_err(|_| anyhow!("WebP encoder configuration failed"))?;
    config.lossless = 0;
    config.quality = f32::from(quality.min(100));
    config.method = method;

    let memory = encoder
        .encode_advanced(&config)
        .map_err(|e| anyhow!("WebP encoding failed: {e:?}"))?;

    Ok(memory.to_vec())
}

fn encode_avif(img: &DynamicImage, quality: u8, speed: u8) -> Result<Vec<u8>> {
    let rgba = img.to_rgba8();
    let mut buf = Vec::new();

    AvifEncoder::new_with_speed_quality(&mut buf, speed, quality.clamp(1, 100))
        .write_image(
            rgba.as_raw(),
            rgba.width(),
            rgba.height(),
            ExtendedColorType::Rgba8,
        )
        .context("AVIF encoding failed")?;

    Ok(buf)
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let rgba = img.to_rgba8();
    let mut buf = Vec::new();

    PngEncoder::new_with_quality(&mut buf, CompressionType::Best, FilterType::Adaptive)
        .write_image(
            rgba.as_raw(),
            rgba.width(),
            rgba.height(),
            ExtendedColorType::Rgba8,
        )
        .context("PNG encoding failed")?;

    Ok(buf)
}
