use crate::config::BlobConfig;
use crate::models::OutputFormat;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use image::ImageFormat;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Flat directory of uploaded originals and compressed derivatives.
///
/// Naming convention:
/// - `original-{millis}-{rand}.{ext}` for uploads
/// - `compressed-{format}-{millis}-{rand}.{ext}` for encoder output
///
/// Blob names are the paths stored in records; they never contain separators.
pub struct BlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl BlobStore {
    /// Create the store, making sure the upload directory exists
    pub async fn new(config: &BlobConfig, public_base_url: &str) -> Result<Self> {
        tokio::fs::create_dir_all(&config.upload_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create upload directory {}",
                    config.upload_dir.display()
                )
            })?;

        info!(upload_dir = %config.upload_dir.display(), "Blob store initialized");

        Ok(Self {
            root: config.upload_dir.clone(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Name for an uploaded original. The extension comes from the sniffed
    /// image format, never from the client, so `/uploads` only ever serves
    /// image content types or `application/octet-stream`.
    pub fn original_name(&self, bytes: &[u8]) -> String {
        format!("original-{}.{}", unique_suffix(), sniffed_extension(bytes))
    }

    /// Name for a compressed derivative
    pub fn compressed_name(&self, format: OutputFormat) -> String {
        format!(
            "compressed-{}-{}.{}",
            format.as_str(),
            unique_suffix(),
            format.extension()
        )
    }

    /// Resolve a blob name to its path, rejecting anything that could escape the directory
    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        if !is_valid_blob_name(name) {
            bail!("Invalid blob name: {name}");
        }
        Ok(self.root.join(name))
    }

    /// Write a blob. The returned guard deletes the file again unless it is kept.
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    pub async fn put(&self, name: &str, bytes: &[u8]) -> Result<BlobGuard> {
        let path = self.path_for(name)?;

        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write blob {name}"))?;

        debug!(blob = %name, "Blob written");

        Ok(BlobGuard {
            name: name.to_string(),
            path,
            size: bytes.len() as u64,
            keep: false,
        })
    }

    /// Whether the blob still exists on disk
    pub async fn exists(&self, name: &str) -> bool {
        match self.path_for(name) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Read a blob fully
    pub async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read blob {name}"))
    }

    /// Public URL under which `/uploads` serves the blob
    pub fn public_url(&self, name: &str) -> String {
        format!("{}/uploads/{}", self.public_base_url, name)
    }
}

/// A freshly written blob that is removed on drop unless [`BlobGuard::keep`] is called.
///
/// Ties the lifetime of an upload's files to the success of the whole
/// per-file pipeline, so failed uploads leave no orphans behind.
#[derive(Debug)]
pub struct BlobGuard {
    name: String,
    path: PathBuf,
    size: u64,
    keep: bool,
}

impl BlobGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Keep the file on disk and release the guard
    pub fn keep(mut self) -> String {
        self.keep = true;
        std::mem::take(&mut self.name)
    }
}

impl Drop for BlobGuard {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed uncommitted blob"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove uncommitted blob"),
        }
    }
}

/// `{unix millis}-{random}`. Collisions need the same millisecond and the same 32-bit draw.
fn unique_suffix() -> String {
    format!(
        "{}-{}",
        Utc::now().timestamp_millis(),
        rand::random::<u32>()
    )
}

fn is_valid_blob_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Extension for the image format detected from magic bytes, `bin` for anything else
fn sniffed_extension(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => "jpg",
        Ok(ImageFormat::Png) => "png",
        Ok(ImageFormat::WebP) => "webp",
        Ok(ImageFormat::Gif) => "gif",
        Ok(ImageFormat::Bmp) => "bmp",
        Ok(ImageFormat::Tiff) => "tiff",
        Ok(ImageFormat::Avif) => "avif",
        _ => "bin",
    }
}
