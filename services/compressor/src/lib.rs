//! Pixpress Compressor
//!
//! AI-assisted image compression service behind the Pixpress web uploader.
//! Clients upload images; each one is stored, scanned for salient objects,
//! optionally matched to a user prompt by a text-generation model, re-encoded
//! and indexed so it can be listed, fetched and downloaded in bulk later.
//!
//! ## Features
//!
//! - **Content-aware quality**: images showing people, faces, text and similar
//!   detail are encoded at a higher quality than requested
//! - **Prompt-driven settings**: a free-text description picks format and quality
//! - **Four output codecs**: JPEG, WebP, AVIF and PNG
//! - **Streaming zip downloads**: archives are written straight into the response
//! - **Pluggable metadata store**: PostgreSQL when configured, in-memory otherwise
//!
//! ## Architecture
//!
//! ```text
//!  HTTP (axum)
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ /api/upload  │──▶│ Upload       │──▶│ Blob Store   │  uploads/
//! └──────────────┘   │ Pipeline     │   └──────────────┘
//!                    └──────────────┘          ▲
//!                      │    │     │            │
//!          ┌───────────┘    │     └──────┐     │
//!          ▼                ▼            ▼     │
//! ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//! │ Region       │ │ Recommender  │ │ Compression  │
//! │ Detector     │ │ (generation) │ │ Engine       │
//! └──────────────┘ └──────────────┘ └──────────────┘
//!                                          │
//!                                          ▼
//! ┌──────────────┐                  ┌──────────────┐
//! │ Archive      │◀─────────────────│ Record Store │  PostgreSQL / memory
//! │ (zip stream) │                  └──────────────┘
//! └──────────────┘
//! ```

pub mod api;
pub mod archive;
pub mod blob_store;
pub mod compression;
pub mod config;
pub mod detection;
pub mod error;
pub mod models;
pub mod recommendation;
pub mod record_store;
pub mod upload;

#[cfg(test)]
mod test_support;

pub use api::{create_router, start_api_server, AppState};
pub use blob_store::{BlobGuard, BlobStore};
pub use compression::{CompressedImage, CompressionEngine};
pub use config::Config;
pub use detection::{HttpRegionDetector, RegionDetector};
pub use error::ApiError;
pub use models::{CompressionRecord, CompressionStats, DetectedRegion, OutputFormat};
pub use recommendation::{FormatRecommendation, HttpRecommender, QualityRecommendation, Recommender};
pub use record_store::{MemoryRecordStore, PgRecordStore, RecordStore};
pub use upload::{UploadOptions, UploadPipeline, UploadedImage};
