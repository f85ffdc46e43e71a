use crate::archive::archive_body;
use crate::blob_store::BlobStore;
use crate::compression::CompressionEngine;
use crate::config::{ApiConfig, Config};
use crate::detection::{region_labels, RegionDetector};
use crate::error::ApiError;
use crate::models::{CompressionRecord, CompressionStats, OutputFormat};
use crate::recommendation::{FormatRecommendation, QualityRecommendation, Recommender};
use crate::record_store::RecordStore;
use crate::upload::{
    validate_batch, validate_image, UploadLimits, UploadOptions, UploadPipeline, UploadedImage,
};
use anyhow::{Context, Result};
use axum::{
    extract::{
        multipart::{Field, MultipartRejection},
        rejection::JsonRejection,
        DefaultBodyLimit, Multipart, Path, State,
    },
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeader;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const ARCHIVE_FILE_NAME: &str = "compressed-images.zip";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub blobs: Arc<BlobStore>,
    pub detector: Arc<dyn RegionDetector>,
    pub recommender: Arc<dyn Recommender>,
    pub pipeline: Arc<UploadPipeline>,
    pub limits: UploadLimits,
    pub default_format: OutputFormat,
    pub default_quality: u8,
    pub recent_limit: i64,
}

impl AppState {
    /// Wire the upload pipeline and handler state from shared components
    pub fn new(
        config: &Config,
        store: Arc<dyn RecordStore>,
        blobs: Arc<BlobStore>,
        detector: Arc<dyn RegionDetector>,
        recommender: Arc<dyn Recommender>,
    ) -> Self {
        let pipeline = UploadPipeline::new(
            detector.clone(),
            recommender.clone(),
            CompressionEngine::new(&config.compression),
            blobs.clone(),
            store.clone(),
        );

        Self {
            store,
            blobs,
            detector,
            recommender,
            pipeline: Arc::new(pipeline),
            limits: UploadLimits::from_config(config),
            default_format: config.compression.default_format,
            default_quality: config.compression.default_quality,
            recent_limit: config.api.recent_limit,
        }
    }

    fn record_response(&self, record: CompressionRecord) -> RecordResponse {
        RecordResponse {
            original_url: self.blobs.public_url(&record.original_path),
            compressed_url: self.blobs.public_url(&record.compressed_path),
            record,
        }
    }
}

/// Success envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

/// A record with public URLs for both blobs
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordResponse {
    #[serde(flatten)]
    pub record: CompressionRecord,
    pub original_url: String,
    pub compressed_url: String,
}

/// `data` of an upload: a single object for one file, an array otherwise
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum UploadData {
    One(RecordResponse),
    Many(Vec<RecordResponse>),
}

/// Compact record for the recent-uploads list
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSummary {
    pub id: Uuid,
    pub original_name: String,
    pub original_size: u64,
    pub compressed_size: u64,
    pub compression_ratio: f64,
    pub format: OutputFormat,
    pub quality: u8,
    pub compressed_url: String,
    pub created_at: DateTime<Utc>,
}

/// Recommendation envelope for the AI endpoints
#[derive(Debug, Serialize)]
pub struct RecommendationResponse<T> {
    pub success: bool,
    pub recommendation: T,
}

/// Format recommendation with the labels it was based on
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatAdvice {
    #[serde(flatten)]
    pub recommendation: FormatRecommendation,
    pub detected_objects: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct QualityRequest {
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadBatchRequest {
    #[serde(default)]
    pub image_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthFeatures {
    pub object_detection: bool,
    pub ai_recommendations: bool,
    pub max_files: usize,
    pub max_file_size_bytes: usize,
    pub formats: Vec<OutputFormat>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
    pub features: HealthFeatures,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let uploads = SetResponseHeader::overriding(
        ServeDir::new(state.blobs.root()),
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    let client = ServeDir::new(&config.static_dir);
    let body_limit = state.limits.body_limit();

    Router::new()
        .route("/api/upload", post(upload_images))
        .route("/api/ai-format", post(recommend_format))
        .route("/api/ai-quality", post(recommend_quality))
        .route("/api/download-batch", post(download_batch))
        .route("/api/image/:id", get(get_image))
        .route("/api/recent", get(recent_images))
        .route("/api/stats", get(stats))
        .route("/api/health", get(health_check))
        .nest_service("/uploads", uploads)
        .fallback_service(client)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Compress one or more uploaded images
#[instrument(skip_all)]
async fn upload_images(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ApiResponse<UploadData>>, ApiError> {
    let mut multipart = multipart.map_err(|e| ApiError::validation(e.body_text()))?;

    let mut images = Vec::new();
    let mut format = None;
    let mut quality = None;
    let mut prompt = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "images" | "image" => {
                if images.len() >= state.limits.max_files {
                    return Err(ApiError::validation(format!(
                        "Too many files (max {})",
                        state.limits.max_files
                    )));
                }
                images.push(read_image(field).await?);
            }
            "format" => format = Some(field.text().await?),
            "quality" => quality = Some(field.text().await?),
            "prompt" => prompt = Some(field.text().await?),
            other => warn!(field = %other, "Ignoring unknown form field"),
        }
    }

    validate_batch(&images, state.limits)?;
    let options = UploadOptions::parse(
        format.as_deref(),
        quality.as_deref(),
        prompt.as_deref(),
        state.default_format,
        state.default_quality,
    )?;

    let file_count = images.len();
    let records = state
        .pipeline
        .process_batch(images, &options)
        .await
        .map_err(|e| ApiError::internal("Failed to process images", e))?;

    info!(file_count, "Upload processed");

    let mut items: Vec<_> = records
        .into_iter()
        .map(|record| state.record_response(record))
        .collect();

    let data = if items.len() == 1 {
        UploadData::One(items.remove(0))
    } else {
        UploadData::Many(items)
    };

    Ok(ApiResponse::ok(data))
}

/// Recommend an output format from the objects detected in an image
#[instrument(skip_all)]
async fn recommend_format(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<RecommendationResponse<FormatAdvice>>, ApiError> {
    let mut multipart = multipart.map_err(|e| ApiError::validation(e.body_text()))?;

    let mut image = None;
    while let Some(field) = multipart.next_field().await? {
        if matches!(field.name(), Some("image" | "images")) && image.is_none() {
            image = Some(read_image(field).await?);
        }
    }

    let image = image.ok_or_else(|| ApiError::validation("No image file provided"))?;
    validate_image(&image, state.limits.max_file_size)?;

    let regions = state.detector.detect(&image.bytes).await;
    let labels = region_labels(&regions);
    let recommendation = state.recommender.recommend_format(&labels).await;

    Ok(Json(RecommendationResponse {
        success: true,
        recommendation: FormatAdvice {
            recommendation,
            detected_objects: labels,
        },
    }))
}

/// Recommend quality and format from a free-text description
#[instrument(skip_all)]
async fn recommend_quality(
    State(state): State<AppState>,
    request: Result<Json<QualityRequest>, JsonRejection>,
) -> Result<Json<RecommendationResponse<QualityRecommendation>>, ApiError> {
    let Json(request) = request?;

    let prompt = request
        .prompt
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::validation("Prompt is required"))?;

    let recommendation = state.recommender.recommend_quality(prompt).await;

    Ok(Json(RecommendationResponse {
        success: true,
        recommendation,
    }))
}

/// Stream the compressed files of several records as one zip archive
#[instrument(skip_all)]
async fn download_batch(
    State(state): State<AppState>,
    request: Result<Json<DownloadBatchRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = request?;

    if request.image_ids.is_empty() {
        return Err(ApiError::validation("No image IDs provided"));
    }

    // Repeated ids would produce entries with the same name
    let mut seen = HashSet::new();
    let ids: Vec<Uuid> = request
        .image_ids
        .iter()
        .filter_map(|raw| match raw.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(id = %raw, "Skipping malformed image id");
                None
            }
        })
        .filter(|id| seen.insert(*id))
        .collect();

    let records = state
        .store
        .get_many(&ids)
        .await
        .map_err(|e| ApiError::internal("Failed to load records", e))?;

    let names: Vec<String> = records.into_iter().map(|r| r.compressed_path).collect();

    info!(
        requested = request.image_ids.len(),
        found = names.len(),
        "Streaming archive"
    );

    let body = archive_body(state.blobs.clone(), names);

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{ARCHIVE_FILE_NAME}\""),
            ),
        ],
        body,
    )
        .into_response())
}

/// Get a single record
#[instrument(skip(state))]
async fn get_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<RecordResponse>>, ApiError> {
    let id: Uuid = id
        .parse()
        .map_err(|_| ApiError::not_found("Image not found"))?;

    let record = state
        .store
        .get(id)
        .await
        .map_err(|e| ApiError::internal("Failed to load image", e))?
        .ok_or_else(|| ApiError::not_found("Image not found"))?;

    Ok(ApiResponse::ok(state.record_response(record)))
}

/// Most recent records, newest first
#[instrument(skip(state))]
async fn recent_images(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<RecordSummary>>>, ApiError> {
    let records = state
        .store
        .recent(state.recent_limit)
        .await
        .map_err(|e| ApiError::internal("Failed to load recent images", e))?;

    let summaries = records
        .into_iter()
        .map(|r| RecordSummary {
            compressed_url: state.blobs.public_url(&r.compressed_path),
            id: r.id,
            original_name: r.original_name,
            original_size: r.original_size,
            compressed_size: r.compressed_size,
            compression_ratio: r.compression_ratio,
            format: r.format,
            quality: r.quality,
            created_at: r.created_at,
        })
        .collect();

    Ok(ApiResponse::ok(summaries))
}

/// Aggregate compression statistics
#[instrument(skip(state))]
async fn stats(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<CompressionStats>>, ApiError> {
    let stats = state
        .store
        .stats()
        .await
        .map_err(|e| ApiError::internal("Failed to load statistics", e))?;

    Ok(ApiResponse::ok(stats))
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = match state.store.backend() {
        "in-memory" => "in-memory",
        _ => match state.store.ping().await {
            Ok(()) => "connected",
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Database health check failed");
                "disconnected"
            }
        },
    };

    Json(HealthResponse {
        status: "OK",
        database,
        features: HealthFeatures {
            object_detection: state.detector.is_enabled(),
            ai_recommendations: state.recommender.is_enabled(),
            max_files: state.limits.max_files,
            max_file_size_bytes: state.limits.max_file_size,
            formats: OutputFormat::ALL.to_vec(),
        },
    })
}

async fn read_image(field: Field<'_>) -> Result<UploadedImage, ApiError> {
    let file_name = field.file_name().unwrap_or("upload").to_string();
    let content_type = field
        .content_type()
        .unwrap_or("application/octet-stream")
        .to_string();
    let bytes = field.bytes().await?;

    Ok(UploadedImage {
        file_name,
        content_type,
        bytes,
    })
}

/// Start the HTTP API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting compressor API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DetectedRegion;

    fn record() -> CompressionRecord {
        CompressionRecord {
            id: Uuid::new_v4(),
            original_name: "cat.png".to_string(),
            original_size: 1000,
            compressed_size: 400,
            compression_ratio: 60.0,
            original_path: "original-1-1.png".to_string(),
            compressed_path: "compressed-webp-1-1.webp".to_string(),
            detected_regions: vec![DetectedRegion {
                label: "cat".to_string(),
                score: 0.9,
                bbox: None,
            }],
            format: OutputFormat::Webp,
            quality: 80,
            ai_suggestion: None,
            prompt_used: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_response_flattens_record() {
        let response = RecordResponse {
            record: record(),
            original_url: "/uploads/original-1-1.png".to_string(),
            compressed_url: "/uploads/compressed-webp-1-1.webp".to_string(),
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["originalName"], "cat.png");
        assert_eq!(json["compressionRatio"], 60.0);
        assert_eq!(json["format"], "webp");
        assert_eq!(json["detectedRegions"][0]["label"], "cat");
        assert_eq!(json["compressedUrl"], "/uploads/compressed-webp-1-1.webp");
        assert!(json.get("record").is_none());
    }

    #[test]
    fn test_upload_data_shape() {
        let item = |r| RecordResponse {
            record: r,
            original_url: String::new(),
            compressed_url: String::new(),
        };

        let one = serde_json::to_value(UploadData::One(item(record()))).unwrap();
        assert!(one.is_object());

        let many =
            serde_json::to_value(UploadData::Many(vec![item(record()), item(record())])).unwrap();
        assert_eq!(many.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn test_format_advice_shape() {
        let advice = FormatAdvice {
            recommendation: FormatRecommendation {
                format: OutputFormat::Avif,
                reason: "Photo".to_string(),
            },
            detected_objects: vec!["person".to_string()],
        };

        let json = serde_json::to_value(&advice).unwrap();
        assert_eq!(json["format"], "avif");
        assert_eq!(json["reason"], "Photo");
        assert_eq!(json["detectedObjects"][0], "person");
    }
}
