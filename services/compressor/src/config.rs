use crate::models::OutputFormat;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the compressor service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Upload directory configuration
    #[serde(default)]
    pub blob: BlobConfig,
    /// Object-detection API configuration
    #[serde(default)]
    pub detection: DetectionConfig,
    /// Text-generation API configuration
    #[serde(default)]
    pub recommendation: RecommendationConfig,
    /// Encoder configuration
    #[serde(default)]
    pub compression: CompressionConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Install the Prometheus exporter
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Prefix for public blob URLs, e.g. `https://img.example.com`. Empty keeps URLs relative.
    #[serde(default)]
    pub public_base_url: String,
    /// Directory holding the web client
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
    /// Maximum number of files per upload request
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    /// Maximum size of a single uploaded file in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: usize,
    /// Number of records returned by /api/recent
    #[serde(default = "default_recent_limit")]
    pub recent_limit: i64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. Records are kept in memory when unset.
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Upload directory configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BlobConfig {
    /// Flat directory holding originals and compressed files
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
}

/// Object-detection inference API
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Inference endpoint receiving raw image bytes
    #[serde(default = "default_detection_endpoint")]
    pub endpoint: String,
    /// Bearer token. Detection is skipped when unset.
    pub api_key: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_detection_timeout_secs")]
    pub timeout_secs: u64,
}

/// Text-generation API used for format/quality suggestions
#[derive(Debug, Clone, Deserialize)]
pub struct RecommendationConfig {
    /// Base URL of the generateContent API
    #[serde(default = "default_generation_endpoint")]
    pub endpoint: String,
    /// Model name
    #[serde(default = "default_generation_model")]
    pub model: String,
    /// API key. Fallback values are returned when unset.
    pub api_key: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

/// Encoder configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CompressionConfig {
    /// Format used when the request names none
    #[serde(default = "default_format")]
    pub default_format: OutputFormat,
    /// Quality used when the request names none
    #[serde(default = "default_quality")]
    pub default_quality: u8,
    /// Labels that trigger the quality boost (substring match, case-insensitive)
    #[serde(default = "default_important_labels")]
    pub important_labels: Vec<String>,
    /// Quality added when an important label is detected
    #[serde(default = "default_importance_boost")]
    pub importance_boost: u8,
    /// Upper bound for boosted quality
    #[serde(default = "default_importance_cap")]
    pub importance_cap: u8,
    /// ravif speed (1 = slowest, 10 = fastest)
    #[serde(default = "default_avif_speed")]
    pub avif_speed: u8,
    /// libwebp method (0 = fastest, 6 = slowest)
    #[serde(default = "default_webp_method")]
    pub webp_method: i32,
}

// Default value functions
fn default_service_name() -> String {
    "pixpress-compressor".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    5000
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

fn default_max_files() -> usize {
    10
}

fn default_max_file_size() -> usize {
    10 * 1024 * 1024 // 10MiB
}

fn default_recent_limit() -> i64 {
    10
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_detection_endpoint() -> String {
    "https://api-inference.huggingface.co/models/facebook/detr-resnet-50".to_string()
}

fn default_detection_timeout_secs() -> u64 {
    30
}

fn default_generation_endpoint() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_generation_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_generation_timeout_secs() -> u64 {
    60
}

fn default_format() -> OutputFormat {
    OutputFormat::Webp
}

fn default_quality() -> u8 {
    80
}

fn default_important_labels() -> Vec<String> {
    ["person", "face", "text", "book", "laptop", "phone"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_importance_boost() -> u8 {
    10
}

fn default_importance_cap() -> u8 {
    95
}

fn default_avif_speed() -> u8 {
    1
}

fn default_webp_method() -> i32 {
    6
}

impl Config {
    /// Load configuration from config files and environment
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/compressor").required(false))
            .add_source(config::File::with_name("/etc/pixpress/compressor").required(false))
            // Override with environment variables
            // PIXPRESS__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("PIXPRESS")
                    .separator("__")
                    .try_parsing(true),
            )
            // Well-known deployment variables win over everything else
            .set_override_option("database.url", env_var("DATABASE_URL"))?
            .set_override_option(
                "api.port",
                env_var("PORT").and_then(|p| p.parse::<i64>().ok()),
            )?
            .set_override_option("detection.api_key", env_var("DETECTION_API_KEY"))?
            .set_override_option("recommendation.api_key", env_var("GENERATION_API_KEY"))?
            .set_override_option("api.cors_origins", env_var("ALLOWED_ORIGINS").map(split_list))?
            .set_override_option("blob.upload_dir", env_var("UPLOAD_DIR"))?
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl DatabaseConfig {
    /// Pool acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Pool idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl DetectionConfig {
    /// Detection request timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RecommendationConfig {
    /// Text-generation request timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Read an env var, treating blank values as unset
fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn split_list(raw: String) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_enabled: default_true(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            public_base_url: String::new(),
            static_dir: default_static_dir(),
            max_files: default_max_files(),
            max_file_size_bytes: default_max_file_size(),
            recent_limit: default_recent_limit(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: default_true(),
        }
    }
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_detection_endpoint(),
            api_key: None,
            timeout_secs: default_detection_timeout_secs(),
        }
    }
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            endpoint: default_generation_endpoint(),
            model: default_generation_model(),
            api_key: None,
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            default_format: default_format(),
            default_quality: default_quality(),
            important_labels: default_important_labels(),
            importance_boost: default_importance_boost(),
            importance_cap: default_importance_cap(),
            avif_speed: default_avif_speed(),
            webp_method: default_webp_method(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.api.max_files, 10);
        assert_eq!(config.api.max_file_size_bytes, 10 * 1024 * 1024);
        assert_eq!(config.api.recent_limit, 10);
        assert_eq!(config.detection.timeout_secs, 30);
        assert_eq!(config.compression.default_format, OutputFormat::Webp);
        assert_eq!(config.compression.default_quality, 80);
        assert_eq!(config.compression.importance_cap, 95);
        assert_eq!(config.compression.avif_speed, 1);
        assert_eq!(config.compression.webp_method, 6);
        assert!(config.database.url.is_none());
    }

    #[test]
    fn test_empty_source_deserializes_to_defaults() {
        let config: Config = config::Config::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.api.port, 5000);
        assert_eq!(config.blob.upload_dir, PathBuf::from("uploads"));
        assert_eq!(config.compression.important_labels.len(), 6);
    }

    #[test]
    fn test_nested_overrides() {
        let config: Config = config::Config::builder()
            .set_override("api.max_files", 3)
            .unwrap()
            .set_override("compression.default_format", "avif")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.api.max_files, 3);
        assert_eq!(config.compression.default_format, OutputFormat::Avif);
        assert_eq!(config.api.host, "0.0.0.0");
    }

    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list("http://a.test, http://b.test,,".to_string()),
            vec!["http://a.test".to_string(), "http://b.test".to_string()]
        );
    }

    #[test]
    fn test_timeout_accessors() {
        let config = Config::default();
        assert_eq!(config.database.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.database.idle_timeout(), Duration::from_secs(600));
        assert_eq!(config.detection.timeout(), Duration::from_secs(30));
        assert_eq!(config.recommendation.timeout(), Duration::from_secs(60));
    }
}
