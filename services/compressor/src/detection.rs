use crate::config::DetectionConfig;
use crate::models::DetectedRegion;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client as HttpClient;
use tracing::{debug, instrument, warn};

/// Finds labeled regions in an image.
///
/// Detection is best-effort: implementations return an empty list instead
/// of failing, so a degraded detector never blocks compression.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegionDetector: Send + Sync {
    async fn detect(&self, image: &[u8]) -> Vec<DetectedRegion>;

    /// Whether a real backend is configured
    fn is_enabled(&self) -> bool;
}

/// Object-detection client for a hosted inference endpoint that accepts raw
/// image bytes and answers with `[{label, score, box}]`.
pub struct HttpRegionDetector {
    client: HttpClient,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpRegionDetector {
    pub fn new(config: &DetectionConfig) -> Result<Self> {
        let client = HttpClient::builder()
            .timeout(config.timeout())
            .build()
            .context("Failed to build detection HTTP client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }

    async fn request(&self, api_key: &str, image: &[u8]) -> Result<Vec<DetectedRegion>> {
        let res = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .context("Detection request failed")?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            bail!("Detection API returned HTTP {}: {}", status, body);
        }

        let body = res.bytes().await.context("Failed to read detection response")?;
        serde_json::from_slice(&body).context("Malformed detection response")
    }
}

#[async_trait]
impl RegionDetector for HttpRegionDetector {
    #[instrument(skip(self, image), fields(size_bytes = image.len()))]
    async fn detect(&self, image: &[u8]) -> Vec<DetectedRegion> {
        let Some(api_key) = self.api_key.as_deref() else {
            debug!("No detection API key configured, skipping detection");
            return Vec::new();
        };

        match self.request(api_key, image).await {
            Ok(regions) => {
                debug!(region_count = regions.len(), "Regions detected");
                regions
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Region detection failed, continuing without regions");
                metrics::counter!("compressor.detection.failures").increment(1);
                Vec::new()
            }
        }
    }

    fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Labels of detected regions, in detection order
pub fn region_labels(regions: &[DetectedRegion]) -> Vec<String> {
    regions.iter().map(|r| r.label.clone()).collect()
}
