use crate::config::RecommendationConfig;
use crate::models::OutputFormat;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::LazyLock;
use tracing::{debug, instrument, warn};

pub const DEFAULT_QUALITY: u8 = 80;
pub const DEFAULT_FORMAT: OutputFormat = OutputFormat::Webp;
pub const DEFAULT_CONTEXT: &str = "Default optimization";
pub const DEFAULT_FORMAT_REASON: &str =
    "WebP offers a good balance of quality and size for web images";

const FORMAT_PROMPT: &str = "You are an image optimization expert. An image contains these \
detected objects: {labels}.\n\
Recommend the best compression format for serving it on the web. Choose one of JPEG, WEBP, \
AVIF or PNG.\n\
Answer with exactly two lines:\n\
FORMAT: <format>\n\
REASON: <one sentence>";

const QUALITY_PROMPT: &str = "You are an image optimization expert. A user describes how \
their image will be used: \"{prompt}\".\n\
Recommend a compression quality between 0 and 100 and a format (JPEG, WEBP, AVIF or PNG).\n\
Answer with exactly three lines:\n\
QUALITY: <number>\n\
FORMAT: <format>\n\
CONTEXT: <short description of the use case>";

static FORMAT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)FORMAT\s*:\s*\**\s*(jpe?g|webp|avif|png)\b").unwrap());
static REASON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)REASON\s*:\s*\**\s*(.+?)\s*$").unwrap());
static QUALITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)QUALITY\s*:\s*\**\s*(\d{1,3})\b").unwrap());
static CONTEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)CONTEXT\s*:\s*\**\s*(.+?)\s*$").unwrap());

/// Suggested output format for a set of detected objects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatRecommendation {
    pub format: OutputFormat,
    pub reason: String,
}

impl Default for FormatRecommendation {
    fn default() -> Self {
        Self {
            format: DEFAULT_FORMAT,
            reason: DEFAULT_FORMAT_REASON.to_string(),
        }
    }
}

/// Suggested quality and format for a free-text description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityRecommendation {
    pub quality: u8,
    pub format: OutputFormat,
    pub context: String,
}

impl Default for QualityRecommendation {
    fn default() -> Self {
        Self {
            quality: DEFAULT_QUALITY,
            format: DEFAULT_FORMAT,
            context: DEFAULT_CONTEXT.to_string(),
        }
    }
}

/// Format/quality advisor.
///
/// Never fails: request errors and unparsable answers degrade to the
/// hard-coded defaults (webp at 80).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Recommender: Send + Sync {
    async fn recommend_format(&self, labels: &[String]) -> FormatRecommendation;

    async fn recommend_quality(&self, prompt: &str) -> QualityRecommendation;

    /// Whether a real backend is configured
    fn is_enabled(&self) -> bool;
}

/// Client for a Gemini-style `generateContent` text-generation API
pub struct HttpRecommender {
    client: HttpClient,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

impl HttpRecommender {
    pub fn new(config: &RecommendationConfig) -> Result<Self> {
        let client = HttpClient::builder()
            .timeout(config.timeout())
            .build()
            .context("Failed to build text-generation HTTP client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    /// Send a prompt and return the concatenated text of the first candidate
    async fn generate(&self, prompt: &str) -> Result<String> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("No text-generation API key configured");
        };

        let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);
        let res = self
            .client
            .post(&url)
            .query(&[("key", api_key)])
            .json(&json!({
                "contents": [{ "parts": [{ "text": prompt }] }]
            }))
            .send()
            .await
            .context("Text-generation request failed")?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            bail!("Text-generation API returned HTTP {}: {}", status, body);
        }

        let response: GenerateResponse = res
            .json()
            .await
            .context("Malformed text-generation response")?;

        let text: String = response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            bail!("Text-generation response contained no text");
        }

        Ok(text)
    }
}

#[async_trait]
impl Recommender for HttpRecommender {
    #[instrument(skip(self))]
    async fn recommend_format(&self, labels: &[String]) -> FormatRecommendation {
        let prompt = format_prompt(labels);
        match self.generate(&prompt).await {
            Ok(text) => {
                debug!(response = %text, "Format recommendation received");
                parse_format_response(&text)
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Format recommendation failed, using default");
                metrics::counter!("compressor.recommendation.fallbacks").increment(1);
                FormatRecommendation::default()
            }
        }
    }

    #[instrument(skip(self))]
    async fn recommend_quality(&self, prompt: &str) -> QualityRecommendation {
        let prompt = quality_prompt(prompt);
        match self.generate(&prompt).await {
            Ok(text) => {
                debug!(response = %text, "Quality recommendation received");
                parse_quality_response(&text)
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Quality recommendation failed, using default");
                metrics::counter!("compressor.recommendation.fallbacks").increment(1);
                QualityRecommendation::default()
            }
        }
    }

    fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }
}

pub fn format_prompt(labels: &[String]) -> String {
    let labels = if labels.is_empty() {
        "no recognizable objects".to_string()
    } else {
        labels.join(", ")
    };
    FORMAT_PROMPT.replace("{labels}", &labels)
}

pub fn quality_prompt(prompt: &str) -> String {
    QUALITY_PROMPT.replace("{prompt}", prompt.trim())
}

/// Parse `FORMAT:` / `REASON:` lines; each missing field falls back on its own
pub fn parse_format_response(text: &str) -> FormatRecommendation {
    let fallback = FormatRecommendation::default();

    let format = capture(&FORMAT_RE, text).and_then(|f| f.parse().ok());
    let reason = capture(&REASON_RE, text).filter(|r| !r.is_empty());

    if format.is_none() || reason.is_none() {
        metrics::counter!("compressor.recommendation.fallbacks").increment(1);
    }

    FormatRecommendation {
        format: format.unwrap_or(fallback.format),
        reason: reason.unwrap_or(fallback.reason),
    }
}

/// Parse `QUALITY:` / `FORMAT:` / `CONTEXT:` lines; each missing field falls back on its own.
/// Qualities above 100 are clamped.
pub fn parse_quality_response(text: &str) -> QualityRecommendation {
    let fallback = QualityRecommendation::default();

    let quality = capture(&QUALITY_RE, text)
        .and_then(|q| q.parse::<u32>().ok())
        .map(|q| q.min(100) as u8);
    let format = capture(&FORMAT_RE, text).and_then(|f| f.parse().ok());
    let context = capture(&CONTEXT_RE, text).filter(|c| !c.is_empty());

    if quality.is_none() || format.is_none() || context.is_none() {
        metrics::counter!("compressor.recommendation.fallbacks").increment(1);
    }

    QualityRecommendation {
        quality: quality.unwrap_or(fallback.quality),
        format: format.unwrap_or(fallback.format),
        context: context.unwrap_or(fallback.context),
    }
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim_matches('*').trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve_once;

    fn recommender(endpoint: String, api_key: Option<&str>) -> HttpRecommender {
        HttpRecommender::new(&RecommendationConfig {
            endpoint,
            model: "test-model".to_string(),
            api_key: api_key.map(String::from),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn test_parse_quality_response() {
        let rec = parse_quality_response(
            "QUALITY: 65\nFORMAT: AVIF\nCONTEXT: Thumbnail for a product grid",
        );
        assert_eq!(rec.quality, 65);
        assert_eq!(rec.format, OutputFormat::Avif);
        assert_eq!(rec.context, "Thumbnail for a product grid");
    }

    #[test]
    fn test_parse_quality_response_with_markdown() {
        let rec = parse_quality_response(
            "Sure!\n**QUALITY:** 90\n**FORMAT:** jpg\n**CONTEXT:** Print-ready portfolio shot",
        );
        assert_eq!(rec.quality, 90);
        assert_eq!(rec.format, OutputFormat::Jpeg);
        assert_eq!(rec.context, "Print-ready portfolio shot");
    }

    #[test]
    fn test_parse_quality_response_partial_fallback() {
        let rec = parse_quality_response("QUALITY: 250\nI would pick something modern.");
        assert_eq!(rec.quality, 100);
        assert_eq!(rec.format, DEFAULT_FORMAT);
        assert_eq!(rec.context, DEFAULT_CONTEXT);

        assert_eq!(
            parse_quality_response("no idea"),
            QualityRecommendation::default()
        );
    }

    #[test]
    fn test_parse_format_response() {
        let rec = parse_format_response(
            "FORMAT: PNG\nREASON: The image is mostly text with sharp edges.",
        );
        assert_eq!(rec.format, OutputFormat::Png);
        assert_eq!(rec.reason, "The image is mostly text with sharp edges.");

        let rec = parse_format_response("FORMAT: gif\nREASON: animation");
        assert_eq!(rec.format, DEFAULT_FORMAT);
        assert_eq!(rec.reason, "animation");
    }

    #[test]
    fn test_prompts_interpolate_values() {
        let prompt = format_prompt(&["person".to_string(), "laptop".to_string()]);
        assert!(prompt.contains("person, laptop"));
        assert!(prompt.contains("FORMAT:"));

        assert!(format_prompt(&[]).contains("no recognizable objects"));

        let prompt = quality_prompt("  hero banner for a blog  ");
        assert!(prompt.contains("\"hero banner for a blog\""));
        assert!(prompt.contains("QUALITY:"));
    }

    #[tokio::test]
    async fn test_recommend_quality_round_trip() {
        let server = serve_once(
            "200 OK",
            r#"{"candidates":[{"content":{"parts":[{"text":"QUALITY: 72\nFORMAT: webp\nCONTEXT: Blog header"}]}}]}"#,
        )
        .await;

        let rec = recommender(server.url.clone(), Some("secret"))
            .recommend_quality("blog header")
            .await;
        assert_eq!(
            rec,
            QualityRecommendation {
                quality: 72,
                format: OutputFormat::Webp,
                context: "Blog header".to_string(),
            }
        );

        let request = server.request.await.unwrap();
        assert!(request.starts_with("POST /api/models/test-model:generateContent?key=secret"));
        assert!(request.contains("blog header"));
    }

    #[tokio::test]
    async fn test_recommend_format_falls_back_on_http_error() {
        let server = serve_once("500 Internal Server Error", r#"{"error":"boom"}"#).await;
        let rec = recommender(server.url, Some("secret"))
            .recommend_format(&["cat".to_string()])
            .await;
        assert_eq!(rec, FormatRecommendation::default());
    }

    #[tokio::test]
    async fn test_recommend_quality_unreachable_uses_default() {
        let rec = recommender("http://127.0.0.1:1".to_string(), Some("secret"))
            .recommend_quality("anything")
            .await;
        assert_eq!(rec.quality, 80);
        assert_eq!(rec.format, OutputFormat::Webp);
        assert_eq!(rec.context, "Default optimization");
    }

    #[tokio::test]
    async fn test_without_key_uses_default() {
        let recommender = recommender("http://127.0.0.1:1".to_string(), None);
        assert!(!recommender.is_enabled());
        assert_eq!(
            recommender.recommend_quality("anything").await,
            QualityRecommendation::default()
        );
    }
}
