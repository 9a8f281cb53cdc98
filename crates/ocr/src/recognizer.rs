use async_trait::async_trait;
use base64::Engine;
use receipt_core::ServiceAccountKey;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::auth::ServiceAccountAuth;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR authentication failed: {0}")]
    Auth(String),
    #[error("OCR request failed: {0}")]
    Request(String),
    /// The service answered but reported an error for this image.
    #[error("OCR service error: {0}")]
    Service(String),
    #[error("Unexpected OCR response: {0}")]
    InvalidResponse(String),
}

/// Abstraction over an OCR backend.
/// Implementations accept encoded image bytes and return the recognized text,
/// with line breaks preserved. An image without text yields `Ok("")`.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    async fn recognize(&self, image_bytes: &[u8]) -> Result<String, OcrError>;
}

// ── Mock backend (always available, used for tests) ───────────────────────────

/// Returns a pre-set string (or error), for testing the pipeline
/// without network access.
pub struct MockRecognizer {
    result: Result<String, String>,
}

impl MockRecognizer {
    pub fn new(text: impl Into<String>) -> Self {
        Self { result: Ok(text.into()) }
    }

    /// A recognizer whose every call fails with a service error.
    pub fn failing(message: impl Into<String>) -> Self {
        Self { result: Err(message.into()) }
    }
}

#[async_trait]
impl OcrBackend for MockRecognizer {
    async fn recognize(&self, _image_bytes: &[u8]) -> Result<String, OcrError> {
        self.result.clone().map_err(OcrError::Service)
    }
}

// ── Google Cloud Vision backend ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://vision.googleapis.com/v1".to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Serialize)]
struct AnnotateRequest {
    requests: Vec<AnnotateImageRequest>,
}

#[derive(Debug, Serialize)]
struct AnnotateImageRequest {
    image: ImageContent,
    features: Vec<Feature>,
}

#[derive(Debug, Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Debug, Serialize)]
struct Feature {
    #[serde(rename = "type")]
    feature_type: &'static str,
}

#[derive(Debug, Default, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<ImageResponse>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageResponse {
    full_text_annotation: Option<TextAnnotation>,
    error: Option<Status>,
}

#[derive(Debug, Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct Status {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Status,
}

fn annotate_request(image_bytes: &[u8]) -> AnnotateRequest {
    AnnotateRequest {
        requests: vec![AnnotateImageRequest {
            image: ImageContent {
                content: base64::engine::general_purpose::STANDARD.encode(image_bytes),
            },
            features: vec![Feature { feature_type: "DOCUMENT_TEXT_DETECTION" }],
        }],
    }
}

fn text_from_response(response: AnnotateResponse) -> Result<String, OcrError> {
    let Some(first) = response.responses.into_iter().next() else {
        return Ok(String::new());
    };
    if let Some(err) = first.error.filter(|e| !e.message.is_empty()) {
        return Err(OcrError::Service(format!("{} (code {})", err.message, err.code)));
    }
    Ok(first.full_text_annotation.map(|a| a.text).unwrap_or_default())
}

/// Document text detection through the Cloud Vision REST API.
pub struct VisionRecognizer {
    http: reqwest::Client,
    auth: ServiceAccountAuth,
    endpoint: String,
}

impl VisionRecognizer {
    pub fn new(key: ServiceAccountKey, config: &VisionConfig) -> Result<Self, OcrError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| OcrError::Request(format!("failed to create HTTP client: {e}")))?;
        let auth = ServiceAccountAuth::new(key, http.clone())?;
        Ok(Self {
            http,
            auth,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl OcrBackend for VisionRecognizer {
    async fn recognize(&self, image_bytes: &[u8]) -> Result<String, OcrError> {
        let token = self.auth.access_token().await?;
        let response = self
            .http
            .post(format!("{}/images:annotate", self.endpoint))
            .bearer_auth(token)
            .json(&annotate_request(image_bytes))
            .send()
            .await
            .map_err(|e| OcrError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OcrError::Request(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorEnvelope>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(OcrError::Service(format!("{status}: {message}")));
        }

        let parsed: AnnotateResponse = serde_json::from_str(&body)
            .map_err(|e| OcrError::InvalidResponse(e.to_string()))?;
        text_from_response(parsed)
    }
}
