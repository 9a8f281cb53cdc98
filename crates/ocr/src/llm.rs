use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Language model client error: {0}")]
    Configuration(String),
    #[error("Language model request failed: {0}")]
    Request(String),
    #[error("Language model API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Unexpected language model response: {0}")]
    InvalidResponse(String),
}

/// A text-completion capability. Returns the raw completion; interpreting it
/// is the caller's job.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

// ── Mock backend ──────────────────────────────────────────────────────────────

/// Returns a canned completion and remembers the prompts it was given.
pub struct MockLlm {
    response: String,
    prompts: std::sync::Mutex<Vec<String>>,
}

impl MockLlm {
    pub fn new(response: impl Into<String>) -> Self {
        Self { response: response.into(), prompts: std::sync::Mutex::new(Vec::new()) }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmBackend for MockLlm {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        if let Ok(mut p) = self.prompts.lock() {
            p.push(prompt.to_string());
        }
        Ok(self.response.clone())
    }
}

// ── OpenAI chat completions ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4".to_string(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Sampling is pinned to temperature 0 so identical text gives identical output.
fn chat_request<'a>(model: &'a str, prompt: &'a str) -> ChatRequest<'a> {
    ChatRequest {
        model,
        messages: vec![ChatMessage { role: "user", content: prompt }],
        temperature: 0.0,
    }
}

fn completion_text(body: &str) -> Result<String, LlmError> {
    let response: ChatResponse =
        serde_json::from_str(body).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse("no choices returned".to_string()))?;
    Ok(choice.message.content.unwrap_or_default().trim().to_string())
}

pub struct OpenAiLlm {
    client: reqwest::Client,
    api_key: SecretString,
    config: LlmConfig,
}

impl OpenAiLlm {
    pub fn new(api_key: SecretString, config: LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Configuration(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client, api_key, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl LlmBackend for OpenAiLlm {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&chat_request(&self.config.model, prompt))
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::Request(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(LlmError::Api { status: status.as_u16(), message });
        }

        completion_text(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_pins_temperature_to_zero() {
        let body = serde_json::to_value(chat_request("gpt-4", "hello")).unwrap();
        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hello");
    }

    #[test]
    fn completion_text_takes_first_choice_trimmed() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"  {\"a\":1}\n"}},
                                  {"message":{"content":"ignored"}}]}"#;
        assert_eq!(completion_text(body).unwrap(), r#"{"a":1}"#);
    }

    #[test]
    fn null_content_is_empty() {
        let body = r#"{"choices":[{"message":{"content":null}}]}"#;
        assert_eq!(completion_text(body).unwrap(), "");
    }

    #[test]
    fn missing_choices_is_invalid() {
        assert!(matches!(completion_text(r#"{"choices":[]}"#), Err(LlmError::InvalidResponse(_))));
        assert!(matches!(completion_text("<html>"), Err(LlmError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn mock_records_prompts() {
        let llm = MockLlm::new("{}");
        assert_eq!(llm.complete("first").await.unwrap(), "{}");
        llm.complete("second").await.unwrap();
        assert_eq!(llm.prompts(), ["first", "second"]);
    }

    #[test]
    fn client_builds_with_defaults() {
        let llm = OpenAiLlm::new(SecretString::new("sk-test".into()), LlmConfig::default()).unwrap();
        assert_eq!(llm.model(), "gpt-4");
    }
}
