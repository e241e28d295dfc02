//! Chat-completion provider client (OpenAI-compatible API).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::pipeline::retry::{ApiError, ApiErrorKind};

/// Seam between analysis code and the wire; tests substitute their own impl.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, ApiError>;
}

pub struct CompletionClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ApiMessage<'a>>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl CompletionClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client");
        Self { base_url, api_key, http }
    }
}

#[async_trait]
impl CompletionBackend for CompletionClient {
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, ApiError> {
        let request = ApiRequest {
            model,
            max_tokens,
            temperature,
            messages: vec![ApiMessage { role: "user", content: prompt }],
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), &body));
        }

        let parsed: ApiResponse = response.json().await.map_err(|e| {
            ApiError::new(ApiErrorKind::Permanent, format!("malformed completion response: {e}"))
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.trim().is_empty())
            .map(|text| text.trim().to_string())
            .ok_or_else(|| ApiError::new(ApiErrorKind::Permanent, "empty completion"))
    }
}
