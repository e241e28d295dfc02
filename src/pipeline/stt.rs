//! Transcription provider client (OpenAI-compatible audio API).

use async_trait::async_trait;
use serde::Deserialize;

use crate::pipeline::retry::{ApiError, ApiErrorKind};

/// A finished transcription.
#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    /// Language reported by the provider, or "unknown".
    pub language: String,
    /// Audio duration in seconds as reported by the provider.
    pub duration: f64,
}

/// Seam between the transcription stage and the wire. The HTTP client below
/// is the production impl; tests substitute their own.
#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        language_hint: Option<&str>,
    ) -> Result<Transcription, ApiError>;
}

pub struct TranscriptionClient {
    base_url: String,
    api_key: String,
    model: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct ApiResponse {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
}

impl TranscriptionClient {
    pub fn new(base_url: String, api_key: String, model: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");
        Self { base_url, api_key, model, http }
    }
}

#[async_trait]
impl TranscriptionBackend for TranscriptionClient {
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        language_hint: Option<&str>,
    ) -> Result<Transcription, ApiError> {
        // A hint pins decoding; without one leave the provider room to detect.
        let temperature = if language_hint.is_some() { "0.0" } else { "0.2" };

        let file_part = reqwest::multipart::Part::bytes(audio)
            .file_name("voice.ogg")
            .mime_str("audio/ogg")
            .map_err(|e| ApiError::new(ApiErrorKind::Permanent, format!("bad audio part: {e}")))?;

        let mut form = reqwest::multipart::Form::new()
            .part("file", file_part)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("temperature", temperature);
        if let Some(lang) = language_hint {
            form = form.text("language", lang.to_string());
        }

        let response = self
            .http
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), &body));
        }

        let parsed: ApiResponse = response.json().await.map_err(|e| {
            ApiError::new(ApiErrorKind::Permanent, format!("malformed transcription response: {e}"))
        })?;

        Ok(Transcription {
            text: parsed.text.trim().to_string(),
            language: parsed.language.unwrap_or_else(|| "unknown".to_string()),
            duration: parsed.duration.unwrap_or(0.0),
        })
    }
}
