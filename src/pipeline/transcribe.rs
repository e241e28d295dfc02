//! Transcription stage: audio bytes in, text out.
//!
//! Resolves a language hint from the per-user preference cache, delegates
//! the network call through the retry wrapper, and feeds the detected
//! language back into the cache on success.

use std::sync::Arc;

use tracing::{debug, info};

use crate::pipeline::lang_cache::LanguageCache;
use crate::pipeline::retry::{Notifier, TerminalFailure, retry_call};
use crate::pipeline::stt::{Transcription, TranscriptionBackend};

/// The single user-facing notice for a failed transcription.
pub const TRANSCRIBE_FAILURE_NOTICE: &str =
    "⚠️ Распознавание не удалось. Пожалуйста, попробуй позже.";

pub struct TranscriptionStage {
    backend: Arc<dyn TranscriptionBackend>,
    cache: Arc<LanguageCache>,
    priority_languages: Vec<String>,
}

impl TranscriptionStage {
    pub fn new(
        backend: Arc<dyn TranscriptionBackend>,
        cache: Arc<LanguageCache>,
        priority_languages: Vec<String>,
    ) -> Self {
        Self { backend, cache, priority_languages }
    }

    /// Transcribe one voice message.
    ///
    /// On terminal failure the user has already been notified through
    /// `notifier`; callers must not send another message.
    pub async fn transcribe(
        &self,
        audio: Vec<u8>,
        user_id: i64,
        notifier: &dyn Notifier,
    ) -> Result<Transcription, TerminalFailure> {
        let hint = self.cache.hint_for(user_id, &self.priority_languages);
        if let Some(ref lang) = hint {
            debug!("Transcribing {} bytes with language hint '{lang}'", audio.len());
        } else {
            debug!("Transcribing {} bytes with auto-detection", audio.len());
        }

        let result = retry_call(
            "transcription",
            Some((notifier, TRANSCRIBE_FAILURE_NOTICE)),
            |_| self.backend.transcribe(audio.clone(), hint.as_deref()),
        )
        .await?;

        info!(
            "Transcribed {:.1}s of audio into {} chars (language: {})",
            result.duration,
            result.text.chars().count(),
            result.language
        );

        if !result.text.is_empty() && result.language != "unknown" {
            // Longer transcripts are stronger evidence of the language.
            let confidence = (result.text.chars().count() as f64 / 100.0).min(1.0);
            self.cache.observe(user_id, &result.language, confidence);
        }

        Ok(result)
    }
}
