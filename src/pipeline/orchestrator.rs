//! End-to-end pipeline for one inbound message.
//!
//! Owns the stage composition: transcription → parallel analysis →
//! formatting. A [`PipelineOutcome`] lives only for the duration of one
//! inbound event and is discarded once the reply is sent.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::pipeline::analyze::{AnalysisResult, AnalysisStage};
use crate::pipeline::archetype::Archetype;
use crate::pipeline::completion::CompletionBackend;
use crate::pipeline::modes::{ModeStore, advice_mode_name};
use crate::pipeline::retry::{ApiErrorKind, Notifier, TerminalFailure, retry_call};
use crate::pipeline::transcribe::TranscriptionStage;

/// The single user-facing notice for a failed advice request.
pub const ADVICE_FAILURE_NOTICE: &str =
    "⚠️ Совет не удалось получить. Пожалуйста, попробуй позже.";

/// Final aggregate for one inbound message.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub transcript: String,
    pub analysis: AnalysisResult,
    pub reply_text: String,
    /// True when one or more modes came back unavailable.
    pub partial: bool,
}

/// Running counters surfaced by the /stats command.
#[derive(Default)]
pub struct PipelineStats {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    total_millis: AtomicU64,
}

impl PipelineStats {
    fn record_success(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.total_millis.fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary_ru(&self) -> String {
        let processed = self.processed.load(Ordering::Relaxed);
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let avg_secs = if succeeded > 0 {
            self.total_millis.load(Ordering::Relaxed) as f64 / succeeded as f64 / 1000.0
        } else {
            0.0
        };
        format!(
            "📊 Статистика обработки\n\n\
             • Всего обработано: {processed}\n\
             • Успешно: {succeeded}\n\
             • Ошибок: {failed}\n\
             • Среднее время: {avg_secs:.1}с"
        )
    }
}

pub struct Pipeline {
    transcription: TranscriptionStage,
    analysis: AnalysisStage,
    completions: Arc<dyn CompletionBackend>,
    modes: Arc<ModeStore>,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(
        transcription: TranscriptionStage,
        analysis: AnalysisStage,
        completions: Arc<dyn CompletionBackend>,
        modes: Arc<ModeStore>,
    ) -> Self {
        Self { transcription, analysis, completions, modes, stats: PipelineStats::default() }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Full flow for a voice message. On `Err` the user has already received
    /// the single failure notice when `user_notified` is set.
    pub async fn process_voice(
        &self,
        audio: Vec<u8>,
        user_id: i64,
        notifier: &dyn Notifier,
    ) -> Result<PipelineOutcome, TerminalFailure> {
        let started = Instant::now();

        let transcription = match self.transcription.transcribe(audio, user_id, notifier).await {
            Ok(t) => t,
            Err(failure) => {
                self.stats.record_failure();
                return Err(failure);
            }
        };

        let outcome = self.process_text(&transcription.text).await;
        self.stats.record_success(started.elapsed());
        info!(
            "Pipeline completed in {:.1}s (partial: {})",
            started.elapsed().as_secs_f64(),
            outcome.partial
        );
        Ok(outcome)
    }

    /// Analysis-only flow, used for forwarded text and as the tail of the
    /// voice flow. Infallible: mode failures become unavailable markers.
    pub async fn process_text(&self, text: &str) -> PipelineOutcome {
        let analysis = self.analysis.analyze(text).await;
        let partial = analysis.is_partial();
        if partial {
            warn!("Analysis completed partially");
        }
        let reply_text = crate::pipeline::format::format_reply(&analysis);
        PipelineOutcome { transcript: text.to_string(), analysis, reply_text, partial }
    }

    /// Generate an archetype advice reply for an earlier transcript.
    ///
    /// The persona's prompt is configuration: the mode named `ADVICE_<NAME>`.
    pub async fn advice(
        &self,
        transcript: &str,
        archetype: Archetype,
        notifier: &dyn Notifier,
    ) -> Result<String, TerminalFailure> {
        let Some(mode) = self.modes.get(&advice_mode_name(archetype.as_str())) else {
            warn!("No advice mode configured for archetype {archetype}");
            let user_notified = notifier.notify_failure(ADVICE_FAILURE_NOTICE).await;
            return Err(TerminalFailure { kind: ApiErrorKind::Permanent, user_notified });
        };

        let prompt = mode.render_prompt(transcript);
        retry_call("advice", Some((notifier, ADVICE_FAILURE_NOTICE)), |_| {
            self.completions.complete(&mode.model, &prompt, mode.max_tokens, mode.temperature)
        })
        .await
    }
}
