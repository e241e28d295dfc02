//! Processing pipeline: transcription, parallel analysis, formatting.

pub mod analyze;
pub mod archetype;
pub mod completion;
pub mod emotion;
pub mod format;
pub mod lang_cache;
pub mod modes;
pub mod orchestrator;
pub mod retry;
pub mod stt;
pub mod transcribe;

pub use analyze::{AnalysisResult, AnalysisStage, ModeOutcome};
pub use archetype::Archetype;
pub use completion::{CompletionBackend, CompletionClient};
pub use emotion::EmotionScores;
pub use modes::{Mode, ModeStore};
pub use orchestrator::{Pipeline, PipelineOutcome};
pub use retry::{ApiError, ApiErrorKind, Notifier, TerminalFailure};
pub use stt::{TranscriptionBackend, TranscriptionClient};
pub use transcribe::TranscriptionStage;
