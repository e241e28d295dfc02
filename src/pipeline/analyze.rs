//! Parallel text analysis across the enabled modes.
//!
//! Every enabled mode runs as a sibling task under one shared deadline for
//! the whole stage. Partial success is a first-class outcome: whatever
//! finished is returned, anything still in flight at the deadline is marked
//! unavailable and aborted, and a single failed mode never fails the request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::pipeline::completion::CompletionBackend;
use crate::pipeline::emotion::EmotionScores;
use crate::pipeline::modes::{MODE_EMOTION, ModeStore};
use crate::pipeline::retry::retry_call;

/// What one mode produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ModeOutcome {
    Completed(String),
    /// Failed terminally or missed the stage deadline.
    Unavailable,
}

impl ModeOutcome {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ModeOutcome::Unavailable)
    }
}

#[derive(Debug, Clone)]
pub struct ModeReport {
    pub outcome: ModeOutcome,
    pub latency: Duration,
}

/// Merged result of one analysis pass: exactly one entry per enabled mode.
#[derive(Debug, Clone, Default)]
pub struct AnalysisResult {
    pub outcomes: HashMap<String, ModeReport>,
}

impl AnalysisResult {
    pub fn completed(&self, name: &str) -> Option<&str> {
        match self.outcomes.get(name)?.outcome {
            ModeOutcome::Completed(ref text) => Some(text),
            ModeOutcome::Unavailable => None,
        }
    }

    /// True when at least one mode is marked unavailable.
    pub fn is_partial(&self) -> bool {
        self.outcomes.values().any(|r| r.outcome.is_unavailable())
    }

    /// Emotion scores, if the EMOTION mode ran and completed.
    pub fn emotion_scores(&self) -> Option<EmotionScores> {
        self.completed(MODE_EMOTION).map(EmotionScores::parse)
    }
}

pub struct AnalysisStage {
    completions: Arc<dyn CompletionBackend>,
    modes: Arc<ModeStore>,
    deadline: Duration,
}

impl AnalysisStage {
    pub fn new(completions: Arc<dyn CompletionBackend>, modes: Arc<ModeStore>, deadline: Duration) -> Self {
        Self { completions, modes, deadline }
    }

    /// Run all enabled modes over `text` concurrently.
    ///
    /// Mode failures are absorbed as unavailable markers, not user messages;
    /// the reply itself carries the signal.
    pub async fn analyze(&self, text: &str) -> AnalysisResult {
        let enabled = self.modes.enabled();
        if enabled.is_empty() {
            warn!("No enabled modes, returning empty analysis");
            return AnalysisResult::default();
        }

        // Pre-mark everything unavailable; completions overwrite below, so
        // whatever misses the deadline keeps the marker.
        let mut outcomes: HashMap<String, ModeReport> = enabled
            .iter()
            .map(|mode| {
                (
                    mode.name.clone(),
                    ModeReport { outcome: ModeOutcome::Unavailable, latency: self.deadline },
                )
            })
            .collect();

        let started = Instant::now();
        let deadline_at = started + self.deadline;
        let mut tasks = JoinSet::new();

        for mode in enabled {
            let completions = self.completions.clone();
            let prompt = mode.render_prompt(text);
            tasks.spawn(async move {
                let call_started = Instant::now();
                let label = format!("mode {}", mode.name);
                let result = retry_call(&label, None, |_| {
                    completions.complete(&mode.model, &prompt, mode.max_tokens, mode.temperature)
                })
                .await;
                (mode.name, result, call_started.elapsed())
            });
        }

        loop {
            match tokio::time::timeout_at(deadline_at, tasks.join_next()).await {
                Ok(Some(Ok((name, result, latency)))) => {
                    let outcome = match result {
                        Ok(completion) => {
                            info!("Mode {name} completed in {:.1}s", latency.as_secs_f64());
                            ModeOutcome::Completed(completion)
                        }
                        Err(failure) => {
                            warn!("Mode {name} unavailable ({:?})", failure.kind);
                            ModeOutcome::Unavailable
                        }
                    };
                    outcomes.insert(name, ModeReport { outcome, latency });
                }
                Ok(Some(Err(join_error))) => {
                    warn!("Analysis task failed: {join_error}");
                }
                Ok(None) => break,
                Err(_) => {
                    let pending = outcomes.values().filter(|r| r.outcome.is_unavailable()).count();
                    warn!(
                        "Analysis deadline of {:.0}s elapsed with {pending} mode(s) pending",
                        self.deadline.as_secs_f64()
                    );
                    // Cancels in-flight calls, including mid-backoff sleeps.
                    tasks.abort_all();
                    break;
                }
            }
        }

        AnalysisResult { outcomes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::modes::Mode;
    use crate::pipeline::retry::{ApiError, ApiErrorKind};
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;
    use tempfile::TempDir;

    /// Per-model scripted behavior.
    #[derive(Clone)]
    enum Behavior {
        Reply(&'static str),
        Fail(ApiErrorKind),
        /// Never completes within any reasonable deadline.
        Hang,
    }

    struct ScriptedBackend {
        behaviors: StdHashMap<String, Behavior>,
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(
            &self,
            model: &str,
            _prompt: &str,
            _max_tokens: u32,
            _temperature: f32,
        ) -> Result<String, ApiError> {
            match self.behaviors.get(model) {
                Some(Behavior::Reply(text)) => Ok(text.to_string()),
                Some(Behavior::Fail(kind)) => Err(ApiError::new(*kind, "scripted failure")),
                Some(Behavior::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(String::new())
                }
                None => panic!("no behavior scripted for model {model}"),
            }
        }
    }

    fn store_with(modes: &[(&str, &str)]) -> Arc<ModeStore> {
        let dir = TempDir::new().unwrap();
        for (name, model) in modes {
            let json = format!(
                r#"{{"name": "{name}", "model": "{model}", "prompt": "{{text}}", "enabled": true}}"#
            );
            std::fs::write(dir.path().join(format!("{}.json", name.to_lowercase())), json).unwrap();
        }
        Arc::new(ModeStore::load(dir.path()).unwrap())
    }

    fn stage(backend: ScriptedBackend, modes: Arc<ModeStore>, deadline: Duration) -> AnalysisStage {
        AnalysisStage::new(Arc::new(backend), modes, deadline)
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_modes_complete() {
        let backend = ScriptedBackend {
            behaviors: StdHashMap::from([
                ("model-a".to_string(), Behavior::Reply("summary text")),
                ("model-b".to_string(), Behavior::Reply("tone text")),
            ]),
        };
        let stage = stage(
            backend,
            store_with(&[("DEFAULT", "model-a"), ("TONE", "model-b")]),
            Duration::from_secs(30),
        );

        let result = stage.analyze("hello world").await;
        assert_eq!(result.outcomes.len(), 2);
        assert_eq!(result.completed("DEFAULT"), Some("summary text"));
        assert_eq!(result.completed("TONE"), Some("tone text"));
        assert!(!result.is_partial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_modes_become_unavailable_without_raising() {
        let backend = ScriptedBackend {
            behaviors: StdHashMap::from([
                ("model-a".to_string(), Behavior::Reply("ok")),
                ("model-b".to_string(), Behavior::Fail(ApiErrorKind::Permanent)),
                ("model-c".to_string(), Behavior::Fail(ApiErrorKind::RateLimited)),
            ]),
        };
        let stage = stage(
            backend,
            store_with(&[("A", "model-a"), ("B", "model-b"), ("C", "model-c")]),
            Duration::from_secs(60),
        );

        let result = stage.analyze("text").await;
        // Exactly N entries, failed ones marked, nothing raised.
        assert_eq!(result.outcomes.len(), 3);
        assert_eq!(result.completed("A"), Some("ok"));
        assert!(result.outcomes["B"].outcome.is_unavailable());
        assert!(result.outcomes["C"].outcome.is_unavailable());
        assert!(result.is_partial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_marks_pending_modes_unavailable() {
        let backend = ScriptedBackend {
            behaviors: StdHashMap::from([
                ("model-a".to_string(), Behavior::Reply("fast")),
                ("model-b".to_string(), Behavior::Hang),
            ]),
        };
        let stage = stage(
            backend,
            store_with(&[("FAST", "model-a"), ("SLOW", "model-b")]),
            Duration::from_secs(30),
        );

        let started = Instant::now();
        let result = stage.analyze("text").await;
        let elapsed = started.elapsed();

        assert!(elapsed <= Duration::from_secs(31), "stage must return at the deadline");
        assert_eq!(result.completed("FAST"), Some("fast"));
        assert!(result.outcomes["SLOW"].outcome.is_unavailable());
        assert!(result.is_partial());
    }

    #[tokio::test]
    async fn test_empty_mode_set_yields_empty_result() {
        let backend = ScriptedBackend { behaviors: StdHashMap::new() };
        let dir = TempDir::new().unwrap();
        let stage = stage(
            backend,
            Arc::new(ModeStore::load(dir.path()).unwrap()),
            Duration::from_secs(5),
        );

        let result = stage.analyze("text").await;
        assert!(result.outcomes.is_empty());
        assert!(!result.is_partial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_emotion_scores_come_from_the_emotion_mode() {
        let backend = ScriptedBackend {
            behaviors: StdHashMap::from([(
                "model-e".to_string(),
                Behavior::Reply(r#"{"sarcasm": 0.8, "toxicity": 0.1, "manipulation": 0.1}"#),
            )]),
        };
        let stage = stage(backend, store_with(&[("EMOTION", "model-e")]), Duration::from_secs(30));

        let result = stage.analyze("text").await;
        let scores = result.emotion_scores().unwrap();
        assert_eq!(scores, EmotionScores::new(0.8, 0.1, 0.1));
    }
}
