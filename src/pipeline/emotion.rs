//! Emotion scoring of the transcript.
//!
//! The EMOTION mode asks the model for a bare JSON object with sarcasm,
//! toxicity and manipulation in [0, 1]. Models wrap JSON in markdown fences
//! or prose often enough that parsing falls back to extracting the first
//! object mentioning "sarcasm"; a transcript must never fail over this, so
//! unparsable output degrades to neutral scores.

use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use tracing::warn;

pub const SARCASM_HIGH: f64 = 0.7;
pub const TOXICITY_HIGH: f64 = 0.6;
pub const MANIPULATION_HIGH: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EmotionScores {
    pub sarcasm: f64,
    pub toxicity: f64,
    pub manipulation: f64,
}

#[derive(Deserialize)]
struct RawScores {
    #[serde(default)]
    sarcasm: f64,
    #[serde(default)]
    toxicity: f64,
    #[serde(default)]
    manipulation: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmotionLevel {
    High,
    Medium,
    Low,
}

impl EmotionLevel {
    pub fn as_ru(&self) -> &'static str {
        match self {
            EmotionLevel::High => "высокий",
            EmotionLevel::Medium => "средний",
            EmotionLevel::Low => "низкий",
        }
    }
}

fn json_object_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"(?s)\{[^{}]*"sarcasm"[^{}]*\}"#).unwrap())
}

impl EmotionScores {
    pub fn new(sarcasm: f64, toxicity: f64, manipulation: f64) -> Self {
        Self { sarcasm, toxicity, manipulation }.clamped()
    }

    /// Parse a completion into scores. Total: bad output gives neutral zeros.
    pub fn parse(response: &str) -> Self {
        let Some(json_text) = extract_json(response) else {
            warn!("No emotion JSON found in response: {:.100}", response);
            return Self::default();
        };
        match serde_json::from_str::<RawScores>(&json_text) {
            Ok(raw) => Self::new(raw.sarcasm, raw.toxicity, raw.manipulation),
            Err(e) => {
                warn!("Failed to parse emotion scores: {e}");
                Self::default()
            }
        }
    }

    fn clamped(self) -> Self {
        Self {
            sarcasm: self.sarcasm.clamp(0.0, 1.0),
            toxicity: self.toxicity.clamp(0.0, 1.0),
            manipulation: self.manipulation.clamp(0.0, 1.0),
        }
    }

    /// Human-readable levels; the medium band starts at 60% of the high
    /// threshold.
    pub fn levels(&self) -> [(&'static str, EmotionLevel); 3] {
        [
            ("sarcasm", level(self.sarcasm, SARCASM_HIGH)),
            ("toxicity", level(self.toxicity, TOXICITY_HIGH)),
            ("manipulation", level(self.manipulation, MANIPULATION_HIGH)),
        ]
    }

    /// Detail view shown when the user asks for the emotion breakdown.
    pub fn describe_ru(&self) -> String {
        let [(_, sarcasm), (_, toxicity), (_, manipulation)] = self.levels();
        format!(
            "😈 уровень сарказма: {}\n☠ уровень токсичности: {}\n🎣 уровень скрытой манипуляции: {}",
            sarcasm.as_ru(),
            toxicity.as_ru(),
            manipulation.as_ru()
        )
    }
}

fn level(score: f64, high: f64) -> EmotionLevel {
    if score >= high {
        EmotionLevel::High
    } else if score >= high * 0.6 {
        EmotionLevel::Medium
    } else {
        EmotionLevel::Low
    }
}

/// Pull the score object out of whatever decoration the model added.
fn extract_json(response: &str) -> Option<String> {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return None;
    }

    // Fenced block first: take everything between the fences.
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.rsplit_once("```"))
        .map(|(inner, _)| inner.trim())
        .unwrap_or(trimmed);

    if unfenced.starts_with('{') && unfenced.ends_with('}') {
        return Some(unfenced.to_string());
    }

    json_object_pattern().find(unfenced).map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let scores = EmotionScores::parse(r#"{"sarcasm": 0.8, "toxicity": 0.1, "manipulation": 0.1}"#);
        assert_eq!(scores, EmotionScores::new(0.8, 0.1, 0.1));
    }

    #[test]
    fn test_parse_fenced_json() {
        let scores = EmotionScores::parse(
            "```json\n{\"sarcasm\": 0.3, \"toxicity\": 0.6, \"manipulation\": 0.0}\n```",
        );
        assert_eq!(scores, EmotionScores::new(0.3, 0.6, 0.0));
    }

    #[test]
    fn test_parse_json_embedded_in_prose() {
        let scores = EmotionScores::parse(
            "Вот результат анализа:\n{\"sarcasm\": 0.5, \"toxicity\": 0.2, \"manipulation\": 0.9}\nГотово.",
        );
        assert_eq!(scores, EmotionScores::new(0.5, 0.2, 0.9));
    }

    #[test]
    fn test_garbage_degrades_to_neutral() {
        assert_eq!(EmotionScores::parse("no json here"), EmotionScores::default());
        assert_eq!(EmotionScores::parse(""), EmotionScores::default());
        assert_eq!(EmotionScores::parse("{\"sarcasm\": \"high\"}"), EmotionScores::default());
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let scores = EmotionScores::parse(r#"{"sarcasm": 3.0, "toxicity": -1.0, "manipulation": 0.5}"#);
        assert_eq!(scores, EmotionScores::new(1.0, 0.0, 0.5));
    }

    #[test]
    fn test_missing_fields_default_to_zero() {
        let scores = EmotionScores::parse(r#"{"sarcasm": 0.4}"#);
        assert_eq!(scores, EmotionScores::new(0.4, 0.0, 0.0));
    }

    #[test]
    fn test_levels_with_medium_band() {
        // Medium starts at 60% of the high threshold.
        let scores = EmotionScores::new(0.42, 0.36, 0.29);
        let [(_, sarcasm), (_, toxicity), (_, manipulation)] = scores.levels();
        assert_eq!(sarcasm, EmotionLevel::Medium); // 0.42 = 0.7 * 0.6
        assert_eq!(toxicity, EmotionLevel::Medium); // 0.36 = 0.6 * 0.6
        assert_eq!(manipulation, EmotionLevel::Low); // just under 0.5 * 0.6

        let high = EmotionScores::new(0.7, 0.6, 0.5);
        for (_, l) in high.levels() {
            assert_eq!(l, EmotionLevel::High);
        }
    }
}
