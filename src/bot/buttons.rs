//! Inline keyboard layouts and callback data.
//!
//! Callback identifiers are underscore-joined and self-contained: the action
//! and, for advice flows, the archetype name ride in the data itself, so
//! parsing never depends on stored state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use crate::pipeline::archetype::Archetype;
use crate::pipeline::emotion::EmotionScores;

/// One decoded button press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackData {
    /// "🤖 совет" on the initial reply: show the suggested archetype.
    AdviceSuggest,
    /// Accept the auto-suggested archetype.
    AdviceAuto(Archetype),
    /// A manually picked archetype.
    AdviceManual(Archetype),
    /// Open the manual 2×2 selection grid.
    ManualMenu,
    /// Back from the grid to the suggestion.
    BackToSuggestion,
    /// "📄 транскрипт": send the transcript as a file.
    TranscriptDownload,
}

impl CallbackData {
    pub fn encode(&self) -> String {
        match self {
            CallbackData::AdviceSuggest => "advice_suggest".to_string(),
            CallbackData::AdviceAuto(a) => format!("advice_auto_{}", a.as_str()),
            CallbackData::AdviceManual(a) => format!("advice_manual_{}", a.as_str()),
            CallbackData::ManualMenu => "advice_manual_select".to_string(),
            CallbackData::BackToSuggestion => "advice_back_suggest".to_string(),
            CallbackData::TranscriptDownload => "transcript_download".to_string(),
        }
    }

    /// Deterministic inverse of [`encode`]. Unknown data yields `None`.
    pub fn parse(data: &str) -> Option<CallbackData> {
        let parts: Vec<&str> = data.split('_').collect();
        match parts.as_slice() {
            ["advice", "suggest"] => Some(CallbackData::AdviceSuggest),
            ["advice", "auto", name] => name.parse().ok().map(CallbackData::AdviceAuto),
            ["advice", "manual", "select"] => Some(CallbackData::ManualMenu),
            ["advice", "manual", name] => name.parse().ok().map(CallbackData::AdviceManual),
            ["advice", "back", "suggest"] => Some(CallbackData::BackToSuggestion),
            ["transcript", "download"] => Some(CallbackData::TranscriptDownload),
            _ => None,
        }
    }
}

fn button(text: &str, data: CallbackData) -> InlineKeyboardButton {
    InlineKeyboardButton::callback(text.to_string(), data.encode())
}

/// Initial reply buttons.
pub fn initial_keyboard(transcript_available: bool) -> InlineKeyboardMarkup {
    let mut row = vec![button("🤖 совет", CallbackData::AdviceSuggest)];
    if transcript_available {
        row.push(button("📄 транскрипт", CallbackData::TranscriptDownload));
    }
    InlineKeyboardMarkup::new(vec![row])
}

/// Buttons offering the auto-suggested archetype.
pub fn suggestion_keyboard(suggested: Archetype) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![button(
            &format!("✨ Получить совет {}", suggested.emoji()),
            CallbackData::AdviceAuto(suggested),
        )],
        vec![button("🔄 Выбрать другой стиль", CallbackData::ManualMenu)],
    ])
}

/// 2×2 grid for picking an archetype manually.
pub fn manual_keyboard() -> InlineKeyboardMarkup {
    let buttons: Vec<InlineKeyboardButton> = Archetype::ALL
        .iter()
        .map(|a| button(&format!("{} {}", a.emoji(), a.as_str()), CallbackData::AdviceManual(*a)))
        .collect();
    let mut rows: Vec<Vec<InlineKeyboardButton>> =
        buttons.chunks(2).map(|chunk| chunk.to_vec()).collect();
    rows.push(vec![button("← К рекомендации", CallbackData::BackToSuggestion)]);
    InlineKeyboardMarkup::new(rows)
}

/// Buttons under a delivered advice reply.
pub fn response_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![button("🔄 Другой стиль", CallbackData::ManualMenu)]])
}

/// Context an advice callback needs: the transcript being advised on and its
/// emotion scores. Keyed by the reply message the buttons hang off of.
#[derive(Debug, Clone)]
pub struct AdviceContext {
    pub transcript: String,
    pub scores: EmotionScores,
}

struct Entry {
    context: AdviceContext,
    stored_at: Instant,
}

/// In-memory, TTL-bounded store of advice contexts.
pub struct ContextStore {
    entries: Mutex<HashMap<(i64, i64), Entry>>,
    ttl: Duration,
}

impl ContextStore {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: Mutex::new(HashMap::new()), ttl }
    }

    pub fn insert(&self, chat_id: i64, message_id: i64, context: AdviceContext) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, e| e.stored_at.elapsed() <= self.ttl);
        entries.insert((chat_id, message_id), Entry { context, stored_at: Instant::now() });
    }

    pub fn get(&self, chat_id: i64, message_id: i64) -> Option<AdviceContext> {
        let mut entries = self.entries.lock().unwrap();
        let key = (chat_id, message_id);
        match entries.get(&key) {
            Some(entry) if entry.stored_at.elapsed() <= self.ttl => Some(entry.context.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_round_trip() {
        let all = [
            CallbackData::AdviceSuggest,
            CallbackData::AdviceAuto(Archetype::Caregiver),
            CallbackData::AdviceAuto(Archetype::Paradox),
            CallbackData::AdviceManual(Archetype::Challenger),
            CallbackData::AdviceManual(Archetype::Oracle),
            CallbackData::ManualMenu,
            CallbackData::BackToSuggestion,
            CallbackData::TranscriptDownload,
        ];
        for data in all {
            assert_eq!(CallbackData::parse(&data.encode()), Some(data), "{data:?}");
        }
    }

    #[test]
    fn test_unknown_callback_data_is_rejected() {
        assert_eq!(CallbackData::parse(""), None);
        assert_eq!(CallbackData::parse("advice"), None);
        assert_eq!(CallbackData::parse("advice_auto_Empath"), None);
        assert_eq!(CallbackData::parse("something_else"), None);
    }

    #[test]
    fn test_manual_select_is_not_an_archetype() {
        // "advice_manual_select" opens the menu, it never parses as a persona.
        assert_eq!(CallbackData::parse("advice_manual_select"), Some(CallbackData::ManualMenu));
    }

    #[test]
    fn test_context_store_round_trip() {
        let store = ContextStore::new(Duration::from_secs(3600));
        let context = AdviceContext {
            transcript: "привет".to_string(),
            scores: EmotionScores::new(0.1, 0.2, 0.3),
        };
        store.insert(5, 10, context.clone());

        let loaded = store.get(5, 10).unwrap();
        assert_eq!(loaded.transcript, "привет");
        assert_eq!(loaded.scores, context.scores);
        assert!(store.get(5, 11).is_none());
    }

    #[test]
    fn test_context_store_expires_entries() {
        let store = ContextStore::new(Duration::ZERO);
        store.insert(1, 1, AdviceContext { transcript: "x".into(), scores: EmotionScores::default() });
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get(1, 1).is_none());
    }

    #[test]
    fn test_manual_keyboard_has_all_archetypes() {
        let kb = manual_keyboard();
        // 2×2 grid plus the back row.
        assert_eq!(kb.inline_keyboard.len(), 3);
        assert_eq!(kb.inline_keyboard[0].len(), 2);
        assert_eq!(kb.inline_keyboard[1].len(), 2);
    }
}
