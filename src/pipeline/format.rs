//! Deterministic rendering of analysis results into one Telegram reply.
//!
//! Sections appear in a fixed order: summary, bullets, action items, extra
//! mode sections, tone annotation. A mode that came back unavailable renders
//! an explicit short note, never a silent gap. The reply respects Telegram's
//! hard message-size limit; when over budget, sections are shed in a fixed
//! priority order with bullets retained longest.

use crate::pipeline::analyze::{AnalysisResult, ModeOutcome};
use crate::pipeline::modes::{MODE_DEFAULT, MODE_EMOTION, MODE_TONE};

/// Telegram's hard ceiling for one message.
pub const MAX_REPLY_CHARS: usize = 4096;

const EMPTY_REPLY: &str = "❌ Нет результатов обработки";

/// Escape model-produced text for HTML parse mode.
pub fn html_escape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '&' => result.push_str("&amp;"),
            _ => result.push(c),
        }
    }
    result
}

/// Shed priority: lower rank is dropped first when over the size limit.
/// Rank 4 sections (bullets, unavailable markers) are never dropped, only
/// truncated as the last resort.
const RANK_TONE: u8 = 0;
const RANK_EXTRA: u8 = 1;
const RANK_ACTIONS: u8 = 2;
const RANK_SUMMARY: u8 = 3;
const RANK_KEEP: u8 = 4;

struct Section {
    text: String,
    rank: u8,
}

/// Parsed structure of the DEFAULT mode output.
#[derive(Debug, Default, PartialEq)]
struct DefaultSections {
    summary: Option<String>,
    bullets: Vec<String>,
    actions: Vec<String>,
    no_actions: bool,
}

enum Block {
    None,
    Bullets,
    Actions,
}

/// Parse the section markers the DEFAULT prompt asks the model to emit.
/// Output without any markers is treated as one summary blob.
fn parse_default(text: &str) -> DefaultSections {
    let mut parsed = DefaultSections::default();
    let mut block = Block::None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let bare = line.trim_start_matches("📝 ").trim_start_matches("📍 ").trim_start_matches("⚡ ");

        if let Some(rest) = bare.strip_prefix("РЕЗЮМЕ:") {
            parsed.summary = Some(rest.trim().to_string());
            block = Block::None;
        } else if bare.starts_with("ОСНОВНЫЕ ПУНКТЫ") {
            block = Block::Bullets;
        } else if bare.starts_with("ДЕЙСТВИЯ") {
            block = Block::Actions;
        } else if bare.starts_with("нет явных действий") {
            parsed.no_actions = true;
            block = Block::Actions;
        } else if let Some(item) = line.strip_prefix('•') {
            let item = item.trim().to_string();
            match block {
                Block::Bullets => parsed.bullets.push(item),
                Block::Actions => parsed.actions.push(item),
                Block::None => {}
            }
        }
    }

    if parsed.summary.is_none()
        && parsed.bullets.is_empty()
        && parsed.actions.is_empty()
        && !parsed.no_actions
    {
        let blob = text.trim();
        if !blob.is_empty() {
            parsed.summary = Some(blob.to_string());
        }
    }
    parsed
}

fn unavailable_note(label: &str) -> String {
    format!("⚠️ {label}: анализ недоступен")
}

fn section_label(mode_name: &str) -> String {
    match mode_name {
        MODE_DEFAULT => "Резюме".to_string(),
        MODE_TONE => "Тон".to_string(),
        _ => {
            let lower = mode_name.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => lower,
            }
        }
    }
}

/// Render the full reply. Deterministic for a given analysis result.
pub fn format_reply(analysis: &AnalysisResult) -> String {
    let mut sections: Vec<Section> = Vec::new();

    match analysis.outcomes.get(MODE_DEFAULT).map(|r| &r.outcome) {
        Some(ModeOutcome::Completed(text)) => {
            let parsed = parse_default(text);
            if let Some(summary) = parsed.summary {
                sections.push(Section {
                    text: format!("📝 <b>Резюме</b>: {}", html_escape(&summary)),
                    rank: RANK_SUMMARY,
                });
            }
            if !parsed.bullets.is_empty() {
                let items: Vec<String> =
                    parsed.bullets.iter().map(|b| format!("• {}", html_escape(b))).collect();
                sections.push(Section {
                    text: format!("<b>Основные пункты</b>:\n{}", items.join("\n")),
                    rank: RANK_KEEP,
                });
            }
            if parsed.no_actions {
                sections.push(Section {
                    text: "⚡ <b>Действия</b>: нет явных действий".to_string(),
                    rank: RANK_ACTIONS,
                });
            } else if !parsed.actions.is_empty() {
                let items: Vec<String> =
                    parsed.actions.iter().map(|a| format!("• {}", html_escape(a))).collect();
                sections.push(Section {
                    text: format!("⚡ <b>Действия</b>:\n{}", items.join("\n")),
                    rank: RANK_ACTIONS,
                });
            }
        }
        Some(ModeOutcome::Unavailable) => {
            sections.push(Section { text: unavailable_note("Резюме"), rank: RANK_KEEP });
        }
        None => {}
    }

    // Extra configured modes render as their own labeled sections, in name
    // order. EMOTION feeds the advice flow instead of the reply; ADVICE_*
    // modes are on-demand prompts, not per-message analyses.
    let mut extra_names: Vec<&String> = analysis
        .outcomes
        .keys()
        .filter(|name| {
            name.as_str() != MODE_DEFAULT
                && name.as_str() != MODE_TONE
                && name.as_str() != MODE_EMOTION
                && !name.starts_with("ADVICE_")
        })
        .collect();
    extra_names.sort();

    for name in extra_names {
        let label = section_label(name);
        match &analysis.outcomes[name].outcome {
            ModeOutcome::Completed(text) => sections.push(Section {
                text: format!("🔎 <b>{label}</b>:\n{}", html_escape(text.trim())),
                rank: RANK_EXTRA,
            }),
            ModeOutcome::Unavailable => {
                sections.push(Section { text: unavailable_note(&label), rank: RANK_KEEP })
            }
        }
    }

    match analysis.outcomes.get(MODE_TONE).map(|r| &r.outcome) {
        Some(ModeOutcome::Completed(text)) => sections.push(Section {
            text: format!("🎭 <b>Тон</b>: {}", html_escape(text.trim())),
            rank: RANK_TONE,
        }),
        Some(ModeOutcome::Unavailable) => {
            sections.push(Section { text: unavailable_note("Тон"), rank: RANK_KEEP })
        }
        None => {}
    }

    if sections.is_empty() {
        return EMPTY_REPLY.to_string();
    }

    let render = |sections: &[Section]| {
        sections.iter().map(|s| s.text.as_str()).collect::<Vec<_>>().join("\n\n")
    };

    let mut out = render(&sections);
    while out.chars().count() > MAX_REPLY_CHARS {
        // Drop the most expendable section; among equals the later one goes.
        let dropped = sections
            .iter()
            .enumerate()
            .filter(|(_, s)| s.rank < RANK_KEEP)
            .min_by_key(|(idx, s)| (s.rank, usize::MAX - idx))
            .map(|(idx, _)| idx);
        match dropped {
            Some(idx) => {
                sections.remove(idx);
                out = render(&sections);
            }
            None => {
                let truncated: String = out.chars().take(MAX_REPLY_CHARS - 1).collect();
                out = format!("{truncated}…");
                break;
            }
        }
    }
    out
}
