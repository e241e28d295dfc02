//! Response archetypes.
//!
//! Four fixed personas for advice replies. Auto-selection is a pure function
//! of the emotion scores; the result is only ever a suggestion and any
//! archetype can be requested directly.

use std::fmt;
use std::str::FromStr;

use crate::pipeline::emotion::EmotionScores;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Archetype {
    Caregiver,
    Challenger,
    Oracle,
    Paradox,
}

impl Archetype {
    pub const ALL: [Archetype; 4] =
        [Archetype::Caregiver, Archetype::Challenger, Archetype::Oracle, Archetype::Paradox];

    /// Pick a persona from emotion scores. Priority order, first match wins:
    /// heavy toxicity or manipulation calls for care, strong sarcasm gets a
    /// challenge, anything moderately charged gets the oracle, and a calm
    /// message falls through to paradox.
    pub fn select(scores: &EmotionScores) -> Archetype {
        if scores.toxicity >= 0.6 || scores.manipulation >= 0.5 {
            Archetype::Caregiver
        } else if scores.sarcasm >= 0.7 {
            Archetype::Challenger
        } else if scores.sarcasm >= 0.4 || scores.toxicity >= 0.4 || scores.manipulation >= 0.4 {
            Archetype::Oracle
        } else {
            Archetype::Paradox
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Archetype::Caregiver => "Caregiver",
            Archetype::Challenger => "Challenger",
            Archetype::Oracle => "Oracle",
            Archetype::Paradox => "Paradox",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Archetype::Caregiver => "🤗",
            Archetype::Challenger => "🃏",
            Archetype::Oracle => "🧙",
            Archetype::Paradox => "☯️",
        }
    }

    pub fn description_ru(&self) -> &'static str {
        match self {
            Archetype::Caregiver => "Заботливая поддержка",
            Archetype::Challenger => "Игривый вызов",
            Archetype::Oracle => "Мудрые инсайты",
            Archetype::Paradox => "Дзен-парадоксы",
        }
    }
}

impl fmt::Display for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Archetype {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "caregiver" => Ok(Archetype::Caregiver),
            "challenger" => Ok(Archetype::Challenger),
            "oracle" => Ok(Archetype::Oracle),
            "paradox" => Ok(Archetype::Paradox),
            _ => Err(()),
        }
    }
}
