//! Declarative processing modes.
//!
//! A mode is a named {model, prompt} unit loaded from one JSON file in the
//! modes directory. Reload is all-or-nothing: a single malformed file rejects
//! the whole batch and the previously valid set stays active.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Placeholder in prompt templates replaced with the transcript.
pub const PROMPT_PLACEHOLDER: &str = "{text}";

/// Mode that produces the structured summary (summary/bullets/actions).
pub const MODE_DEFAULT: &str = "DEFAULT";
/// Mode that produces the tone annotation.
pub const MODE_TONE: &str = "TONE";
/// Mode that produces the JSON emotion scores feeding archetype selection.
pub const MODE_EMOTION: &str = "EMOTION";

/// Name of the advice mode for an archetype, e.g. `ADVICE_CAREGIVER`.
pub fn advice_mode_name(archetype: &str) -> String {
    format!("ADVICE_{}", archetype.to_uppercase())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mode {
    pub name: String,
    pub model: String,
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    pub enabled: bool,
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_temperature() -> f32 {
    0.5
}

impl Mode {
    pub fn render_prompt(&self, text: &str) -> String {
        self.prompt.replace(PROMPT_PLACEHOLDER, text)
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".into());
        }
        if self.model.trim().is_empty() {
            return Err("model must not be empty".into());
        }
        if !self.prompt.contains(PROMPT_PLACEHOLDER) {
            return Err(format!("prompt must contain the {PROMPT_PLACEHOLDER} placeholder"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(format!("temperature {} out of range [0, 2]", self.temperature));
        }
        Ok(())
    }
}

/// Errors rejecting a mode directory load. Operator-facing only; these never
/// reach chat users.
#[derive(Debug)]
pub enum ModeLoadError {
    ReadDir { path: PathBuf, source: std::io::Error },
    ReadFile { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: serde_json::Error },
    Invalid { path: PathBuf, reason: String },
    Duplicate { name: String, path: PathBuf },
}

impl fmt::Display for ModeLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadDir { path, source } => {
                write!(f, "failed to read modes directory '{}': {source}", path.display())
            }
            Self::ReadFile { path, source } => {
                write!(f, "failed to read mode file '{}': {source}", path.display())
            }
            Self::Parse { path, source } => {
                write!(f, "failed to parse mode file '{}': {source}", path.display())
            }
            Self::Invalid { path, reason } => {
                write!(f, "invalid mode file '{}': {reason}", path.display())
            }
            Self::Duplicate { name, path } => {
                write!(f, "duplicate mode name '{name}' in '{}'", path.display())
            }
        }
    }
}

impl std::error::Error for ModeLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadDir { source, .. } | Self::ReadFile { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// The active mode set, hot-reloadable.
pub struct ModeStore {
    dir: PathBuf,
    modes: RwLock<HashMap<String, Mode>>,
}

impl ModeStore {
    /// Empty store pointing at a directory (nothing loaded yet).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), modes: RwLock::new(HashMap::new()) }
    }

    /// Load the directory, failing on the first malformed file.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, ModeLoadError> {
        let store = Self::new(dir);
        store.reload()?;
        Ok(store)
    }

    /// Re-read the directory and swap the active set atomically.
    ///
    /// On any error the previous set stays active and the error is returned
    /// as an operator diagnostic. Returns the number of modes loaded.
    pub fn reload(&self) -> Result<usize, ModeLoadError> {
        let fresh = load_dir(&self.dir)?;
        let count = fresh.len();
        let names: Vec<&String> = {
            let mut names: Vec<&String> = fresh.keys().collect();
            names.sort();
            names
        };
        info!("Loaded {count} mode(s): {names:?}");
        *self.modes.write().unwrap() = fresh;
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<Mode> {
        self.modes.read().unwrap().get(name).cloned()
    }

    /// Enabled modes, sorted by name for deterministic execution reporting.
    pub fn enabled(&self) -> Vec<Mode> {
        let mut modes: Vec<Mode> =
            self.modes.read().unwrap().values().filter(|m| m.enabled).cloned().collect();
        modes.sort_by(|a, b| a.name.cmp(&b.name));
        modes
    }

    pub fn len(&self) -> usize {
        self.modes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.read().unwrap().is_empty()
    }
}

fn load_dir(dir: &Path) -> Result<HashMap<String, Mode>, ModeLoadError> {
    let mut modes = HashMap::new();

    if !dir.exists() {
        warn!("Modes directory {} does not exist", dir.display());
        return Ok(modes);
    }

    let entries = std::fs::read_dir(dir)
        .map_err(|source| ModeLoadError::ReadDir { path: dir.to_path_buf(), source })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    for path in paths {
        let content = std::fs::read_to_string(&path)
            .map_err(|source| ModeLoadError::ReadFile { path: path.clone(), source })?;
        let mode: Mode = serde_json::from_str(&content)
            .map_err(|source| ModeLoadError::Parse { path: path.clone(), source })?;
        mode.validate().map_err(|reason| ModeLoadError::Invalid { path: path.clone(), reason })?;
        if modes.contains_key(&mode.name) {
            return Err(ModeLoadError::Duplicate { name: mode.name, path });
        }
        modes.insert(mode.name.clone(), mode);
    }

    Ok(modes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_mode(dir: &Path, file: &str, json: &str) {
        std::fs::write(dir.join(file), json).unwrap();
    }

    fn valid_mode_json(name: &str) -> String {
        format!(
            r#"{{
                "name": "{name}",
                "model": "gpt-4o",
                "prompt": "Проанализируй: {{text}}",
                "max_tokens": 500,
                "temperature": 0.3,
                "enabled": true
            }}"#
        )
    }

    #[test]
    fn test_load_and_reload_are_idempotent() {
        let dir = TempDir::new().unwrap();
        write_mode(dir.path(), "default.json", &valid_mode_json("DEFAULT"));
        write_mode(dir.path(), "tone.json", &valid_mode_json("TONE"));

        let store = ModeStore::load(dir.path()).unwrap();
        let first = store.enabled();

        store.reload().unwrap();
        let second = store.enabled();

        assert_eq!(first, second, "reloading unchanged files must give an identical set");
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_missing_required_field_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_mode(dir.path(), "broken.json", r#"{"name": "X", "prompt": "{text}"}"#);

        let result = ModeStore::load(dir.path());
        assert!(matches!(result, Err(ModeLoadError::Parse { .. })));
    }

    #[test]
    fn test_prompt_without_placeholder_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_mode(
            dir.path(),
            "bad.json",
            r#"{"name": "X", "model": "gpt-4o", "prompt": "no placeholder", "enabled": true}"#,
        );

        let result = ModeStore::load(dir.path());
        assert!(matches!(result, Err(ModeLoadError::Invalid { .. })));
    }

    #[test]
    fn test_bad_reload_keeps_previous_set() {
        let dir = TempDir::new().unwrap();
        write_mode(dir.path(), "default.json", &valid_mode_json("DEFAULT"));

        let store = ModeStore::load(dir.path()).unwrap();
        assert!(store.get("DEFAULT").is_some());

        write_mode(dir.path(), "default.json", "{ not json");
        assert!(store.reload().is_err());

        // Previous valid set survives the failed reload untouched.
        let kept = store.get("DEFAULT").unwrap();
        assert_eq!(kept.model, "gpt-4o");
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        write_mode(dir.path(), "a.json", &valid_mode_json("SAME"));
        write_mode(dir.path(), "b.json", &valid_mode_json("SAME"));

        let result = ModeStore::load(dir.path());
        assert!(matches!(result, Err(ModeLoadError::Duplicate { .. })));
    }

    #[test]
    fn test_disabled_modes_are_loaded_but_not_enabled() {
        let dir = TempDir::new().unwrap();
        write_mode(
            dir.path(),
            "off.json",
            r#"{"name": "OFF", "model": "gpt-4o", "prompt": "{text}", "enabled": false}"#,
        );

        let store = ModeStore::load(dir.path()).unwrap();
        assert!(store.get("OFF").is_some());
        assert!(store.enabled().is_empty());
    }

    #[test]
    fn test_missing_directory_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = ModeStore::load(dir.path().join("nope")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_render_prompt_substitutes_text() {
        let mode = Mode {
            name: "DEFAULT".into(),
            model: "gpt-4o".into(),
            prompt: "Кратко: {text}".into(),
            max_tokens: 100,
            temperature: 0.2,
            enabled: true,
        };
        assert_eq!(mode.render_prompt("привет"), "Кратко: привет");
    }

    #[test]
    fn test_advice_mode_name() {
        assert_eq!(advice_mode_name("Caregiver"), "ADVICE_CAREGIVER");
    }
}
