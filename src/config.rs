use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use teloxide::types::UserId;

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    telegram_bot_token: String,
    openai_api_key: String,
    /// Base URL of the OpenAI-compatible API.
    api_base_url: Option<String>,
    /// Model for the transcription endpoint.
    transcription_model: Option<String>,
    /// Directory of per-mode JSON files.
    modes_dir: Option<String>,
    /// Directory for state files (logs, language cache, lock).
    data_dir: Option<String>,
    /// Lock file path override.
    lock_file: Option<String>,
    /// Shared deadline for one analysis pass, in seconds.
    #[serde(default = "default_analysis_deadline_secs")]
    analysis_deadline_secs: u64,
    /// Languages worth hinting to the transcription provider.
    #[serde(default = "default_priority_languages")]
    priority_languages: Vec<String>,
    /// Cached-language confidence needed before hinting.
    #[serde(default = "default_language_confidence_threshold")]
    language_confidence_threshold: f64,
    /// Language preference expiry after inactivity.
    #[serde(default = "default_language_cache_ttl_days")]
    language_cache_ttl_days: i64,
    /// Users allowed to run operator commands like /reload_modes.
    #[serde(default)]
    owner_ids: Vec<u64>,
    /// Longest voice message accepted, in seconds.
    #[serde(default = "default_max_voice_duration_secs")]
    max_voice_duration_secs: u32,
}

fn default_analysis_deadline_secs() -> u64 {
    30
}

fn default_priority_languages() -> Vec<String> {
    vec!["ru".to_string(), "en".to_string()]
}

fn default_language_confidence_threshold() -> f64 {
    0.7
}

fn default_language_cache_ttl_days() -> i64 {
    30
}

fn default_max_voice_duration_secs() -> u32 {
    600
}

pub struct Config {
    pub telegram_bot_token: String,
    pub openai_api_key: String,
    pub api_base_url: String,
    pub transcription_model: String,
    pub modes_dir: PathBuf,
    pub data_dir: PathBuf,
    pub lock_file: PathBuf,
    pub analysis_deadline_secs: u64,
    pub priority_languages: Vec<String>,
    pub language_confidence_threshold: f64,
    pub language_cache_ttl_days: i64,
    pub owner_ids: Vec<UserId>,
    pub max_voice_duration_secs: u32,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2
            || token_parts[0].parse::<u64>().is_err()
            || token_parts[1].is_empty()
        {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)"
                    .into(),
            ));
        }
        if file.openai_api_key.is_empty() {
            return Err(ConfigError::Validation("openai_api_key is required".into()));
        }
        if file.analysis_deadline_secs == 0 {
            return Err(ConfigError::Validation("analysis_deadline_secs must be positive".into()));
        }
        if !(0.0..=1.0).contains(&file.language_confidence_threshold) {
            return Err(ConfigError::Validation(
                "language_confidence_threshold must be within [0, 1]".into(),
            ));
        }

        let data_dir = file.data_dir.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        let lock_file = file
            .lock_file
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join(".voxsight.lock"));

        Ok(Self {
            telegram_bot_token: file.telegram_bot_token,
            openai_api_key: file.openai_api_key,
            api_base_url: file
                .api_base_url
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            transcription_model: file
                .transcription_model
                .unwrap_or_else(|| "whisper-1".to_string()),
            modes_dir: file.modes_dir.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("modes")),
            data_dir,
            lock_file,
            analysis_deadline_secs: file.analysis_deadline_secs,
            priority_languages: file.priority_languages,
            language_confidence_threshold: file.language_confidence_threshold,
            language_cache_ttl_days: file.language_cache_ttl_days,
            owner_ids: file.owner_ids.into_iter().map(UserId).collect(),
            max_voice_duration_secs: file.max_voice_duration_secs,
        })
    }

    pub fn is_owner(&self, user_id: UserId) -> bool {
        self.owner_ids.contains(&user_id)
    }
}
