//! Persisted config (Ollama endpoint, models, retrieval and storage settings) in the
//! app data directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::app_data;
use crate::kv;
use crate::model::RetryPolicy;
use crate::ollama::{DEFAULT_BASE_URL, DEFAULT_CHAT_MODEL, DEFAULT_EMBED_MODEL, DEFAULT_MAX_EMBED_CHARS};
use crate::persistence::DEFAULT_STORE_KEY;
use crate::record::WORD_COUNT;
use crate::similarity::DEFAULT_TOP_K;

const CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ollama_url: String,
    pub embed_model: String,
    pub chat_model: String,
    /// Results returned by `query` and `ask` unless overridden.
    pub top_k: usize,
    /// Maximum characters per chunk when ingesting documents.
    pub max_chunk_chars: usize,
    /// Text longer than this is truncated before it is sent for embedding.
    pub max_embed_chars: usize,
    /// Numeric metadata field summed by `stats`.
    pub stats_field: String,
    pub store_key: String,
    /// Total bytes the persisted store may occupy. Unlimited when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_quota_bytes: Option<u64>,
    /// Documents embedded in parallel during ingest.
    pub embed_concurrency: usize,
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ollama_url: DEFAULT_BASE_URL.to_string(),
            embed_model: DEFAULT_EMBED_MODEL.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            top_k: DEFAULT_TOP_K,
            max_chunk_chars: 1000,
            max_embed_chars: DEFAULT_MAX_EMBED_CHARS,
            stats_field: WORD_COUNT.to_string(),
            store_key: DEFAULT_STORE_KEY.to_string(),
            storage_quota_bytes: None,
            embed_concurrency: 4,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: u32,
    pub attempt_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            backoff_multiplier: 2,
            attempt_timeout_secs: 30,
        }
    }
}

impl RetryConfig {
    /// A zero timeout disables the per-attempt limit.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            backoff_multiplier: self.backoff_multiplier.max(1),
            attempt_timeout: (self.attempt_timeout_secs > 0)
                .then(|| Duration::from_secs(self.attempt_timeout_secs)),
        }
    }
}

impl Config {
    /// Sets a scalar setting by its TOML key (`retry.*` for the retry table).
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        let positive = |v: &str| v.parse::<usize>().ok().filter(|n| *n > 0).ok_or_else(invalid);
        match key {
            "ollama_url" => {
                url::Url::parse(value).map_err(|_| invalid())?;
                self.ollama_url = value.to_string();
            }
            "embed_model" => self.embed_model = value.to_string(),
            "chat_model" => self.chat_model = value.to_string(),
            "top_k" => self.top_k = positive(value)?,
            "max_chunk_chars" => self.max_chunk_chars = positive(value)?,
            "max_embed_chars" => self.max_embed_chars = positive(value)?,
            "stats_field" => self.stats_field = value.to_string(),
            "store_key" => {
                if !kv::is_valid_key(value) {
                    return Err(invalid());
                }
                self.store_key = value.to_string();
            }
            "storage_quota_bytes" => {
                self.storage_quota_bytes = match value {
                    "" | "none" => None,
                    v => Some(v.parse().map_err(|_| invalid())?),
                }
            }
            "embed_concurrency" => self.embed_concurrency = positive(value)?,
            "retry.max_attempts" => self.retry.max_attempts = value.parse().map_err(|_| invalid())?,
            "retry.initial_backoff_ms" => {
                self.retry.initial_backoff_ms = value.parse().map_err(|_| invalid())?
            }
            "retry.backoff_multiplier" => {
                self.retry.backoff_multiplier = value.parse().map_err(|_| invalid())?
            }
            "retry.attempt_timeout_secs" => {
                self.retry.attempt_timeout_secs = value.parse().map_err(|_| invalid())?
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }
}

/// Path of the config file in the app data directory.
pub fn config_path() -> Option<PathBuf> {
    Some(app_data::app_data_dir()?.join(CONFIG_FILENAME))
}

/// Load config from the app data directory. Returns default config if missing or invalid.
pub fn load_config() -> Config {
    match config_path() {
        Some(path) => load_config_from(&path),
        None => Config::default(),
    }
}

/// Load config from `path`. Returns default config if missing or invalid.
pub fn load_config_from(path: &Path) -> Config {
    let Ok(s) = std::fs::read_to_string(path) else {
        return Config::default();
    };
    toml::from_str(&s).unwrap_or_else(|e| {
        warn!("ignoring invalid config at {}: {}", path.display(), e);
        Config::default()
    })
}

/// Save config to the app data directory.
pub fn save_config(config: &Config) -> Result<(), ConfigError> {
    let path = config_path().ok_or(ConfigError::NoDataDir)?;
    save_config_to(&path, config)
}

pub fn save_config_to(path: &Path, config: &Config) -> Result<(), ConfigError> {
    let s = toml::to_string_pretty(config).map_err(ConfigError::Serialize)?;
    std::fs::write(path, s).map_err(ConfigError::Write)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine app data directory")]
    NoDataDir,
    #[error("failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("failed to write config: {0}")]
    Write(std::io::Error),
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}
