//! Configuration resolution for `SecureChat`.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/securechat/settings.json)
//! 3. Explicit config file supplied by the caller
//! 4. Environment variables (highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete `SecureChat` configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub cards: CardConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sessions: SessionConfig::default(),
            cards: CardConfig::default(),
            storage: StorageConfig::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Session lifetime and ratchet limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a session stays usable after creation (seconds). Default: 7 days.
    pub session_ttl_secs: u64,
    /// Maximum number of message keys the receiving chain may skip in one step.
    pub max_skip: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 7 * 24 * 60 * 60,
            max_skip: 1000,
        }
    }
}

/// Card publishing and pre-key pool management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardConfig {
    /// Identity type recorded in every published card snapshot.
    pub identity_type: String,
    /// Age after which the long-term card is replaced (seconds). Default: 30 days.
    pub long_term_card_ttl_secs: u64,
    /// Number of one-time cards the directory should hold after a rotation.
    pub desired_one_time_cards: usize,
    /// Directory pool size at or below which a rotation is considered due.
    pub one_time_low_watermark: usize,
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            identity_type: "username".to_string(),
            long_term_card_ttl_secs: 30 * 24 * 60 * 60,
            desired_one_time_cards: 100,
            one_time_low_watermark: 10,
        }
    }
}

/// User data store persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON file the store is flushed to. In-memory only when unset.
    pub path: Option<PathBuf>,
    /// Flush after every successful session mutation.
    pub sync_on_write: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            sync_on_write: true,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit_file: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        config = load_config_file(&global_path)?;
    }

    if let Some(path) = explicit_file {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }
        config = load_config_file(path)?;
    }

    apply_env_overrides(&mut config);
    validate(&config)?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".securechat").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME").ok().map(|h| {
            PathBuf::from(h).join("Library/Application Support/securechat/settings.json")
        })
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
            .map(|p| p.join("securechat").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("SECURECHAT_SESSION_TTL_SECS")
        && let Ok(n) = val.parse()
    {
        config.sessions.session_ttl_secs = n;
    }
    if let Ok(val) = std::env::var("SECURECHAT_LONG_TERM_CARD_TTL_SECS")
        && let Ok(n) = val.parse()
    {
        config.cards.long_term_card_ttl_secs = n;
    }
    if let Ok(val) = std::env::var("SECURECHAT_DESIRED_ONE_TIME_CARDS")
        && let Ok(n) = val.parse()
    {
        config.cards.desired_one_time_cards = n;
    }
    if let Ok(val) = std::env::var("SECURECHAT_STORAGE_PATH") {
        config.storage.path = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("SECURECHAT_LOG_LEVEL") {
        config.log_level = val;
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.sessions.session_ttl_secs == 0 {
        return Err(Error::Config("session_ttl_secs must be positive".into()));
    }
    if config.cards.identity_type.is_empty() {
        return Err(Error::Config("identity_type must not be empty".into()));
    }
    if config.cards.one_time_low_watermark > config.cards.desired_one_time_cards {
        return Err(Error::Config(format!(
            "one_time_low_watermark ({}) exceeds desired_one_time_cards ({})",
            config.cards.one_time_low_watermark, config.cards.desired_one_time_cards
        )));
    }
    Ok(())
}
