//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     HARMONY_AUTHOR=Riley                                               │
//! │     HARMONY_DATABASE_PATH=/tmp/harmony.db                              │
//! │     HARMONY_MAX_CONCURRENT_OPERATIONS=3                                │
//! │     HARMONY_MAX_RETRY_ELAPSED_SECS=120                                 │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/sync/sync.toml (Linux)                                   │
//! │     ~/Library/Application Support/com.harmony.sync/sync.toml (macOS)   │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     5 concurrent operations, 1 s initial retry, 60 s retry budget      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [author]
//! name = "Riley's Laptop"
//!
//! [database]
//! path = "/home/riley/.local/share/harmony/harmony.db"
//!
//! [sync]
//! max_concurrent_operations = 5
//! initial_retry_delay_ms = 1000
//! max_retry_elapsed_secs = 60
//! reauthenticate_on_token_expiry = true
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use harmony_core::MAX_CONCURRENT_OPERATIONS;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Author Configuration
// =============================================================================

/// Who this device reports as the author of uploaded records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorConfig {
    /// Name stored in the remote record's author metadata.
    #[serde(default = "default_author_name")]
    pub name: String,
}

fn default_author_name() -> String {
    "Harmony".to_string()
}

impl Default for AuthorConfig {
    fn default() -> Self {
        AuthorConfig {
            name: default_author_name(),
        }
    }
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Where the bookkeeping database lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file. Defaults to the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    /// The configured path, or `harmony.db` in the platform data directory.
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path.clone().or_else(|| {
            directories::ProjectDirs::from("com", "harmony", "sync")
                .map(|dirs| dirs.data_dir().join("harmony.db"))
        })
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Per-record operations a batch runs at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_operations: usize,

    /// First wait after the backend reports a rate limit (milliseconds).
    /// Doubles on every further rate limit.
    #[serde(default = "default_initial_retry_delay")]
    pub initial_retry_delay_ms: u64,

    /// Give up retrying a rate-limited call after this long (seconds).
    #[serde(default = "default_max_retry_elapsed")]
    pub max_retry_elapsed_secs: u64,

    /// Silently sign in again and retry once when a token expires.
    #[serde(default = "default_reauthenticate")]
    pub reauthenticate_on_token_expiry: bool,
}

fn default_max_concurrent() -> usize {
    MAX_CONCURRENT_OPERATIONS
}
fn default_initial_retry_delay() -> u64 {
    1000
}
fn default_max_retry_elapsed() -> u64 {
    60
}
fn default_reauthenticate() -> bool {
    true
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            max_concurrent_operations: default_max_concurrent(),
            initial_retry_delay_ms: default_initial_retry_delay(),
            max_retry_elapsed_secs: default_max_retry_elapsed(),
            reauthenticate_on_token_expiry: default_reauthenticate(),
        }
    }
}

impl SyncSettings {
    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub fn max_retry_elapsed(&self) -> Duration {
        Duration::from_secs(self.max_retry_elapsed_secs)
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub author: AuthorConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub sync: SyncSettings,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.sync.max_concurrent_operations == 0 {
            return Err(SyncError::InvalidConfig(
                "max_concurrent_operations must be greater than 0".into(),
            ));
        }

        if self.sync.initial_retry_delay_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "initial_retry_delay_ms must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("HARMONY_AUTHOR") {
            debug!(author = %name, "Overriding author from environment");
            self.author.name = name;
        }

        if let Ok(path) = std::env::var("HARMONY_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = Some(PathBuf::from(path));
        }

        if let Ok(value) = std::env::var("HARMONY_MAX_CONCURRENT_OPERATIONS") {
            match value.parse::<usize>() {
                Ok(n) => self.sync.max_concurrent_operations = n,
                Err(_) => warn!(value = %value, "Ignoring invalid HARMONY_MAX_CONCURRENT_OPERATIONS"),
            }
        }

        if let Ok(value) = std::env::var("HARMONY_MAX_RETRY_ELAPSED_SECS") {
            match value.parse::<u64>() {
                Ok(secs) => self.sync.max_retry_elapsed_secs = secs,
                Err(_) => warn!(value = %value, "Ignoring invalid HARMONY_MAX_RETRY_ELAPSED_SECS"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "harmony", "sync")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    /// Name written as the author of uploaded records.
    pub fn author_name(&self) -> &str {
        &self.author.name
    }
}
