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
//! │     CALDERA_SYNC_MODE=manual                                           │
//! │     CALDERA_CONFLICT_STRATEGY=newest_wins                              │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/caldera/sync.toml (Linux)                                │
//! │     ~/Library/Application Support/com.caldera.caldera/sync.toml        │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     SyncMode::Auto, ServerWins, auto-generated device_id               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Laptop"
//!
//! [sync]
//! mode = "auto"             # auto | manual | offline
//! poll_interval_secs = 300
//! workers = 4
//! max_retries = 10
//! conflict_strategy = "server_wins"
//!
//! [[accounts]]
//! id = "work"
//! base_url = "https://dav.example.com/"
//! username = "alice"
//! password_env = "CALDERA_WORK_PASSWORD"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use caldera_core::{ConflictStrategy, DEFAULT_HORIZON_DAYS};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Sync Mode
// =============================================================================

/// When sync passes run.
///
/// ## Mode Selection
/// ```text
/// AUTO     periodic Normal pass every poll_interval_secs, plus requests
/// MANUAL   only explicit SyncRequest messages trigger a pass
/// OFFLINE  no network at all; edits keep queueing locally
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Auto,
    Manual,
    Offline,
}

impl SyncMode {
    /// Returns true if the agent schedules passes on its own.
    pub fn polls(&self) -> bool {
        matches!(self, SyncMode::Auto)
    }

    /// Returns true if sync is enabled at all.
    pub fn is_sync_enabled(&self) -> bool {
        !matches!(self, SyncMode::Offline)
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Auto => write!(f, "auto"),
            SyncMode::Manual => write!(f, "manual"),
            SyncMode::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "background" => Ok(SyncMode::Auto),
            "manual" | "on_demand" => Ok(SyncMode::Manual),
            "offline" | "disabled" => Ok(SyncMode::Offline),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown sync mode: '{}'. Valid options: auto, manual, offline",
                other
            ))),
        }
    }
}

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name, sent as part of the User-Agent.
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "Caldera".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Account Configuration
// =============================================================================

/// One CalDAV account.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Local account id; remote calendars reference it.
    pub id: String,

    /// Server root or principal URL.
    pub base_url: String,

    pub username: String,

    /// Inline password. Prefer `password_env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Name of the environment variable holding the password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
}

impl AccountConfig {
    /// Resolves the password: environment variable first, then inline.
    pub fn resolve_password(&self) -> SyncResult<String> {
        if let Some(ref var) = self.password_env {
            match std::env::var(var) {
                Ok(value) => return Ok(value),
                Err(_) => warn!(account = %self.id, var = %var, "Password variable not set"),
            }
        }
        self.password.clone().ok_or_else(|| {
            SyncError::InvalidConfig(format!("account '{}' has no password", self.id))
        })
    }
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("password_env", &self.password_env)
            .finish()
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// When passes run.
    #[serde(default)]
    pub mode: SyncMode,

    /// Interval between automatic Normal passes (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Queue operations executed concurrently (distinct events only).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Operations claimed per queue round.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Failed attempts before an operation is marked Failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,

    /// Per-request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Cap on buffered response bodies (bytes).
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,

    /// Inline retries of one call after 429/503 before giving up to the queue.
    #[serde(default = "default_rate_limit_retries")]
    pub rate_limit_retries: u32,

    /// Longest Retry-After honored inline (seconds); longer waits go to the queue.
    #[serde(default = "default_max_inline_wait")]
    pub max_inline_wait_secs: u64,

    /// How divergent copies are reconciled.
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,

    /// Days of occurrences materialized past `max(now, start)`.
    #[serde(default = "default_horizon_days")]
    pub horizon_days: i64,
}

fn default_poll_interval() -> u64 {
    300
}
fn default_workers() -> usize {
    4
}
fn default_batch_size() -> u32 {
    50
}
fn default_max_retries() -> i64 {
    10
}
fn default_request_timeout() -> u64 {
    30
}
fn default_max_response_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_rate_limit_retries() -> u32 {
    2
}
fn default_max_inline_wait() -> u64 {
    60
}
fn default_horizon_days() -> i64 {
    DEFAULT_HORIZON_DAYS
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            mode: SyncMode::default(),
            poll_interval_secs: default_poll_interval(),
            workers: default_workers(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            request_timeout_secs: default_request_timeout(),
            max_response_bytes: default_max_response_bytes(),
            rate_limit_retries: default_rate_limit_retries(),
            max_inline_wait_secs: default_max_inline_wait(),
            conflict_strategy: ConflictStrategy::default(),
            horizon_days: default_horizon_days(),
        }
    }
}

impl SyncSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn max_inline_wait(&self) -> Duration {
        Duration::from_secs(self.max_inline_wait_secs)
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Device-specific configuration.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Sync behavior settings.
    #[serde(default)]
    pub sync: SyncSettings,

    /// CalDAV accounts.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
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
        if self.device.id.is_empty() {
            return Err(SyncError::InvalidConfig("device.id must not be empty".into()));
        }

        if self.sync.poll_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "poll_interval_secs must be greater than 0".into(),
            ));
        }

        if self.sync.workers == 0 {
            return Err(SyncError::InvalidConfig("workers must be greater than 0".into()));
        }

        if self.sync.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }

        if self.sync.max_retries < 1 {
            return Err(SyncError::InvalidConfig(
                "max_retries must be at least 1".into(),
            ));
        }

        if self.sync.horizon_days < 1 {
            return Err(SyncError::InvalidConfig(
                "horizon_days must be at least 1".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if !seen.insert(account.id.as_str()) {
                return Err(SyncError::InvalidConfig(format!(
                    "duplicate account id '{}'",
                    account.id
                )));
            }
            let url = url::Url::parse(&account.base_url)?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(SyncError::InvalidUrl(format!(
                    "Account URL must start with http:// or https://, got: {}",
                    account.base_url
                )));
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("CALDERA_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Ok(name) = std::env::var("CALDERA_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Ok(mode) = std::env::var("CALDERA_SYNC_MODE") {
            if let Ok(parsed) = mode.parse() {
                debug!(mode = %mode, "Overriding sync mode from environment");
                self.sync.mode = parsed;
            }
        }

        if let Ok(secs) = std::env::var("CALDERA_POLL_INTERVAL_SECS") {
            if let Ok(s) = secs.parse::<u64>() {
                self.sync.poll_interval_secs = s;
            }
        }

        if let Ok(workers) = std::env::var("CALDERA_SYNC_WORKERS") {
            if let Ok(w) = workers.parse::<usize>() {
                self.sync.workers = w;
            }
        }

        if let Ok(strategy) = std::env::var("CALDERA_CONFLICT_STRATEGY") {
            match strategy.parse::<ConflictStrategy>() {
                Ok(parsed) => self.sync.conflict_strategy = parsed,
                Err(e) => warn!(strategy = %strategy, error = %e, "Unknown conflict strategy in environment"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "caldera", "caldera").map(|dirs| {
            let config_dir = dirs.config_dir();
            config_dir.join("sync.toml")
        })
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the device ID.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Returns the sync mode.
    pub fn mode(&self) -> SyncMode {
        self.sync.mode
    }

    /// Returns true if sync is enabled.
    pub fn is_sync_enabled(&self) -> bool {
        self.sync.mode.is_sync_enabled()
    }

    /// Looks up an account by id.
    pub fn account(&self, id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.id == id)
    }

    /// User-Agent sent with every request.
    pub fn user_agent(&self) -> String {
        format!("caldera/{} ({})", env!("CARGO_PKG_VERSION"), self.device.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: &str, url: &str) -> AccountConfig {
        AccountConfig {
            id: id.to_string(),
            base_url: url.to_string(),
            username: "alice".to_string(),
            password: Some("secret".to_string()),
            password_env: None,
        }
    }

    #[test]
    fn test_sync_mode_parsing() {
        assert_eq!("auto".parse::<SyncMode>().unwrap(), SyncMode::Auto);
        assert_eq!("manual".parse::<SyncMode>().unwrap(), SyncMode::Manual);
        assert_eq!("disabled".parse::<SyncMode>().unwrap(), SyncMode::Offline);
        assert!("primary".parse::<SyncMode>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(!config.device.id.is_empty());
        assert_eq!(config.sync.mode, SyncMode::Auto);
        assert_eq!(config.sync.max_retries, 10);
        assert_eq!(config.sync.conflict_strategy, ConflictStrategy::ServerWins);
        assert_eq!(config.sync.horizon_days, DEFAULT_HORIZON_DAYS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();
        config.accounts.push(account("work", "https://dav.example.com/"));
        assert!(config.validate().is_ok());

        config.accounts.push(account("work", "https://other.example.com/"));
        assert!(config.validate().is_err());

        config.accounts.pop();
        config.accounts.push(account("ftp", "ftp://dav.example.com/"));
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.accounts.pop();
        config.sync.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_with_accounts() {
        let text = r#"
            [device]
            id = "dev-1"

            [sync]
            mode = "manual"
            conflict_strategy = "newest_wins"

            [[accounts]]
            id = "work"
            base_url = "https://dav.example.com/"
            username = "alice"
            password_env = "CALDERA_TEST_UNSET_PASSWORD"
        "#;
        let config: SyncConfig = toml::from_str(text).unwrap();
        assert_eq!(config.mode(), SyncMode::Manual);
        assert_eq!(config.sync.conflict_strategy, ConflictStrategy::NewestWins);
        assert_eq!(config.sync.workers, 4);
        assert_eq!(config.account("work").unwrap().username, "alice");

        let out = toml::to_string_pretty(&config).unwrap();
        assert!(out.contains("[[accounts]]"));
        assert!(!out.contains("password ="));
    }

    #[test]
    fn test_password_resolution_falls_back_to_inline() {
        let mut acct = account("work", "https://dav.example.com/");
        acct.password_env = Some("CALDERA_TEST_SURELY_UNSET_VAR".to_string());
        assert_eq!(acct.resolve_password().unwrap(), "secret");

        acct.password = None;
        assert!(acct.resolve_password().is_err());
        assert!(!format!("{:?}", account("a", "https://x/")).contains("secret"));
    }
}
