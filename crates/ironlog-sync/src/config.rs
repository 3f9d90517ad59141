//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                            │
//! │     IRONLOG_SYNC_MODE=manual                                            │
//! │     IRONLOG_REMOTE_URL=https://api.ironlog.app                          │
//! │                                                                         │
//! │  2. TOML Config File                                                    │
//! │     ~/.config/ironlog/sync.toml (Linux)                                 │
//! │     ~/Library/Application Support/app.ironlog.IronLog/sync.toml (macOS) │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                    │
//! │     SyncMode::Auto, auto-generated device id                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Pixel 8"
//!
//! [remote]
//! endpoint = "https://api.ironlog.app"
//! request_timeout_ms = 10000
//!
//! [sync]
//! mode = "auto"   # auto | manual | offline
//! batch_size = 100
//! max_push_passes = 5
//! max_deferrals = 3
//!
//! [database]
//! path = "/data/ironlog.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Sync Mode
// =============================================================================

/// Which triggers may start a sync run.
///
/// ```text
/// AUTO     every trigger: sign-in, foreground, connectivity, manual, retry
/// MANUAL   sign-in and manual triggers only; no automatic retry
/// OFFLINE  nothing; local writes keep queueing
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
    /// Returns true if sync is enabled at all.
    pub fn is_sync_enabled(&self) -> bool {
        !matches!(self, SyncMode::Offline)
    }

    /// Returns true if background triggers (foreground, connectivity,
    /// retry) may start runs.
    pub fn allows_background(&self) -> bool {
        matches!(self, SyncMode::Auto)
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
            "auto" => Ok(SyncMode::Auto),
            "manual" => Ok(SyncMode::Manual),
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
    /// Unique device identifier (UUID v4), generated on first run.
    pub id: String,

    /// Human-readable device name, shown in logs.
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "IronLog Device".to_string()
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
// Remote Configuration
// =============================================================================

/// Where the remote authority lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Base URL of the remote (http or https). Used for the reachability
    /// probe; `None` disables probing.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Upper bound for a single remote call (milliseconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout() -> u64 {
    10_000
}

impl Default for RemoteSettings {
    fn default() -> Self {
        RemoteSettings {
            endpoint: None,
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl RemoteSettings {
    /// Parses the endpoint, if configured.
    pub fn endpoint_url(&self) -> SyncResult<Option<Url>> {
        self.endpoint
            .as_deref()
            .map(|raw| Url::parse(raw).map_err(SyncError::from))
            .transpose()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default)]
    pub mode: SyncMode,

    /// Queue entries taken per push pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Push passes per run before moving on to pull.
    #[serde(default = "default_max_push_passes")]
    pub max_push_passes: u32,

    /// Passes a child may wait for an unresolved parent before it is
    /// dropped as an orphan.
    #[serde(default = "default_max_deferrals")]
    pub max_deferrals: i64,

    /// First retry delay after a transient failure (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Retry delay ceiling (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Interval between reachability probes (seconds).
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
}

fn default_batch_size() -> u32 {
    100
}
fn default_max_push_passes() -> u32 {
    5
}
fn default_max_deferrals() -> i64 {
    3
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}
fn default_probe_interval() -> u64 {
    15
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            mode: SyncMode::default(),
            batch_size: default_batch_size(),
            max_push_passes: default_max_push_passes(),
            max_deferrals: default_max_deferrals(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            probe_interval_secs: default_probe_interval(),
        }
    }
}

// =============================================================================
// Database Settings
// =============================================================================

/// Local store location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file; defaults to `ironlog.db` in the platform data dir.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub remote: RemoteSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub database: DatabaseSettings,
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
            return Err(SyncError::MissingDeviceId);
        }

        if let Some(url) = self.remote.endpoint_url()? {
            if !matches!(url.scheme(), "http" | "https") {
                return Err(SyncError::InvalidUrl(format!(
                    "Remote endpoint must be http:// or https://, got: {}",
                    url
                )));
            }
            if url.host_str().is_none() {
                return Err(SyncError::InvalidUrl(format!("Remote endpoint has no host: {}", url)));
            }
        }

        if self.remote.request_timeout_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "request_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.sync.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }
        if self.sync.max_push_passes == 0 {
            return Err(SyncError::InvalidConfig(
                "max_push_passes must be greater than 0".into(),
            ));
        }
        if self.sync.probe_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "probe_interval_secs must be greater than 0".into(),
            ));
        }
        if self.sync.max_deferrals < 1 {
            return Err(SyncError::InvalidConfig(
                "max_deferrals must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Applies `IRONLOG_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary variable source.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(id) = var("IRONLOG_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Some(name) = var("IRONLOG_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Some(mode) = var("IRONLOG_SYNC_MODE") {
            match mode.parse() {
                Ok(parsed) => {
                    debug!(mode = %mode, "Overriding sync mode from environment");
                    self.sync.mode = parsed;
                }
                Err(_) => warn!(mode = %mode, "Unknown sync mode in environment"),
            }
        }

        if let Some(url) = var("IRONLOG_REMOTE_URL") {
            debug!(url = %url, "Overriding remote endpoint from environment");
            self.remote.endpoint = Some(url);
        }

        if let Some(timeout) = var("IRONLOG_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse::<u64>() {
                self.remote.request_timeout_ms = ms;
            }
        }

        if let Some(size) = var("IRONLOG_BATCH_SIZE") {
            if let Ok(n) = size.parse::<u32>() {
                self.sync.batch_size = n;
            }
        }

        if let Some(path) = var("IRONLOG_DB_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("app", "ironlog", "IronLog")
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("sync.toml"))
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_sync_mode_parsing() {
        assert_eq!("auto".parse::<SyncMode>().unwrap(), SyncMode::Auto);
        assert_eq!("Manual".parse::<SyncMode>().unwrap(), SyncMode::Manual);
        assert_eq!("disabled".parse::<SyncMode>().unwrap(), SyncMode::Offline);
        assert!("primary".parse::<SyncMode>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(!config.device.id.is_empty());
        assert_eq!(config.mode(), SyncMode::Auto);
        assert_eq!(config.sync.batch_size, 100);
        assert_eq!(config.sync.max_deferrals, 3);
        assert_eq!(config.remote.request_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.device.id = String::new();
        assert!(matches!(config.validate(), Err(SyncError::MissingDeviceId)));
        config.device.id = "device-1".into();

        config.remote.endpoint = Some("ws://localhost:8080".into());
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.remote.endpoint = Some("not a url".into());
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.remote.endpoint = Some("https://api.ironlog.app".into());
        assert!(config.validate().is_ok());

        config.sync.probe_interval_secs = 0;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));
        config.sync.probe_interval_secs = 30;

        config.sync.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("IRONLOG_DEVICE_ID", "device-9"),
            ("IRONLOG_SYNC_MODE", "manual"),
            ("IRONLOG_REMOTE_URL", "http://127.0.0.1:8080"),
            ("IRONLOG_BATCH_SIZE", "not-a-number"),
            ("IRONLOG_DB_PATH", "/tmp/ironlog-test.db"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.device_id(), "device-9");
        assert_eq!(config.mode(), SyncMode::Manual);
        assert_eq!(config.remote.endpoint.as_deref(), Some("http://127.0.0.1:8080"));
        assert_eq!(config.sync.batch_size, 100);
        assert_eq!(config.database.path, Some(PathBuf::from("/tmp/ironlog-test.db")));
    }

    #[test]
    fn test_save_then_load() {
        let dir = std::env::temp_dir().join(format!("ironlog-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("sync.toml");

        let mut config = SyncConfig::default();
        config.device.id = "device-saved".into();
        config.sync.mode = SyncMode::Manual;
        config.sync.max_deferrals = 7;
        config.save(Some(path.clone())).unwrap();

        let loaded = SyncConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.device_id(), "device-saved");
        assert_eq!(loaded.mode(), SyncMode::Manual);
        assert_eq!(loaded.sync.max_deferrals, 7);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_toml_round_trip() {
        let parsed: SyncConfig = toml::from_str(
            r#"
            [device]
            id = "abc"

            [sync]
            mode = "offline"
            max_push_passes = 2
            "#,
        )
        .unwrap();

        assert_eq!(parsed.device_id(), "abc");
        assert_eq!(parsed.device.name, "IronLog Device");
        assert_eq!(parsed.mode(), SyncMode::Offline);
        assert_eq!(parsed.sync.max_push_passes, 2);
        assert_eq!(parsed.sync.batch_size, 100);

        let toml_str = toml::to_string_pretty(&parsed).unwrap();
        assert!(toml_str.contains("[device]"));
        assert!(toml_str.contains("[sync]"));
    }
}
