//! Sync engine configuration.
//!
//! Defaults, then an optional JSON file, then `FUEL_SYNC_*` environment
//! overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::normalize_base_url;
use crate::error::ConfigError;
use crate::model::UserId;

const DEFAULT_API_URL: &str = "http://localhost:3000";
const DEFAULT_PUSH_ADDR: &str = "127.0.0.1:3001";
const DEFAULT_DRAIN_INTERVAL_SECS: u64 = 5;
const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 300_000;
const DEFAULT_MAX_TRANSIENT_RETRIES: u32 = 100;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

pub const ENV_API_URL: &str = "FUEL_SYNC_API_URL";
pub const ENV_PUSH_ADDR: &str = "FUEL_SYNC_PUSH_ADDR";
pub const ENV_OPERATOR_ID: &str = "FUEL_SYNC_OPERATOR_ID";
pub const ENV_DRAIN_INTERVAL_SECS: &str = "FUEL_SYNC_DRAIN_INTERVAL_SECS";
pub const ENV_MAX_RETRIES: &str = "FUEL_SYNC_MAX_RETRIES";
pub const ENV_MAX_RECONNECT_ATTEMPTS: &str = "FUEL_SYNC_MAX_RECONNECT_ATTEMPTS";
pub const ENV_REPLAY_DB: &str = "FUEL_SYNC_REPLAY_DB";
pub const ENV_LOG_DIR: &str = "FUEL_SYNC_LOG_DIR";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub push_addr: String,
    pub operator_id: Option<UserId>,
    pub drain_interval_secs: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Consecutive failed reconnects before giving up; 0 keeps trying.
    pub max_reconnect_attempts: u32,
    /// 0 disables the limit.
    pub max_transient_retries: u32,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub replay_buffer_path: Option<PathBuf>,
    pub log_dir: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            push_addr: DEFAULT_PUSH_ADDR.to_string(),
            operator_id: None,
            drain_interval_secs: DEFAULT_DRAIN_INTERVAL_SECS,
            reconnect_base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
            reconnect_max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
            max_reconnect_attempts: 0,
            max_transient_retries: DEFAULT_MAX_TRANSIENT_RETRIES,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            replay_buffer_path: None,
            log_dir: default_log_dir(),
        }
    }
}

impl SyncConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: SyncConfig = serde_json::from_str(&raw)?;
        config.api_base_url = normalize_base_url(&config.api_base_url);
        Ok(config)
    }

    /// Defaults (or `file` when given) with environment overrides applied.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match file {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(url) = env_string(ENV_API_URL) {
            self.api_base_url = normalize_base_url(&url);
        }
        if let Some(addr) = env_string(ENV_PUSH_ADDR) {
            self.push_addr = addr;
        }
        if let Some(id) = env_parse::<UserId>(ENV_OPERATOR_ID)? {
            self.operator_id = Some(id);
        }
        if let Some(secs) = env_parse::<u64>(ENV_DRAIN_INTERVAL_SECS)? {
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    key: ENV_DRAIN_INTERVAL_SECS,
                    value: secs.to_string(),
                });
            }
            self.drain_interval_secs = secs;
        }
        if let Some(limit) = env_parse::<u32>(ENV_MAX_RETRIES)? {
            self.max_transient_retries = limit;
        }
        if let Some(limit) = env_parse::<u32>(ENV_MAX_RECONNECT_ATTEMPTS)? {
            self.max_reconnect_attempts = limit;
        }
        if let Some(path) = env_string(ENV_REPLAY_DB) {
            self.replay_buffer_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = env_string(ENV_LOG_DIR) {
            self.log_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn require_operator_id(&self) -> Result<UserId, ConfigError> {
        self.operator_id.ok_or(ConfigError::Missing(ENV_OPERATOR_ID))
    }

    pub fn retry_limit(&self) -> Option<u32> {
        (self.max_transient_retries > 0).then_some(self.max_transient_retries)
    }

    pub fn reconnect_limit(&self) -> Option<u32> {
        (self.max_reconnect_attempts > 0).then_some(self.max_reconnect_attempts)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs.max(1))
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms.max(self.reconnect_base_delay_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env_string(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(None),
    }
}

/// `$XDG_DATA_HOME/fuel-order-sync/logs`, falling back to the platform's
/// local data directory.
pub fn default_log_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("fuel-order-sync").join("logs")
}
