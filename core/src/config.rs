use crate::errors::{IpcError, IpcResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory name used under the per-user config and runtime directories.
pub const APP_DIR_NAME: &str = "peerlink";

/// Overrides the directory holding `config.toml` and the default registry.
pub const CONFIG_DIR_ENV: &str = "PEERLINK_CONFIG_DIR";
/// Overrides `socket_dir` regardless of the config file.
pub const SOCKET_DIR_ENV: &str = "PEERLINK_SOCKET_DIR";
/// Overrides `registry_path` regardless of the config file.
pub const REGISTRY_ENV: &str = "PEERLINK_REGISTRY";

/// Runtime configuration shared by servers, clients and the registry.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct IpcConfig {
    /// Directory holding one socket per live endpoint.
    pub socket_dir: PathBuf,
    /// JSON file mapping endpoint names to launch recipes.
    pub registry_path: PathBuf,
    /// Reply window for `call` when the caller does not pass one.
    pub call_timeout_ms: u64,
    /// Read-modify-write attempts for `register_self` before giving up.
    pub registry_write_attempts: u32,
    /// Pause between registry write attempts.
    pub registry_retry_backoff_ms: u64,
    /// Pause before re-trying a failed listener bind.
    pub bind_retry_delay_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
            registry_path: default_config_dir().join("registry.json"),
            call_timeout_ms: 5_000,
            registry_write_attempts: 5,
            registry_retry_backoff_ms: 50,
            bind_retry_delay_ms: 1_000,
        }
    }
}

impl IpcConfig {
    /// Builds a config rooted at explicit locations, leaving the timings at
    /// their defaults.
    pub fn for_dirs(socket_dir: impl Into<PathBuf>, registry_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            registry_path: registry_path.into(),
            ..Self::default()
        }
    }

    /// Loads `config.toml` from the default config directory, then applies
    /// environment overrides.
    pub fn load() -> IpcResult<Self> {
        let path = default_config_dir().join("config.toml");
        let mut config = Self::load_from_file(&path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a file if it exists, otherwise returns the default config
    pub fn load_from_file(path: &Path) -> IpcResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            IpcError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        toml::from_str(&content).map_err(|e| {
            IpcError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Saves configuration to a file
    pub fn save_to_file(&self, path: &Path) -> IpcResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| IpcError::Config(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                IpcError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        fs::write(path, content)
            .map_err(|e| IpcError::Config(format!("Failed to write config file: {}", e)))
    }

    fn apply_env_overrides(&mut self) {
        if let Some(dir) = env::var_os(SOCKET_DIR_ENV) {
            self.socket_dir = PathBuf::from(dir);
        }
        if let Some(path) = env::var_os(REGISTRY_ENV) {
            self.registry_path = PathBuf::from(path);
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn registry_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.registry_retry_backoff_ms)
    }

    pub fn bind_retry_delay(&self) -> Duration {
        Duration::from_millis(self.bind_retry_delay_ms)
    }
}

/// Directory holding `config.toml` and, by default, the registry file.
pub fn default_config_dir() -> PathBuf {
    if let Some(dir) = env::var_os(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(env::temp_dir)
        .join(APP_DIR_NAME)
}

/// Directory holding endpoint sockets: the per-user runtime dir when the
/// platform has one, the local data dir otherwise.
pub fn default_socket_dir() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(env::temp_dir)
        .join(APP_DIR_NAME)
}
