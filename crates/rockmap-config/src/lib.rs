//! # rockmap-config
//!
//! Configuration management for rockmap.
//!
//! Loads configuration from:
//! 1. `~/.rockmap/config.toml` (global)
//! 2. `.rockmap/config.toml` (working directory, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(|e| e.into_inner())
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(|e| e.into_inner()) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub region: RegionConfig,
    pub map: MapConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Global config (~/.rockmap/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::from_file(&global_path)?;
            }
        }

        // 2. Local config (.rockmap/config.toml) - overrides global
        let local_path = Path::new(".rockmap/config.toml");
        if local_path.exists() {
            debug!("Loading local config from {:?}", local_path);
            let local = Self::from_file(local_path)?;
            config.merge(local);
        }

        // 3. Environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse a single TOML file (no layering, no env overrides)
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.rockmap/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".rockmap/config.toml"))
    }

    /// Merge another config; fields left at their defaults in `other` are kept
    fn merge(&mut self, other: Config) {
        let defaults = Config::default();
        if other.region.shm_dir != defaults.region.shm_dir {
            self.region.shm_dir = other.region.shm_dir;
        }
        if other.map.default_limit != defaults.map.default_limit {
            self.map.default_limit = other.map.default_limit;
        }
        if other.log.level != defaults.log.level {
            self.log.level = other.log.level;
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("ROCKMAP_SHM_DIR") {
            self.region.shm_dir = PathBuf::from(dir);
        }
        if let Ok(limit) = std::env::var("ROCKMAP_ENTRY_LIMIT") {
            if let Ok(n) = limit.parse() {
                self.map.default_limit = n;
            }
        }
        if let Ok(level) = std::env::var("ROCKMAP_LOG") {
            if let Ok(level) = level.parse() {
                self.log.level = level;
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Where shared segments are created
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    pub shm_dir: PathBuf,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            shm_dir: default_shm_dir(),
        }
    }
}

/// Default segment directory: /dev/shm on Linux (RAM-backed), tmpdir elsewhere
pub fn default_shm_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/dev/shm")
    }
    #[cfg(not(target_os = "linux"))]
    {
        std::env::temp_dir().join("rockmap")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Slot capacity used when a map is created without an explicit limit
    pub default_limit: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            default_limit: 65536,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: logging::LogLevel,
}
