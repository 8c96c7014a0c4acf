//! Configuration file support for cyclone
//!
//! Configuration is stored in TOML format at:
//! - Linux: `~/.config/cyclone/config.toml`
//! - macOS: `~/Library/Application Support/cyclone/config.toml`
//! - Windows: `%APPDATA%\cyclone\config.toml`
//!
//! Components never read this file themselves. The bootstrap loads a
//! [`Config`] and hands each component its own settings struct.

use crate::error::{Error, Result};
use crate::link::LinkConfig;
use crate::relay::RelayConfig;
use crate::supervisor::SupervisorConfig;
use crate::watcher::WatcherConfig;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Engine endpoint and launch settings
    pub engine: EngineSettings,
    /// Client link settings
    pub link: LinkSettings,
    /// State file watcher settings
    pub watcher: WatcherSettings,
    /// External synth target
    pub osc: OscSettings,
}

impl Config {
    /// Load configuration from the default config file location
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Err(Error::Config(format!("Config file not found at {:?}", path)))
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration or return default if not found
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => config,
            Err(Error::Config(_)) => Self::default(),
            Err(e) => {
                log::warn!("[CONFIG] Ignoring unreadable config file: {}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the default config file location
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    /// Save configuration to an explicit path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "cyclone") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Err(Error::Config("Could not determine config directory".to_string()))
        }
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            host: self.engine.host.clone(),
            reconnect_grace: Duration::from_millis(self.link.reconnect_grace_ms),
            connect_timeout: Duration::from_millis(self.link.connect_timeout_ms),
            max_reconnect_attempts: self.link.max_reconnect_attempts,
        }
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            debounce: Duration::from_millis(self.watcher.debounce_ms),
            poll_interval: Duration::from_millis(self.watcher.poll_interval_ms),
            force_poll: self.watcher.force_poll,
        }
    }

    /// Supervisor settings. Fails when no engine command is configured.
    pub fn supervisor_config(&self) -> Result<SupervisorConfig> {
        let (program, args) = self
            .engine
            .command
            .split_first()
            .ok_or_else(|| Error::Config("engine.command is empty".to_string()))?;
        Ok(SupervisorConfig {
            program: PathBuf::from(program),
            args: args.to_vec(),
            host: self.engine.host.clone(),
            port: self.engine.port,
            version: env!("CARGO_PKG_VERSION").to_string(),
            ready_marker: self.engine.ready_marker.clone(),
            probe_timeout: Duration::from_millis(self.engine.probe_timeout_ms),
        })
    }

    /// Relay settings, or `None` when no external target is enabled.
    pub fn relay_config(&self) -> Option<RelayConfig> {
        if !self.osc.enabled {
            return None;
        }
        Some(RelayConfig {
            target: format!("{}:{}", self.osc.host, self.osc.port),
            latency: Duration::from_millis(self.osc.latency_ms),
            debug: self.osc.debug,
        })
    }
}

/// Engine endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    pub host: String,
    pub port: u16,
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Substring of the engine's stdout line announcing readiness
    pub ready_marker: String,
    pub probe_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            command: vec!["cyclone-engine".to_string()],
            ready_marker: "listening on".to_string(),
            probe_timeout_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinkSettings {
    pub reconnect_grace_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            reconnect_grace_ms: 500,
            connect_timeout_ms: 1000,
            max_reconnect_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatcherSettings {
    pub debounce_ms: u64,
    pub poll_interval_ms: u64,
    /// Skip the filesystem watcher and always poll
    pub force_poll: bool,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            poll_interval_ms: 1000,
            force_poll: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OscSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Added to every bundle time tag
    pub latency_ms: u64,
    /// Log dropped datagrams
    pub debug: bool,
}

impl Default for OscSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 57120,
            latency_ms: 0,
            debug: false,
        }
    }
}
