//! Error types for cyclone-core

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for cyclone-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by explicit operations.
///
/// Discovery, protocol and relay faults are not reported through this type:
/// they degrade to "no engine", a dropped line, or a dropped datagram.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No engine is reachable
    #[error("Engine is not running")]
    NotRunning,

    /// The link was disposed while the operation was pending
    #[error("Engine link disposed")]
    Disposed,

    /// The supervisor already owns a live engine process
    #[error("Engine process already running (pid {0})")]
    AlreadyRunning(u32),

    /// The engine process could not be launched
    #[error("Failed to start engine at '{}': {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A TCP connect did not finish in time
    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Filesystem watcher error
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// OSC encoding error
    #[error("OSC error: {0}")]
    Osc(#[from] rosc::OscError),
}
