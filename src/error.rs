//! Error types for the buckos init system.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for init system operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the init system.
#[derive(Error, Debug)]
pub enum Error {
    /// Process creation failed for a service
    #[error("Failed to fork service {name}: {source}")]
    Fork {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// Plugin dependency missing or cyclic
    #[error("Plugin dependency error: {plugin} depends on {dependency}: {reason}")]
    Dependency {
        plugin: String,
        dependency: String,
        reason: String,
    },

    /// Plugin registered twice
    #[error("Plugin already registered: {0}")]
    Duplicate(String),

    /// Plugin not registered
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// Service table is full
    #[error("Service table full ({capacity} entries), ignoring: {directive}")]
    Capacity { capacity: usize, directive: String },

    /// Malformed control-channel request
    #[error("Invalid initctl request: {0}")]
    Protocol(String),

    /// Service crash-looped past the restart threshold
    #[error("Service {name} exceeded restart limit ({count} consecutive exits)")]
    RestartLimitExceeded { name: String, count: u32 },

    /// Service not found
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Runlevel outside 0-9
    #[error("Invalid runlevel: {0}")]
    InvalidRunlevel(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be read
    #[error("Failed to read {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Not running as PID 1
    #[error("Not running as PID 1 (current PID: {0})")]
    NotPid1(u32),

    /// Signal error
    #[error("Signal error: {0}")]
    Signal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Nix error
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
}
