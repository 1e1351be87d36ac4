//! Init system configuration.
//!
//! Runtime settings live in an optional TOML file; everything has a default
//! so a bare system boots without one. Service directives are not part of
//! this file, they come from the line-oriented `conf_file` (see
//! [`crate::conf`]).

use crate::error::{Error, Result};
use crate::runlevel::{is_terminal, MAX_RUNLEVEL};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the TOML configuration.
pub const DEFAULT_CONFIG: &str = "/etc/buckos/init.toml";

/// Default location of the directive file.
pub const DEFAULT_CONF_FILE: &str = "/etc/finit.conf";

/// Default control-channel FIFO.
pub const DEFAULT_FIFO: &str = "/dev/initctl";

/// Restart back-off policy for crash-looping services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartLimits {
    /// Consecutive unexpected exits before a service is marked crashed
    pub limit: u32,
    /// A service that ran at least this long has its counter reset
    #[serde(with = "secs")]
    pub window: Duration,
}

impl Default for RestartLimits {
    fn default() -> Self {
        Self {
            limit: 5,
            window: Duration::from_secs(60),
        }
    }
}

/// Init system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InitConfig {
    /// Directive file holding `service` lines
    pub conf_file: PathBuf,
    /// Control-channel FIFO path
    pub fifo: PathBuf,
    /// Directories created once the base filesystem is up
    pub runtime_dirs: Vec<PathBuf>,
    /// Plugins enabled by name
    pub plugins: Vec<String>,
    /// Boot runlevel
    pub runlevel: u8,
    /// Service table capacity
    pub max_services: usize,
    pub restart: RestartLimits,
    /// Grace period between SIGTERM and SIGKILL
    #[serde(with = "secs")]
    pub stop_timeout: Duration,
    /// Upper bound on a single event loop pass
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Whether to enforce PID 1 requirement
    pub require_pid1: bool,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            conf_file: PathBuf::from(DEFAULT_CONF_FILE),
            fifo: PathBuf::from(DEFAULT_FIFO),
            runtime_dirs: vec![PathBuf::from("/run"), PathBuf::from("/var/lock")],
            plugins: vec!["initctl".to_string()],
            runlevel: 2,
            max_services: 64,
            restart: RestartLimits::default(),
            stop_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            require_pid1: true,
        }
    }
}

impl InitConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: InitConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject settings the supervisor cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.runlevel > MAX_RUNLEVEL || is_terminal(self.runlevel) {
            return Err(Error::Config(format!(
                "boot runlevel must be 1-9 and not 6, got {}",
                self.runlevel
            )));
        }
        if self.max_services == 0 {
            return Err(Error::Config("max_services must be at least 1".to_string()));
        }
        if self.restart.limit == 0 {
            return Err(Error::Config("restart.limit must be at least 1".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll_interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Default log directive derived from the kernel command line.
///
/// `finit_debug` or `--debug` enables debug output, `quiet` limits output to
/// warnings unless debugging was requested.
pub fn kernel_log_level(cmdline: &str) -> &'static str {
    let debug = cmdline
        .split_whitespace()
        .any(|arg| arg == "finit_debug" || arg == "--debug");
    if debug {
        "debug"
    } else if cmdline.split_whitespace().any(|arg| arg == "quiet") {
        "warn"
    } else {
        "info"
    }
}

/// Whole-second durations.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Millisecond durations.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = InitConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fifo, PathBuf::from("/dev/initctl"));
        assert_eq!(config.restart.limit, 5);
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("init.toml");
        std::fs::write(
            &path,
            r#"
runlevel = 3
stop_timeout = 2
poll_interval = 100

[restart]
limit = 3
"#,
        )
        .unwrap();

        let config = InitConfig::from_file(&path).unwrap();
        assert_eq!(config.runlevel, 3);
        assert_eq!(config.stop_timeout, Duration::from_secs(2));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.restart.limit, 3);
        assert_eq!(config.restart.window, Duration::from_secs(60));
        assert_eq!(config.conf_file, PathBuf::from(DEFAULT_CONF_FILE));
    }

    #[test]
    fn test_reject_terminal_boot_runlevel() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("init.toml");
        std::fs::write(&path, "runlevel = 6\n").unwrap();
        assert!(matches!(InitConfig::from_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = InitConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.runlevel, 2);
    }

    #[test]
    fn test_kernel_log_level() {
        assert_eq!(kernel_log_level("root=/dev/sda1 quiet"), "warn");
        assert_eq!(kernel_log_level("root=/dev/sda1 quiet finit_debug"), "debug");
        assert_eq!(kernel_log_level("console=ttyS0 --debug"), "debug");
        assert_eq!(kernel_log_level("console=ttyS0"), "info");
    }
}
