//! Line-oriented directive file (`/etc/finit.conf`).
//!
//! One directive per line, leading whitespace ignored, `#` starts a comment.
//! Only `service` lines feed the supervisor; the remaining directives are
//! collected for boot glue.
//!
//! ```text
//! host    buckos
//! service [2345] /sbin/syslogd -n
//! service /sbin/getty 115200 ttyS0   # every runlevel
//! ```

use crate::error::{Error, Result};
use crate::runlevel::Runlevels;
use crate::service::{ServiceCommand, ServiceDirective};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Source of service directives, re-read on every reload.
pub trait ServiceSource {
    /// Current list of service directives, in declaration order.
    fn load(&self) -> Result<Vec<ServiceDirective>>;

    /// Description for logging purposes.
    fn describe(&self) -> String;
}

/// Directives consumed by boot glue rather than the supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootDirectives {
    pub user: Option<String>,
    pub host: Option<String>,
    pub network: Option<String>,
    pub startx: Option<String>,
    pub shutdown: Option<String>,
    pub check: Vec<String>,
    pub module: Vec<String>,
    pub mknod: Vec<String>,
}

/// Parsed directive file.
#[derive(Debug, Clone, Default)]
pub struct Conf {
    pub services: Vec<ServiceDirective>,
    pub boot: BootDirectives,
}

impl Conf {
    /// Parse directive file contents. Malformed lines are logged and skipped.
    pub fn parse(content: &str) -> Self {
        let mut conf = Conf::default();

        for (lineno, raw) in content.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }

            let (keyword, rest) = match line.split_once(char::is_whitespace) {
                Some((keyword, rest)) => (keyword, rest.trim()),
                None => (line, ""),
            };

            let value = || (!rest.is_empty()).then(|| rest.to_string());
            match keyword {
                "service" => match parse_service(rest) {
                    Ok(directive) => {
                        debug!(line = lineno + 1, %directive, "Parsed service directive");
                        conf.services.push(directive);
                    }
                    Err(e) => warn!(line = lineno + 1, error = %e, "Skipping service directive"),
                },
                "user" => conf.boot.user = value(),
                "host" => conf.boot.host = value(),
                "network" => conf.boot.network = value(),
                "startx" => conf.boot.startx = value(),
                "shutdown" => conf.boot.shutdown = value(),
                "check" => conf.boot.check.extend(value()),
                "module" => conf.boot.module.extend(value()),
                "mknod" => conf.boot.mknod.extend(value()),
                other => debug!(line = lineno + 1, keyword = other, "Ignoring unknown directive"),
            }
        }

        conf
    }

    /// Read and parse a directive file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&content))
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Parse the arguments of a `service` line: `[LEVELS] command args...`.
pub fn parse_service(rest: &str) -> Result<ServiceDirective> {
    let rest = rest.trim_start();
    let (runlevels, command) = match rest.strip_prefix('[') {
        Some(tail) => {
            let (levels, command) = tail
                .split_once(']')
                .ok_or_else(|| Error::Config(format!("unterminated runlevel list: {}", rest)))?;
            (Runlevels::parse(levels.trim())?, command)
        }
        None => (Runlevels::ALL, rest),
    };

    let command = ServiceCommand::parse(command)
        .ok_or_else(|| Error::Config("service directive without a command".to_string()))?;

    Ok(ServiceDirective::new(runlevels, command))
}

/// Directive file on disk.
#[derive(Debug, Clone)]
pub struct ConfFile {
    path: PathBuf,
}

impl ConfFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ServiceSource for ConfFile {
    fn load(&self) -> Result<Vec<ServiceDirective>> {
        Ok(Conf::from_file(&self.path)?.services)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Sample configuration
    host buckos
user admin
check /dev/sda1
module  e1000
module loop
network /sbin/udhcpc -i eth0
shutdown /sbin/mdadm --wait-clean --scan

service [2345] /sbin/syslogd -n   # system log
\tservice /sbin/getty 115200 ttyS0
service [S] /bin/sh
service [2x] /sbin/broken
service
";

    #[test]
    fn test_parse_services() {
        let conf = Conf::parse(SAMPLE);
        assert_eq!(conf.services.len(), 3);

        let syslogd = &conf.services[0];
        assert_eq!(syslogd.runlevels, Runlevels::from_levels(&[2, 3, 4, 5]));
        assert_eq!(syslogd.command.program, "/sbin/syslogd");
        assert_eq!(syslogd.command.args, vec!["-n"]);

        let getty = &conf.services[1];
        assert_eq!(getty.runlevels, Runlevels::ALL);
        assert_eq!(getty.command.args, vec!["115200", "ttyS0"]);

        assert_eq!(conf.services[2].runlevels, Runlevels::from_levels(&[1]));
    }

    #[test]
    fn test_parse_boot_directives() {
        let conf = Conf::parse(SAMPLE);
        assert_eq!(conf.boot.host.as_deref(), Some("buckos"));
        assert_eq!(conf.boot.user.as_deref(), Some("admin"));
        assert_eq!(conf.boot.module, vec!["e1000", "loop"]);
        assert_eq!(conf.boot.check, vec!["/dev/sda1"]);
        assert_eq!(conf.boot.network.as_deref(), Some("/sbin/udhcpc -i eth0"));
        assert!(conf.boot.startx.is_none());
    }

    #[test]
    fn test_parse_service_errors() {
        assert!(parse_service("[23 /sbin/foo").is_err());
        assert!(parse_service("[23]").is_err());
        assert!(parse_service("").is_err());
    }

    #[test]
    fn test_conf_file_source() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("finit.conf");
        std::fs::write(&path, "service [3] /sbin/dropbear -F\n").unwrap();

        let source = ConfFile::new(&path);
        let services = source.load().unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].command.name(), "dropbear");

        let missing = ConfFile::new(dir.path().join("missing.conf"));
        assert!(matches!(missing.load(), Err(Error::ConfigRead { .. })));
    }
}
