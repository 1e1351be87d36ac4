//! Service definition types and states for the supervision engine.

use crate::runlevel::Runlevels;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Stable identifier of a service in the supervision table.
///
/// Identifiers grow monotonically, so ordering by id is declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId(pub u32);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Executable path plus argument vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ServiceCommand {
    /// Split a command line on whitespace.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Short name used in logs: the basename of the program.
    pub fn name(&self) -> &str {
        self.program.rsplit('/').next().unwrap_or(&self.program)
    }
}

impl fmt::Display for ServiceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// A parsed `service` directive. Two directives are the same service when
/// both the runlevel membership and the command line match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceDirective {
    pub runlevels: Runlevels,
    pub command: ServiceCommand,
}

impl ServiceDirective {
    pub fn new(runlevels: Runlevels, command: ServiceCommand) -> Self {
        Self { runlevels, command }
    }
}

impl fmt::Display for ServiceDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service {} {}", self.runlevels, self.command)
    }
}

/// Current state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Not running and eligible to start
    #[default]
    Halted,
    /// Forked, not yet marked running
    Starting,
    /// Process is alive
    Running,
    /// Termination requested, waiting for exit
    Stopping,
    /// Gave up after too many consecutive exits
    Crashed,
    /// Exited unexpectedly, being started again
    Restarting,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Halted => write!(f, "halted"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Stopping => write!(f, "stopping"),
            ServiceState::Crashed => write!(f, "crashed"),
            ServiceState::Restarting => write!(f, "restarting"),
        }
    }
}

/// A unit of supervision.
#[derive(Debug, Clone)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub directive: ServiceDirective,
    pub state: ServiceState,
    /// Process ID while a process exists
    pub pid: Option<u32>,
    /// Consecutive unexpected exits
    pub restart_count: u32,
    /// Monotonic start stamp, used to stop in reverse start order
    pub start_seq: u64,
    pub started_at: Option<Instant>,
    pub started_wall: Option<DateTime<Utc>>,
    /// Grace period expiry while `Stopping`
    pub stop_deadline: Option<Instant>,
    /// SIGKILL already sent for the current stop
    pub killed: bool,
    /// Directive disappeared on reload; drop from the table once halted
    pub retired: bool,
}

impl Service {
    pub fn new(id: ServiceId, directive: ServiceDirective) -> Self {
        Self {
            id,
            name: directive.command.name().to_string(),
            directive,
            state: ServiceState::Halted,
            pid: None,
            restart_count: 0,
            start_seq: 0,
            started_at: None,
            started_wall: None,
            stop_deadline: None,
            killed: false,
            retired: false,
        }
    }

    pub fn runlevels(&self) -> Runlevels {
        self.directive.runlevels
    }

    pub fn command(&self) -> &ServiceCommand {
        &self.directive.command
    }

    /// Whether the service must run in `level`.
    pub fn runs_in(&self, level: u8) -> bool {
        self.directive.runlevels.contains(level)
    }

    /// Clear process bookkeeping and settle in `state`.
    pub(crate) fn settle(&mut self, state: ServiceState) {
        self.state = state;
        self.pid = None;
        self.stop_deadline = None;
        self.killed = false;
    }

    pub fn uptime(&self) -> Option<Duration> {
        match self.state {
            ServiceState::Running | ServiceState::Stopping => {
                self.started_at.map(|start| start.elapsed())
            }
            _ => None,
        }
    }
}

/// Service status information for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub id: ServiceId,
    pub name: String,
    pub state: ServiceState,
    pub runlevels: Runlevels,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: Option<u64>,
}

impl ServiceStatus {
    pub fn from_service(service: &Service) -> Self {
        Self {
            id: service.id,
            name: service.name.clone(),
            state: service.state,
            runlevels: service.runlevels(),
            pid: service.pid,
            restart_count: service.restart_count,
            started_at: service.started_wall,
            uptime_secs: service.uptime().map(|d| d.as_secs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parse() {
        let cmd = ServiceCommand::parse("  /sbin/syslogd -n -O /dev/null ").unwrap();
        assert_eq!(cmd.program, "/sbin/syslogd");
        assert_eq!(cmd.args, vec!["-n", "-O", "/dev/null"]);
        assert_eq!(cmd.name(), "syslogd");
        assert_eq!(cmd.to_string(), "/sbin/syslogd -n -O /dev/null");

        assert!(ServiceCommand::parse("   ").is_none());
    }

    #[test]
    fn test_new_service_is_halted() {
        let cmd = ServiceCommand::parse("/usr/sbin/dropbear -F").unwrap();
        let service = Service::new(ServiceId(0), ServiceDirective::new(Runlevels::ALL, cmd));
        assert_eq!(service.state, ServiceState::Halted);
        assert_eq!(service.name, "dropbear");
        assert!(service.pid.is_none());
        assert!(service.runs_in(3));
    }
}
