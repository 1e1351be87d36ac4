//! Process management for the init system.
//!
//! This module handles spawning, signalling and reaping service processes.
//! The supervisor talks to it through [`ProcessControl`] so the engine can be
//! driven without forking real children.

use crate::error::{Error, Result};
use crate::service::ServiceCommand;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use tracing::{debug, error, info};

/// Exit status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Process ID
    pub pid: u32,
    /// Exit code (if exited normally)
    pub code: Option<i32>,
    /// Signal (if killed by signal)
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn exited(pid: u32, code: i32) -> Self {
        Self {
            pid,
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(pid: u32, signal: Signal) -> Self {
        Self {
            pid,
            code: None,
            signal: Some(signal as i32),
        }
    }

    /// Check if the process exited successfully.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Operations the supervisor needs from the operating system.
pub trait ProcessControl {
    /// Fork and exec `command`, returning the child PID.
    fn spawn(&mut self, name: &str, command: &ServiceCommand) -> Result<u32>;

    /// Deliver `sig` to `pid`.
    fn signal(&mut self, pid: u32, sig: Signal) -> Result<()>;

    /// Collect every child that has exited since the last call. Never blocks.
    fn reap(&mut self) -> Vec<ExitStatus>;
}

/// Real process control backed by fork/exec and `waitpid`.
#[derive(Debug, Default)]
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessControl for ProcessSupervisor {
    fn spawn(&mut self, name: &str, command: &ServiceCommand) -> Result<u32> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        cmd.env("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin");
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        // Own session, default signal handling
        unsafe {
            cmd.pre_exec(|| {
                crate::signals::reset_dispositions()?;
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|source| Error::Fork {
            name: name.to_string(),
            source,
        })?;

        // The child is reaped through waitpid(-1), never through this handle.
        let pid = child.id();
        info!(service = %name, pid = pid, "Spawned process");
        Ok(pid)
    }

    fn signal(&mut self, pid: u32, sig: Signal) -> Result<()> {
        signal::kill(Pid::from_raw(pid as i32), sig)?;
        debug!(pid = pid, signal = ?sig, "Sent signal to process");
        Ok(())
    }

    fn reap(&mut self) -> Vec<ExitStatus> {
        let mut statuses = Vec::new();

        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    let pid = pid.as_raw() as u32;
                    debug!(pid = pid, code = code, "Reaped process");
                    statuses.push(ExitStatus::exited(pid, code));
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    let pid = pid.as_raw() as u32;
                    debug!(pid = pid, signal = ?sig, "Reaped signaled process");
                    statuses.push(ExitStatus::signaled(pid, sig));
                }
                Ok(WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => {
                    // No more zombies to reap
                    break;
                }
                Ok(_) => continue,
                Err(nix::Error::EINTR) => continue,
                Err(e) => {
                    error!(error = %e, "Error reaping children");
                    break;
                }
            }
        }

        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status() {
        assert!(ExitStatus::exited(10, 0).success());
        assert!(!ExitStatus::exited(10, 1).success());

        let killed = ExitStatus::signaled(11, Signal::SIGKILL);
        assert!(!killed.success());
        assert_eq!(killed.signal, Some(9));
    }

    #[test]
    fn test_spawn_missing_program_is_fork_error() {
        let mut processes = ProcessSupervisor::new();
        let cmd = ServiceCommand::parse("/nonexistent/buckos-test-daemon --foreground").unwrap();
        let err = processes.spawn("daemon", &cmd).unwrap_err();
        assert!(matches!(err, Error::Fork { ref name, .. } if name == "daemon"));
    }
}
