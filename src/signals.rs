//! Signal front-end for PID 1.
//!
//! Two dispositions, installed in order:
//!
//! - **Suppressed**: right after start, job-control and shutdown signals are
//!   ignored so nothing can take the process down before the base
//!   filesystem is up. `SIGCHLD` keeps its default action so children stay
//!   reapable.
//! - **Operational**: steady state. Handlers only record the delivery (the
//!   tokio signal driver sets a flag and wakes the reactor); all processing
//!   happens in the supervisor loop between multiplexer passes.
//!
//! | Signal              | Effect                          |
//! |---------------------|---------------------------------|
//! | `SIGCHLD`           | wake the loop to reap children  |
//! | `SIGHUP`            | reload service directives       |
//! | `SIGUSR1`           | halt (runlevel 0)               |
//! | `SIGUSR2`           | power off (runlevel 0)          |
//! | `SIGTERM`, `SIGINT` | reboot (runlevel 6)             |

use crate::error::{Error, Result};
use crate::plugin::Request;
use crate::runlevel::HaltMode;
use nix::sys::signal::{
    sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use std::future::poll_fn;
use std::task::{Context, Poll};
use tokio::signal::unix::{signal, Signal as SignalStream, SignalKind};
use tracing::{debug, info};

/// Signals ignored until the steady-state disposition is installed.
const SUPPRESSED: &[Signal] = &[
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGPIPE,
    Signal::SIGALRM,
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGPWR,
];

/// Initial disposition; consumed when switching to [`SignalFrontEnd`].
#[derive(Debug)]
pub struct Suppressed {
    _private: (),
}

/// Ignore everything that could disturb early boot.
pub fn suppress() -> Result<Suppressed> {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    for &sig in SUPPRESSED {
        // SAFETY: SIG_IGN installs no handler code.
        unsafe { sigaction(sig, &ignore) }
            .map_err(|e| Error::Signal(format!("failed to ignore {}: {}", sig, e)))?;
    }
    debug!("Signals suppressed");
    Ok(Suppressed { _private: () })
}

impl Suppressed {
    /// Install the steady-state disposition. Must run inside a tokio runtime.
    pub fn operational(self) -> Result<SignalFrontEnd> {
        let install = |kind: SignalKind| {
            signal(kind).map_err(|e| Error::Signal(format!("failed to install handler: {}", e)))
        };

        let front = SignalFrontEnd {
            child: install(SignalKind::child())?,
            hangup: install(SignalKind::hangup())?,
            terminate: install(SignalKind::terminate())?,
            interrupt: install(SignalKind::interrupt())?,
            user1: install(SignalKind::user_defined1())?,
            user2: install(SignalKind::user_defined2())?,
        };
        info!("Signal handlers installed");
        Ok(front)
    }
}

/// Restore default dispositions and an empty mask. Called in forked children
/// before exec, so services do not inherit the ignored set.
pub fn reset_dispositions() -> std::io::Result<()> {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in Signal::iterator() {
        if sig == Signal::SIGKILL || sig == Signal::SIGSTOP {
            continue;
        }
        // SAFETY: SIG_DFL installs no handler code.
        let _ = unsafe { sigaction(sig, &default) };
    }
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
        .map_err(std::io::Error::from)
}

/// Signals delivered since the last drain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SignalEvents {
    pub child: bool,
    pub reload: bool,
    pub halt: bool,
    pub poweroff: bool,
    pub reboot: bool,
}

impl SignalEvents {
    pub fn is_empty(&self) -> bool {
        *self == SignalEvents::default()
    }

    /// Translate into supervisor requests. Child exits need no request, the
    /// loop reaps after every pass.
    pub fn into_requests(self) -> Vec<Request> {
        let mut requests = Vec::new();
        if self.reload {
            requests.push(Request::Reload);
        }

        let shutdown = if self.reboot {
            Some((HaltMode::Reboot, 6))
        } else if self.poweroff {
            Some((HaltMode::PowerOff, 0))
        } else if self.halt {
            Some((HaltMode::Halt, 0))
        } else {
            None
        };
        if let Some((mode, level)) = shutdown {
            requests.push(Request::SetHaltMode(mode));
            requests.push(Request::Runlevel(level));
        }

        requests
    }
}

/// Steady-state signal disposition.
pub struct SignalFrontEnd {
    child: SignalStream,
    hangup: SignalStream,
    terminate: SignalStream,
    interrupt: SignalStream,
    user1: SignalStream,
    user2: SignalStream,
}

impl SignalFrontEnd {
    /// Wait until at least one signal has been delivered, then drain them all.
    pub async fn recv(&mut self) -> SignalEvents {
        poll_fn(|cx| self.poll_events(cx)).await
    }

    fn poll_events(&mut self, cx: &mut Context<'_>) -> Poll<SignalEvents> {
        let events = SignalEvents {
            child: self.child.poll_recv(cx).is_ready(),
            reload: self.hangup.poll_recv(cx).is_ready(),
            halt: self.user1.poll_recv(cx).is_ready(),
            poweroff: self.user2.poll_recv(cx).is_ready(),
            reboot: self.terminate.poll_recv(cx).is_ready()
                | self.interrupt.poll_recv(cx).is_ready(),
        };

        if events.is_empty() {
            Poll::Pending
        } else {
            debug!(?events, "Signals received");
            Poll::Ready(events)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reload_request() {
        let events = SignalEvents {
            reload: true,
            ..Default::default()
        };
        assert_eq!(events.into_requests(), vec![Request::Reload]);
    }

    #[test]
    fn test_shutdown_requests() {
        let halt = SignalEvents {
            halt: true,
            ..Default::default()
        };
        assert_eq!(
            halt.into_requests(),
            vec![Request::SetHaltMode(HaltMode::Halt), Request::Runlevel(0)]
        );

        let poweroff = SignalEvents {
            poweroff: true,
            ..Default::default()
        };
        assert_eq!(
            poweroff.into_requests(),
            vec![Request::SetHaltMode(HaltMode::PowerOff), Request::Runlevel(0)]
        );

        let both = SignalEvents {
            halt: true,
            reboot: true,
            ..Default::default()
        };
        assert_eq!(
            both.into_requests(),
            vec![Request::SetHaltMode(HaltMode::Reboot), Request::Runlevel(6)]
        );
    }

    #[test]
    fn test_child_only_needs_no_request() {
        let events = SignalEvents {
            child: true,
            ..Default::default()
        };
        assert!(!events.is_empty());
        assert!(events.into_requests().is_empty());
    }
}
