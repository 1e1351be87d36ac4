//! Init system core - boot sequence and PID 1 duties.

use crate::conf::{Conf, ConfFile};
use crate::config::InitConfig;
use crate::error::{Error, Result};
use crate::plugin::{Hook, PluginCatalog, PluginRuntime};
use crate::process::ProcessSupervisor;
use crate::runlevel::ShutdownType;
use crate::signals;
use crate::supervisor::Supervisor;
use nix::sys::reboot::{reboot, RebootMode};
use tracing::{debug, error, info, warn};

/// The main init system.
pub struct Init {
    config: InitConfig,
}

impl Init {
    /// Create a new init system.
    pub fn new(config: InitConfig) -> Result<Self> {
        config.validate()?;

        // Check if we're PID 1
        let pid = std::process::id();
        if config.require_pid1 && pid != 1 {
            return Err(Error::NotPid1(pid));
        }

        Ok(Self { config })
    }

    pub fn config(&self) -> &InitConfig {
        &self.config
    }

    /// Boot the system and supervise services until a halt or reboot is
    /// requested. Returns only if the final reboot call does.
    pub async fn run(&self) -> Result<ShutdownType> {
        info!("Buckos init system starting");

        // Nothing may kill us before the handlers are in place.
        let suppressed = signals::suppress()?;

        let conf = match Conf::from_file(&self.config.conf_file) {
            Ok(conf) => conf,
            Err(e) => {
                warn!(error = %e, "No usable directive file, booting without services");
                Conf::default()
            }
        };
        if let Some(host) = &conf.boot.host {
            debug!(host = %host, "Hostname directive");
        }

        let mut plugins = PluginRuntime::with_catalog(PluginCatalog::builtin(&self.config));
        for name in &self.config.plugins {
            plugins.register_by_name(name)?;
        }

        let mut supervisor = Supervisor::new(
            self.config.clone(),
            ProcessSupervisor::new(),
            Box::new(ConfFile::new(&self.config.conf_file)),
        )
        .with_plugins(plugins);

        for directive in conf.services {
            if let Err(e) = supervisor.register(directive) {
                error!(error = %e, "Failed to register service");
            }
        }

        supervisor.run_hooks(Hook::BaseFilesystemUp);

        supervisor.attach_signals(suppressed.operational()?);
        supervisor.run_hooks(Hook::PostSignalSetup);

        supervisor.run_hooks(Hook::PostNetworkUp);

        supervisor.startup();
        supervisor.run_hooks(Hook::PreRunLoop);

        let shutdown_type = supervisor.monitor().await;
        self.shutdown(shutdown_type)?;
        Ok(shutdown_type)
    }

    /// Sync and hand the machine back to the kernel.
    fn shutdown(&self, shutdown_type: ShutdownType) -> Result<()> {
        info!(shutdown_type = ?shutdown_type, "Initiating system shutdown");

        // Sync filesystems
        unsafe {
            libc::sync();
        }

        if !self.config.require_pid1 {
            info!("Not running as PID 1, leaving the system up");
            return Ok(());
        }

        let mode = match shutdown_type {
            ShutdownType::PowerOff => RebootMode::RB_POWER_OFF,
            ShutdownType::Reboot => RebootMode::RB_AUTOBOOT,
            ShutdownType::Halt => RebootMode::RB_HALT_SYSTEM,
        };
        reboot(mode)?;

        Ok(())
    }
}
