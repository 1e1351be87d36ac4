//! Buckos init - minimal PID 1 service supervisor.
//!
//! A small SysV-flavoured init. It boots the system through a fixed sequence
//! of checkpoints, starts the services declared for the boot runlevel and then
//! sits in a single event loop that:
//!
//! - reaps every child and restarts services that die unexpectedly
//! - switches runlevels, stopping services before starting new ones
//! - listens on the `initctl` FIFO for `telinit`/`shutdown` requests
//! - maps SIGHUP, SIGUSR1, SIGUSR2, SIGTERM and SIGINT onto reload, halt,
//!   power-off and reboot
//!
//! # Architecture
//!
//! - **Init**: boot glue, owns the sequence and the final reboot call
//! - **Supervisor**: service table, restart policy and runlevel state machine
//! - **PluginRuntime**: hook checkpoints and the descriptor multiplexer
//! - **signals**: suppressed boot disposition and the steady-state front-end
//! - **protocol**: the 384-byte `initctl` request record and its client
//!
//! # Example
//!
//! ```no_run
//! use buckos_init::{Init, InitConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let init = Init::new(InitConfig::default())?;
//!     init.run().await?;
//!     Ok(())
//! }
//! ```

pub mod conf;
pub mod config;
pub mod error;
pub mod init;
pub mod plugin;
pub mod process;
pub mod protocol;
pub mod runlevel;
pub mod service;
pub mod signals;
pub mod supervisor;

// Re-export main types
pub use conf::{Conf, ConfFile, ServiceSource};
pub use config::{InitConfig, RestartLimits};
pub use error::{Error, Result};
pub use init::Init;
pub use plugin::{Hook, Interest, Plugin, PluginCatalog, PluginContext, PluginRuntime, Request};
pub use process::{ExitStatus, ProcessControl, ProcessSupervisor};
pub use protocol::{ControlClient, InitRequest};
pub use runlevel::{HaltMode, RunlevelState, Runlevels, ShutdownType};
pub use service::{Service, ServiceDirective, ServiceId, ServiceState, ServiceStatus};
pub use supervisor::Supervisor;
