//! Buckos init binary.
//!
//! Runs as PID 1 by default. The remaining subcommands talk to a running
//! init through the control FIFO, the way `telinit` does.

use anyhow::Context;
use buckos_init::config::{kernel_log_level, DEFAULT_CONFIG};
use buckos_init::protocol::HALT_VARIABLE;
use buckos_init::runlevel::{is_terminal, parse_runlevel_char};
use buckos_init::{ControlClient, Init, InitConfig};
use clap::{Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "init",
    about = "Buckos init - PID 1 service supervisor",
    version,
    author
)]
struct Cli {
    /// Init configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Service directive file
    #[arg(long)]
    conf_file: Option<PathBuf>,

    /// Control-channel FIFO
    #[arg(long)]
    fifo: Option<PathBuf>,

    /// Boot runlevel
    #[arg(long)]
    runlevel: Option<u8>,

    /// Don't require running as PID 1
    #[arg(long)]
    no_pid1: bool,

    #[command(subcommand)]
    command: Option<Commands>,

    /// Words the kernel hands to init from its command line
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
    kernel_args: Vec<String>,
}

impl Cli {
    /// Plain boot with every option at its default.
    fn boot() -> Self {
        Self {
            config: PathBuf::from(DEFAULT_CONFIG),
            conf_file: None,
            fifo: None,
            runlevel: None,
            no_pid1: false,
            command: None,
            kernel_args: Vec::new(),
        }
    }

    /// Boot runlevel named on the kernel command line (`single`, `S` or a
    /// digit). The last one wins; halt and reboot levels are ignored.
    fn kernel_runlevel(&self) -> Option<u8> {
        self.kernel_args
            .iter()
            .filter_map(|arg| match arg.as_str() {
                "single" => parse_runlevel_char('S'),
                word if word.len() == 1 => word.chars().next().and_then(parse_runlevel_char),
                _ => None,
            })
            .filter(|&level| !is_terminal(level))
            .last()
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run as init system (PID 1)
    Init,

    /// Switch the running init to another runlevel
    Runlevel {
        /// Runlevel: 0-9 or S
        level: String,
    },

    /// Re-read the service directive file
    Reload,

    /// Stop all services and halt
    Halt,

    /// Stop all services and power off
    Poweroff,

    /// Stop all services and reboot
    Reboot,

    /// Forget a previously requested halt or power-off choice
    Cancel,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cmdline = std::fs::read_to_string("/proc/cmdline").unwrap_or_default();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(kernel_log_level(&cmdline)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let pid1 = std::process::id() == 1;
    let cli = parse_args(std::env::args_os(), pid1).unwrap_or_else(|e| e.exit());
    let config = load_config(&cli);

    match cli.command {
        Some(Commands::Init) | None => {
            run_init(config).await?;
        }

        Some(Commands::Runlevel { level }) => {
            let c = level
                .chars()
                .next()
                .filter(|&c| level.len() == 1 && parse_runlevel_char(c).is_some())
                .with_context(|| format!("invalid runlevel: {}", level))?;
            client(&config).runlevel(c)?;
            info!(runlevel = %c, "Runlevel change requested");
        }

        Some(Commands::Reload) => {
            client(&config).reload()?;
            info!("Reload requested");
        }

        Some(Commands::Halt) => {
            let client = client(&config);
            client.setenv(&format!("{}=HALT", HALT_VARIABLE))?;
            client.runlevel('0')?;
        }

        Some(Commands::Poweroff) => {
            let client = client(&config);
            client.setenv(&format!("{}=POWERDOWN", HALT_VARIABLE))?;
            client.runlevel('0')?;
        }

        Some(Commands::Reboot) => {
            client(&config).runlevel('6')?;
        }

        Some(Commands::Cancel) => {
            client(&config).setenv(HALT_VARIABLE)?;
            info!("Halt mode reset");
        }
    }

    Ok(())
}

/// Parse the command line. As PID 1 an unparsable command line must not stop
/// the boot, so it is logged and the defaults are used.
fn parse_args<I, T>(args: I, pid1: bool) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match Cli::try_parse_from(args) {
        Ok(cli) => Ok(cli),
        Err(e) if pid1 => {
            warn!(error = %e, "Ignoring unrecognized arguments");
            Ok(Cli::boot())
        }
        Err(e) => Err(e),
    }
}

/// Configuration file plus command line overrides. PID 1 must come up even
/// with a broken configuration file, so errors fall back to defaults.
fn load_config(cli: &Cli) -> InitConfig {
    let mut config = match InitConfig::load_or_default(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %cli.config.display(), error = %e, "Using default configuration");
            InitConfig::default()
        }
    };

    if let Some(conf_file) = &cli.conf_file {
        config.conf_file = conf_file.clone();
    }
    if let Some(fifo) = &cli.fifo {
        config.fifo = fifo.clone();
    }
    if let Some(runlevel) = cli.runlevel.or_else(|| cli.kernel_runlevel()) {
        config.runlevel = runlevel;
    }
    if cli.no_pid1 {
        config.require_pid1 = false;
    }
    config
}

fn client(config: &InitConfig) -> ControlClient {
    ControlClient::new(&config.fifo)
}

/// Run as the init system.
async fn run_init(config: InitConfig) -> anyhow::Result<()> {
    let init = Init::new(config)?;
    match init.run().await {
        Ok(shutdown_type) => {
            info!(shutdown_type = ?shutdown_type, "Init finished");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Init failed");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        parse_args(args.iter().copied(), false).unwrap()
    }

    #[test]
    fn test_kernel_words_accepted() {
        let cli = parse(&["init", "finit_debug"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.kernel_args, vec!["finit_debug"]);

        let cli = parse(&["init", "--", "--debug"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.kernel_args, vec!["--debug"]);
    }

    #[test]
    fn test_kernel_runlevel() {
        assert_eq!(parse(&["init", "3"]).kernel_runlevel(), Some(3));
        assert_eq!(parse(&["init", "quiet", "single"]).kernel_runlevel(), Some(1));
        assert_eq!(parse(&["init", "S"]).kernel_runlevel(), Some(1));
        assert_eq!(parse(&["init", "6"]).kernel_runlevel(), None);
        assert_eq!(parse(&["init", "splash"]).kernel_runlevel(), None);
    }

    #[test]
    fn test_subcommands_still_parsed() {
        let cli = parse(&["init", "runlevel", "3"]);
        assert!(matches!(cli.command, Some(Commands::Runlevel { ref level }) if level == "3"));
        assert!(cli.kernel_args.is_empty());

        assert!(matches!(parse(&["init", "reload"]).command, Some(Commands::Reload)));
    }

    #[test]
    fn test_unknown_flag_boots_as_pid1() {
        assert!(parse_args(["init", "--bogus"], false).is_err());

        let cli = parse_args(["init", "--bogus"], true).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG));
    }

    #[test]
    fn test_kernel_runlevel_overrides_default() {
        let mut cli = parse(&["init", "--config", "/nonexistent/init.toml", "4"]);
        assert_eq!(load_config(&cli).runlevel, 4);

        cli.runlevel = Some(3);
        assert_eq!(load_config(&cli).runlevel, 3);
    }
}
