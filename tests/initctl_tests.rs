//! Tests for the initctl control channel

use buckos_init::conf::{parse_service, ServiceSource};
use buckos_init::plugin::{Hook, PluginCatalog, PluginRuntime, Request};
use buckos_init::process::ProcessSupervisor;
use buckos_init::protocol::{ControlClient, InitRequest, REQUEST_SIZE};
use buckos_init::service::ServiceCommand;
use buckos_init::{
    ExitStatus, HaltMode, InitConfig, ProcessControl, Result, ServiceDirective, ServiceState,
    ShutdownType, Supervisor,
};
use nix::sys::signal::Signal;
use std::io::Write;
use std::os::unix::fs::FileTypeExt;
use std::time::Duration;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> InitConfig {
    InitConfig {
        fifo: dir.path().join("run").join("initctl"),
        runtime_dirs: vec![dir.path().join("run").join("lock")],
        poll_interval: Duration::from_millis(10),
        require_pid1: false,
        ..Default::default()
    }
}

/// Runtime with initctl (and its dependencies) set up on a temporary FIFO.
fn create_runtime(config: &InitConfig) -> PluginRuntime {
    let mut runtime = PluginRuntime::with_catalog(PluginCatalog::builtin(config));
    runtime.register_by_name("initctl").unwrap();
    let requests = runtime.run_hooks(Hook::BaseFilesystemUp);
    assert!(requests.is_empty());
    runtime
}

fn write_raw(config: &InitConfig, bytes: &[u8]) {
    let mut fifo = std::fs::OpenOptions::new()
        .write(true)
        .open(&config.fifo)
        .unwrap();
    fifo.write_all(bytes).unwrap();
}

mod setup {
    use super::*;

    #[test]
    fn test_initctl_pulls_in_bootmisc() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let runtime = create_runtime(&config);

        assert_eq!(runtime.names(), vec!["bootmisc", "initctl"]);
        assert!(dir.path().join("run").join("lock").is_dir());

        let meta = std::fs::symlink_metadata(&config.fifo).unwrap();
        assert!(meta.file_type().is_fifo());
        assert!(ControlClient::new(&config.fifo).is_available());
    }
}

mod requests {
    use super::*;

    #[tokio::test]
    async fn test_runlevel_request() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let mut runtime = create_runtime(&config);

        ControlClient::new(&config.fifo).runlevel('3').unwrap();
        let requests = runtime.run_loop(Duration::from_secs(5)).await;
        assert_eq!(requests, vec![Request::Runlevel(3)]);
    }

    #[tokio::test]
    async fn test_bad_records_dropped_channel_recovers() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let mut runtime = create_runtime(&config);

        let mut bad = InitRequest::runlevel('5').encode();
        bad[0] ^= 0xff;
        write_raw(&config, &bad);
        let requests = runtime.run_loop(Duration::from_secs(5)).await;
        assert!(requests.is_empty());

        write_raw(&config, &InitRequest::runlevel('5').encode()[..REQUEST_SIZE - 1]);
        let requests = runtime.run_loop(Duration::from_secs(5)).await;
        assert!(requests.is_empty());

        let client = ControlClient::new(&config.fifo);
        client.runlevel('3').unwrap();
        let requests = runtime.run_loop(Duration::from_secs(5)).await;
        assert_eq!(requests, vec![Request::Runlevel(3)]);
    }

    #[tokio::test]
    async fn test_poweroff_sequence() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let mut runtime = create_runtime(&config);

        let mut burst = Vec::new();
        burst.extend_from_slice(&InitRequest::setenv("INIT_HALT=POWERDOWN").unwrap().encode());
        burst.extend_from_slice(&InitRequest::runlevel('0').encode());
        write_raw(&config, &burst);

        let requests = runtime.run_loop(Duration::from_secs(5)).await;
        assert_eq!(
            requests,
            vec![Request::SetHaltMode(HaltMode::PowerOff), Request::Runlevel(0)]
        );
    }

    #[tokio::test]
    async fn test_reload_and_ignored_requests() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let mut runtime = create_runtime(&config);

        let mut burst = Vec::new();
        burst.extend_from_slice(&InitRequest::setenv("TERM=vt100").unwrap().encode());
        burst.extend_from_slice(&InitRequest::runlevel('q').encode());
        burst.extend_from_slice(&InitRequest::reload().encode());
        write_raw(&config, &burst);

        let requests = runtime.run_loop(Duration::from_secs(5)).await;
        assert_eq!(requests, vec![Request::Reload]);
    }
}

mod end_to_end {
    use super::*;

    struct Lines(Vec<&'static str>);

    impl ServiceSource for Lines {
        fn load(&self) -> Result<Vec<ServiceDirective>> {
            self.0.iter().map(|line| parse_service(line)).collect()
        }

        fn describe(&self) -> String {
            "test".to_string()
        }
    }

    /// Process layer handing out fake PIDs; every signal kills.
    #[derive(Default)]
    struct Fake {
        next_pid: u32,
        exited: Vec<ExitStatus>,
    }

    impl ProcessControl for Fake {
        fn spawn(&mut self, _name: &str, _command: &ServiceCommand) -> Result<u32> {
            self.next_pid += 1;
            Ok(1000 + self.next_pid)
        }

        fn signal(&mut self, pid: u32, sig: Signal) -> Result<()> {
            self.exited.push(ExitStatus::signaled(pid, sig));
            Ok(())
        }

        fn reap(&mut self) -> Vec<ExitStatus> {
            std::mem::take(&mut self.exited)
        }
    }

    #[tokio::test]
    async fn test_runlevel_change_over_control_channel() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let plugins = create_runtime(&config);

        let mut sup = Supervisor::new(config.clone(), Fake::default(), Box::new(Lines(Vec::new())))
            .with_plugins(plugins);
        let a = sup.register(parse_service("[23] /sbin/a").unwrap()).unwrap();
        let b = sup.register(parse_service("[3] /sbin/b").unwrap()).unwrap();
        sup.startup();

        let a_pid = sup.service(a).unwrap().pid;
        assert_eq!(sup.runlevel().current(), 2);
        assert_eq!(sup.service(a).unwrap().state, ServiceState::Running);
        assert_eq!(sup.service(b).unwrap().state, ServiceState::Halted);

        ControlClient::new(&config.fifo).runlevel('3').unwrap();
        for _ in 0..100 {
            assert!(sup.step().await.is_none());
            if sup.runlevel().current() == 3 {
                break;
            }
        }

        assert_eq!(sup.runlevel().current(), 3);
        assert_eq!(sup.runlevel().previous(), Some(2));
        assert_eq!(sup.service(a).unwrap().pid, a_pid);
        assert_eq!(sup.service(a).unwrap().state, ServiceState::Running);
        assert_eq!(sup.service(b).unwrap().state, ServiceState::Running);
        assert!(sup.processes().exited.is_empty());
    }

    #[tokio::test]
    async fn test_reboot_over_control_channel() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let plugins = create_runtime(&config);

        let mut sup = Supervisor::new(
            config.clone(),
            ProcessSupervisor::new(),
            Box::new(Lines(Vec::new())),
        )
        .with_plugins(plugins);
        sup.startup();

        ControlClient::new(&config.fifo).runlevel('6').unwrap();
        let action = tokio::time::timeout(Duration::from_secs(5), sup.monitor())
            .await
            .expect("monitor did not finish");

        assert_eq!(action, ShutdownType::Reboot);
        assert_eq!(sup.runlevel().current(), 6);
        assert_eq!(sup.runlevel().halt_mode(), HaltMode::Reboot);
    }
}
