//! Service supervision engine and runlevel state machine.
//!
//! The [`Supervisor`] owns everything mutable: the service table, the
//! runlevel state, the plugin runtime and the signal front-end. It is driven
//! from a single loop ([`Supervisor::monitor`]); nothing else mutates it.
//!
//! Runlevel changes run in two phases. Services leaving the new level are
//! stopped one at a time, most recently started first, each given the
//! configured grace period before SIGKILL. Only once every one of them has
//! exited does the level switch and the services entering it start, in
//! declaration order.

use crate::conf::ServiceSource;
use crate::config::InitConfig;
use crate::error::{Error, Result};
use crate::plugin::{Hook, PluginRuntime, Request};
use crate::process::{ExitStatus, ProcessControl, ProcessSupervisor};
use crate::runlevel::{is_terminal, RunlevelState, ShutdownType, MAX_RUNLEVEL};
use crate::service::{Service, ServiceDirective, ServiceId, ServiceState, ServiceStatus};
use crate::signals::SignalFrontEnd;
use chrono::Utc;
use nix::sys::signal::Signal;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// A runlevel change whose stop phase is still in progress.
#[derive(Debug)]
struct Transition {
    target: u8,
    /// Services still to be stopped, in stop order
    queue: VecDeque<ServiceId>,
    /// Services signalled and not yet exited
    awaiting: Vec<ServiceId>,
}

/// The supervision context.
pub struct Supervisor<P: ProcessControl = ProcessSupervisor> {
    config: InitConfig,
    /// Keyed by id, so iteration is declaration order
    services: BTreeMap<ServiceId, Service>,
    pids: HashMap<u32, ServiceId>,
    next_id: u32,
    start_seq: u64,
    runlevel: RunlevelState,
    transition: Option<Transition>,
    processes: P,
    source: Box<dyn ServiceSource>,
    plugins: PluginRuntime,
    signals: Option<SignalFrontEnd>,
}

impl<P: ProcessControl> Supervisor<P> {
    /// Create a supervisor at the configured boot runlevel with an empty
    /// service table.
    pub fn new(config: InitConfig, processes: P, source: Box<dyn ServiceSource>) -> Self {
        let runlevel = RunlevelState::new(config.runlevel);
        Self {
            config,
            services: BTreeMap::new(),
            pids: HashMap::new(),
            next_id: 0,
            start_seq: 0,
            runlevel,
            transition: None,
            processes,
            source,
            plugins: PluginRuntime::new(),
            signals: None,
        }
    }

    pub fn with_plugins(mut self, plugins: PluginRuntime) -> Self {
        self.plugins = plugins;
        self
    }

    /// Hand over the steady-state signal disposition to the loop.
    pub fn attach_signals(&mut self, signals: SignalFrontEnd) {
        self.signals = Some(signals);
    }

    pub fn runlevel(&self) -> &RunlevelState {
        &self.runlevel
    }

    /// Target of the runlevel change in progress, if any.
    pub fn pending_runlevel(&self) -> Option<u8> {
        self.transition.as_ref().map(|t| t.target)
    }

    pub fn service(&self, id: ServiceId) -> Option<&Service> {
        self.services.get(&id)
    }

    /// First service whose program basename is `name`.
    pub fn find(&self, name: &str) -> Option<&Service> {
        self.services.values().find(|s| s.name == name)
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn processes(&self) -> &P {
        &self.processes
    }

    pub fn processes_mut(&mut self) -> &mut P {
        &mut self.processes
    }

    pub fn status(&self) -> Vec<ServiceStatus> {
        self.services.values().map(ServiceStatus::from_service).collect()
    }

    /// Insert a service in `Halted` state.
    pub fn register(&mut self, directive: ServiceDirective) -> Result<ServiceId> {
        if self.services.len() >= self.config.max_services {
            return Err(Error::Capacity {
                capacity: self.config.max_services,
                directive: directive.to_string(),
            });
        }

        let id = ServiceId(self.next_id);
        self.next_id += 1;
        let service = Service::new(id, directive);
        info!(service = %service.name, id = %id, runlevels = %service.runlevels(), "Registered service");
        self.services.insert(id, service);
        Ok(id)
    }

    /// Start a service. An explicit start re-arms a crashed service.
    pub fn start(&mut self, id: ServiceId) -> Result<()> {
        let service = self
            .services
            .get_mut(&id)
            .ok_or_else(|| Error::ServiceNotFound(id.to_string()))?;

        if service.pid.is_some() {
            debug!(service = %service.name, "Service is already running");
            return Ok(());
        }
        if service.state == ServiceState::Crashed {
            info!(service = %service.name, "Re-enabling crashed service");
            service.restart_count = 0;
        }

        self.launch(id)
    }

    /// Fork and exec. On failure the service is left `Halted`.
    fn launch(&mut self, id: ServiceId) -> Result<()> {
        let Some(service) = self.services.get_mut(&id) else {
            return Err(Error::ServiceNotFound(id.to_string()));
        };

        if service.state != ServiceState::Restarting {
            service.state = ServiceState::Starting;
        }
        info!(service = %service.name, command = %service.command(), "Starting service");

        match self.processes.spawn(&service.name, service.command()) {
            Ok(pid) => {
                self.start_seq += 1;
                service.pid = Some(pid);
                service.state = ServiceState::Running;
                service.start_seq = self.start_seq;
                service.started_at = Some(Instant::now());
                service.started_wall = Some(Utc::now());
                service.stop_deadline = None;
                service.killed = false;
                self.pids.insert(pid, id);
                info!(service = %service.name, pid = pid, "Service started");
                Ok(())
            }
            Err(e) => {
                service.settle(ServiceState::Halted);
                error!(service = %service.name, error = %e, "Failed to start service");
                Err(e)
            }
        }
    }

    /// Send SIGTERM and arm the grace timer. A service without a process is
    /// simply marked halted.
    pub fn stop(&mut self, id: ServiceId) -> Result<()> {
        let service = self
            .services
            .get_mut(&id)
            .ok_or_else(|| Error::ServiceNotFound(id.to_string()))?;

        let Some(pid) = service.pid else {
            if service.state != ServiceState::Crashed {
                service.settle(ServiceState::Halted);
            }
            return Ok(());
        };
        if service.state == ServiceState::Stopping {
            return Ok(());
        }

        info!(service = %service.name, pid = pid, "Stopping service");
        service.state = ServiceState::Stopping;
        service.stop_deadline = Some(Instant::now() + self.config.stop_timeout);
        service.killed = false;

        // A process that is already gone is settled by the reaper.
        if let Err(e) = self.processes.signal(pid, Signal::SIGTERM) {
            warn!(service = %service.name, pid = pid, error = %e, "Failed to send SIGTERM");
        }
        Ok(())
    }

    /// Start every service that belongs to the current runlevel. Used once
    /// at boot.
    pub fn startup(&mut self) {
        let level = self.runlevel.current();
        info!(runlevel = level, "Starting services");

        let ids: Vec<ServiceId> = self
            .services
            .values()
            .filter(|s| s.state == ServiceState::Halted && s.runs_in(level))
            .map(|s| s.id)
            .collect();

        for id in ids {
            let _ = self.start(id);
        }
        debug!(status = ?self.status(), "Startup complete");
    }

    /// Handle the death of a child process.
    pub fn on_child_exit(&mut self, exit: ExitStatus) {
        let Some(id) = self.pids.remove(&exit.pid) else {
            debug!(pid = exit.pid, code = ?exit.code, "Reaped unsupervised process");
            return;
        };

        let level = self.runlevel.current();
        let shutting_down = self.shutting_down();
        let leaving = self
            .transition
            .as_ref()
            .is_some_and(|t| t.queue.contains(&id));
        let restart = &self.config.restart;

        let Some(service) = self.services.get_mut(&id) else {
            return;
        };
        if service.pid != Some(exit.pid) {
            return;
        }

        info!(
            service = %service.name,
            pid = exit.pid,
            code = ?exit.code,
            signal = ?exit.signal,
            "Service process exited"
        );

        let mut relaunch = false;
        match service.state {
            ServiceState::Stopping => {
                service.settle(ServiceState::Halted);
                info!(service = %service.name, "Service stopped");
            }
            ServiceState::Running | ServiceState::Starting | ServiceState::Restarting => {
                if shutting_down || leaving || service.retired || !service.runs_in(level) {
                    service.settle(ServiceState::Halted);
                    debug!(service = %service.name, "Not restarting service");
                } else {
                    let stable = service
                        .started_at
                        .is_some_and(|at| at.elapsed() >= restart.window);
                    if stable {
                        service.restart_count = 0;
                    }
                    service.restart_count += 1;

                    if service.restart_count >= restart.limit {
                        let err = Error::RestartLimitExceeded {
                            name: service.name.clone(),
                            count: service.restart_count,
                        };
                        service.settle(ServiceState::Crashed);
                        error!(service = %service.name, error = %err, "Giving up on service, marked crashed");
                    } else {
                        warn!(
                            service = %service.name,
                            restart_count = service.restart_count,
                            "Service died, restarting"
                        );
                        service.settle(ServiceState::Restarting);
                        relaunch = true;
                    }
                }
            }
            ServiceState::Halted | ServiceState::Crashed => {}
        }

        let retire = service.retired && service.pid.is_none();
        if let Some(t) = self.transition.as_mut() {
            t.queue.retain(|queued| *queued != id);
        }

        if retire {
            if let Some(service) = self.services.remove(&id) {
                info!(service = %service.name, "Removed service");
            }
        } else if relaunch {
            let _ = self.launch(id);
        }
    }

    /// Periodic work: escalate overdue stops and advance a pending runlevel
    /// change.
    pub fn tick(&mut self, now: Instant) {
        for service in self.services.values_mut() {
            if service.state != ServiceState::Stopping || service.killed {
                continue;
            }
            let (Some(pid), Some(deadline)) = (service.pid, service.stop_deadline) else {
                continue;
            };
            if deadline > now {
                continue;
            }

            warn!(service = %service.name, pid = pid, "Service did not stop in time, sending SIGKILL");
            if let Err(e) = self.processes.signal(pid, Signal::SIGKILL) {
                warn!(service = %service.name, pid = pid, error = %e, "Failed to send SIGKILL");
            }
            service.killed = true;
        }

        self.advance_transition();
    }

    /// Request a change to `level`.
    pub fn enter(&mut self, level: u8) -> Result<()> {
        if level > MAX_RUNLEVEL {
            return Err(Error::InvalidRunlevel(level.to_string()));
        }
        match &self.transition {
            Some(t) if t.target == level => {
                debug!(runlevel = level, "Runlevel change already in progress");
                return Ok(());
            }
            None if level == self.runlevel.current() => {
                debug!(runlevel = level, "Already in runlevel");
                return Ok(());
            }
            _ => {}
        }

        let terminal = is_terminal(level);
        let mut leaving: Vec<&Service> = self
            .services
            .values()
            .filter(|s| {
                matches!(
                    s.state,
                    ServiceState::Running | ServiceState::Starting | ServiceState::Restarting
                ) && (terminal || !s.runs_in(level))
            })
            .collect();
        leaving.sort_by(|a, b| b.start_seq.cmp(&a.start_seq));

        let queue: VecDeque<ServiceId> = leaving.iter().map(|s| s.id).collect();
        let awaiting: Vec<ServiceId> = self
            .services
            .values()
            .filter(|s| s.state == ServiceState::Stopping)
            .map(|s| s.id)
            .collect();

        info!(
            from = self.runlevel.current(),
            to = level,
            stopping = queue.len(),
            "Changing runlevel"
        );
        self.transition = Some(Transition {
            target: level,
            queue,
            awaiting,
        });
        self.advance_transition();
        Ok(())
    }

    fn advance_transition(&mut self) {
        loop {
            let next = {
                let Some(t) = self.transition.as_mut() else {
                    return;
                };
                let services = &self.services;
                t.awaiting.retain(|id| {
                    services
                        .get(id)
                        .is_some_and(|s| s.state == ServiceState::Stopping)
                });
                if !t.awaiting.is_empty() {
                    return;
                }
                t.queue.pop_front().ok_or(t.target)
            };

            match next {
                Ok(id) => {
                    let _ = self.stop(id);
                    let stopping = self
                        .services
                        .get(&id)
                        .is_some_and(|s| s.state == ServiceState::Stopping);
                    if let (true, Some(t)) = (stopping, self.transition.as_mut()) {
                        t.awaiting.push(id);
                    }
                }
                Err(target) => {
                    self.transition = None;
                    self.complete_transition(target);
                    return;
                }
            }
        }
    }

    fn complete_transition(&mut self, target: u8) {
        self.runlevel.switch_to(target);
        info!(
            runlevel = target,
            previous = ?self.runlevel.previous(),
            "Runlevel changed"
        );

        if is_terminal(target) {
            info!("All services stopped");
            let requests = self.plugins.run_hooks(Hook::Shutdown);
            if !requests.is_empty() {
                debug!(?requests, "Ignoring requests from shutdown hooks");
            }
            return;
        }

        let ids: Vec<ServiceId> = self
            .services
            .values()
            .filter(|s| {
                !s.retired
                    && matches!(s.state, ServiceState::Halted | ServiceState::Crashed)
                    && s.runs_in(target)
            })
            .map(|s| s.id)
            .collect();
        for id in ids {
            let _ = self.start(id);
        }
    }

    /// A terminal runlevel is pending or reached.
    fn shutting_down(&self) -> bool {
        self.runlevel.is_terminal()
            || self
                .transition
                .as_ref()
                .is_some_and(|t| is_terminal(t.target))
    }

    /// Re-read service directives and apply the difference. Services whose
    /// directive is unchanged are left alone; new ones are registered and
    /// started, vanished ones are stopped and removed.
    pub fn reload_dynamic(&mut self) -> Result<()> {
        let directives = self.source.load()?;
        info!(source = %self.source.describe(), services = directives.len(), "Reloading services");

        let mut fresh: Vec<Option<ServiceDirective>> = directives.into_iter().map(Some).collect();
        let mut kept = Vec::new();
        let mut gone = Vec::new();

        for service in self.services.values().filter(|s| !s.retired) {
            let matched = fresh
                .iter_mut()
                .find(|d| matches!(d, Some(existing) if *existing == service.directive))
                .and_then(Option::take);
            match matched {
                Some(_) => kept.push(service.id),
                None => gone.push(service.id),
            }
        }

        for id in gone {
            let Some(service) = self.services.get_mut(&id) else {
                continue;
            };
            info!(service = %service.name, "Service removed from configuration");
            service.retired = true;
            if service.pid.is_some() {
                let _ = self.stop(id);
            } else {
                self.services.remove(&id);
            }
        }

        let mut candidates = Vec::new();
        for id in kept {
            if let Some(service) = self.services.get_mut(&id) {
                if service.state == ServiceState::Crashed {
                    service.restart_count = 0;
                    service.state = ServiceState::Halted;
                    candidates.push(id);
                }
            }
        }
        for directive in fresh.into_iter().flatten() {
            match self.register(directive) {
                Ok(id) => candidates.push(id),
                Err(e) => error!(error = %e, "Failed to register service"),
            }
        }

        // A pending runlevel change starts these when its stop phase ends.
        if self.transition.is_none() && !self.runlevel.is_terminal() {
            let level = self.runlevel.current();
            for id in candidates {
                if self.services.get(&id).is_some_and(|s| s.runs_in(level)) {
                    let _ = self.start(id);
                }
            }
        }

        debug!(status = ?self.status(), "Reload complete");
        Ok(())
    }

    /// Apply a request from a plugin or signal.
    pub fn handle_request(&mut self, request: Request) {
        match request {
            Request::Runlevel(level) => {
                if let Err(e) = self.enter(level) {
                    warn!(error = %e, "Ignoring runlevel request");
                }
            }
            Request::Reload => {
                if let Err(e) = self.reload_dynamic() {
                    error!(error = %e, "Reload failed, keeping current services");
                }
            }
            Request::SetHaltMode(mode) => {
                info!(mode = ?mode, "Halt mode set");
                self.runlevel.set_halt_mode(mode);
            }
        }
    }

    /// Run a boot checkpoint and apply whatever the hooks requested.
    pub fn run_hooks(&mut self, hook: Hook) {
        for request in self.plugins.run_hooks(hook) {
            self.handle_request(request);
        }
    }

    /// Collect exited children and feed them to the engine.
    pub fn reap(&mut self) {
        for exit in self.processes.reap() {
            self.on_child_exit(exit);
        }
    }

    /// Shutdown action once a terminal runlevel is reached and every service
    /// process is gone.
    pub fn shutdown_action(&self) -> Option<ShutdownType> {
        let idle = self.services.values().all(|s| s.pid.is_none());
        (self.transition.is_none() && self.runlevel.is_terminal() && idle)
            .then(|| self.runlevel.shutdown_type())
    }

    /// The main loop. Returns only when the system is ready to halt or
    /// reboot.
    pub async fn monitor(&mut self) -> ShutdownType {
        info!(runlevel = self.runlevel.current(), "Entering supervision loop");

        loop {
            if let Some(action) = self.step().await {
                info!(action = ?action, "Supervision loop finished");
                return action;
            }
        }
    }

    /// One pass of the main loop: wait for descriptors, signals or the poll
    /// interval, then reap, act on requests and check stop deadlines.
    pub async fn step(&mut self) -> Option<ShutdownType> {
        let timeout = self.config.poll_interval;
        let requests = match self.signals.as_mut() {
            Some(signals) => tokio::select! {
                requests = self.plugins.run_loop(timeout) => requests,
                events = signals.recv() => events.into_requests(),
            },
            None => self.plugins.run_loop(timeout).await,
        };

        self.reap();
        for request in requests {
            self.handle_request(request);
        }
        self.tick(Instant::now());

        self.shutdown_action()
    }
}
