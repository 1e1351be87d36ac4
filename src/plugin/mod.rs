//! Plugin and hook runtime.
//!
//! Plugins are statically known extension units. Each one may subscribe to
//! boot [`Hook`] checkpoints and may watch file descriptors for readiness.
//! The runtime owns the event multiplexer used in steady state: one call to
//! [`PluginRuntime::run_loop`] waits for ready descriptors (or the timeout),
//! dispatches them to their owning plugins and hands back whatever
//! [`Request`]s the plugins queued for the supervisor.
//!
//! Callbacks never get access to the supervisor itself. They talk through a
//! [`PluginContext`], and watch changes made from inside a callback are
//! applied after it returns, so the set being dispatched is never mutated
//! underneath the loop.

pub mod bootmisc;
pub mod initctl;

use crate::config::InitConfig;
use crate::error::{Error, Result};
use crate::runlevel::HaltMode;
use std::fmt;
use std::future::poll_fn;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest as TokioInterest;
use tracing::{debug, error, info, warn};

/// Boot sequence checkpoints, in the order they fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Hook {
    /// Base filesystem mounted, `/run` usable
    BaseFilesystemUp,
    /// Steady-state signal disposition installed
    PostSignalSetup,
    /// Loopback and basic networking up
    PostNetworkUp,
    /// Last stop before the supervision loop
    PreRunLoop,
    /// All services stopped after a terminal runlevel
    Shutdown,
}

impl Hook {
    pub const ALL: [Hook; 5] = [
        Hook::BaseFilesystemUp,
        Hook::PostSignalSetup,
        Hook::PostNetworkUp,
        Hook::PreRunLoop,
        Hook::Shutdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::BaseFilesystemUp => "basefs-up",
            Hook::PostSignalSetup => "sigsetup",
            Hook::PostNetworkUp => "network-up",
            Hook::PreRunLoop => "pre-runloop",
            Hook::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Readiness interest for a watched descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };
    pub const BOTH: Interest = Interest {
        read: true,
        write: true,
    };

    pub fn is_empty(&self) -> bool {
        !self.read && !self.write
    }

    fn to_tokio(self) -> Option<TokioInterest> {
        match (self.read, self.write) {
            (true, true) => Some(TokioInterest::READABLE | TokioInterest::WRITABLE),
            (true, false) => Some(TokioInterest::READABLE),
            (false, true) => Some(TokioInterest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// What a plugin may ask of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Change to the given runlevel
    Runlevel(u8),
    /// Re-read service directives
    Reload,
    /// Set the pending shutdown disposition
    SetHaltMode(HaltMode),
}

#[derive(Debug)]
enum WatchOp {
    Watch(RawFd, Interest),
    Unwatch(RawFd),
    Release(OwnedFd),
}

/// Handle given to plugin callbacks.
#[derive(Debug, Default)]
pub struct PluginContext {
    ops: Vec<WatchOp>,
    requests: Vec<Request>,
}

impl PluginContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `fd`; the calling plugin's `on_io` is invoked when it is ready.
    pub fn watch(&mut self, fd: RawFd, interest: Interest) {
        self.ops.push(WatchOp::Watch(fd, interest));
    }

    /// Stop watching `fd`.
    pub fn unwatch(&mut self, fd: RawFd) {
        self.ops.push(WatchOp::Unwatch(fd));
    }

    /// Stop watching `fd` and close it. The descriptor stays open until its
    /// watch is deregistered, so the number cannot be reused while the
    /// multiplexer still holds it.
    pub fn release(&mut self, fd: impl Into<OwnedFd>) {
        self.ops.push(WatchOp::Release(fd.into()));
    }

    /// Queue a request for the supervisor.
    pub fn request(&mut self, request: Request) {
        self.requests.push(request);
    }

    /// Requests queued so far.
    pub fn requests(&self) -> &[Request] {
        &self.requests
    }
}

/// A statically registered extension unit.
pub trait Plugin {
    fn name(&self) -> &str;

    /// Plugins that must be initialised first.
    fn depends(&self) -> &[&'static str] {
        &[]
    }

    /// Checkpoints this plugin subscribes to.
    fn hooks(&self) -> &[Hook] {
        &[]
    }

    /// Called once per subscribed checkpoint.
    fn on_hook(&mut self, _hook: Hook, _ctx: &mut PluginContext) -> Result<()> {
        Ok(())
    }

    /// Called when a descriptor this plugin watches is ready. `fd` must be
    /// drained until it would block, readiness is edge-triggered.
    fn on_io(&mut self, _fd: RawFd, _ready: Interest, _ctx: &mut PluginContext) -> Result<()> {
        Ok(())
    }
}

type PluginFactory = Box<dyn Fn() -> Box<dyn Plugin>>;

/// Factories for plugins that can be registered by name, either directly or
/// to satisfy another plugin's dependency.
#[derive(Default)]
pub struct PluginCatalog {
    factories: Vec<(String, PluginFactory)>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog of the plugins shipped with the init system.
    pub fn builtin(config: &InitConfig) -> Self {
        let dirs = config.runtime_dirs.clone();
        let fifo = config.fifo.clone();
        Self::new()
            .with(bootmisc::NAME, move || {
                Box::new(bootmisc::Bootmisc::new(dirs.clone()))
            })
            .with(initctl::NAME, move || {
                Box::new(initctl::Initctl::new(fifo.clone()))
            })
    }

    /// Add a factory; later entries shadow earlier ones with the same name.
    pub fn with<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Plugin> + 'static,
    {
        self.factories.retain(|(n, _)| n != name);
        self.factories.push((name.to_string(), Box::new(factory)));
        self
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn Plugin>> {
        self.factories
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, factory)| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.iter().any(|(n, _)| n == name)
    }
}

struct Watch {
    fd: RawFd,
    interest: Interest,
    owner: String,
    io: Option<AsyncFd<RawFd>>,
}

/// Registry of plugins plus the descriptor set they watch.
#[derive(Default)]
pub struct PluginRuntime {
    /// Initialisation order: every plugin follows its dependencies
    plugins: Vec<Box<dyn Plugin>>,
    catalog: PluginCatalog,
    watches: Vec<Watch>,
}

impl PluginRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runtime that resolves missing dependencies from `catalog`.
    pub fn with_catalog(catalog: PluginCatalog) -> Self {
        Self {
            catalog,
            ..Self::default()
        }
    }

    /// Register a plugin, pulling in missing dependencies from the catalog.
    pub fn register(&mut self, plugin: Box<dyn Plugin>) -> Result<()> {
        let mut in_progress = Vec::new();
        self.register_inner(plugin, &mut in_progress)
    }

    /// Register a catalog plugin by name.
    pub fn register_by_name(&mut self, name: &str) -> Result<()> {
        let plugin = self
            .catalog
            .create(name)
            .ok_or_else(|| Error::PluginNotFound(name.to_string()))?;
        self.register(plugin)
    }

    fn register_inner(
        &mut self,
        plugin: Box<dyn Plugin>,
        in_progress: &mut Vec<String>,
    ) -> Result<()> {
        let name = plugin.name().to_string();
        if self.is_registered(&name) {
            return Err(Error::Duplicate(name));
        }

        in_progress.push(name.clone());
        for &dep in plugin.depends() {
            if self.is_registered(dep) {
                continue;
            }
            if in_progress.iter().any(|n| n == dep) {
                return Err(Error::Dependency {
                    plugin: name,
                    dependency: dep.to_string(),
                    reason: format!("dependency cycle: {} -> {}", in_progress.join(" -> "), dep),
                });
            }
            let dependency = self.catalog.create(dep).ok_or_else(|| Error::Dependency {
                plugin: name.clone(),
                dependency: dep.to_string(),
                reason: "not registered and not available".to_string(),
            })?;
            debug!(plugin = %name, dependency = dep, "Registering plugin dependency");
            self.register_inner(dependency, in_progress)?;
        }
        in_progress.pop();

        info!(plugin = %name, "Registered plugin");
        self.plugins.push(plugin);
        Ok(())
    }

    /// Remove a plugin and every descriptor it watches.
    pub fn unregister(&mut self, name: &str) -> Result<()> {
        let idx = self
            .plugins
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| Error::PluginNotFound(name.to_string()))?;
        // Deregister first: the plugin owns the descriptors and closes them on drop
        self.watches.retain(|w| w.owner != name);
        drop(self.plugins.remove(idx));
        info!(plugin = %name, "Unregistered plugin");
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.plugins.iter().any(|p| p.name() == name)
    }

    /// Plugin names in initialisation order.
    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Run every callback subscribed to `hook`. Failures are logged and do
    /// not stop the remaining callbacks.
    pub fn run_hooks(&mut self, hook: Hook) -> Vec<Request> {
        debug!(hook = %hook, "Running hooks");
        let mut requests = Vec::new();

        for idx in 0..self.plugins.len() {
            if !self.plugins[idx].hooks().contains(&hook) {
                continue;
            }

            let mut ctx = PluginContext::new();
            let plugin = &mut self.plugins[idx];
            let owner = plugin.name().to_string();
            if let Err(e) = plugin.on_hook(hook, &mut ctx) {
                warn!(plugin = %owner, hook = %hook, error = %e, "Hook failed");
            }
            requests.extend(self.apply(&owner, ctx));
        }

        requests
    }

    /// Watch `fd` on behalf of plugin `owner`. Replaces an existing watch on
    /// the same descriptor.
    pub fn watch(&mut self, owner: &str, fd: RawFd, interest: Interest) {
        self.watches.retain(|w| w.fd != fd);
        if interest.is_empty() {
            return;
        }
        debug!(plugin = owner, fd = fd, "Watching descriptor");
        self.watches.push(Watch {
            fd,
            interest,
            owner: owner.to_string(),
            io: None,
        });
    }

    pub fn unwatch(&mut self, fd: RawFd) {
        if let Some(idx) = self.watches.iter().position(|w| w.fd == fd) {
            let watch = self.watches.remove(idx);
            debug!(plugin = %watch.owner, fd = fd, "Unwatched descriptor");
        }
    }

    pub fn is_watched(&self, fd: RawFd) -> bool {
        self.watches.iter().any(|w| w.fd == fd)
    }

    /// One multiplexer pass: wait up to `timeout` for ready descriptors,
    /// dispatch each to its owner and return the queued requests.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn run_loop(&mut self, timeout: Duration) -> Vec<Request> {
        self.register_pending();

        let ready = match tokio::time::timeout(timeout, poll_fn(|cx| self.poll_ready(cx))).await
        {
            Ok(ready) => ready,
            Err(_) => return Vec::new(),
        };

        let mut requests = Vec::new();
        for (fd, owner, flags) in ready {
            // An earlier callback in this pass may have dropped the watch
            if !self.watches.iter().any(|w| w.fd == fd && w.owner == owner) {
                continue;
            }
            let Some(plugin) = self.plugins.iter_mut().find(|p| p.name() == owner) else {
                continue;
            };

            let mut ctx = PluginContext::new();
            if let Err(e) = plugin.on_io(fd, flags, &mut ctx) {
                warn!(plugin = %owner, fd = fd, error = %e, "I/O callback failed");
            }
            requests.extend(self.apply(&owner, ctx));
        }

        requests
    }

    /// Attach new watches to the reactor. Descriptors the reactor refuses are
    /// dropped from the set.
    fn register_pending(&mut self) {
        self.watches.retain_mut(|watch| {
            if watch.io.is_some() {
                return true;
            }
            let Some(interest) = watch.interest.to_tokio() else {
                return false;
            };
            match AsyncFd::with_interest(watch.fd, interest) {
                Ok(io) => {
                    watch.io = Some(io);
                    true
                }
                Err(e) => {
                    error!(plugin = %watch.owner, fd = watch.fd, error = %e, "Cannot watch descriptor");
                    false
                }
            }
        });
    }

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Vec<(RawFd, String, Interest)>> {
        let mut ready = Vec::new();

        for watch in &self.watches {
            let Some(io) = watch.io.as_ref() else {
                continue;
            };
            let mut flags = Interest::default();

            if watch.interest.read {
                if let Poll::Ready(result) = io.poll_read_ready(cx) {
                    match result {
                        Ok(mut guard) => guard.clear_ready(),
                        Err(e) => warn!(fd = watch.fd, error = %e, "Read readiness error"),
                    }
                    flags.read = true;
                }
            }
            if watch.interest.write {
                if let Poll::Ready(result) = io.poll_write_ready(cx) {
                    match result {
                        Ok(mut guard) => guard.clear_ready(),
                        Err(e) => warn!(fd = watch.fd, error = %e, "Write readiness error"),
                    }
                    flags.write = true;
                }
            }

            if !flags.is_empty() {
                ready.push((watch.fd, watch.owner.clone(), flags));
            }
        }

        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(ready)
        }
    }

    /// Apply watch changes a callback queued and hand back its requests.
    fn apply(&mut self, owner: &str, ctx: PluginContext) -> Vec<Request> {
        for op in ctx.ops {
            match op {
                WatchOp::Watch(fd, interest) => self.watch(owner, fd, interest),
                WatchOp::Unwatch(fd) => self.unwatch(fd),
                WatchOp::Release(fd) => {
                    self.unwatch(fd.as_raw_fd());
                    drop(fd);
                }
            }
        }
        ctx.requests
    }
}
