//! Control-channel server on the `initctl` FIFO.
//!
//! Standard reboot/shutdown utilities talk to init through this FIFO. After
//! every read burst the FIFO is closed and reopened, and recreated if
//! somebody removed or replaced it, so writers can always reconnect.
//!
//! For SysV compatibility `init 0` halts unless `INIT_HALT=POWERDOWN` was
//! set first.

use super::{Hook, Interest, Plugin, PluginContext, Request};
use crate::error::Result;
use crate::protocol::{InitCommand, InitRequest, HALT_VARIABLE, REQUEST_SIZE};
use crate::runlevel::{parse_runlevel_char, HaltMode};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

pub const NAME: &str = "initctl";

pub struct Initctl {
    path: PathBuf,
    fifo: Option<File>,
}

impl Initctl {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fifo: None,
        }
    }

    /// Descriptor currently being watched, if the FIFO is open.
    pub fn fd(&self) -> Option<RawFd> {
        self.fifo.as_ref().map(|f| f.as_raw_fd())
    }

    fn open(&mut self, ctx: &mut PluginContext) -> Result<()> {
        ensure_fifo(&self.path)?;

        // Opened read-write so the FIFO never reports EOF between writers.
        let fifo = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(&self.path)?;

        ctx.watch(fifo.as_raw_fd(), Interest::READ);
        self.fifo = Some(fifo);
        Ok(())
    }

    fn reopen(&mut self, ctx: &mut PluginContext) {
        // The old descriptor is still open while the new one is created, so
        // the two never share a number.
        if let Some(old) = self.fifo.take() {
            ctx.release(old);
        }
        if let Err(e) = self.open(ctx) {
            error!(path = %self.path.display(), error = %e, "Failed reopening initctl FIFO");
        }
    }
}

impl Plugin for Initctl {
    fn name(&self) -> &str {
        NAME
    }

    // Needs a writable runtime directory.
    fn depends(&self) -> &[&'static str] {
        &[super::bootmisc::NAME]
    }

    fn hooks(&self) -> &[Hook] {
        &[Hook::BaseFilesystemUp]
    }

    fn on_hook(&mut self, _hook: Hook, ctx: &mut PluginContext) -> Result<()> {
        debug!(path = %self.path.display(), "Setting up initctl FIFO");
        self.open(ctx)?;
        info!(path = %self.path.display(), "Control channel listening");
        Ok(())
    }

    fn on_io(&mut self, _fd: RawFd, _ready: Interest, ctx: &mut PluginContext) -> Result<()> {
        let Some(fifo) = self.fifo.as_mut() else {
            return Ok(());
        };

        let mut buf = [0u8; REQUEST_SIZE];
        loop {
            match fifo.read(&mut buf) {
                Ok(0) => {
                    debug!("Nothing to do, bailing out");
                    break;
                }
                Ok(len) => match InitRequest::decode(&buf[..len]) {
                    Ok(rq) => dispatch(&rq, ctx),
                    Err(e) => {
                        error!(error = %e, "Dropping initctl channel");
                        break;
                    }
                },
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(error = %e, "Failed reading initctl request");
                    break;
                }
            }
        }

        self.reopen(ctx);
        Ok(())
    }
}

/// Translate one well-formed request into supervisor requests.
fn dispatch(rq: &InitRequest, ctx: &mut PluginContext) {
    match rq.command() {
        InitCommand::Runlevel => match rq.runlevel_char().and_then(parse_runlevel_char) {
            Some(level) => {
                debug!(level = level, "Setting new runlevel");
                if level == 6 {
                    ctx.request(Request::SetHaltMode(HaltMode::Reboot));
                }
                ctx.request(Request::Runlevel(level));
            }
            None => debug!(runlevel = rq.runlevel, "Unsupported runlevel"),
        },
        InitCommand::Reload => ctx.request(Request::Reload),
        InitCommand::SetEnv => {
            if let Some(mode) = halt_mode_from_env(&rq.data_str()) {
                ctx.request(Request::SetHaltMode(mode));
            }
        }
        InitCommand::Unsupported(cmd) => debug!(cmd = cmd, "Unsupported initctl command"),
    }
}

/// Interpret a `SETENV` assignment. Only the halt variable matters: no value
/// cancels a pending shutdown, `POWERDOWN` and `HALT` pick the disposition.
pub fn halt_mode_from_env(assignment: &str) -> Option<HaltMode> {
    let (name, value) = assignment.split_once('=').unwrap_or((assignment, ""));
    if name != HALT_VARIABLE {
        return None;
    }
    match value {
        "" => Some(HaltMode::Default),
        "POWERDOWN" => Some(HaltMode::PowerOff),
        "HALT" => Some(HaltMode::Halt),
        _ => None,
    }
}

/// Make sure `path` is a FIFO, replacing whatever else is there.
fn ensure_fifo(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => return Ok(()),
        Ok(_) => {
            info!(path = %path.display(), "Replacing stale initctl node");
            std::fs::remove_file(path)?;
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)?;
    debug!(path = %path.display(), "Created FIFO");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halt_mode_from_env() {
        assert_eq!(halt_mode_from_env("INIT_HALT"), Some(HaltMode::Default));
        assert_eq!(halt_mode_from_env("INIT_HALT="), Some(HaltMode::Default));
        assert_eq!(halt_mode_from_env("INIT_HALT=POWERDOWN"), Some(HaltMode::PowerOff));
        assert_eq!(halt_mode_from_env("INIT_HALT=HALT"), Some(HaltMode::Halt));
        assert_eq!(halt_mode_from_env("INIT_HALT=SOON"), None);
        assert_eq!(halt_mode_from_env("RUNLEVEL=3"), None);
        assert_eq!(halt_mode_from_env("INIT_HALTED=HALT"), None);
    }

    #[test]
    fn test_dispatch_runlevel() {
        let mut ctx = PluginContext::new();
        dispatch(&InitRequest::runlevel('s'), &mut ctx);
        assert_eq!(ctx.requests(), &[Request::Runlevel(1)]);

        let mut ctx = PluginContext::new();
        dispatch(&InitRequest::runlevel('6'), &mut ctx);
        assert_eq!(
            ctx.requests(),
            &[Request::SetHaltMode(HaltMode::Reboot), Request::Runlevel(6)]
        );

        let mut ctx = PluginContext::new();
        dispatch(&InitRequest::runlevel('q'), &mut ctx);
        assert!(ctx.requests().is_empty());
    }

    #[test]
    fn test_reopen_releases_old_descriptor_after_new_watch() {
        use super::super::WatchOp;
        use std::io::Write;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("initctl");
        let mut initctl = Initctl::new(&path);

        let mut ctx = PluginContext::new();
        initctl.on_hook(Hook::BaseFilesystemUp, &mut ctx).unwrap();
        let old = initctl.fd().unwrap();
        assert!(matches!(ctx.ops[..], [WatchOp::Watch(fd, Interest::READ)] if fd == old));

        let mut writer = OpenOptions::new().write(true).open(&path).unwrap();
        writer.write_all(&InitRequest::reload().encode()).unwrap();

        let mut ctx = PluginContext::new();
        initctl.on_io(old, Interest::READ, &mut ctx).unwrap();
        assert_eq!(ctx.requests(), &[Request::Reload]);

        // Old descriptor handed over still open; the new one got another number
        let new = initctl.fd().unwrap();
        assert_ne!(new, old);
        match &ctx.ops[..] {
            [WatchOp::Release(released), WatchOp::Watch(fd, Interest::READ)] => {
                assert_eq!(released.as_raw_fd(), old);
                assert_eq!(*fd, new);
            }
            ops => panic!("unexpected watch changes: {:?}", ops),
        }
    }

    #[test]
    fn test_ensure_fifo_replaces_regular_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("initctl");
        std::fs::write(&path, b"stale").unwrap();

        ensure_fifo(&path).unwrap();
        let meta = std::fs::symlink_metadata(&path).unwrap();
        assert!(meta.file_type().is_fifo());

        // Idempotent on an existing FIFO
        ensure_fifo(&path).unwrap();
    }
}
