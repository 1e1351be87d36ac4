//! SysV-compatible init control-channel protocol.
//!
//! `telinit`, `shutdown` and friends write fixed-size `init_request` records
//! into a FIFO that init reads. Layout, native endian, 384 bytes:
//!
//! | Offset | Field       | Type        |
//! |--------|-------------|-------------|
//! | 0      | `magic`     | `i32`       |
//! | 4      | `cmd`       | `i32`       |
//! | 8      | `runlevel`  | `i32`       |
//! | 12     | `sleeptime` | `i32`       |
//! | 16     | `data`      | `[u8; 368]` |

use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Magic number every request starts with.
pub const INIT_MAGIC: i32 = 0x0309_1969;

/// Size of the `data` buffer.
pub const DATA_SIZE: usize = 368;

/// Size of one request record.
pub const REQUEST_SIZE: usize = 16 + DATA_SIZE;

/// Environment variable carrying the halt/poweroff choice.
pub const HALT_VARIABLE: &str = "INIT_HALT";

pub const CMD_RUNLVL: i32 = 1;
pub const CMD_SETENV: i32 = 6;
pub const CMD_RELOAD: i32 = 8;

/// Decoded command code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitCommand {
    Runlevel,
    SetEnv,
    Reload,
    Unsupported(i32),
}

impl From<i32> for InitCommand {
    fn from(code: i32) -> Self {
        match code {
            CMD_RUNLVL => InitCommand::Runlevel,
            CMD_SETENV => InitCommand::SetEnv,
            CMD_RELOAD => InitCommand::Reload,
            other => InitCommand::Unsupported(other),
        }
    }
}

/// One control-channel request record.
#[derive(Clone, PartialEq, Eq)]
pub struct InitRequest {
    pub magic: i32,
    pub cmd: i32,
    pub runlevel: i32,
    pub sleeptime: i32,
    pub data: [u8; DATA_SIZE],
}

impl std::fmt::Debug for InitRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitRequest")
            .field("magic", &format_args!("{:#x}", self.magic))
            .field("cmd", &self.cmd)
            .field("runlevel", &self.runlevel)
            .field("sleeptime", &self.sleeptime)
            .field("data", &self.data_str())
            .finish()
    }
}

impl InitRequest {
    fn new(cmd: i32) -> Self {
        Self {
            magic: INIT_MAGIC,
            cmd,
            runlevel: 0,
            sleeptime: 0,
            data: [0; DATA_SIZE],
        }
    }

    /// Request a runlevel change; `level` is the runlevel character.
    pub fn runlevel(level: char) -> Self {
        let mut rq = Self::new(CMD_RUNLVL);
        rq.runlevel = level as i32;
        rq
    }

    pub fn reload() -> Self {
        Self::new(CMD_RELOAD)
    }

    /// Set (`NAME=value`) or clear (`NAME`) an init environment variable.
    pub fn setenv(assignment: &str) -> Result<Self> {
        let bytes = assignment.as_bytes();
        if bytes.len() >= DATA_SIZE {
            return Err(Error::Protocol(format!(
                "environment assignment longer than {} bytes",
                DATA_SIZE - 1
            )));
        }
        let mut rq = Self::new(CMD_SETENV);
        rq.data[..bytes.len()].copy_from_slice(bytes);
        Ok(rq)
    }

    pub fn command(&self) -> InitCommand {
        InitCommand::from(self.cmd)
    }

    /// Runlevel field as a character, if it is one.
    pub fn runlevel_char(&self) -> Option<char> {
        u32::try_from(self.runlevel).ok().and_then(char::from_u32)
    }

    /// The data buffer up to the first NUL.
    pub fn data_str(&self) -> String {
        let end = self.data.iter().position(|&b| b == 0).unwrap_or(DATA_SIZE);
        String::from_utf8_lossy(&self.data[..end]).into_owned()
    }

    pub fn encode(&self) -> [u8; REQUEST_SIZE] {
        let mut buf = [0u8; REQUEST_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.cmd.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.runlevel.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.sleeptime.to_ne_bytes());
        buf[16..].copy_from_slice(&self.data);
        buf
    }

    /// Decode one record. Anything but exactly one record with the right
    /// magic is a protocol error.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != REQUEST_SIZE {
            return Err(Error::Protocol(format!(
                "expected {} bytes, got {}",
                REQUEST_SIZE,
                buf.len()
            )));
        }

        let field = |at: usize| i32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let magic = field(0);
        if magic != INIT_MAGIC {
            return Err(Error::Protocol(format!("bad magic {:#x}", magic)));
        }

        let mut data = [0u8; DATA_SIZE];
        data.copy_from_slice(&buf[16..]);
        Ok(Self {
            magic,
            cmd: field(4),
            runlevel: field(8),
            sleeptime: field(12),
            data,
        })
    }
}

/// Client side of the control channel, used by the `init` binary when it is
/// not PID 1.
pub struct ControlClient {
    fifo: PathBuf,
}

impl ControlClient {
    pub fn new(fifo: impl AsRef<Path>) -> Self {
        Self {
            fifo: fifo.as_ref().to_path_buf(),
        }
    }

    /// Check if the control FIFO exists
    pub fn is_available(&self) -> bool {
        self.fifo.exists()
    }

    /// Write one request. Fails instead of blocking when nobody reads the
    /// FIFO.
    pub fn send(&self, request: &InitRequest) -> Result<()> {
        let mut fifo = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.fifo)
            .map_err(|e| {
                Error::Protocol(format!(
                    "cannot open {}: {}. Is init running?",
                    self.fifo.display(),
                    e
                ))
            })?;

        fifo.write_all(&request.encode())?;
        debug!(request = ?request, "Sent initctl request");
        Ok(())
    }

    pub fn runlevel(&self, level: char) -> Result<()> {
        self.send(&InitRequest::runlevel(level))
    }

    pub fn reload(&self) -> Result<()> {
        self.send(&InitRequest::reload())
    }

    pub fn setenv(&self, assignment: &str) -> Result<()> {
        self.send(&InitRequest::setenv(assignment)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runlevel_request_layout() {
        let buf = InitRequest::runlevel('3').encode();
        assert_eq!(buf.len(), 384);
        assert_eq!(&buf[0..4], &INIT_MAGIC.to_ne_bytes());
        assert_eq!(&buf[4..8], &CMD_RUNLVL.to_ne_bytes());
        assert_eq!(&buf[8..12], &('3' as i32).to_ne_bytes());
        assert!(buf[16..].iter().all(|&b| b == 0));

        let rq = InitRequest::decode(&buf).unwrap();
        assert_eq!(rq.command(), InitCommand::Runlevel);
        assert_eq!(rq.runlevel_char(), Some('3'));
    }

    #[test]
    fn test_decode_rejects_short_record() {
        let buf = InitRequest::reload().encode();
        let err = InitRequest::decode(&buf[..REQUEST_SIZE - 1]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut buf = InitRequest::reload().encode();
        buf[0] ^= 0xff;
        assert!(matches!(InitRequest::decode(&buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_setenv_data() {
        let rq = InitRequest::setenv("INIT_HALT=POWERDOWN").unwrap();
        assert_eq!(rq.command(), InitCommand::SetEnv);
        assert_eq!(rq.data_str(), "INIT_HALT=POWERDOWN");

        let too_long = "X".repeat(DATA_SIZE);
        assert!(InitRequest::setenv(&too_long).is_err());
    }

    #[test]
    fn test_unsupported_command() {
        assert_eq!(InitCommand::from(0), InitCommand::Unsupported(0));
        assert_eq!(InitCommand::from(8), InitCommand::Reload);
    }

    #[test]
    fn test_client_without_reader_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let client = ControlClient::new(dir.path().join("initctl"));
        assert!(!client.is_available());
        assert!(matches!(client.reload(), Err(Error::Protocol(_))));
    }
}
