//! Runtime directory setup once the base filesystem is writable.

use super::{Hook, Plugin, PluginContext};
use crate::error::Result;
use std::path::PathBuf;
use tracing::{debug, warn};

pub const NAME: &str = "bootmisc";

/// Creates the runtime directories other plugins expect (`/run`, lock dirs).
pub struct Bootmisc {
    dirs: Vec<PathBuf>,
}

impl Bootmisc {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }
}

impl Plugin for Bootmisc {
    fn name(&self) -> &str {
        NAME
    }

    fn hooks(&self) -> &[Hook] {
        &[Hook::BaseFilesystemUp]
    }

    fn on_hook(&mut self, _hook: Hook, _ctx: &mut PluginContext) -> Result<()> {
        for dir in &self.dirs {
            match std::fs::create_dir_all(dir) {
                Ok(()) => debug!(dir = %dir.display(), "Runtime directory ready"),
                Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to create runtime directory"),
            }
        }
        Ok(())
    }
}
