//! Runlevel vocabulary: membership masks, the process-wide runlevel state and
//! the pending halt disposition.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest valid runlevel.
pub const MAX_RUNLEVEL: u8 = 9;

/// Single-user runlevel, also reachable as `S`/`s`.
pub const SINGLE_USER: u8 = 1;

/// Translate a runlevel character into its numeric level.
///
/// `'0'..='9'` map to themselves, `'S'` and `'s'` are single-user.
pub fn parse_runlevel_char(c: char) -> Option<u8> {
    match c {
        's' | 'S' => Some(SINGLE_USER),
        '0'..='9' => c.to_digit(10).map(|d| d as u8),
        _ => None,
    }
}

/// Whether a level ends the system lifetime (halt or reboot).
pub fn is_terminal(level: u8) -> bool {
    level == 0 || level == 6
}

/// Set of runlevels a service must be running in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Runlevels(u16);

impl Runlevels {
    /// Membership in every runlevel.
    pub const ALL: Runlevels = Runlevels(0x3ff);

    /// Empty membership.
    pub const fn empty() -> Self {
        Runlevels(0)
    }

    /// Build a mask from a list of levels, ignoring out of range entries.
    pub fn from_levels(levels: &[u8]) -> Self {
        let mut mask = Runlevels::empty();
        for &level in levels {
            mask.insert(level);
        }
        mask
    }

    /// Parse a level list such as `2345` or `S`.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut mask = Runlevels::empty();
        for c in spec.chars() {
            let level = parse_runlevel_char(c)
                .ok_or_else(|| Error::InvalidRunlevel(format!("'{}' in [{}]", c, spec)))?;
            mask.insert(level);
        }
        if mask.is_empty() {
            return Err(Error::InvalidRunlevel(format!("empty runlevel list [{}]", spec)));
        }
        Ok(mask)
    }

    pub fn insert(&mut self, level: u8) {
        if level <= MAX_RUNLEVEL {
            self.0 |= 1 << level;
        }
    }

    pub fn contains(&self, level: u8) -> bool {
        level <= MAX_RUNLEVEL && self.0 & (1 << level) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Levels in ascending order.
    pub fn levels(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=MAX_RUNLEVEL).filter(move |l| self.contains(*l))
    }
}

impl Default for Runlevels {
    fn default() -> Self {
        Runlevels::ALL
    }
}

impl fmt::Display for Runlevels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for level in self.levels() {
            write!(f, "{}", level)?;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for Runlevels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Runlevels{}", self)
    }
}

/// Pending shutdown disposition, consulted once services have stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HaltMode {
    /// No explicit request; runlevel 0 halts
    #[default]
    Default,
    /// Halt the machine
    Halt,
    /// Power the machine off
    PowerOff,
    /// Reboot
    Reboot,
}

/// Kernel-level action performed after the last service stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownType {
    /// Power off the system
    PowerOff,
    /// Reboot the system
    Reboot,
    /// Halt the system
    Halt,
}

/// Current and previous runlevel plus the pending halt mode.
#[derive(Debug, Clone)]
pub struct RunlevelState {
    current: u8,
    previous: Option<u8>,
    halt: HaltMode,
}

impl RunlevelState {
    pub fn new(initial: u8) -> Self {
        Self {
            current: initial,
            previous: None,
            halt: HaltMode::Default,
        }
    }

    pub fn current(&self) -> u8 {
        self.current
    }

    pub fn previous(&self) -> Option<u8> {
        self.previous
    }

    pub fn halt_mode(&self) -> HaltMode {
        self.halt
    }

    pub fn set_halt_mode(&mut self, mode: HaltMode) {
        self.halt = mode;
    }

    /// Record a completed transition.
    pub fn switch_to(&mut self, level: u8) {
        self.previous = Some(self.current);
        self.current = level;
    }

    pub fn is_terminal(&self) -> bool {
        is_terminal(self.current)
    }

    /// Resolve the halt mode into the action for the current terminal level.
    ///
    /// `Default` halts rather than powering off, matching SysV `init 0`.
    pub fn shutdown_type(&self) -> ShutdownType {
        if self.current == 6 {
            return ShutdownType::Reboot;
        }
        match self.halt {
            HaltMode::Default | HaltMode::Halt => ShutdownType::Halt,
            HaltMode::PowerOff => ShutdownType::PowerOff,
            HaltMode::Reboot => ShutdownType::Reboot,
        }
    }
}
