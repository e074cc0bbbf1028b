//! Signal handling for the supervisor (`spec.md` §4.1).
//!
//! Grounded on `william-lbn-neon/compute_tools/src/bin/compute_ctl.rs`'s
//! `signal_hook::iterator::Signals` background-thread pattern — the teacher
//! crate has no long-running supervisor of its own to draw this from.
//! SIGHUP is tracked separately (reload, never escalates); SIGTERM/SIGINT/
//! SIGQUIT monotonically escalate a single shutdown level, per the spec's
//! "current shutdown signal" rule.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

use color_eyre::eyre::{Context, Result};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

/// Escalating shutdown level, ordered TERM ≤ INT ≤ QUIT per `spec.md` §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ShutdownLevel {
    /// No shutdown requested yet.
    None = 0,
    /// Graceful shutdown: forward SIGTERM, wait out children.
    Term = 1,
    /// Fast shutdown: forward SIGINT.
    Int = 2,
    /// Immediate shutdown: forward SIGQUIT.
    Quit = 3,
}

impl ShutdownLevel {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Term,
            2 => Self::Int,
            3 => Self::Quit,
            _ => Self::None,
        }
    }

    /// The OS signal this level forwards to supervised children.
    #[must_use]
    pub const fn forwarded_signal(self) -> Option<nix::sys::signal::Signal> {
        match self {
            Self::None => None,
            Self::Term => Some(nix::sys::signal::Signal::SIGTERM),
            Self::Int => Some(nix::sys::signal::Signal::SIGINT),
            Self::Quit => Some(nix::sys::signal::Signal::SIGQUIT),
        }
    }

    /// The next level up the `TERM ≤ INT ≤ QUIT` escalation, used when a
    /// shutdown stalls past its timeout (`spec.md` §4.1's "every additional
    /// ~10s, escalate"). `Quit` is the ceiling: escalating it is a no-op.
    #[must_use]
    pub const fn escalate_once(self) -> Self {
        match self {
            Self::None => Self::Term,
            Self::Term => Self::Int,
            Self::Int | Self::Quit => Self::Quit,
        }
    }
}

/// Shared, signal-handler-safe view of pending supervisor signals.
#[derive(Debug, Clone)]
pub struct SignalState {
    shutdown_level: Arc<AtomicU8>,
    reload_pending: Arc<AtomicBool>,
}

impl SignalState {
    /// Installs handlers for SIGHUP/SIGTERM/SIGINT/SIGQUIT, returning a
    /// handle the supervisor polls from its main loop.
    ///
    /// # Errors
    /// Returns an error if the OS signal handlers cannot be installed.
    pub fn install() -> Result<Self> {
        let state = Self {
            shutdown_level: Arc::new(AtomicU8::new(ShutdownLevel::None as u8)),
            reload_pending: Arc::new(AtomicBool::new(false)),
        };

        let mut signals = Signals::new([SIGHUP, SIGTERM, SIGINT, SIGQUIT])
            .context("install supervisor signal handlers")?;
        let worker_state = state.clone();
        thread::spawn(move || {
            for sig in signals.forever() {
                worker_state.record(sig);
            }
        });

        Ok(state)
    }

    fn record(&self, sig: i32) {
        match sig {
            SIGHUP => self.reload_pending.store(true, Ordering::SeqCst),
            SIGTERM => self.escalate(ShutdownLevel::Term),
            SIGINT => self.escalate(ShutdownLevel::Int),
            SIGQUIT => self.escalate(ShutdownLevel::Quit),
            _ => {}
        }
    }

    fn escalate(&self, level: ShutdownLevel) {
        let incoming = level as u8;
        let _ = self
            .shutdown_level
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if incoming > current {
                    Some(incoming)
                } else {
                    None
                }
            });
    }

    /// The current shutdown escalation level.
    #[must_use]
    pub fn shutdown_level(&self) -> ShutdownLevel {
        ShutdownLevel::from_u8(self.shutdown_level.load(Ordering::SeqCst))
    }

    /// Whether a reload (SIGHUP) is pending, clearing the flag if so.
    pub fn take_reload_pending(&self) -> bool {
        self.reload_pending.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_state() -> SignalState {
        SignalState {
            shutdown_level: Arc::new(AtomicU8::new(ShutdownLevel::None as u8)),
            reload_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn escalation_is_monotonic() {
        let state = fresh_state();
        state.record(SIGTERM);
        assert_eq!(state.shutdown_level(), ShutdownLevel::Term);
        state.record(SIGINT);
        assert_eq!(state.shutdown_level(), ShutdownLevel::Int);
        // A repeat of a lower signal never de-escalates.
        state.record(SIGTERM);
        assert_eq!(state.shutdown_level(), ShutdownLevel::Int);
        state.record(SIGQUIT);
        assert_eq!(state.shutdown_level(), ShutdownLevel::Quit);
    }

    #[test]
    fn reload_flag_is_consumed_once() {
        let state = fresh_state();
        state.record(SIGHUP);
        assert!(state.take_reload_pending());
        assert!(!state.take_reload_pending());
    }
}
