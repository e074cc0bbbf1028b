//! Domain error types for the keeper runtime.
//!
//! Follows the teacher crate's newtype-over-[`color_eyre::Report`] pattern: leaf
//! failures are wrapped in a `thiserror` newtype close to where they occur, and
//! [`KeeperError`] is the single sum type the process boundary (`main`) maps to
//! an exit code. Nothing below `main` should call `std::process::exit`.

use color_eyre::Report;
use thiserror::Error;

/// Result alias for top-level keeper operations.
pub type Result<T> = std::result::Result<T, KeeperError>;

/// Result alias for state/PID-file I/O.
pub type StateResult<T> = std::result::Result<T, StateError>;

/// Result alias for configuration loading.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result alias for FSM transition functions.
pub type TransitionResult<T> = std::result::Result<T, TransitionError>;

/// Result alias for monitor RPC calls.
pub type MonitorResult<T> = std::result::Result<T, MonitorError>;

/// Result alias for local Postgres control operations.
pub type PgControlResult<T> = std::result::Result<T, PgControlError>;

/// Top-level error exposed by the crate, mapped 1:1 to the exit codes in
/// `spec.md` §6.
#[derive(Debug, Error)]
pub enum KeeperError {
    /// CLI arguments could not be parsed or were mutually inconsistent.
    #[error("invalid arguments")]
    BadArgs(#[source] Report),
    /// The merged configuration was missing required fields or failed validation.
    #[error("invalid configuration")]
    BadConfig(#[from] ConfigError),
    /// The on-disk keeper state file was missing, truncated, or failed to parse.
    #[error("invalid state file")]
    BadState(#[from] StateError),
    /// The monitor could not be reached after exhausting the retry policy.
    #[error("monitor unreachable")]
    MonitorUnreachable(#[from] MonitorError),
    /// The local Postgres controller failed an operation it must not retry.
    #[error("postgres control failure")]
    PgControl(#[from] PgControlError),
    /// An invariant was violated that the runtime cannot safely recover from.
    #[error("internal error")]
    Internal(#[source] Report),
    /// The process is exiting because it received a terminating signal.
    #[error("terminated by signal")]
    QuitBySignal,
    /// The monitor reported this node as `DROPPED` and the keeper has exited.
    #[error("dropped from monitor")]
    Dropped,
    /// Another live supervisor already owns the PID file for this data directory.
    #[error("already running")]
    AlreadyRunning,
    /// The per-service restart budget was exhausted.
    #[error("restart budget exhausted")]
    RestartBudgetExhausted,
}

impl KeeperError {
    /// Maps this error to the process exit code named in `spec.md` §6.
    ///
    /// Exit code `0` is reserved for success and is never produced here.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::BadArgs(_) => 2,
            Self::BadConfig(_) => 3,
            Self::BadState(_) => 4,
            Self::MonitorUnreachable(_) => 5,
            Self::PgControl(_) => 6,
            Self::Internal(_) => 7,
            Self::QuitBySignal | Self::AlreadyRunning | Self::RestartBudgetExhausted => 8,
            Self::Dropped => 9,
        }
    }
}

/// Captures state-file and PID-file I/O failures.
///
/// Per `spec.md` §7, a state-file I/O failure is treated as a transition
/// failure and retried on the next tick; it is promoted to [`KeeperError`]
/// only when the loop gives up entirely (e.g. at startup).
#[derive(Debug, Error)]
#[error(transparent)]
pub struct StateError(#[from] Report);

/// Captures configuration loading/merging failures.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ConfigError(#[from] Report);

/// Captures a single FSM transition function's failure.
///
/// A transition failure never advances `current_role`; the state file is
/// still rewritten to keep contact timestamps current, and the transition is
/// retried on the next tick.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct TransitionError(#[from] Report);

/// Captures monitor RPC failures (`node_active`, LISTEN/NOTIFY).
#[derive(Debug, Error)]
#[error(transparent)]
pub struct MonitorError(#[from] Report);

/// Captures Local Postgres Controller failures (start/stop/probe).
#[derive(Debug, Error)]
#[error(transparent)]
pub struct PgControlError(#[from] Report);

impl From<TransitionError> for KeeperError {
    fn from(err: TransitionError) -> Self {
        Self::Internal(err.0)
    }
}
