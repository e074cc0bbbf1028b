//! The side effects a transition function may perform (`spec.md` §4.4).
//!
//! Transition functions never touch Postgres or the filesystem directly;
//! they only call through [`Effects`], so the table in [`super::table`] can
//! be exercised against a fake in tests. [`crate::lpc::LocalPostgresController`]
//! provides the real implementation.

use crate::error::TransitionResult;
use crate::state::ReplicationSource;

/// Everything a transition function needs from the Local Postgres
/// Controller and the keeper's other-node cache.
pub trait Effects {
    /// Runs `initdb` if the data directory is empty.
    ///
    /// # Errors
    /// Returns an error if `initdb` fails.
    fn initdb_if_absent(&mut self) -> TransitionResult<()>;

    /// Creates the replication role and grants it the replication attribute.
    ///
    /// # Errors
    /// Returns an error if the role cannot be created.
    fn ensure_replication_role(&mut self) -> TransitionResult<()>;

    /// Starts the local Postgres if it is not already running.
    ///
    /// # Errors
    /// Returns an error if Postgres fails to start.
    fn start_postgres(&mut self) -> TransitionResult<()>;

    /// Stops the local Postgres if it is running.
    ///
    /// # Errors
    /// Returns an error if Postgres fails to stop.
    fn stop_postgres(&mut self) -> TransitionResult<()>;

    /// Ensures a physical replication slot named `name` exists.
    ///
    /// # Errors
    /// Returns an error if the slot cannot be created.
    fn ensure_replication_slot(&mut self, name: &str) -> TransitionResult<()>;

    /// Drops every physical replication slot this node owns.
    ///
    /// # Errors
    /// Returns an error if a slot cannot be dropped.
    fn drop_replication_slots(&mut self) -> TransitionResult<()>;

    /// Rewrites `pg_hba.conf` to admit `hostname` as the replication user,
    /// then reloads Postgres's configuration.
    ///
    /// # Errors
    /// Returns an error if the file cannot be rewritten.
    fn ensure_hba_rule_for(&mut self, hostname: &str) -> TransitionResult<()>;

    /// Sets `synchronous_standby_names` and reloads Postgres.
    ///
    /// # Errors
    /// Returns an error if the setting cannot be applied.
    fn set_synchronous_standby_names(&mut self, value: &str) -> TransitionResult<()>;

    /// Reads the current Postgres LSN as text, e.g. `"0/3000060"`.
    ///
    /// # Errors
    /// Returns an error if Postgres cannot be queried.
    fn current_lsn(&mut self) -> TransitionResult<String>;

    /// Attempts `pg_rewind` against `source`, returning `false` if it
    /// refuses (diverged history or control-file mismatch) rather than
    /// erroring, so the caller can fall back to a full base backup.
    ///
    /// # Errors
    /// Returns an error only for failures `pg_rewind` cannot itself
    /// diagnose (e.g. the source is unreachable).
    fn try_pg_rewind(&mut self, source: &ReplicationSource) -> TransitionResult<bool>;

    /// Runs a full `pg_basebackup` against `source`, replacing the local
    /// data directory.
    ///
    /// # Errors
    /// Returns an error if the base backup fails.
    fn pg_basebackup(&mut self, source: &ReplicationSource) -> TransitionResult<()>;

    /// Waits, bounded, for local replay to reach `target_lsn` and pauses
    /// recovery there (`recovery_target_lsn`/`recovery_target_action=pause`).
    ///
    /// # Errors
    /// Returns an error if the target is not reached before the internal
    /// bound, or if Postgres cannot be reconfigured.
    fn fetch_wal_to(&mut self, target_lsn: &str) -> TransitionResult<()>;

    /// Promotes a paused standby to primary and waits until it reports
    /// being out of recovery, then issues a `CHECKPOINT`.
    ///
    /// # Errors
    /// Returns an error if promotion does not complete.
    fn promote_and_checkpoint(&mut self) -> TransitionResult<()>;

    /// Clears standby recovery settings (`primary_conninfo`, `standby.signal`)
    /// now that this node is a primary.
    ///
    /// # Errors
    /// Returns an error if the settings cannot be cleared.
    fn clear_standby_recovery_settings(&mut self) -> TransitionResult<()>;

    /// Confirms the upstream's timeline id is at least the local one before
    /// resuming streaming as a standby.
    ///
    /// # Errors
    /// Returns an error if the upstream cannot be queried.
    fn standby_check_timeline_with_upstream(
        &mut self,
        source: &ReplicationSource,
    ) -> TransitionResult<TimelineCheck>;
}

/// Result of comparing local and upstream timeline ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineCheck {
    /// Upstream timeline equals the local one: safe to proceed.
    Caught,
    /// Upstream timeline is ahead: keep waiting.
    UpstreamAhead,
}
