//! The partition detector (`spec.md` §4.6): runs only when the last monitor
//! call failed and `current_role == PRIMARY`, deciding whether this node
//! should self-demote ahead of a split-brain window.

use std::time::Duration;

use tracing::{info, warn};

use crate::error::MonitorResult;
use crate::observability::PARTITION_TARGET;

/// Reads whatever the detector needs from the local Postgres: is a
/// replication client connected as the replica user.
pub trait PartitionProbe {
    /// Whether a streaming replication client, connected as the replica
    /// user, is currently attached to the local Postgres.
    ///
    /// # Errors
    /// Returns an error if the local Postgres cannot be queried.
    fn has_streaming_replica(&mut self) -> MonitorResult<bool>;
}

/// Outcome of one partition-detector pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionVerdict {
    /// No self-demotion needed (yet, or because a standby is streaming).
    Healthy,
    /// Both monitor and standby contact are overdue past the configured
    /// timeout; the caller must self-demote.
    Unhealthy,
}

/// Runs one pass of the three-step algorithm in `spec.md` §4.6.
///
/// `now`, `last_monitor_contact`, and `last_secondary_contact` are Unix
/// seconds, matching [`crate::state::KeeperState`]'s fields. On a healthy
/// standby-streaming outcome, `last_secondary_contact` is updated in place.
///
/// # Errors
/// Returns an error if the local Postgres probe fails.
pub fn detect(
    probe: &mut dyn PartitionProbe,
    now: i64,
    last_monitor_contact: i64,
    last_secondary_contact: &mut i64,
    network_partition_timeout: Duration,
) -> MonitorResult<PartitionVerdict> {
    if probe.has_streaming_replica()? {
        *last_secondary_contact = now;
        return Ok(PartitionVerdict::Healthy);
    }

    if last_monitor_contact > 0 && *last_secondary_contact > 0 {
        let monitor_lag = non_negative_duration(now, last_monitor_contact);
        let secondary_lag = non_negative_duration(now, *last_secondary_contact);

        if monitor_lag >= network_partition_timeout && secondary_lag >= network_partition_timeout
        {
            warn!(
                target: PARTITION_TARGET,
                monitor_lag_secs = monitor_lag.as_secs(),
                secondary_lag_secs = secondary_lag.as_secs(),
                "self-demoting: lost monitor and standby contact past the partition timeout"
            );
            return Ok(PartitionVerdict::Unhealthy);
        }

        info!(
            target: PARTITION_TARGET,
            monitor_lag_secs = monitor_lag.as_secs(),
            secondary_lag_secs = secondary_lag.as_secs(),
            "monitor unreachable but within the partition timeout"
        );
    }

    Ok(PartitionVerdict::Healthy)
}

/// `now - contact`, clamped to zero. `spec.md` §9 calls out that a naive
/// subtraction can log a negative duration under clock skew or a
/// `last_*_contact` written slightly in the future; this keeps the logged
/// value always non-negative instead.
fn non_negative_duration(now: i64, contact: i64) -> Duration {
    let secs = now.saturating_sub(contact).max(0);
    Duration::from_secs(u64::try_from(secs).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProbe {
        streaming: bool,
    }

    impl PartitionProbe for FakeProbe {
        fn has_streaming_replica(&mut self) -> MonitorResult<bool> {
            Ok(self.streaming)
        }
    }

    #[test]
    fn streaming_replica_is_healthy_and_updates_contact() {
        let mut probe = FakeProbe { streaming: true };
        let mut last_secondary_contact = 0;
        let verdict = detect(&mut probe, 100, 50, &mut last_secondary_contact, Duration::from_secs(20))
            .expect("detect");
        assert_eq!(verdict, PartitionVerdict::Healthy);
        assert_eq!(last_secondary_contact, 100);
    }

    #[test]
    fn both_contacts_overdue_triggers_self_demotion() {
        let mut probe = FakeProbe { streaming: false };
        let mut last_secondary_contact = 10;
        let verdict = detect(&mut probe, 100, 10, &mut last_secondary_contact, Duration::from_secs(20))
            .expect("detect");
        assert_eq!(verdict, PartitionVerdict::Unhealthy);
    }

    #[test]
    fn not_yet_overdue_stays_healthy() {
        let mut probe = FakeProbe { streaming: false };
        let mut last_secondary_contact = 95;
        let verdict = detect(&mut probe, 100, 95, &mut last_secondary_contact, Duration::from_secs(20))
            .expect("detect");
        assert_eq!(verdict, PartitionVerdict::Healthy);
    }

    #[test]
    fn never_contacted_stays_healthy() {
        let mut probe = FakeProbe { streaming: false };
        let mut last_secondary_contact = 0;
        let verdict = detect(&mut probe, 100, 0, &mut last_secondary_contact, Duration::from_secs(20))
            .expect("detect");
        assert_eq!(verdict, PartitionVerdict::Healthy);
    }

    #[test]
    fn duration_never_goes_negative_under_clock_skew() {
        assert_eq!(non_negative_duration(10, 50), Duration::from_secs(0));
    }
}
