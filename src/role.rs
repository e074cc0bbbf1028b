//! Node role enumeration.
//!
//! The exact string spellings form part of the wire contract with the
//! monitor (`spec.md` §3, §6) — they are transmitted verbatim as `node_active`
//! parameters and results, so `Display`/`FromStr` below must round-trip them
//! byte-for-byte. Kept as a plain hand-written `impl` rather than reaching for
//! an enum-string derive crate, matching the teacher's preference for small
//! explicit `impl` blocks over macro-generated ones.

use std::fmt;
use std::str::FromStr;

/// A node's current or assigned role, as understood by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    /// Freshly registered, not yet initialised.
    Init,
    /// Sole node in a formation with no standby.
    Single,
    /// Normal primary with at least one attached standby.
    Primary,
    /// Primary waiting for a standby to attach.
    WaitPrimary,
    /// A new standby is joining an existing primary.
    JoinPrimary,
    /// Streaming standby, fully caught up.
    Secondary,
    /// Standby still catching up to the primary.
    CatchingUp,
    /// Former primary waiting for a standby's acknowledgement after failover.
    WaitStandby,
    /// Metadata is registered but Postgres is operator-managed.
    Maintenance,
    /// Transitioning into `Maintenance`.
    PrepMaintenance,
    /// Former primary that has stopped serving writes after a failover.
    Demoted,
    /// Former primary stopping due to a detected network partition.
    DemoteTimeout,
    /// Standby that has stopped streaming ahead of a role change.
    StopReplication,
    /// Standby draining its final WAL before a planned failover.
    Draining,
    /// Standby reporting its LSN to the monitor ahead of a role change.
    ReportLsn,
    /// Standby fast-forwarding to a target LSN.
    FastForward,
    /// A new standby joining an existing secondary set.
    JoinSecondary,
    /// Applying `synchronous_standby_names`/GUC changes.
    ApplySettings,
    /// Standby preparing to be promoted to primary.
    PreparePromotion,
    /// Node has been removed from the formation.
    Dropped,
    /// Sentinel for "no role assigned yet".
    NoState,
}

impl NodeRole {
    /// All roles, in the order `spec.md` §3 lists them.
    pub const ALL: [Self; 20] = [
        Self::Init,
        Self::Single,
        Self::Primary,
        Self::WaitPrimary,
        Self::JoinPrimary,
        Self::Secondary,
        Self::CatchingUp,
        Self::WaitStandby,
        Self::Maintenance,
        Self::PrepMaintenance,
        Self::Demoted,
        Self::DemoteTimeout,
        Self::StopReplication,
        Self::Draining,
        Self::ReportLsn,
        Self::FastForward,
        Self::JoinSecondary,
        Self::ApplySettings,
        Self::PreparePromotion,
        Self::Dropped,
    ];

    /// The exact wire spelling sent to and received from the monitor.
    #[must_use]
    pub const fn as_wire_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Single => "single",
            Self::Primary => "primary",
            Self::WaitPrimary => "wait_primary",
            Self::JoinPrimary => "join_primary",
            Self::Secondary => "secondary",
            Self::CatchingUp => "catchingup",
            Self::WaitStandby => "wait_standby",
            Self::Maintenance => "maintenance",
            Self::PrepMaintenance => "prep_maintenance",
            Self::Demoted => "demoted",
            Self::DemoteTimeout => "demote_timeout",
            Self::StopReplication => "stop_replication",
            Self::Draining => "draining",
            Self::ReportLsn => "report_lsn",
            Self::FastForward => "fast_forward",
            Self::JoinSecondary => "join_secondary",
            Self::ApplySettings => "apply_settings",
            Self::PreparePromotion => "prepare_promotion",
            Self::Dropped => "dropped",
            Self::NoState => "no_state",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

/// Error returned when a string does not match any known [`NodeRole`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown node role: {0:?}")]
pub struct ParseNodeRoleError(pub String);

impl FromStr for NodeRole {
    type Err = ParseNodeRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "init" => Self::Init,
            "single" => Self::Single,
            "primary" => Self::Primary,
            "wait_primary" => Self::WaitPrimary,
            "join_primary" => Self::JoinPrimary,
            "secondary" => Self::Secondary,
            "catchingup" => Self::CatchingUp,
            "wait_standby" => Self::WaitStandby,
            "maintenance" => Self::Maintenance,
            "prep_maintenance" => Self::PrepMaintenance,
            "demoted" => Self::Demoted,
            "demote_timeout" => Self::DemoteTimeout,
            "stop_replication" => Self::StopReplication,
            "draining" => Self::Draining,
            "report_lsn" => Self::ReportLsn,
            "fast_forward" => Self::FastForward,
            "join_secondary" => Self::JoinSecondary,
            "apply_settings" => Self::ApplySettings,
            "prepare_promotion" => Self::PreparePromotion,
            "dropped" => Self::Dropped,
            "no_state" => Self::NoState,
            other => return Err(ParseNodeRoleError(other.to_owned())),
        })
    }
}

impl serde::Serialize for NodeRole {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_wire_str())
    }
}

impl<'de> serde::Deserialize<'de> for NodeRole {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn round_trips_every_role(#[values(
        NodeRole::Init, NodeRole::Single, NodeRole::Primary, NodeRole::WaitPrimary,
        NodeRole::JoinPrimary, NodeRole::Secondary, NodeRole::CatchingUp, NodeRole::WaitStandby,
        NodeRole::Maintenance, NodeRole::PrepMaintenance, NodeRole::Demoted,
        NodeRole::DemoteTimeout, NodeRole::StopReplication, NodeRole::Draining,
        NodeRole::ReportLsn, NodeRole::FastForward, NodeRole::JoinSecondary,
        NodeRole::ApplySettings, NodeRole::PreparePromotion, NodeRole::Dropped, NodeRole::NoState
    )]
    role: NodeRole) {
        let wire = role.to_string();
        assert_eq!(wire.parse::<NodeRole>().expect("known role"), role);
    }

    #[test]
    fn rejects_unknown_role() {
        assert!("bogus_role".parse::<NodeRole>().is_err());
    }
}
