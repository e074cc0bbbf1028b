//! The static transition table (`spec.md` §4.4): a lookup from
//! `(current_role, assigned_role)` to the comment, required Postgres status,
//! and transition function to run.

use std::collections::HashMap;

use super::effects::Effects;
use super::transitions;
use crate::error::TransitionResult;
use crate::role::NodeRole;
use crate::state::{ExpectedStatus, KeeperState, NodeInfo, ReplicationSource};

/// Everything a transition function needs, borrowed for the duration of one
/// invocation.
pub struct TransitionCtx<'a> {
    /// The effects handle (real LPC, or a fake in tests).
    pub effects: &'a mut dyn Effects,
    /// The keeper's persisted state, mutable so transitions can record
    /// intermediate progress (`spec.md` §4.4: "persist state after each
    /// successful step").
    pub state: &'a mut KeeperState,
    /// The cached other-node array, refreshed by the node-active loop.
    pub other_nodes: &'a [NodeInfo],
    /// Upstream connection info, when this node has (or is becoming) a
    /// standby.
    pub replication_source: Option<&'a ReplicationSource>,
    /// The target LSN supplied by the monitor for a bounded catch-up.
    pub target_lsn: Option<&'a str>,
}

/// A transition function: converges local Postgres on the role pair's
/// postcondition.
pub type TransitionFn = fn(&mut TransitionCtx<'_>) -> TransitionResult<()>;

/// One entry of the static transition table.
#[derive(Clone, Copy)]
pub struct TableEntry {
    /// Short human-readable description, echoed in logs.
    pub comment: &'static str,
    /// Expected Postgres status the "ensure current state" pass must reach
    /// before the transition function runs. `None` means the transition
    /// function manages Postgres's running state itself.
    pub expected_pg_status: Option<ExpectedStatus>,
    /// The transition function to invoke.
    pub transition: TransitionFn,
}

impl std::fmt::Debug for TableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableEntry")
            .field("comment", &self.comment)
            .field("expected_pg_status", &self.expected_pg_status)
            .finish_non_exhaustive()
    }
}

/// The full (current, assigned) → entry table, built fresh on each call.
///
/// Built on demand rather than cached in a `static`: the table is ~20
/// entries of plain data and function pointers, cheap to rebuild, and this
/// avoids reaching for a lazy-static crate the teacher does not already
/// depend on.
#[must_use]
pub fn build() -> HashMap<(NodeRole, NodeRole), TableEntry> {
    use NodeRole::{
        ApplySettings, CatchingUp, Demoted, DemoteTimeout, Dropped, Maintenance, PreparePromotion,
        Primary, Secondary, Single, StopReplication, WaitPrimary,
    };

    let mut table = HashMap::new();

    table.insert(
        (NodeRole::Init, Single),
        TableEntry {
            comment: "initialize as the sole node of the formation",
            expected_pg_status: Some(ExpectedStatus::Running),
            transition: transitions::init_primary,
        },
    );
    table.insert(
        (Single, WaitPrimary),
        TableEntry {
            comment: "prepare replication for an incoming standby",
            expected_pg_status: Some(ExpectedStatus::Running),
            transition: transitions::prepare_replication,
        },
    );
    table.insert(
        (Primary, DemoteTimeout),
        TableEntry {
            comment: "self-demote after losing monitor and standby contact",
            expected_pg_status: Some(ExpectedStatus::Stopped),
            transition: transitions::report_lsn_and_drop_replication_slots,
        },
    );
    table.insert(
        (Demoted, CatchingUp),
        TableEntry {
            comment: "rewind or reinitialize against the new primary",
            expected_pg_status: None,
            transition: transitions::rewind_or_init,
        },
    );
    table.insert(
        (Secondary, PreparePromotion),
        TableEntry {
            comment: "fetch WAL up to the monitor's target LSN and pause",
            expected_pg_status: Some(ExpectedStatus::Running),
            transition: transitions::prepare_standby_for_promotion,
        },
    );
    table.insert(
        (PreparePromotion, StopReplication),
        TableEntry {
            comment: "promote and stabilize pg_control with a checkpoint",
            expected_pg_status: Some(ExpectedStatus::Running),
            transition: transitions::promote_and_stabilize,
        },
    );
    table.insert(
        (StopReplication, Primary),
        TableEntry {
            comment: "confirm standby recovery settings are clear",
            expected_pg_status: Some(ExpectedStatus::Running),
            transition: transitions::finish_promotion,
        },
    );
    table.insert(
        (Primary, ApplySettings),
        TableEntry {
            comment: "rewrite synchronous_standby_names from the other-node cache",
            expected_pg_status: Some(ExpectedStatus::Running),
            transition: transitions::apply_settings,
        },
    );

    for role in NodeRole::ALL {
        if role == Maintenance || role == Dropped {
            continue;
        }
        table.insert(
            (role, Maintenance),
            TableEntry {
                comment: "release control to the operator",
                expected_pg_status: None,
                transition: transitions::enter_maintenance,
            },
        );
        table.insert(
            (role, Dropped),
            TableEntry {
                comment: "leave the formation",
                expected_pg_status: Some(ExpectedStatus::Stopped),
                transition: transitions::enter_dropped,
            },
        );
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_to_single_requires_postgres_running() {
        let table = build();
        let entry = table
            .get(&(NodeRole::Init, NodeRole::Single))
            .expect("INIT -> SINGLE entry");
        assert_eq!(entry.expected_pg_status, Some(ExpectedStatus::Running));
    }

    #[test]
    fn every_role_can_transition_to_maintenance_and_dropped() {
        let table = build();
        for role in NodeRole::ALL {
            if role == NodeRole::Maintenance || role == NodeRole::Dropped {
                continue;
            }
            assert!(table.contains_key(&(role, NodeRole::Maintenance)));
            assert!(table.contains_key(&(role, NodeRole::Dropped)));
        }
    }
}
