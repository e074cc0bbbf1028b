//! Transition functions named in `spec.md` §4.4.
//!
//! Every function here must be idempotent: re-invoking it after a
//! crash-and-restart that left partial effects has to converge on the same
//! outcome, so each step re-checks rather than assumes a clean starting
//! point.

use color_eyre::eyre::eyre;

use super::effects::{Effects, TimelineCheck};
use super::table::TransitionCtx;
use crate::error::TransitionResult;

/// INIT → SINGLE.
pub fn init_primary(ctx: &mut TransitionCtx<'_>) -> TransitionResult<()> {
    ctx.effects.initdb_if_absent()?;
    ctx.effects.ensure_replication_role()?;
    ctx.effects.start_postgres()?;
    ctx.effects.ensure_replication_slot(&replication_slot_name(ctx.state.current_node_id))?;
    Ok(())
}

/// SINGLE → WAIT_PRIMARY.
pub fn prepare_replication(ctx: &mut TransitionCtx<'_>) -> TransitionResult<()> {
    for peer in ctx.other_nodes {
        ctx.effects.ensure_hba_rule_for(&peer.host)?;
    }
    ctx.effects
        .ensure_replication_slot(&replication_slot_name(ctx.state.current_node_id))?;
    let synchronous_names = synchronous_standby_names(ctx.other_nodes);
    ctx.effects.set_synchronous_standby_names(&synchronous_names)?;
    Ok(())
}

/// PRIMARY → DEMOTE_TIMEOUT: `stop_postgres` / `report_lsn_and_drop_replication_slots`.
pub fn report_lsn_and_drop_replication_slots(ctx: &mut TransitionCtx<'_>) -> TransitionResult<()> {
    let lsn = ctx.effects.current_lsn()?;
    ctx.effects.stop_postgres()?;
    ctx.effects.drop_replication_slots()?;
    ctx.state.xlog_location = lsn;
    Ok(())
}

/// DEMOTED → CATCHINGUP.
pub fn rewind_or_init(ctx: &mut TransitionCtx<'_>) -> TransitionResult<()> {
    let source = ctx
        .replication_source
        .ok_or_else(|| eyre!("rewind_or_init requires a replication source"))?;
    if !ctx.effects.try_pg_rewind(source)? {
        ctx.effects.pg_basebackup(source)?;
    }
    ctx.effects.start_postgres()?;
    Ok(())
}

/// SECONDARY → PREPARE_PROMOTION.
pub fn prepare_standby_for_promotion(ctx: &mut TransitionCtx<'_>) -> TransitionResult<()> {
    let target_lsn = ctx
        .target_lsn
        .ok_or_else(|| eyre!("prepare_standby_for_promotion requires a target LSN"))?;
    ctx.effects.fetch_wal_to(target_lsn)?;
    Ok(())
}

/// PREPARE_PROMOTION → STOP_REPLICATION and STOP_REPLICATION → PRIMARY share
/// the same promotion primitive; the table lists them as two steps so the
/// node-active loop can report each to the monitor separately, but only the
/// first actually performs the promotion.
pub fn promote_and_stabilize(ctx: &mut TransitionCtx<'_>) -> TransitionResult<()> {
    ctx.effects.promote_and_checkpoint()?;
    ctx.effects.clear_standby_recovery_settings()?;
    Ok(())
}

/// STOP_REPLICATION → PRIMARY: the promotion primitive has already run;
/// this step only confirms recovery settings are clear (idempotent no-op
/// if `promote_and_stabilize` already ran to completion).
pub fn finish_promotion(ctx: &mut TransitionCtx<'_>) -> TransitionResult<()> {
    ctx.effects.clear_standby_recovery_settings()
}

/// PRIMARY → APPLY_SETTINGS.
pub fn apply_settings(ctx: &mut TransitionCtx<'_>) -> TransitionResult<()> {
    let synchronous_names = synchronous_standby_names(ctx.other_nodes);
    ctx.effects.set_synchronous_standby_names(&synchronous_names)
}

/// any → MAINTENANCE: the expected-status file removal is handled by the
/// node-active loop (per `DESIGN.md`'s MAINTENANCE-race resolution); this
/// function only confirms there is nothing further to converge.
pub fn enter_maintenance(_ctx: &mut TransitionCtx<'_>) -> TransitionResult<()> {
    Ok(())
}

/// any → DROPPED.
pub fn enter_dropped(ctx: &mut TransitionCtx<'_>) -> TransitionResult<()> {
    ctx.effects.drop_replication_slots()?;
    ctx.effects.stop_postgres()
}

/// Re-checks the upstream timeline before resuming streaming as a standby.
///
/// Not a table entry itself (it guards `CATCHINGUP`/`SECONDARY` re-entry);
/// exposed for the node-active loop to call directly per `spec.md` §4.4's
/// "Timelines" tie-break.
///
/// # Errors
/// Returns an error if the upstream timeline is behind the local one, which
/// `spec.md` calls impossible, or if the upstream cannot be queried.
pub fn standby_check_timeline_with_upstream(
    effects: &mut dyn Effects,
    source: &crate::state::ReplicationSource,
) -> TransitionResult<TimelineCheck> {
    effects.standby_check_timeline_with_upstream(source)
}

fn replication_slot_name(node_id: u64) -> String {
    format!("pgautofailover_standby_{node_id}")
}

fn synchronous_standby_names(other_nodes: &[crate::state::NodeInfo]) -> String {
    if other_nodes.is_empty() {
        String::new()
    } else {
        let names: Vec<&str> = other_nodes.iter().map(|n| n.name.as_str()).collect();
        format!("ANY 1 ({})", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NodeInfo;

    #[test]
    fn synchronous_standby_names_empty_when_no_peers() {
        assert_eq!(synchronous_standby_names(&[]), "");
    }

    #[test]
    fn synchronous_standby_names_lists_peers() {
        let peers = vec![NodeInfo {
            node_id: 2,
            name: "node_2".to_owned(),
            host: "node-2.internal".to_owned(),
            port: 5432,
            lsn: "0/0".to_owned(),
            is_primary: false,
        }];
        assert_eq!(synchronous_standby_names(&peers), "ANY 1 (node_2)");
    }
}
