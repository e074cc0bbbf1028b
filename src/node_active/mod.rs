//! The node-active loop (`spec.md` §4.5): the single-threaded periodic loop
//! that is the sole author of keeper state transitions and the sole caller
//! of the monitor's `node_active` RPC.

mod monitor;

pub use monitor::{MonitorClient, NodeActiveParams, NodeActiveResponse, PgMonitorClient};

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use camino::Utf8PathBuf;

use secrecy::{ExposeSecret, SecretString};

use crate::config::KeeperCfg;
use crate::error::{KeeperError, Result};
use crate::fsm::{Effects, Engine, TransitionCtx};
use crate::lpc::LocalPostgresController;
use crate::observability::{FSM_TARGET, NODE_ACTIVE_TARGET};
use crate::partition::{self, PartitionVerdict};
use crate::role::NodeRole;
use crate::state::{
    ExpectedStatus, ExpectedStatusFile, KeeperState, NodeInfo, PidFile, PidFileState,
    ReplicationSource,
};
use crate::supervisor::SignalState;

use tracing::{info, warn};

/// On-disk stand-in for a monitor reply, consulted when `monitor_disabled`
/// is set (`spec.md` §4.5 step 6).
#[derive(Debug, Clone, serde::Deserialize)]
struct NodesFile {
    assigned_role: NodeRole,
    #[serde(default)]
    nodes: Vec<NodeInfo>,
}

/// Two-level warning hysteresis (`spec.md` §4.5 step 13): a transient error
/// logs once, a recovery logs once, and a continuous error does not
/// re-log every tick.
#[derive(Debug, Default)]
struct ErrorHysteresis {
    currently_failing: bool,
}

impl ErrorHysteresis {
    fn observe_failure(&mut self, context: &str, err: &dyn std::fmt::Display) {
        if !self.currently_failing {
            warn!(target: NODE_ACTIVE_TARGET, %err, "{context} failing");
            self.currently_failing = true;
        }
    }

    fn observe_success(&mut self, context: &str) {
        if self.currently_failing {
            info!(target: NODE_ACTIVE_TARGET, "{context} recovered");
            self.currently_failing = false;
        }
    }
}

/// Drives the node-active loop for one keeper data directory.
pub struct NodeActiveLoop<M: MonitorClient> {
    cfg: KeeperCfg,
    data_dir: Utf8PathBuf,
    engine: Engine,
    lpc: LocalPostgresController,
    monitor: Option<M>,
    expected_status: ExpectedStatusFile,
    pidfile: PidFile,
    start_pid: i32,
    signals: SignalState,
    other_nodes: Vec<NodeInfo>,
    monitor_hysteresis: ErrorHysteresis,
    /// Upstream connection info for the current primary, rebuilt from the
    /// monitor's reply each tick a primary is present in `other_nodes`.
    replication_source: Option<ReplicationSource>,
    /// Target LSN for a bounded catch-up, as last supplied by the monitor.
    target_lsn: Option<String>,
}

impl<M: MonitorClient> NodeActiveLoop<M> {
    /// Builds a loop for `cfg`, verifying the supervisor PID file names
    /// `start_pid` before any work begins.
    ///
    /// # Errors
    /// Returns an error if the Local Postgres Controller cannot be built or
    /// the expected-status runtime directory cannot be created.
    pub fn new(
        cfg: KeeperCfg,
        start_pid: i32,
        signals: SignalState,
        monitor: Option<M>,
    ) -> Result<Self> {
        let data_dir = cfg
            .data_dir
            .clone()
            .ok_or_else(|| KeeperError::BadConfig(crate::error::ConfigError::from(
                color_eyre::eyre::eyre!("data_dir is required"),
            )))?;
        let pgdata = cfg
            .pgdata
            .clone()
            .ok_or_else(|| KeeperError::BadConfig(crate::error::ConfigError::from(
                color_eyre::eyre::eyre!("pgdata is required"),
            )))?;
        let pgport = cfg.pgport.unwrap_or(5432);

        let lpc = LocalPostgresController::new(
            &pgdata,
            pgport,
            cfg.replication_user.as_deref().unwrap_or("postgres"),
            cfg.replication_password
                .as_ref()
                .map(|p| p.expose_secret().to_owned())
                .unwrap_or_default()
                .as_str(),
        )
        .map_err(KeeperError::PgControl)?;

        let expected_status =
            ExpectedStatusFile::for_data_dir(&data_dir).map_err(KeeperError::Internal)?;
        let pidfile = PidFile::for_data_dir(&data_dir);

        Ok(Self {
            cfg,
            data_dir,
            engine: Engine::new(),
            lpc,
            monitor,
            expected_status,
            pidfile,
            start_pid,
            signals,
            other_nodes: Vec::new(),
            monitor_hysteresis: ErrorHysteresis::default(),
            replication_source: None,
            target_lsn: None,
        })
    }

    /// Runs the loop until a shutdown signal is observed or the node is
    /// confirmed `DROPPED`.
    ///
    /// # Errors
    /// Returns [`KeeperError::QuitBySignal`] on a clean signal-driven exit,
    /// [`KeeperError::Dropped`] once `DROPPED` is confirmed, or propagates a
    /// fatal state/monitor error.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if self.signals.take_reload_pending() {
                crate::hba::refresh(
                    &self.data_dir.join("pg_hba.conf"),
                    "replication",
                    self.cfg.replication_user.as_deref().unwrap_or("pgautofailover_replicator"),
                    &self.other_nodes,
                    &mut self.lpc,
                )
                .map_err(KeeperError::Internal)?;
            }

            if self.signals.shutdown_level() != crate::supervisor::ShutdownLevel::None {
                return Err(KeeperError::QuitBySignal);
            }

            if !self.supervisor_still_owns_us()? {
                return Err(KeeperError::AlreadyRunning);
            }

            if self.tick()? {
                return Err(KeeperError::Dropped);
            }

            self.sleep_until_next_tick();
        }
    }

    fn supervisor_still_owns_us(&self) -> Result<bool> {
        match self.pidfile.inspect().map_err(KeeperError::Internal)? {
            PidFileState::LiveOwner { pid } => Ok(pid == self.start_pid),
            PidFileState::Absent | PidFileState::Stale => Ok(false),
        }
    }

    /// Runs one full iteration. Returns `true` once `DROPPED` has been
    /// confirmed with the monitor and the loop should exit.
    fn tick(&mut self) -> Result<bool> {
        let mut state = KeeperState::load(&self.data_dir)
            .map_err(KeeperError::Internal)?
            .unwrap_or_default();

        let is_running = self.lpc.is_running();
        let lsn = self.lpc.current_lsn().unwrap_or_else(|_| "0/0".to_owned());

        let now = unix_now();
        let mut dirty = false;

        let monitor_outcome = self.monitor.as_mut().map(|monitor| {
            monitor.node_active(NodeActiveParams {
                formation: self.cfg.formation.as_deref().unwrap_or("default"),
                name: self.cfg.name.as_deref().unwrap_or("node"),
                pgport: self.cfg.pgport.unwrap_or(5432),
                node_id: state.current_node_id,
                group: state.current_group,
                current_role: state.current_role,
                is_running,
                lsn: &lsn,
                sync_state: None,
            })
        });

        let assigned_role = match monitor_outcome {
            Some(Ok(response)) => {
                self.monitor_hysteresis.observe_success("monitor contact");
                state.last_monitor_contact = now;
                self.reconcile_monitor_identity(&mut state, &response);
                self.target_lsn = response.target_lsn;
                self.other_nodes = response.other_nodes;
                self.replication_source = self.build_replication_source(&state.current_slot_name);
                dirty = true;
                response.assigned_role
            }
            Some(Err(err)) => {
                self.monitor_hysteresis
                    .observe_failure("monitor contact", &err);
                if state.current_role == NodeRole::Primary {
                    self.run_partition_detector(&mut state, now)?;
                }
                state.assigned_role
            }
            None => match self.read_nodes_file() {
                Ok(Some(nodes_file)) => {
                    self.other_nodes = nodes_file.nodes;
                    self.replication_source =
                        self.build_replication_source(&state.current_slot_name);
                    nodes_file.assigned_role
                }
                Ok(None) => state.assigned_role,
                Err(err) => {
                    warn!(target: NODE_ACTIVE_TARGET, %err, "failed to read nodes file");
                    state.assigned_role
                }
            },
        };

        if assigned_role != state.current_role {
            self.converge(&mut state, assigned_role)?;
        } else {
            let _ = self
                .lpc
                .ensure_current_state(self.expected_for(state.current_role));
        }

        if dirty || self.monitor.is_some() {
            state.save(&self.data_dir).map_err(KeeperError::Internal)?;
        }

        Ok(state.current_role == NodeRole::Dropped && state.assigned_role == NodeRole::Dropped)
    }

    fn converge(&mut self, state: &mut KeeperState, assigned_role: NodeRole) -> Result<()> {
        state.assigned_role = assigned_role;

        if assigned_role == NodeRole::Maintenance {
            self.expected_status
                .write(ExpectedStatus::Unknown)
                .map_err(KeeperError::Internal)?;
            // DESIGN.md's resolution of the MAINTENANCE race (`spec.md` §9):
            // wait for the LPC's ack before unlinking, rather than a blind
            // unlink racing the LPC's own read of the file.
            if !self.wait_for_ack(ExpectedStatus::Unknown) {
                warn!(
                    target: NODE_ACTIVE_TARGET,
                    "LPC did not acknowledge UNKNOWN before the bound elapsed; retrying next tick"
                );
                return Ok(());
            }
            self.expected_status.remove().map_err(KeeperError::Internal)?;
            state.current_role = assigned_role;
            return state.save(&self.data_dir).map_err(KeeperError::Internal);
        }

        let entry = self.engine.entry(state.current_role, assigned_role);

        if let Some(entry) = entry {
            if let Some(expected) = entry.expected_pg_status {
                self.expected_status
                    .write(expected)
                    .map_err(KeeperError::Internal)?;
                let _ = self.lpc.ensure_current_state(expected);
            }

            let mut ctx = TransitionCtx {
                effects: &mut self.lpc,
                state,
                other_nodes: &self.other_nodes,
                replication_source: self.replication_source.as_ref(),
                target_lsn: self.target_lsn.as_deref(),
            };
            match (entry.transition)(&mut ctx) {
                Ok(()) => {
                    info!(target: FSM_TARGET, comment = entry.comment, "transition applied");
                }
                Err(err) => {
                    warn!(target: FSM_TARGET, %err, "transition failed, retrying next tick");
                    return Ok(());
                }
            }
        }

        state.current_role = assigned_role;
        state.save(&self.data_dir).map_err(KeeperError::Internal)
    }

    /// Polls the expected-status ack sibling until it reports `expected`,
    /// bounded by `DEFAULT_ENSURE_STATE_TIMEOUT_SECS`. Returns `false` on
    /// timeout so the caller can retry next tick rather than block forever
    /// on a wedged or absent LPC.
    fn wait_for_ack(&self, expected: ExpectedStatus) -> bool {
        let bound = Duration::from_secs(crate::config::DEFAULT_ENSURE_STATE_TIMEOUT_SECS);
        let poll_interval = Duration::from_millis(100);
        let deadline = Instant::now() + bound;

        loop {
            if let Ok(Some(crate::state::AckStatus(acked))) = self.expected_status.read_ack() {
                if acked == expected {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(poll_interval);
        }
    }

    fn run_partition_detector(&mut self, state: &mut KeeperState, now: i64) -> Result<()> {
        let verdict = partition::detect(
            &mut self.lpc,
            now,
            state.last_monitor_contact,
            &mut state.last_secondary_contact,
            self.cfg.network_partition_timeout(),
        )
        .map_err(|err| KeeperError::Internal(color_eyre::Report::from(err)))?;

        if verdict == PartitionVerdict::Unhealthy {
            state.assigned_role = NodeRole::DemoteTimeout;
        }
        Ok(())
    }

    /// Applies the `spec.md` §4.4 tie-break / invariant 4: if the monitor's
    /// node id, group, or replication slot name differs from what this node
    /// has persisted (and it has previously been assigned an identity at
    /// all), the old slot is dropped and a new one matching the monitor's
    /// `slot_name` is created before the new identity is adopted. A failure
    /// here is logged and retried next tick rather than treated as fatal;
    /// the identity fields are still updated so the loop converges once the
    /// slot operations succeed.
    fn reconcile_monitor_identity(&mut self, state: &mut KeeperState, response: &NodeActiveResponse) {
        let had_identity = state.current_node_id != 0;
        let identity_changed = had_identity
            && (response.node_id != state.current_node_id
                || response.group != state.current_group
                || response.slot_name != state.current_slot_name);

        if identity_changed {
            info!(
                target: NODE_ACTIVE_TARGET,
                old_slot = %state.current_slot_name,
                new_slot = %response.slot_name,
                "monitor reassigned node/group/slot identity, resetting replication slot"
            );
            if let Err(err) = self.lpc.drop_replication_slots() {
                warn!(target: NODE_ACTIVE_TARGET, %err, "failed to drop replication slots during identity reset");
            }
            if let Err(err) = self.lpc.ensure_replication_slot(&response.slot_name) {
                warn!(target: NODE_ACTIVE_TARGET, %err, "failed to recreate replication slot during identity reset");
            }
            if self.lpc.is_running() {
                let restarted = self
                    .lpc
                    .stop_postgres()
                    .and_then(|()| self.lpc.start_postgres());
                if let Err(err) = restarted {
                    warn!(target: NODE_ACTIVE_TARGET, %err, "failed to restart postgres during identity reset");
                }
            }
        }

        state.current_node_id = response.node_id;
        state.current_group = response.group;
        state.current_slot_name.clone_from(&response.slot_name);
    }

    /// Builds upstream connection info for `pg_rewind`/`pg_basebackup`/
    /// streaming from the current primary in the other-node cache, if one
    /// is known. Returns `None` until the other-node cache has a primary
    /// (e.g. before the first successful monitor contact).
    fn build_replication_source(&self, slot_name: &str) -> Option<ReplicationSource> {
        let primary = self.other_nodes.iter().find(|node| node.is_primary)?;
        let replication_password = self
            .cfg
            .replication_password
            .as_ref()
            .map(|password| SecretString::from(password.expose_secret().to_owned()))
            .unwrap_or_else(|| SecretString::from(String::new()));

        Some(ReplicationSource {
            upstream_host: primary.host.clone(),
            upstream_port: primary.port,
            replication_user: self
                .cfg
                .replication_user
                .clone()
                .unwrap_or_else(|| "pgautofailover_replicator".to_owned()),
            replication_password,
            slot_name: slot_name.to_owned(),
            max_rate: None,
            backup_dir: self.data_dir.join("basebackup"),
            target_lsn: self.target_lsn.clone(),
            ssl_enabled: false,
            application_name: self.cfg.name.clone().unwrap_or_else(|| "node".to_owned()),
        })
    }

    /// Reads `nodes.json`, the monitor-disabled stand-in for the monitor's
    /// reply (`spec.md` §4.5 step 6): an assigned role plus the other-node
    /// array, maintained by hand or by an external tool when no monitor is
    /// configured.
    fn read_nodes_file(&self) -> Result<Option<NodesFile>> {
        let path = self.data_dir.join("nodes.json");
        match std::fs::read(path.as_std_path()) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| KeeperError::Internal(color_eyre::Report::from(err))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(KeeperError::Internal(color_eyre::Report::from(err))),
        }
    }

    fn expected_for(&self, role: NodeRole) -> ExpectedStatus {
        match role {
            NodeRole::Maintenance | NodeRole::Dropped => ExpectedStatus::Unknown,
            NodeRole::DemoteTimeout | NodeRole::Demoted => ExpectedStatus::Stopped,
            _ => ExpectedStatus::Running,
        }
    }

    fn sleep_until_next_tick(&mut self) {
        let sleep_time = self.cfg.sleep_time();
        if let Some(monitor) = self.monitor.as_mut() {
            let _ = monitor.wait_for_notification(sleep_time);
        } else {
            std::thread::sleep(sleep_time);
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
