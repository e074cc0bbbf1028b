//! The monitor RPC surface (`spec.md` §4.5 step 6, §6 wire protocol): the
//! single `node_active` SQL call plus the `state`/`log` LISTEN channels.

use std::time::Duration;

use color_eyre::eyre::Context;
use postgres::{Client, NoTls};

use crate::error::MonitorResult;
use crate::role::NodeRole;
use crate::state::NodeInfo;

/// Parameters the keeper reports to the monitor on every tick.
#[derive(Debug, Clone)]
pub struct NodeActiveParams<'a> {
    /// Formation this node belongs to.
    pub formation: &'a str,
    /// Node name.
    pub name: &'a str,
    /// Local Postgres port.
    pub pgport: u16,
    /// Monitor-assigned node id, `0` if not yet assigned.
    pub node_id: u64,
    /// Group id within the formation, `0` if not yet assigned.
    pub group: i32,
    /// The role this node currently believes it holds.
    pub current_role: NodeRole,
    /// Whether the local Postgres is currently running.
    pub is_running: bool,
    /// Current Postgres LSN, as Postgres's text form.
    pub lsn: &'a str,
    /// Current `sync_state` as reported by `pg_stat_replication`, if any.
    pub sync_state: Option<&'a str>,
}

/// What the monitor assigns back in response to `node_active`.
#[derive(Debug, Clone)]
pub struct NodeActiveResponse {
    /// The role the monitor wants this node to converge to.
    pub assigned_role: NodeRole,
    /// Node id, possibly newly assigned on first contact.
    pub node_id: u64,
    /// Group id, possibly newly assigned on first contact.
    pub group: i32,
    /// Replication slot name the monitor wants this node to use.
    pub slot_name: String,
    /// Target LSN for a bounded catch-up, when the monitor has one staged.
    pub target_lsn: Option<String>,
    /// The rest of the formation, as the monitor currently sees it.
    pub other_nodes: Vec<NodeInfo>,
}

/// The monitor RPC surface the node-active loop depends on. Abstracted so
/// tests can supply a fake instead of a live monitor connection.
pub trait MonitorClient {
    /// Invokes `node_active`, the single call per tick that both reports
    /// this node's status and receives its assigned role.
    ///
    /// # Errors
    /// Returns an error if the monitor is unreachable or rejects the call.
    fn node_active(&mut self, params: NodeActiveParams<'_>) -> MonitorResult<NodeActiveResponse>;

    /// Blocks on the `state`/`log` LISTEN channels for up to `timeout`,
    /// returning whether a notification arrived before the timeout elapsed.
    ///
    /// # Errors
    /// Returns an error if the LISTEN connection fails.
    fn wait_for_notification(&mut self, timeout: Duration) -> MonitorResult<bool>;
}

/// [`MonitorClient`] backed by a synchronous `postgres` connection.
pub struct PgMonitorClient {
    client: Client,
}

impl PgMonitorClient {
    /// Connects to the monitor at `uri` and issues `LISTEN` on the state and
    /// log channels.
    ///
    /// # Errors
    /// Returns an error if the connection or the `LISTEN` calls fail.
    pub fn connect(uri: &str) -> MonitorResult<Self> {
        let mut client = Client::connect(uri, NoTls).context("connect to monitor")?;
        client.execute("LISTEN state", &[]).context("LISTEN state")?;
        client.execute("LISTEN log", &[]).context("LISTEN log")?;
        Ok(Self { client })
    }
}

impl MonitorClient for PgMonitorClient {
    fn node_active(&mut self, params: NodeActiveParams<'_>) -> MonitorResult<NodeActiveResponse> {
        #[expect(
            clippy::cast_possible_wrap,
            reason = "node ids fit comfortably in i64 in practice"
        )]
        let node_id_param = params.node_id as i64;
        let row = self
            .client
            .query_one(
                "SELECT assigned_role, node_id, group_id, slot_name, target_lsn \
                 FROM pgautofailover.node_active($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    &params.formation,
                    &params.name,
                    &i32::from(params.pgport),
                    &node_id_param,
                    &params.group,
                    &params.current_role.as_wire_str(),
                    &params.is_running,
                    &params.lsn,
                    &params.sync_state,
                ],
            )
            .context("call pgautofailover.node_active")?;

        let assigned_role: String = row.get(0);
        #[expect(
            clippy::cast_sign_loss,
            reason = "monitor-assigned node/group ids are always non-negative"
        )]
        let node_id = row.get::<_, i64>(1) as u64;
        let group: i32 = row.get(2);
        let slot_name: String = row.get(3);
        let target_lsn: Option<String> = row.get(4);

        let other_nodes_rows = self
            .client
            .query(
                "SELECT node_id, node_name, node_host, node_port, reported_lsn, is_primary \
                 FROM pgautofailover.get_other_nodes($1)",
                &[&node_id_param],
            )
            .context("call pgautofailover.get_other_nodes")?;
        let other_nodes = other_nodes_rows
            .into_iter()
            .map(|row| {
                #[expect(
                    clippy::cast_sign_loss,
                    reason = "peer node ids are always non-negative"
                )]
                let node_id = row.get::<_, i64>(0) as u64;
                let port: i32 = row.get(3);
                NodeInfo {
                    node_id,
                    name: row.get(1),
                    host: row.get(2),
                    #[expect(
                        clippy::cast_sign_loss,
                        clippy::cast_possible_truncation,
                        reason = "Postgres port numbers fit in u16"
                    )]
                    port: port as u16,
                    lsn: row.get(4),
                    is_primary: row.get(5),
                }
            })
            .collect();

        Ok(NodeActiveResponse {
            assigned_role: assigned_role
                .parse()
                .context("parse assigned_role from monitor")?,
            node_id,
            group,
            slot_name,
            target_lsn,
            other_nodes,
        })
    }

    fn wait_for_notification(&mut self, timeout: Duration) -> MonitorResult<bool> {
        let notification = self
            .client
            .notifications()
            .timeout_iter(timeout)
            .next()
            .transpose()
            .context("read monitor notification")?;
        Ok(notification.is_some())
    }
}
