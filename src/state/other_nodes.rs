//! The other-node cache (`spec.md` §3): an ordered snapshot of the rest of
//! the formation, refreshed on group-state change and on entry to
//! `WAIT_STANDBY`.

use serde::{Deserialize, Serialize};

/// A single peer node, as reported by the monitor or read from the
/// monitor-disabled `nodes.json` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Monitor-assigned node id.
    pub node_id: u64,
    /// Node name.
    pub name: String,
    /// Hostname other nodes use to reach this node.
    pub host: String,
    /// Port the node's Postgres listens on.
    pub port: u16,
    /// Last known LSN reported by this node, Postgres's text form.
    pub lsn: String,
    /// Whether this node currently believes it is the primary.
    pub is_primary: bool,
}
