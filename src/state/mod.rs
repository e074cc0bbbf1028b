//! On-disk state and PID bookkeeping (`spec.md` §3, §4.3, §6).

mod expected_status;
mod keeper_state;
mod other_nodes;
mod pidfile;
mod replication_source;

pub use expected_status::{AckStatus, ExpectedStatus, ExpectedStatusFile};
pub use keeper_state::KeeperState;
pub use other_nodes::NodeInfo;
pub use pidfile::{PidFile, PidFileState};
pub use replication_source::ReplicationSource;
