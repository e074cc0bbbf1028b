//! Persisted keeper state (`spec.md` §3).
//!
//! Invariant 2: the state file is always either fully written and syncable
//! or absent; a reader must never observe a partial write. Enforced by
//! [`crate::fs::atomic_write`] (temp file + rename onto the same filesystem),
//! the same discipline the teacher crate uses for its worker IPC payloads.

use camino::Utf8Path;
use color_eyre::eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::fs::atomic_write;
use crate::role::NodeRole;

const STATE_FILE_NAME: &str = "pg_keeper.state";
const CURRENT_VERSION: u32 = 1;

/// The keeper's persisted view of the world, rewritten after every
/// successful tick of the node-active loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeeperState {
    /// On-disk schema version, bumped on incompatible format changes.
    pub version: u32,
    /// Role Postgres is actually in, as last observed/enacted locally.
    pub current_role: NodeRole,
    /// Role the monitor most recently assigned.
    pub assigned_role: NodeRole,
    /// Node id assigned by the monitor. `0` until the first successful
    /// `node_active` call.
    pub current_node_id: u64,
    /// Group id within the formation. `0` until assigned.
    pub current_group: i32,
    /// Last observed local Postgres LSN, as Postgres's own text form
    /// (e.g. `"0/3000060"`).
    pub xlog_location: String,
    /// Unix seconds of the last successful monitor contact. `0` if never.
    pub last_monitor_contact: i64,
    /// Unix seconds of the last observed streaming-standby contact. `0` if
    /// never.
    pub last_secondary_contact: i64,
    /// Initialization stage, used while `current_role == Init`. Opaque to
    /// everything except the transition functions that set it.
    pub init_stage: u32,
    /// Replication slot name the monitor last told this node to use. Empty
    /// until assigned. Tracked so the node-active loop can detect the
    /// `spec.md` §4.4 tie-break (monitor returns a different node/group/slot
    /// identity) and drop/recreate the slot rather than silently adopting it.
    #[serde(default)]
    pub current_slot_name: String,
}

impl Default for KeeperState {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            current_role: NodeRole::Init,
            assigned_role: NodeRole::Init,
            current_node_id: 0,
            current_group: 0,
            xlog_location: String::from("0/0"),
            last_monitor_contact: 0,
            last_secondary_contact: 0,
            init_stage: 0,
            current_slot_name: String::new(),
        }
    }
}

impl KeeperState {
    /// The path the state file lives at under a keeper data directory.
    #[must_use]
    pub fn path(data_dir: &Utf8Path) -> camino::Utf8PathBuf {
        data_dir.join(STATE_FILE_NAME)
    }

    /// Loads the state file, if present.
    ///
    /// # Errors
    /// Returns an error if the file exists but fails to parse, or if reading
    /// it fails for a reason other than "not found".
    pub fn load(data_dir: &Utf8Path) -> Result<Option<Self>> {
        let path = Self::path(data_dir);
        match std::fs::read(path.as_std_path()) {
            Ok(bytes) => {
                let state: Self = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parse keeper state file {path}"))?;
                Ok(Some(state))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read keeper state file {path}")),
        }
    }

    /// Persists this state atomically (write-temp-then-rename).
    ///
    /// # Errors
    /// Returns an error if serialisation or the underlying atomic write
    /// fails.
    pub fn save(&self, data_dir: &Utf8Path) -> Result<()> {
        let path = Self::path(data_dir);
        let bytes =
            serde_json::to_vec_pretty(self).context("serialise keeper state")?;
        atomic_write(&path, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trips_through_disk() {
        let dir = TempDir::new().expect("tempdir");
        let data_dir = Utf8Path::from_path(dir.path()).expect("utf8 path");

        let mut state = KeeperState::default();
        state.current_role = NodeRole::Primary;
        state.assigned_role = NodeRole::Primary;
        state.current_node_id = 7;
        state.current_group = 1;
        state.xlog_location = "0/3000060".to_owned();

        state.save(data_dir).expect("save");
        let loaded = KeeperState::load(data_dir).expect("load").expect("present");
        assert_eq!(loaded, state);
    }

    #[test]
    fn load_returns_none_when_absent() {
        let dir = TempDir::new().expect("tempdir");
        let data_dir = Utf8Path::from_path(dir.path()).expect("utf8 path");
        assert!(KeeperState::load(data_dir).expect("load").is_none());
    }

    #[test]
    fn rewritten_timestamps_do_not_change_other_fields() {
        let dir = TempDir::new().expect("tempdir");
        let data_dir = Utf8Path::from_path(dir.path()).expect("utf8 path");

        let mut state = KeeperState::default();
        state.save(data_dir).expect("save");

        state.last_monitor_contact = 100;
        state.save(data_dir).expect("save again");

        let loaded = KeeperState::load(data_dir).expect("load").expect("present");
        assert_eq!(loaded.last_monitor_contact, 100);
        assert_eq!(loaded.current_role, NodeRole::Init);
    }
}
