//! Integration coverage for [`KeeperState`]'s on-disk round trip
//! (`spec.md` §3, invariant 2), beyond the in-module unit tests: the JSON
//! on disk uses the wire role spellings, and a sequence of saves across a
//! simulated failover leaves only the final state behind.

use camino::{Utf8Path, Utf8PathBuf};
use pg_keeper::role::NodeRole;
use pg_keeper::state::KeeperState;
use tempfile::TempDir;

fn data_dir(tmp: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir")
}

#[test]
fn on_disk_json_uses_wire_role_spellings() {
    let tmp = TempDir::new().expect("tempdir");
    let dir = data_dir(&tmp);

    let mut state = KeeperState::default();
    state.current_role = NodeRole::CatchingUp;
    state.assigned_role = NodeRole::Secondary;
    state.save(&dir).expect("save");

    let raw = std::fs::read_to_string(KeeperState::path(&dir).as_std_path()).expect("read raw");
    assert!(raw.contains("\"catchingup\""));
    assert!(raw.contains("\"secondary\""));
    assert!(!raw.contains("CatchingUp"));
}

#[test]
fn sequential_saves_across_a_simulated_failover_leave_only_the_final_state() {
    let tmp = TempDir::new().expect("tempdir");
    let dir = data_dir(&tmp);

    let sequence = [
        (NodeRole::Init, NodeRole::Single),
        (NodeRole::Single, NodeRole::WaitPrimary),
        (NodeRole::WaitPrimary, NodeRole::Primary),
        (NodeRole::Primary, NodeRole::DemoteTimeout),
        (NodeRole::DemoteTimeout, NodeRole::Demoted),
    ];

    let mut state = KeeperState::default();
    for (current, assigned) in sequence {
        state.current_role = current;
        state.assigned_role = assigned;
        state.save(&dir).expect("save");
    }

    let loaded = KeeperState::load(&dir).expect("load").expect("present");
    assert_eq!(loaded.current_role, NodeRole::DemoteTimeout);
    assert_eq!(loaded.assigned_role, NodeRole::Demoted);

    let entries: Vec<_> = std::fs::read_dir(dir.as_std_path())
        .expect("read_dir")
        .filter_map(Result::ok)
        .collect();
    let state_files = entries
        .iter()
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("pg_keeper.state"))
        .count();
    assert_eq!(state_files, 1, "atomic_write must not leave temp files behind");
}

#[test]
fn version_field_survives_a_round_trip() {
    let tmp = TempDir::new().expect("tempdir");
    let dir = data_dir(&tmp);

    let state = KeeperState::default();
    let original_version = state.version;
    state.save(&dir).expect("save");

    let loaded = KeeperState::load(&dir).expect("load").expect("present");
    assert_eq!(loaded.version, original_version);
}

#[test]
fn absent_state_dir_load_is_none_not_an_error() {
    let tmp = TempDir::new().expect("tempdir");
    let dir = data_dir(&tmp).join("does-not-exist-yet");
    assert!(KeeperState::load(Utf8Path::new(dir.as_str())).expect("load").is_none());
}
