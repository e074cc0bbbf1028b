//! The HBA refresh hook (`spec.md` §4.7): keeps `pg_hba.conf` in sync with
//! the other-node cache, admitting every peer as a replication client.
//!
//! Invoked on reload and whenever the other-node cache changes. Ordering
//! matters: `pg_hba.conf` is rewritten atomically first, and only then is
//! Postgres asked to reload; a reload failure is a warning; the operator may
//! need to intervene, but the keeper keeps running either way.

use camino::Utf8Path;
use color_eyre::eyre::Result;
use tracing::warn;

use crate::fs::atomic_write;
use crate::state::NodeInfo;

/// Marks the block of rules this hook owns, so repeated runs replace rather
/// than append.
const MANAGED_BLOCK_BEGIN: &str = "# pg-keeper: managed replication rules (begin)";
const MANAGED_BLOCK_END: &str = "# pg-keeper: managed replication rules (end)";

/// Something that can ask the local Postgres to reload its configuration
/// without restarting it.
pub trait ReloadTarget {
    /// Issues the reload (`pg_ctl reload` or equivalent).
    ///
    /// # Errors
    /// Returns an error if the reload request could not be sent.
    fn reload(&mut self) -> Result<()>;
}

/// Rewrites `pg_hba.conf` at `hba_path` so every entry in `peers` may connect
/// as `replication_user` to the `replication` and `dbname` databases, then
/// asks `target` to reload. A reload failure is logged and swallowed.
///
/// # Errors
/// Returns an error if `pg_hba.conf` cannot be read or rewritten. Reload
/// failures are not propagated (see module docs).
pub fn refresh(
    hba_path: &Utf8Path,
    dbname: &str,
    replication_user: &str,
    peers: &[NodeInfo],
    target: &mut dyn ReloadTarget,
) -> Result<()> {
    let existing = match std::fs::read_to_string(hba_path.as_std_path()) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err.into()),
    };

    let preserved = strip_managed_block(&existing);
    let managed = render_managed_block(dbname, replication_user, peers);

    let mut rewritten = preserved;
    if !rewritten.is_empty() && !rewritten.ends_with('\n') {
        rewritten.push('\n');
    }
    rewritten.push_str(&managed);

    atomic_write(hba_path, rewritten.as_bytes())?;

    if let Err(err) = target.reload() {
        warn!(error = %err, "pg_hba.conf reload failed; operator intervention may be needed");
    }

    Ok(())
}

fn strip_managed_block(contents: &str) -> String {
    let mut out = String::new();
    let mut in_block = false;
    for line in contents.lines() {
        if line == MANAGED_BLOCK_BEGIN {
            in_block = true;
            continue;
        }
        if line == MANAGED_BLOCK_END {
            in_block = false;
            continue;
        }
        if !in_block {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn render_managed_block(dbname: &str, replication_user: &str, peers: &[NodeInfo]) -> String {
    let mut block = String::new();
    block.push_str(MANAGED_BLOCK_BEGIN);
    block.push('\n');
    for peer in peers {
        let address = hba_address(&peer.host);
        block.push_str(&format!(
            "hostssl replication {replication_user} {address} trust\n"
        ));
        block.push_str(&format!(
            "hostssl {dbname} {replication_user} {address} trust\n"
        ));
    }
    block.push_str(MANAGED_BLOCK_END);
    block.push('\n');
    block
}

/// Renders a peer's host for the address column of an HBA rule. A CIDR mask
/// only makes sense after an IP literal; Postgres rejects `/32` appended to a
/// hostname, so a hostname is emitted bare and only IP literals get a mask.
fn hba_address(host: &str) -> String {
    match host.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(ip)) => format!("{ip}/32"),
        Ok(std::net::IpAddr::V6(ip)) => format!("{ip}/128"),
        Err(_) => host.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct FakeTarget {
        reloaded: bool,
    }

    impl ReloadTarget for FakeTarget {
        fn reload(&mut self) -> Result<()> {
            self.reloaded = true;
            Ok(())
        }
    }

    fn peer(host: &str) -> NodeInfo {
        NodeInfo {
            node_id: 2,
            name: "node_2".to_owned(),
            host: host.to_owned(),
            port: 5432,
            lsn: "0/0".to_owned(),
            is_primary: false,
        }
    }

    #[test]
    fn refresh_writes_rules_and_reloads() {
        let dir = TempDir::new().expect("tempdir");
        let hba_path = Utf8Path::from_path(dir.path()).expect("utf8").join("pg_hba.conf");
        std::fs::write(hba_path.as_std_path(), "# operator rules\nlocal all all trust\n")
            .expect("seed file");

        let mut target = FakeTarget { reloaded: false };
        refresh(&hba_path, "replication", "pgautofailover_replicator", &[peer("10.0.0.2")], &mut target)
            .expect("refresh");

        let written = std::fs::read_to_string(hba_path.as_std_path()).expect("read back");
        assert!(written.contains("local all all trust"));
        assert!(written.contains("10.0.0.2/32"));
        assert!(target.reloaded);
    }

    #[test]
    fn refresh_replaces_stale_managed_block_rather_than_appending() {
        let dir = TempDir::new().expect("tempdir");
        let hba_path = Utf8Path::from_path(dir.path()).expect("utf8").join("pg_hba.conf");
        let mut target = FakeTarget { reloaded: false };

        refresh(&hba_path, "replication", "pgautofailover_replicator", &[peer("10.0.0.2")], &mut target)
            .expect("first refresh");
        refresh(&hba_path, "replication", "pgautofailover_replicator", &[peer("10.0.0.3")], &mut target)
            .expect("second refresh");

        let written = std::fs::read_to_string(hba_path.as_std_path()).expect("read back");
        assert!(!written.contains("10.0.0.2"));
        assert!(written.contains("10.0.0.3"));
    }

    #[test]
    fn refresh_writes_bare_hostnames_without_a_cidr_mask() {
        let dir = TempDir::new().expect("tempdir");
        let hba_path = Utf8Path::from_path(dir.path()).expect("utf8").join("pg_hba.conf");
        let mut target = FakeTarget { reloaded: false };

        refresh(
            &hba_path,
            "replication",
            "pgautofailover_replicator",
            &[peer("node-2.internal")],
            &mut target,
        )
        .expect("refresh");

        let written = std::fs::read_to_string(hba_path.as_std_path()).expect("read back");
        assert!(written.contains("node-2.internal trust"));
        assert!(!written.contains("node-2.internal/32"));
    }
}
