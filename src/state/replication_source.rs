//! Replication source configuration (`spec.md` §3): what a standby needs to
//! drive `pg_basebackup` / `primary_conninfo` / `pg_rewind` against an
//! upstream node.

use camino::Utf8PathBuf;
use secrecy::SecretString;

/// Upstream connection and backup parameters for one standby.
#[derive(Debug, Clone)]
pub struct ReplicationSource {
    /// Hostname of the upstream node.
    pub upstream_host: String,
    /// Port of the upstream node's Postgres.
    pub upstream_port: u16,
    /// Replication role username.
    pub replication_user: String,
    /// Replication role password. Kept as [`SecretString`] so it never
    /// appears in `Debug` output or logs, matching the teacher crate's
    /// handling of the superuser password in `PgEnvCfg`.
    pub replication_password: SecretString,
    /// Name of the replication slot this standby should consume.
    pub slot_name: String,
    /// Maximum `pg_basebackup` transfer rate, e.g. `"100M"`. `None` means
    /// unthrottled.
    pub max_rate: Option<String>,
    /// Directory `pg_basebackup` writes into before it is promoted into
    /// place as the data directory.
    pub backup_dir: Utf8PathBuf,
    /// Target LSN for a bounded catch-up (`recovery_target_lsn`), when set.
    pub target_lsn: Option<String>,
    /// Whether to require SSL on the replication connection.
    pub ssl_enabled: bool,
    /// `application_name` reported on the replication connection, used by
    /// the upstream's `synchronous_standby_names` matching.
    pub application_name: String,
}

impl ReplicationSource {
    /// Builds the `primary_conninfo` value Postgres expects in
    /// `postgresql.auto.conf` / `standby.signal` setups.
    #[must_use]
    pub fn primary_conninfo(&self) -> String {
        use secrecy::ExposeSecret;
        let sslmode = if self.ssl_enabled { "require" } else { "prefer" };
        format!(
            "host={} port={} user={} password={} application_name={} sslmode={}",
            self.upstream_host,
            self.upstream_port,
            self.replication_user,
            self.replication_password.expose_secret(),
            self.application_name,
            sslmode,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_conninfo_contains_required_fields() {
        let source = ReplicationSource {
            upstream_host: "node-a.internal".to_owned(),
            upstream_port: 5432,
            replication_user: "pgautofailover_replicator".to_owned(),
            replication_password: SecretString::from("s3cret".to_owned()),
            slot_name: "pgautofailover_standby_2".to_owned(),
            max_rate: None,
            backup_dir: Utf8PathBuf::from("/var/lib/pg-keeper/backup"),
            target_lsn: None,
            ssl_enabled: true,
            application_name: "node_2".to_owned(),
        };

        let conninfo = source.primary_conninfo();
        assert!(conninfo.contains("host=node-a.internal"));
        assert!(conninfo.contains("sslmode=require"));
        assert!(conninfo.contains("application_name=node_2"));
    }
}
