//! The Local Postgres Controller (`spec.md` §4.2): the only component that
//! starts, stops, or reconfigures the local Postgres instance, driven by the
//! expected-status file the node-active loop writes.
//!
//! Grounded on the teacher crate's `cluster.rs::TestCluster`: a single
//! current-thread Tokio runtime drives `postgresql_embedded::PostgreSQL`'s
//! async `setup`/`start`/`stop`, called synchronously via `block_on` from
//! otherwise-synchronous keeper code. Everything `postgresql_embedded` does
//! not cover (replication slots, `pg_hba.conf`, promotion, rewind) is driven
//! directly against the local Postgres with the `postgres` crate or the
//! bundled command-line tools, the way `pg_auto_failover`'s own keeper does.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, eyre};
use postgresql_embedded::{PostgreSQL, Settings};
use postgres::NoTls;
use tokio::runtime::{Builder, Runtime};
use tracing::warn;

use crate::error::{MonitorResult, PgControlResult, TransitionResult};
use crate::fsm::{Effects, TimelineCheck};
use crate::hba::ReloadTarget;
use crate::observability::LPC_TARGET;
use crate::partition::PartitionProbe;
use crate::state::{ExpectedStatus, ReplicationSource};

/// Owns the embedded Postgres handle and every operation the FSM, the
/// partition detector, and the HBA hook need against the local instance.
pub struct LocalPostgresController {
    runtime: Runtime,
    postgres: PostgreSQL,
    settings: Settings,
    pgdata: Utf8PathBuf,
    running: bool,
}

impl LocalPostgresController {
    /// Builds a controller for the Postgres instance rooted at `pgdata`,
    /// listening on `pgport`.
    ///
    /// # Errors
    /// Returns an error if the Tokio runtime cannot be created.
    pub fn new(
        pgdata: &Utf8Path,
        pgport: u16,
        superuser: &str,
        password: &str,
    ) -> PgControlResult<Self> {
        let mut settings = Settings::default();
        settings.port = pgport;
        settings.username = superuser.to_owned();
        settings.password = password.to_owned();
        settings.data_dir = pgdata.as_std_path().to_path_buf();

        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .context("create Tokio runtime for LocalPostgresController")
            .map_err(crate::error::PgControlError::from)?;

        let postgres = PostgreSQL::new(settings.clone());

        Ok(Self {
            runtime,
            postgres,
            settings,
            pgdata: pgdata.to_owned(),
            running: false,
        })
    }

    /// Converges local Postgres on `expected`, the "ensure current state"
    /// pass described in `spec.md` §4.4's execution policy.
    ///
    /// # Errors
    /// Returns an error if Postgres fails to reach the requested status.
    pub fn ensure_current_state(&mut self, expected: ExpectedStatus) -> PgControlResult<()> {
        match expected {
            ExpectedStatus::Unknown => Ok(()),
            ExpectedStatus::Init => self.initdb_if_absent().map_err(into_pg_control_error),
            ExpectedStatus::Stopped => self.stop_postgres().map_err(into_pg_control_error),
            ExpectedStatus::Running | ExpectedStatus::RunningAsSubprocess => {
                self.start_postgres().map_err(into_pg_control_error)
            }
        }
    }

    /// Whether the controller believes Postgres is currently running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    fn pg_version_file_exists(&self) -> bool {
        self.pgdata.join("PG_VERSION").as_std_path().is_file()
    }

    fn connect(&self) -> TransitionResult<postgres::Client> {
        postgres::Config::new()
            .host("localhost")
            .port(self.settings.port)
            .user(&self.settings.username)
            .password(&self.settings.password)
            .dbname("postgres")
            .connect(NoTls)
            .context("connect to local Postgres")
            .map_err(Into::into)
    }

    fn postmaster_pid(&self) -> Option<i32> {
        let contents = std::fs::read_to_string(self.pgdata.join("postmaster.pid").as_std_path()).ok()?;
        contents.lines().next()?.trim().parse().ok()
    }

    fn bin_path(&self, name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(self.settings.installation_dir.join("bin").join(name))
            .unwrap_or_else(|path| Utf8PathBuf::from(path.to_string_lossy().into_owned()))
    }
}

fn into_pg_control_error(err: crate::error::TransitionError) -> crate::error::PgControlError {
    crate::error::PgControlError::from(color_eyre::Report::from(err))
}

impl Effects for LocalPostgresController {
    fn initdb_if_absent(&mut self) -> TransitionResult<()> {
        if self.pg_version_file_exists() {
            return Ok(());
        }
        self.runtime
            .block_on(self.postgres.setup())
            .context("postgresql_embedded::setup() failed")?;
        Ok(())
    }

    fn ensure_replication_role(&mut self) -> TransitionResult<()> {
        let mut client = self.connect()?;
        client
            .execute(
                "DO $$ BEGIN \
                 IF NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = 'pgautofailover_replicator') THEN \
                 CREATE ROLE pgautofailover_replicator WITH REPLICATION LOGIN; \
                 END IF; END $$;",
                &[],
            )
            .context("create replication role")?;
        Ok(())
    }

    fn start_postgres(&mut self) -> TransitionResult<()> {
        if self.running {
            return Ok(());
        }
        self.runtime
            .block_on(self.postgres.start())
            .context("postgresql_embedded::start() failed")?;
        self.running = true;
        Ok(())
    }

    fn stop_postgres(&mut self) -> TransitionResult<()> {
        if !self.running {
            return Ok(());
        }
        let outcome = self.runtime.block_on(async {
            tokio::time::timeout(Duration::from_secs(15), self.postgres.stop()).await
        });
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(color_eyre::Report::from(err).into()),
            Err(_) => return Err(eyre!("postgresql_embedded::stop() timed out after 15s").into()),
        }
        self.running = false;
        Ok(())
    }

    fn ensure_replication_slot(&mut self, name: &str) -> TransitionResult<()> {
        let mut client = self.connect()?;
        client
            .execute(
                "SELECT pg_create_physical_replication_slot($1) \
                 WHERE NOT EXISTS (SELECT 1 FROM pg_replication_slots WHERE slot_name = $1)",
                &[&name],
            )
            .context("create replication slot")?;
        Ok(())
    }

    fn drop_replication_slots(&mut self) -> TransitionResult<()> {
        let mut client = self.connect()?;
        client
            .execute(
                "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots",
                &[],
            )
            .context("drop replication slots")?;
        Ok(())
    }

    fn ensure_hba_rule_for(&mut self, hostname: &str) -> TransitionResult<()> {
        let hba_path = self.pgdata.join("pg_hba.conf");
        let peer = crate::state::NodeInfo {
            node_id: 0,
            name: hostname.to_owned(),
            host: hostname.to_owned(),
            port: self.settings.port,
            lsn: String::new(),
            is_primary: false,
        };
        crate::hba::refresh(&hba_path, "replication", "pgautofailover_replicator", &[peer], self)
            .map_err(Into::into)
    }

    fn set_synchronous_standby_names(&mut self, value: &str) -> TransitionResult<()> {
        let mut client = self.connect()?;
        client
            .execute(
                "ALTER SYSTEM SET synchronous_standby_names = $1",
                &[&value],
            )
            .context("set synchronous_standby_names")?;
        client
            .execute("SELECT pg_reload_conf()", &[])
            .context("reload after synchronous_standby_names change")?;
        Ok(())
    }

    fn current_lsn(&mut self) -> TransitionResult<String> {
        let mut client = self.connect()?;
        let row = client
            .query_one(
                "SELECT COALESCE(pg_current_wal_lsn()::text, pg_last_wal_replay_lsn()::text)",
                &[],
            )
            .context("query current LSN")?;
        Ok(row.get(0))
    }

    fn try_pg_rewind(&mut self, source: &ReplicationSource) -> TransitionResult<bool> {
        let status = std::process::Command::new(self.bin_path("pg_rewind").as_std_path())
            .arg(format!("--target-pgdata={}", self.pgdata))
            .arg(format!(
                "--source-server=host={} port={} user={} dbname=postgres",
                source.upstream_host, source.upstream_port, source.replication_user
            ))
            .status()
            .context("run pg_rewind")?;
        Ok(status.success())
    }

    fn pg_basebackup(&mut self, source: &ReplicationSource) -> TransitionResult<()> {
        crate::cleanup_helpers::try_remove_dir_all(self.pgdata.as_std_path()).ok();
        let status = std::process::Command::new(self.bin_path("pg_basebackup").as_std_path())
            .arg("-D")
            .arg(self.pgdata.as_std_path())
            .arg("-h")
            .arg(&source.upstream_host)
            .arg("-p")
            .arg(source.upstream_port.to_string())
            .arg("-U")
            .arg(&source.replication_user)
            .status()
            .context("run pg_basebackup")?;
        if !status.success() {
            return Err(eyre!("pg_basebackup exited with {status}").into());
        }
        Ok(())
    }

    fn fetch_wal_to(&mut self, target_lsn: &str) -> TransitionResult<()> {
        let auto_conf = self.pgdata.join("postgresql.auto.conf");
        let addition = format!(
            "\nrecovery_target_lsn = '{target_lsn}'\nrecovery_target_action = 'pause'\nrecovery_target_inclusive = true\n"
        );
        let mut contents = std::fs::read_to_string(auto_conf.as_std_path()).unwrap_or_default();
        contents.push_str(&addition);
        crate::fs::atomic_write(&auto_conf, contents.as_bytes())?;
        self.stop_postgres()?;
        self.start_postgres()
    }

    fn promote_and_checkpoint(&mut self) -> TransitionResult<()> {
        let status = std::process::Command::new(self.bin_path("pg_ctl").as_std_path())
            .arg("promote")
            .arg("-D")
            .arg(self.pgdata.as_std_path())
            .status()
            .context("run pg_ctl promote")?;
        if !status.success() {
            return Err(eyre!("pg_ctl promote exited with {status}").into());
        }
        let mut client = self.connect()?;
        client.execute("CHECKPOINT", &[]).context("checkpoint after promotion")?;
        Ok(())
    }

    fn clear_standby_recovery_settings(&mut self) -> TransitionResult<()> {
        let standby_signal = self.pgdata.join("standby.signal");
        std::fs::remove_file(standby_signal.as_std_path()).ok();
        Ok(())
    }

    fn standby_check_timeline_with_upstream(
        &mut self,
        source: &ReplicationSource,
    ) -> TransitionResult<TimelineCheck> {
        let local = crate::lpc::pg_control::inspect(&self.bin_path("pg_controldata"), &self.pgdata)?;
        let mut upstream_client = postgres::Config::new()
            .host(&source.upstream_host)
            .port(source.upstream_port)
            .user(&source.replication_user)
            .dbname("postgres")
            .connect(NoTls)
            .context("connect to upstream for timeline check")?;
        let row = upstream_client
            .query_one("SELECT timeline_id FROM pg_control_checkpoint()", &[])
            .context("query upstream timeline")?;
        let upstream_timeline: i32 = row.get(0);
        #[expect(
            clippy::cast_possible_wrap,
            reason = "timeline ids are small positive integers in practice"
        )]
        let local_timeline = local.timeline_id as i32;
        if upstream_timeline < local_timeline {
            return Err(eyre!(
                "upstream timeline {upstream_timeline} is behind local timeline {local_timeline}"
            )
            .into());
        }
        if upstream_timeline == local_timeline {
            Ok(TimelineCheck::Caught)
        } else {
            Ok(TimelineCheck::UpstreamAhead)
        }
    }
}

impl ReloadTarget for LocalPostgresController {
    fn reload(&mut self) -> color_eyre::eyre::Result<()> {
        let Some(pid) = self.postmaster_pid() else {
            warn!(target: LPC_TARGET, "no postmaster.pid found, skipping reload");
            return Ok(());
        };
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGHUP)
            .context("send SIGHUP to postmaster")
    }
}

impl PartitionProbe for LocalPostgresController {
    fn has_streaming_replica(&mut self) -> MonitorResult<bool> {
        let mut client = self
            .connect()
            .map_err(|err| crate::error::MonitorError::from(color_eyre::Report::from(err)))?;
        let row = client
            .query_one(
                "SELECT count(*) FROM pg_stat_replication WHERE usename = 'pgautofailover_replicator'",
                &[],
            )
            .context("query pg_stat_replication")
            .map_err(crate::error::MonitorError::from)?;
        let count: i64 = row.get(0);
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_path_joins_installation_dir() {
        let controller = LocalPostgresController::new(
            Utf8Path::new("/var/lib/pg-keeper/data"),
            5432,
            "postgres",
            "",
        )
        .expect("build controller");
        assert!(controller.bin_path("pg_ctl").as_str().ends_with("bin/pg_ctl"));
    }
}
