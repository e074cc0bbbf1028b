//! Layered keeper configuration.
//!
//! Mirrors the teacher crate's `PgEnvCfg`: an [`OrthoConfig`]-derived struct
//! that merges, in ascending priority, built-in defaults, a TOML file under
//! the data directory, environment variables (prefix `PGKEEPER`), and CLI
//! flags. See `SPEC_FULL.md` §0.1.

use std::time::Duration;

use camino::Utf8PathBuf;
use color_eyre::eyre::{Context, Result};
use ortho_config::OrthoConfig;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};

/// Restart budget defaults from `spec.md` §4.1: `R` restarts within `T`
/// seconds.
pub const DEFAULT_RESTART_BUDGET_COUNT: usize = 5;
/// Restart budget window in seconds.
pub const DEFAULT_RESTART_BUDGET_WINDOW_SECS: u64 = 10;
/// Default `SLEEP_TIME` between node-active loop iterations (`spec.md` §4.5).
pub const DEFAULT_SLEEP_TIME_SECS: u64 = 5;
/// Default partition timeout (`spec.md` §4.6).
pub const DEFAULT_NETWORK_PARTITION_TIMEOUT_SECS: u64 = 20;
/// Default bound on waiting for the LPC to converge on an expected status.
pub const DEFAULT_ENSURE_STATE_TIMEOUT_SECS: u64 = 10;

/// Layered configuration for a single keeper process.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, OrthoConfig, Default)]
#[ortho_config(prefix = "PGKEEPER")]
pub struct KeeperCfg {
    /// Directory holding the local Postgres data directory plus keeper
    /// runtime files (state file, config file, PID file).
    pub data_dir: Option<Utf8PathBuf>,
    /// `postgres://` URI the keeper uses to reach the monitor. `None` selects
    /// the monitor-disabled mode described in `spec.md` §4.5 step 6.
    pub monitor_uri: Option<String>,
    /// Formation name this node belongs to.
    pub formation: Option<String>,
    /// Group id within the formation. Assigned by the monitor on first
    /// contact when absent.
    pub group: Option<i32>,
    /// Node name as reported to the monitor.
    pub name: Option<String>,
    /// Hostname other nodes use to reach this node's Postgres.
    pub hostname: Option<String>,
    /// Port the local Postgres listens on.
    pub pgport: Option<u16>,
    /// Local Postgres data directory (distinct from `data_dir`, which is the
    /// keeper's own runtime directory).
    pub pgdata: Option<Utf8PathBuf>,
    /// Address the local Postgres binds to.
    pub pghost: Option<String>,
    /// Replication role username.
    pub replication_user: Option<String>,
    /// Replication role password.
    #[serde(default)]
    pub replication_password: Option<SecretString>,
    /// Seconds of lost monitor and standby contact before a primary
    /// self-demotes (`spec.md` §4.6).
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default)]
    pub network_partition_timeout: Option<Duration>,
    /// When set, the keeper reads assigned state from a local `nodes.json`
    /// file instead of calling the monitor (`spec.md` §4.5 step 6).
    #[serde(default)]
    pub monitor_disabled: bool,
    /// Restart budget count (`R` in `spec.md` §4.1).
    #[serde(default)]
    pub restart_budget_count: Option<usize>,
    /// Restart budget window, seconds (`T` in `spec.md` §4.1).
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default)]
    pub restart_budget_window: Option<Duration>,
    /// `SLEEP_TIME` between node-active loop iterations.
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default)]
    pub sleep_time: Option<Duration>,
}

impl KeeperCfg {
    /// Loads configuration via [`OrthoConfig::load`], then validates that the
    /// fields required to run are present.
    ///
    /// # Errors
    /// Returns an error if the underlying layered load fails, or if
    /// `data_dir` is absent once all layers are merged.
    pub fn load_validated() -> Result<Self> {
        let cfg = Self::load().context("failed to load configuration via OrthoConfig")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Confirms the fields the runtime cannot proceed without are present.
    ///
    /// # Errors
    /// Returns an error naming the first missing required field.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.is_none() {
            return Err(color_eyre::eyre::eyre!(
                "data_dir is required (set PGKEEPER_DATA_DIR or --data-dir)"
            ));
        }
        if self.pgdata.is_none() {
            return Err(color_eyre::eyre::eyre!(
                "pgdata is required (set PGKEEPER_PGDATA or --pgdata)"
            ));
        }
        Ok(())
    }

    /// The restart budget count, applying the `spec.md` §4.1 default.
    #[must_use]
    pub fn restart_budget_count(&self) -> usize {
        self.restart_budget_count
            .unwrap_or(DEFAULT_RESTART_BUDGET_COUNT)
    }

    /// The restart budget window, applying the `spec.md` §4.1 default.
    #[must_use]
    pub fn restart_budget_window(&self) -> Duration {
        self.restart_budget_window
            .unwrap_or(Duration::from_secs(DEFAULT_RESTART_BUDGET_WINDOW_SECS))
    }

    /// The node-active loop's sleep time, applying the `spec.md` §4.5 default.
    #[must_use]
    pub fn sleep_time(&self) -> Duration {
        self.sleep_time
            .unwrap_or(Duration::from_secs(DEFAULT_SLEEP_TIME_SECS))
    }

    /// The partition detector's timeout, applying the `spec.md` §4.6 default.
    #[must_use]
    pub fn network_partition_timeout(&self) -> Duration {
        self.network_partition_timeout
            .unwrap_or(Duration::from_secs(DEFAULT_NETWORK_PARTITION_TIMEOUT_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_data_dir_and_pgdata() {
        let cfg = KeeperCfg::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_minimal_complete_config() {
        let cfg = KeeperCfg {
            data_dir: Some(Utf8PathBuf::from("/var/lib/pg-keeper")),
            pgdata: Some(Utf8PathBuf::from("/var/lib/pg-keeper/data")),
            ..KeeperCfg::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn defaults_match_spec() {
        let cfg = KeeperCfg::default();
        assert_eq!(cfg.restart_budget_count(), DEFAULT_RESTART_BUDGET_COUNT);
        assert_eq!(
            cfg.restart_budget_window(),
            Duration::from_secs(DEFAULT_RESTART_BUDGET_WINDOW_SECS)
        );
        assert_eq!(cfg.sleep_time(), Duration::from_secs(DEFAULT_SLEEP_TIME_SECS));
        assert_eq!(
            cfg.network_partition_timeout(),
            Duration::from_secs(DEFAULT_NETWORK_PARTITION_TIMEOUT_SECS)
        );
    }
}
