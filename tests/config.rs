//! Validates [`KeeperCfg`]'s validation rules, defaults, and serialisation,
//! mirroring the teacher crate's `tests/settings.rs` style of constructing
//! the config struct directly rather than exercising the full layered
//! environment/CLI merge (`spec.md` §0.1).

use std::time::Duration;

use camino::Utf8PathBuf;
use pg_keeper::config::{
    DEFAULT_ENSURE_STATE_TIMEOUT_SECS, DEFAULT_NETWORK_PARTITION_TIMEOUT_SECS,
    DEFAULT_RESTART_BUDGET_COUNT, DEFAULT_RESTART_BUDGET_WINDOW_SECS, DEFAULT_SLEEP_TIME_SECS,
    KeeperCfg,
};
use rstest::rstest;
use secrecy::SecretString;

fn minimal_cfg() -> KeeperCfg {
    KeeperCfg {
        data_dir: Some(Utf8PathBuf::from("/var/lib/pg-keeper")),
        pgdata: Some(Utf8PathBuf::from("/var/lib/pg-keeper/data")),
        ..KeeperCfg::default()
    }
}

#[rstest]
fn default_config_fails_validation() {
    assert!(KeeperCfg::default().validate().is_err());
}

#[rstest]
#[case::missing_data_dir(None, Some(Utf8PathBuf::from("/var/lib/pg-keeper/data")))]
#[case::missing_pgdata(Some(Utf8PathBuf::from("/var/lib/pg-keeper")), None)]
fn validate_rejects_either_missing_required_field(
    #[case] data_dir: Option<Utf8PathBuf>,
    #[case] pgdata: Option<Utf8PathBuf>,
) {
    let cfg = KeeperCfg {
        data_dir,
        pgdata,
        ..KeeperCfg::default()
    };
    assert!(cfg.validate().is_err());
}

#[rstest]
fn minimal_cfg_passes_validation() {
    assert!(minimal_cfg().validate().is_ok());
}

#[rstest]
fn getters_apply_spec_defaults_when_unset() {
    let cfg = minimal_cfg();
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
    // Not currently surfaced by a getter, but the constant is part of the
    // public ensure-current-state contract; assert it stays sane.
    assert!(DEFAULT_ENSURE_STATE_TIMEOUT_SECS > 0);
}

#[rstest]
fn getters_honour_explicit_overrides() {
    let cfg = KeeperCfg {
        restart_budget_count: Some(3),
        restart_budget_window: Some(Duration::from_secs(60)),
        sleep_time: Some(Duration::from_secs(1)),
        network_partition_timeout: Some(Duration::from_secs(120)),
        ..minimal_cfg()
    };
    assert_eq!(cfg.restart_budget_count(), 3);
    assert_eq!(cfg.restart_budget_window(), Duration::from_secs(60));
    assert_eq!(cfg.sleep_time(), Duration::from_secs(1));
    assert_eq!(cfg.network_partition_timeout(), Duration::from_secs(120));
}

#[rstest]
fn monitor_disabled_is_a_plain_flag_independent_of_monitor_uri() {
    let cfg = KeeperCfg {
        monitor_disabled: true,
        monitor_uri: None,
        ..minimal_cfg()
    };
    assert!(cfg.validate().is_ok());
    assert!(cfg.monitor_uri.is_none());
}

#[rstest]
fn replication_password_is_never_exposed_via_debug() {
    let cfg = KeeperCfg {
        replication_password: Some(SecretString::from("s3cret".to_owned())),
        ..minimal_cfg()
    };
    let rendered = format!("{cfg:?}");
    assert!(!rendered.contains("s3cret"));
}

#[rstest]
fn serde_round_trips_through_json() -> color_eyre::Result<()> {
    let cfg = KeeperCfg {
        formation: Some("default".to_owned()),
        name: Some("node_1".to_owned()),
        pgport: Some(5433),
        network_partition_timeout: Some(Duration::from_secs(30)),
        ..minimal_cfg()
    };

    let json = serde_json::to_string(&cfg)?;
    let parsed: KeeperCfg = serde_json::from_str(&json)?;

    assert_eq!(parsed.data_dir, cfg.data_dir);
    assert_eq!(parsed.pgdata, cfg.pgdata);
    assert_eq!(parsed.formation, cfg.formation);
    assert_eq!(parsed.name, cfg.name);
    assert_eq!(parsed.pgport, cfg.pgport);
    assert_eq!(
        parsed.network_partition_timeout,
        cfg.network_partition_timeout
    );
    Ok(())
}
