//! `pg-keeper` CLI entry point (`spec.md` §6).
//!
//! Subcommands: `run` (start the supervisor), `stop` (signal a running
//! supervisor), `reload` (SIGHUP it), `status` (read the PID file), `fsm`
//! (the in-scope FSM diagnostic surface named in `SPEC_FULL.md` §0.5), and
//! the hidden `internal-service` subcommand the supervisor re-execs itself
//! into for each supervised child — the in-process replacement for the
//! teacher's self-reexec "do service" pattern (`DESIGN.md`).

use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use pg_keeper::config::KeeperCfg;
use pg_keeper::error::{KeeperError, Result};
use pg_keeper::fsm::{Engine, TransitionCtx};
use pg_keeper::lpc::LocalPostgresController;
use pg_keeper::node_active::{NodeActiveLoop, PgMonitorClient};
use pg_keeper::observability::init_tracing;
use pg_keeper::role::NodeRole;
use pg_keeper::state::{KeeperState, NodeInfo, PidFile, PidFileState, ReplicationSource};
use pg_keeper::supervisor::{RestartPolicy, ServiceSpec, SignalState, Supervisor};
use secrecy::{ExposeSecret, SecretString};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pg-keeper", version, about = "Per-node keeper agent for a primary/standby PostgreSQL cluster")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the supervisor for this data directory.
    Run,
    /// Signal a running supervisor to shut down.
    Stop {
        /// Escalate straight to SIGINT (fast shutdown).
        #[arg(long)]
        fast: bool,
        /// Escalate straight to SIGQUIT (immediate shutdown).
        #[arg(long)]
        immediate: bool,
        /// Send SIGKILL to the process group. Requires `PGKEEPER_DEBUG=1`.
        #[arg(long)]
        sigkill: bool,
    },
    /// Send `SIGHUP` to a running supervisor.
    Reload,
    /// Report the supervisor's PID-file contents.
    Status {
        /// Emit JSON instead of plain text.
        #[arg(long)]
        json: bool,
    },
    /// FSM diagnostics (`SPEC_FULL.md` §0.5): exercise the transition table
    /// without running the full node-active loop.
    Fsm {
        #[command(subcommand)]
        action: FsmAction,
    },
    /// Hidden: run a single supervised child in-process. Spawned by `run`
    /// via a re-exec of the current binary; not intended for direct use.
    #[command(hide = true)]
    InternalService { service: ServiceKind },
}

#[derive(Subcommand)]
enum FsmAction {
    /// List every `(current, assigned)` pair the transition table covers.
    List,
    /// Print the table entry for `current -> assigned`, if any.
    Assign {
        current: RoleArg,
        assigned: RoleArg,
    },
    /// Run one step of the node-active loop's convergence logic against the
    /// on-disk state file, without contacting the monitor. Peer and
    /// replication-source info is read from `nodes.json` (the same
    /// monitor-disabled stand-in the node-active loop itself consumes), so a
    /// transition that needs a primary (`rewind_or_init`) or a target LSN
    /// (`prepare_standby_for_promotion`) can only succeed once that file
    /// carries the matching data.
    Step {
        /// Target LSN for `prepare_standby_for_promotion`, overriding
        /// anything already persisted in the state file.
        #[arg(long)]
        target_lsn: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ServiceKind {
    Lpc,
    NodeActive,
}

#[derive(Clone, Copy)]
struct RoleArg(NodeRole);

impl std::str::FromStr for RoleArg {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<NodeRole>().map(RoleArg).map_err(|err| err.to_string())
    }
}

fn main() -> ExitCode {
    color_eyre::install().ok();
    init_tracing();

    let cli = Cli::parse();
    match dispatch(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "pg-keeper exiting");
            #[expect(
                clippy::cast_sign_loss,
                reason = "exit_code() returns a small positive code table"
            )]
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Run => run(),
        Command::Stop {
            fast,
            immediate,
            sigkill,
        } => stop(fast, immediate, sigkill),
        Command::Reload => reload(),
        Command::Status { json } => status(json),
        Command::Fsm { action } => fsm(action),
        Command::InternalService { service } => internal_service(service),
    }
}

fn load_cfg() -> Result<KeeperCfg> {
    KeeperCfg::load_validated().map_err(|err| KeeperError::BadConfig(err.into()))
}

fn run() -> Result<()> {
    let cfg = load_cfg()?;
    let data_dir = cfg.data_dir.clone().ok_or_else(|| {
        KeeperError::BadConfig(color_eyre::eyre::eyre!("data_dir is required").into())
    })?;

    let exe = std::env::current_exe().map_err(|err| KeeperError::Internal(err.into()))?;

    let services = vec![
        ServiceSpec {
            name: "postgres ctl".to_owned(),
            restart_policy: RestartPolicy::Permanent,
            start_fn: spawn_internal_service(exe.clone(), "lpc"),
        },
        ServiceSpec {
            name: "node active".to_owned(),
            restart_policy: RestartPolicy::Permanent,
            start_fn: spawn_internal_service(exe, "node-active"),
        },
    ];

    let mut supervisor = Supervisor::new(
        &data_dir,
        services,
        cfg.restart_budget_count(),
        cfg.restart_budget_window(),
    )?;
    info!("supervisor starting");
    supervisor.run()
}

fn spawn_internal_service(
    exe: std::path::PathBuf,
    service: &'static str,
) -> Box<dyn Fn() -> color_eyre::eyre::Result<std::process::Child> + Send> {
    Box::new(move || {
        std::process::Command::new(&exe)
            .arg("internal-service")
            .arg(service)
            .env("PGKEEPER_SUPERVISOR_PID", std::process::id().to_string())
            .spawn()
            .map_err(Into::into)
    })
}

fn internal_service(service: ServiceKind) -> Result<()> {
    let cfg = load_cfg()?;
    let start_pid = std::env::var("PGKEEPER_SUPERVISOR_PID")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| std::process::id() as i32);
    let signals = SignalState::install().map_err(KeeperError::Internal)?;

    match service {
        ServiceKind::Lpc => run_lpc_service(&cfg, &signals),
        ServiceKind::NodeActive => {
            let monitor = if cfg.monitor_disabled {
                None
            } else {
                match cfg.monitor_uri.as_deref() {
                    Some(uri) => {
                        Some(PgMonitorClient::connect(uri).map_err(KeeperError::MonitorUnreachable)?)
                    }
                    None => None,
                }
            };
            let mut loop_ = NodeActiveLoop::new(cfg, start_pid, signals, monitor)?;
            loop_.run()
        }
    }
}

/// Runs the LPC as a standalone supervised child: periodically reconciles
/// actual Postgres status against the expected-status file (`spec.md`
/// §4.2). The convergence itself is driven through
/// [`LocalPostgresController::ensure_current_state`], the same entry point
/// the node-active loop calls in-process during FSM transitions; here it
/// runs on its own cadence so Postgres stays aligned even between
/// node-active ticks.
fn run_lpc_service(cfg: &KeeperCfg, signals: &SignalState) -> Result<()> {
    use pg_keeper::state::ExpectedStatusFile;
    use std::time::Duration;

    let data_dir = cfg.data_dir.clone().ok_or_else(|| {
        KeeperError::BadConfig(color_eyre::eyre::eyre!("data_dir is required").into())
    })?;
    let pgdata = cfg.pgdata.clone().ok_or_else(|| {
        KeeperError::BadConfig(color_eyre::eyre::eyre!("pgdata is required").into())
    })?;
    let mut controller = LocalPostgresController::new(
        &pgdata,
        cfg.pgport.unwrap_or(5432),
        cfg.replication_user.as_deref().unwrap_or("postgres"),
        "",
    )
    .map_err(KeeperError::PgControl)?;
    let expected_status =
        ExpectedStatusFile::for_data_dir(&data_dir).map_err(KeeperError::Internal)?;

    loop {
        if signals.shutdown_level() != pg_keeper::supervisor::ShutdownLevel::None {
            return Err(KeeperError::QuitBySignal);
        }
        if let Ok(expected) = expected_status.read() {
            let _ = controller.ensure_current_state(expected);
            let _ = expected_status.write_ack(expected);
        }
        std::thread::sleep(Duration::from_millis(500));
    }
}

fn stop(fast: bool, immediate: bool, sigkill: bool) -> Result<()> {
    let cfg = load_cfg()?;
    let data_dir = cfg.data_dir.clone().ok_or_else(|| {
        KeeperError::BadConfig(color_eyre::eyre::eyre!("data_dir is required").into())
    })?;
    let pidfile = PidFile::for_data_dir(&data_dir);
    let pid = match pidfile.inspect().map_err(KeeperError::Internal)? {
        PidFileState::LiveOwner { pid } => pid,
        PidFileState::Absent | PidFileState::Stale => {
            return Err(KeeperError::Internal(color_eyre::eyre::eyre!(
                "no running supervisor for this data directory"
            )));
        }
    };

    let signal = if sigkill {
        if std::env::var("PGKEEPER_DEBUG").as_deref() != Ok("1") {
            return Err(KeeperError::BadArgs(color_eyre::eyre::eyre!(
                "--sigkill requires PGKEEPER_DEBUG=1"
            )));
        }
        Signal::SIGKILL
    } else if immediate {
        Signal::SIGQUIT
    } else if fast {
        Signal::SIGINT
    } else {
        Signal::SIGTERM
    };

    kill(Pid::from_raw(pid), signal).map_err(|err| KeeperError::Internal(err.into()))
}

fn reload() -> Result<()> {
    let cfg = load_cfg()?;
    let data_dir = cfg.data_dir.clone().ok_or_else(|| {
        KeeperError::BadConfig(color_eyre::eyre::eyre!("data_dir is required").into())
    })?;
    let pidfile = PidFile::for_data_dir(&data_dir);
    let pid = match pidfile.inspect().map_err(KeeperError::Internal)? {
        PidFileState::LiveOwner { pid } => pid,
        PidFileState::Absent | PidFileState::Stale => {
            return Err(KeeperError::Internal(color_eyre::eyre::eyre!(
                "no running supervisor for this data directory"
            )));
        }
    };
    kill(Pid::from_raw(pid), Signal::SIGHUP).map_err(|err| KeeperError::Internal(err.into()))
}

#[expect(
    clippy::print_stdout,
    reason = "status is a CLI reporting command; stdout is its documented output channel"
)]
fn status(json: bool) -> Result<()> {
    let cfg = load_cfg()?;
    let data_dir = cfg.data_dir.clone().ok_or_else(|| {
        KeeperError::BadConfig(color_eyre::eyre::eyre!("data_dir is required").into())
    })?;
    let pidfile = PidFile::for_data_dir(&data_dir);
    let (supervisor_pid, services) = pidfile.read_full().map_err(KeeperError::Internal)?;

    if json {
        let services_json: Vec<String> = services
            .iter()
            .map(|(name, pid)| format!("{{\"name\":\"{name}\",\"pid\":{pid}}}"))
            .collect();
        println!(
            "{{\"supervisor_pid\":{supervisor_pid},\"pgport\":{},\"services\":[{}]}}",
            cfg.pgport.unwrap_or(5432),
            services_json.join(",")
        );
    } else {
        println!("supervisor pid: {supervisor_pid}");
        println!("pgport: {}", cfg.pgport.unwrap_or(5432));
        for (name, pid) in &services {
            println!("  {name}: {pid}");
        }
    }
    Ok(())
}

#[expect(
    clippy::print_stdout,
    reason = "fsm is a CLI diagnostic command; stdout is its documented output channel"
)]
fn fsm(action: FsmAction) -> Result<()> {
    let engine = Engine::new();
    match action {
        FsmAction::List => {
            for current in NodeRole::ALL {
                for assigned in NodeRole::ALL {
                    if let Some(entry) = engine.entry(current, assigned) {
                        println!("{current} -> {assigned}: {}", entry.comment);
                    }
                }
            }
            Ok(())
        }
        FsmAction::Assign { current, assigned } => {
            match engine.entry(current.0, assigned.0) {
                Some(entry) => println!(
                    "{} -> {}: {} (expected_pg_status={:?})",
                    current.0, assigned.0, entry.comment, entry.expected_pg_status
                ),
                None => println!("{} -> {}: no table entry", current.0, assigned.0),
            }
            Ok(())
        }
        FsmAction::Step { target_lsn } => {
            let cfg = load_cfg()?;
            let data_dir = cfg.data_dir.clone().ok_or_else(|| {
                KeeperError::BadConfig(color_eyre::eyre::eyre!("data_dir is required").into())
            })?;
            let pgdata = cfg.pgdata.clone().ok_or_else(|| {
                KeeperError::BadConfig(color_eyre::eyre::eyre!("pgdata is required").into())
            })?;
            let mut state = KeeperState::load(&data_dir)
                .map_err(KeeperError::Internal)?
                .unwrap_or_default();
            let mut controller = LocalPostgresController::new(
                &pgdata,
                cfg.pgport.unwrap_or(5432),
                cfg.replication_user.as_deref().unwrap_or("postgres"),
                "",
            )
            .map_err(KeeperError::PgControl)?;

            let Some(entry) = engine.entry(state.current_role, state.assigned_role) else {
                println!("no table entry for {} -> {}", state.current_role, state.assigned_role);
                return Ok(());
            };

            let other_nodes = read_nodes_file(&data_dir)?;
            let replication_source =
                build_replication_source(&cfg, &other_nodes, &state.current_slot_name, target_lsn.as_deref());

            let mut ctx = TransitionCtx {
                effects: &mut controller,
                state: &mut state,
                other_nodes: &other_nodes,
                replication_source: replication_source.as_ref(),
                target_lsn: target_lsn.as_deref(),
            };
            (entry.transition)(&mut ctx).map_err(|err| KeeperError::Internal(err.into()))?;
            state.current_role = state.assigned_role;
            state.save(&data_dir).map_err(KeeperError::Internal)?;
            println!("stepped to {}", state.current_role);
            Ok(())
        }
    }
}

/// Minimal mirror of the node-active loop's `nodes.json` schema (only the
/// fields this diagnostic needs).
#[derive(serde::Deserialize)]
struct NodesFile {
    #[serde(default)]
    nodes: Vec<NodeInfo>,
}

fn read_nodes_file(data_dir: &camino::Utf8Path) -> Result<Vec<NodeInfo>> {
    let path = data_dir.join("nodes.json");
    match std::fs::read(path.as_std_path()) {
        Ok(bytes) => {
            let file: NodesFile = serde_json::from_slice(&bytes)
                .map_err(|err| KeeperError::Internal(color_eyre::Report::from(err)))?;
            Ok(file.nodes)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(KeeperError::Internal(color_eyre::Report::from(err))),
    }
}

/// Builds a `ReplicationSource` from the `is_primary` peer in `other_nodes`,
/// the same way the node-active loop does, so `fsm step` can actually drive
/// `rewind_or_init`/`prepare_standby_for_promotion` against a hand-maintained
/// `nodes.json` rather than failing those transitions unconditionally.
fn build_replication_source(
    cfg: &KeeperCfg,
    other_nodes: &[NodeInfo],
    slot_name: &str,
    target_lsn: Option<&str>,
) -> Option<ReplicationSource> {
    let primary = other_nodes.iter().find(|node| node.is_primary)?;
    let replication_password = cfg
        .replication_password
        .as_ref()
        .map(|password| SecretString::from(password.expose_secret().to_owned()))
        .unwrap_or_else(|| SecretString::from(String::new()));

    Some(ReplicationSource {
        upstream_host: primary.host.clone(),
        upstream_port: primary.port,
        replication_user: cfg
            .replication_user
            .clone()
            .unwrap_or_else(|| "pgautofailover_replicator".to_owned()),
        replication_password,
        slot_name: slot_name.to_owned(),
        max_rate: None,
        backup_dir: cfg
            .data_dir
            .clone()
            .unwrap_or_else(|| camino::Utf8PathBuf::from("."))
            .join("basebackup"),
        target_lsn: target_lsn.map(ToOwned::to_owned),
        ssl_enabled: false,
        application_name: cfg.name.clone().unwrap_or_else(|| "node".to_owned()),
    })
}
