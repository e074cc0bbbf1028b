//! Process supervision (`spec.md` §4.1): starts the Local Postgres Controller
//! and node-active loop as supervised children, restarts them within a
//! ring-buffer budget, and escalates shutdown signals (`TERM` ≤ `INT` ≤
//! `QUIT`) to every live child.

mod restart_budget;
mod service;
mod signals;

pub use restart_budget::RestartBudget;
pub use service::{RestartPolicy, ServiceSpec, StartFn};
pub use signals::{ShutdownLevel, SignalState};

use std::collections::BTreeMap;
use std::process::Child;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use nix::sys::signal::kill;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::error::{KeeperError, Result};
use crate::observability::SUPERVISOR_TARGET;
use crate::state::{PidFile, PidFileState};

/// How long the reap loop sleeps between non-blocking `waitpid` polls.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait after the first shutdown signal before resignalling
/// (`spec.md` §4.1: "if children are still alive after ~5s").
const SHUTDOWN_FIRST_CHECKPOINT: Duration = Duration::from_secs(5);

/// How often to escalate and resignal thereafter (`spec.md` §4.1: "every
/// additional ~10s, escalate").
const SHUTDOWN_ESCALATION_INTERVAL: Duration = Duration::from_secs(10);

/// One supervised child process slot, empty between an exit and its restart.
struct Slot {
    child: Option<Child>,
}

/// Supervises a fixed set of services for one keeper data directory.
///
/// Owns the PID file for the duration of its `run`; only one [`Supervisor`]
/// may hold a given data directory's PID file at a time (invariant 1 of
/// `spec.md` §6).
pub struct Supervisor {
    pidfile: PidFile,
    services: Vec<ServiceSpec>,
    budgets: Vec<RestartBudget>,
    slots: Vec<Slot>,
    signals: SignalState,
}

impl Supervisor {
    /// Claims the PID file for `data_dir` and builds a supervisor for
    /// `services`, each restartable up to `restart_budget_count` times per
    /// `restart_budget_window`.
    ///
    /// # Errors
    /// Returns [`KeeperError::AlreadyRunning`] if another live supervisor
    /// already owns `data_dir`'s PID file, or [`KeeperError::Internal`] if
    /// the PID file cannot be written or signal handlers cannot be
    /// installed.
    pub fn new(
        data_dir: &Utf8PathBuf,
        services: Vec<ServiceSpec>,
        restart_budget_count: usize,
        restart_budget_window: Duration,
    ) -> Result<Self> {
        let pidfile = PidFile::for_data_dir(data_dir);
        if matches!(
            pidfile.inspect().map_err(KeeperError::Internal)?,
            PidFileState::LiveOwner { .. }
        ) {
            return Err(KeeperError::AlreadyRunning);
        }

        pidfile
            .acquire(std::process::id() as i32)
            .map_err(KeeperError::Internal)?;

        let signals = SignalState::install().map_err(KeeperError::Internal)?;

        let budgets = services
            .iter()
            .map(|_| RestartBudget::new(restart_budget_count, restart_budget_window))
            .collect();
        let slots = services.iter().map(|_| Slot { child: None }).collect();

        Ok(Self {
            pidfile,
            services,
            budgets,
            slots,
            signals,
        })
    }

    /// Starts every service in declaration order, then reaps and restarts
    /// children until a shutdown signal is received, a `Transient` service
    /// exits cleanly, or a restart budget is exhausted.
    ///
    /// # Errors
    /// Returns [`KeeperError::RestartBudgetExhausted`] if a service's restart
    /// budget runs out, or [`KeeperError::QuitBySignal`] once the process has
    /// forwarded a shutdown signal to every child and they have exited.
    pub fn run(&mut self) -> Result<()> {
        self.start_all()?;

        loop {
            let level = self.signals.shutdown_level();
            if level != ShutdownLevel::None {
                self.stop_all(level)?;
                return Err(KeeperError::QuitBySignal);
            }

            if self.signals.take_reload_pending() {
                self.forward_to_all(nix::sys::signal::Signal::SIGHUP);
            }

            if let Some(outcome) = self.reap_one()? {
                if outcome == ReapOutcome::CleanShutdownRequested {
                    self.stop_all(ShutdownLevel::Term)?;
                    return Ok(());
                }
            }

            std::thread::sleep(REAP_POLL_INTERVAL);
        }
    }

    fn start_all(&mut self) -> Result<()> {
        for index in 0..self.services.len() {
            self.start_one(index)?;
        }
        self.rewrite_pidfile()
    }

    fn start_one(&mut self, index: usize) -> Result<()> {
        let name = self.services[index].name.clone();
        let child = (self.services[index].start_fn)()
            .map_err(KeeperError::Internal)
            .map_err(|err| {
                warn!(target: SUPERVISOR_TARGET, service = %name, "failed to start service");
                err
            })?;
        info!(target: SUPERVISOR_TARGET, service = %name, pid = child.id(), "service started");
        self.slots[index].child = Some(child);
        Ok(())
    }

    fn rewrite_pidfile(&self) -> Result<()> {
        let mut services = BTreeMap::new();
        for (spec, slot) in self.services.iter().zip(&self.slots) {
            if let Some(child) = &slot.child {
                services.insert(spec.name.clone(), child.id() as i32);
            }
        }
        self.pidfile
            .write(std::process::id() as i32, &services)
            .map_err(KeeperError::Internal)
    }

    /// Polls every live child once without blocking, applying restart policy
    /// to any that have exited. Returns `Some(CleanShutdownRequested)` if a
    /// `Transient` service exited successfully, signalling the caller to
    /// stop everything else and return.
    fn reap_one(&mut self) -> Result<Option<ReapOutcome>> {
        for index in 0..self.slots.len() {
            let Some(child) = self.slots[index].child.as_ref() else {
                continue;
            };
            let pid = Pid::from_raw(child.id() as i32);
            let status = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => continue,
                Ok(status) => status,
                Err(err) => {
                    warn!(target: SUPERVISOR_TARGET, %err, "waitpid failed");
                    continue;
                }
            };

            let name = self.services[index].name.clone();
            let exited_clean = matches!(status, WaitStatus::Exited(_, 0));
            self.slots[index].child = None;
            info!(
                target: SUPERVISOR_TARGET,
                service = %name,
                exited_clean,
                "service exited"
            );

            match self.services[index].restart_policy {
                RestartPolicy::Temporary => {
                    self.rewrite_pidfile()?;
                }
                RestartPolicy::Transient if exited_clean => {
                    return Ok(Some(ReapOutcome::CleanShutdownRequested));
                }
                RestartPolicy::Transient | RestartPolicy::Permanent => {
                    self.restart_or_exhaust(index)?;
                }
            }
        }
        Ok(None)
    }

    fn restart_or_exhaust(&mut self, index: usize) -> Result<()> {
        let now = Instant::now();
        if !self.budgets[index].allows_restart(now) {
            let name = self.services[index].name.clone();
            warn!(target: SUPERVISOR_TARGET, service = %name, "restart budget exhausted");
            return Err(KeeperError::RestartBudgetExhausted);
        }
        self.budgets[index].record(now);
        self.start_one(index)?;
        self.rewrite_pidfile()
    }

    /// Sends `signal` to every live child, in reverse start order.
    fn forward_to_all(&self, signal: nix::sys::signal::Signal) {
        for index in (0..self.slots.len()).rev() {
            let Some(child) = self.slots[index].child.as_ref() else {
                continue;
            };
            let pid = Pid::from_raw(child.id() as i32);
            if let Err(err) = kill(pid, signal) {
                warn!(target: SUPERVISOR_TARGET, %err, "failed to signal child");
            }
        }
    }

    /// Non-blocking reap pass over every live child, used while waiting out
    /// a shutdown; clears slots for children that have already exited.
    fn reap_exited_during_shutdown(&mut self) {
        for index in 0..self.slots.len() {
            let Some(child) = self.slots[index].child.as_ref() else {
                continue;
            };
            let pid = Pid::from_raw(child.id() as i32);
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(_) => {}
                Ok(_) => self.slots[index].child = None,
            }
        }
    }

    fn any_child_alive(&self) -> bool {
        self.slots.iter().any(|slot| slot.child.is_some())
    }

    /// Forwards `level`'s shutdown signal, polling non-blockingly until
    /// every child has exited, escalating (`spec.md` §4.1: TERM ≤ INT ≤
    /// QUIT) if children are still alive 5s after the first signal and
    /// every 10s thereafter.
    fn stop_all(&mut self, level: ShutdownLevel) -> Result<()> {
        let Some(signal) = level.forwarded_signal() else {
            return Ok(());
        };
        let mut current = level;
        self.forward_to_all(signal);

        let mut waited = Duration::ZERO;
        let mut next_checkpoint = SHUTDOWN_FIRST_CHECKPOINT;

        while self.any_child_alive() {
            std::thread::sleep(REAP_POLL_INTERVAL);
            waited += REAP_POLL_INTERVAL;
            self.reap_exited_during_shutdown();

            if self.any_child_alive() && waited >= next_checkpoint {
                current = current.escalate_once();
                if let Some(signal) = current.forwarded_signal() {
                    warn!(
                        target: SUPERVISOR_TARGET,
                        ?current,
                        "children still alive past shutdown checkpoint, escalating"
                    );
                    self.forward_to_all(signal);
                }
                next_checkpoint += SHUTDOWN_ESCALATION_INTERVAL;
            }
        }

        self.pidfile.release().map_err(KeeperError::Internal)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let _ = self.pidfile.release();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReapOutcome {
    CleanShutdownRequested,
}
