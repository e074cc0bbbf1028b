//! The supervisor PID file (`spec.md` §4.1, §6).
//!
//! Format: line 1 is the supervisor PID; each following line is
//! `"<pid> <service-name>"`. Invariant 1: exactly one process holds the PID
//! file for a given data directory.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, Result, eyre};
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::fs::atomic_write;

const PID_FILE_NAME: &str = "pg_keeper.pid";

/// Handle to the PID file for one keeper data directory.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: Utf8PathBuf,
}

/// Outcome of attempting to read a supervisor PID file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PidFileState {
    /// No PID file exists.
    Absent,
    /// A PID file exists and its recorded PID is still signalable — another
    /// supervisor owns this data directory.
    LiveOwner {
        /// PID of the live owning process.
        pid: i32,
    },
    /// A PID file exists but its recorded PID is not signalable. It is
    /// stale and safe to remove.
    Stale,
}

impl PidFile {
    /// The PID file path for `data_dir`.
    #[must_use]
    pub fn for_data_dir(data_dir: &Utf8Path) -> Self {
        Self {
            path: data_dir.join(PID_FILE_NAME),
        }
    }

    /// The PID file path (for diagnostics/tests).
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Inspects the current PID file without mutating anything.
    ///
    /// # Errors
    /// Returns an error if the file exists but its first line is not a valid
    /// PID, or if reading fails for a reason other than "not found".
    pub fn inspect(&self) -> Result<PidFileState> {
        let contents = match std::fs::read_to_string(self.path.as_std_path()) {
            Ok(c) => c,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PidFileState::Absent);
            }
            Err(err) => return Err(err).with_context(|| format!("read {}", self.path)),
        };

        let first_line = contents
            .lines()
            .next()
            .ok_or_else(|| eyre!("PID file {} is empty", self.path))?;
        let pid: i32 = first_line
            .trim()
            .parse()
            .with_context(|| format!("parse supervisor PID from {}", self.path))?;

        if is_signalable(pid) {
            Ok(PidFileState::LiveOwner { pid })
        } else {
            Ok(PidFileState::Stale)
        }
    }

    /// Acquires ownership of the PID file for `supervisor_pid`.
    ///
    /// If a stale PID file is found it is removed first. If a live owner is
    /// found this fails with "already running" semantics (invariant 1).
    ///
    /// # Errors
    /// Returns an error if another live supervisor owns this data directory,
    /// or if the file cannot be written.
    pub fn acquire(&self, supervisor_pid: i32) -> Result<()> {
        match self.inspect()? {
            PidFileState::LiveOwner { pid } => {
                return Err(eyre!(
                    "pg-keeper is already running for this data directory (pid {pid})"
                ));
            }
            PidFileState::Stale => {
                std::fs::remove_file(self.path.as_std_path())
                    .with_context(|| format!("remove stale PID file {}", self.path))?;
            }
            PidFileState::Absent => {}
        }
        self.write(supervisor_pid, &BTreeMap::new())
    }

    /// Rewrites the PID file with the current supervisor PID and live
    /// service membership. Called on every membership change (start,
    /// restart, exit) per `spec.md` §4.1.
    ///
    /// # Errors
    /// Returns an error if the atomic write fails.
    pub fn write(&self, supervisor_pid: i32, services: &BTreeMap<String, i32>) -> Result<()> {
        let mut contents = format!("{supervisor_pid}\n");
        for (name, pid) in services {
            contents.push_str(&format!("{pid} {name}\n"));
        }
        atomic_write(&self.path, contents.as_bytes())
    }

    /// Removes the PID file. Called at the end of a clean shutdown.
    ///
    /// # Errors
    /// Returns an error if removal fails for a reason other than "already
    /// absent".
    pub fn release(&self) -> Result<()> {
        match std::fs::remove_file(self.path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove {}", self.path)),
        }
    }

    /// Parses the full PID file, returning (supervisor pid, service name ->
    /// pid map).
    ///
    /// # Errors
    /// Returns an error if the file is absent or malformed.
    pub fn read_full(&self) -> Result<(i32, BTreeMap<String, i32>)> {
        let contents = std::fs::read_to_string(self.path.as_std_path())
            .with_context(|| format!("read {}", self.path))?;
        let mut lines = contents.lines();
        let supervisor_pid: i32 = lines
            .next()
            .ok_or_else(|| eyre!("PID file {} is empty", self.path))?
            .trim()
            .parse()
            .with_context(|| format!("parse supervisor PID from {}", self.path))?;

        let mut services = BTreeMap::new();
        for line in lines {
            let (pid_str, name) = line
                .split_once(' ')
                .ok_or_else(|| eyre!("malformed service line in {}: {line:?}", self.path))?;
            let pid: i32 = pid_str
                .trim()
                .parse()
                .with_context(|| format!("parse service pid in {}", self.path))?;
            services.insert(name.to_owned(), pid);
        }

        Ok((supervisor_pid, services))
    }
}

fn is_signalable(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn absent_when_no_file() {
        let dir = TempDir::new().expect("tempdir");
        let data_dir = Utf8Path::from_path(dir.path()).expect("utf8");
        let pidfile = PidFile::for_data_dir(data_dir);
        assert_eq!(pidfile.inspect().expect("inspect"), PidFileState::Absent);
    }

    #[test]
    fn live_owner_detected_for_current_process() {
        let dir = TempDir::new().expect("tempdir");
        let data_dir = Utf8Path::from_path(dir.path()).expect("utf8");
        let pidfile = PidFile::for_data_dir(data_dir);
        let my_pid = std::process::id() as i32;
        pidfile.write(my_pid, &BTreeMap::new()).expect("write");

        assert_eq!(
            pidfile.inspect().expect("inspect"),
            PidFileState::LiveOwner { pid: my_pid }
        );
    }

    #[test]
    fn stale_pid_is_removed_on_acquire() {
        let dir = TempDir::new().expect("tempdir");
        let data_dir = Utf8Path::from_path(dir.path()).expect("utf8");
        let pidfile = PidFile::for_data_dir(data_dir);

        let dead_pid = spawn_and_reap_child();
        pidfile.write(dead_pid, &BTreeMap::new()).expect("write");
        assert_eq!(pidfile.inspect().expect("inspect"), PidFileState::Stale);

        pidfile.acquire(std::process::id() as i32).expect("acquire");
        assert!(matches!(
            pidfile.inspect().expect("inspect"),
            PidFileState::LiveOwner { .. }
        ));
    }

    /// Spawns and waits on a short-lived child, returning a PID guaranteed to
    /// no longer exist.
    fn spawn_and_reap_child() -> i32 {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id() as i32;
        child.wait().expect("wait for child");
        pid
    }

    #[test]
    fn acquire_fails_against_a_live_owner() {
        let dir = TempDir::new().expect("tempdir");
        let data_dir = Utf8Path::from_path(dir.path()).expect("utf8");
        let pidfile = PidFile::for_data_dir(data_dir);
        let my_pid = std::process::id() as i32;
        pidfile.write(my_pid, &BTreeMap::new()).expect("write");

        assert!(pidfile.acquire(my_pid).is_err());
    }

    #[test]
    fn read_full_round_trips_services() {
        let dir = TempDir::new().expect("tempdir");
        let data_dir = Utf8Path::from_path(dir.path()).expect("utf8");
        let pidfile = PidFile::for_data_dir(data_dir);

        let mut services = BTreeMap::new();
        services.insert("postgres ctl".to_owned(), 111);
        services.insert("node active".to_owned(), 222);
        pidfile.write(42, &services).expect("write");

        let (supervisor_pid, read_services) = pidfile.read_full().expect("read_full");
        assert_eq!(supervisor_pid, 42);
        assert_eq!(read_services, services);
    }
}
