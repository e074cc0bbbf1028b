//! The expected-status file and its acknowledgement sibling (`spec.md` §4.3,
//! §6, and the MAINTENANCE race fix from §9 / `DESIGN.md`).
//!
//! The file lives under an XDG-style runtime directory keyed by the
//! normalized data-directory path, matching `spec.md` §6's "Expected-status
//! file" paragraph. Invariant 3: only the node-active loop writes it; the LPC
//! only reads it (and writes the `.ack` sibling).

use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, Result, eyre};

use crate::fs::atomic_write;

/// Intent the node-active loop signals to the LPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedStatus {
    /// No opinion; the LPC takes no action (maintenance mode).
    Unknown,
    /// The LPC should run the initialization stage.
    Init,
    /// The LPC must ensure Postgres is not running.
    Stopped,
    /// The LPC must ensure Postgres is running.
    Running,
    /// Stronger form of `Running`: the running Postgres must be a
    /// descendant of the current supervisor.
    RunningAsSubprocess,
}

impl fmt::Display for ExpectedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "UNKNOWN",
            Self::Init => "INIT",
            Self::Stopped => "STOPPED",
            Self::Running => "RUNNING",
            Self::RunningAsSubprocess => "RUNNING_AS_SUBPROCESS",
        })
    }
}

impl FromStr for ExpectedStatus {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim() {
            "UNKNOWN" => Self::Unknown,
            "INIT" => Self::Init,
            "STOPPED" => Self::Stopped,
            "RUNNING" => Self::Running,
            "RUNNING_AS_SUBPROCESS" => Self::RunningAsSubprocess,
            other => return Err(eyre!("unknown expected-status token: {other:?}")),
        })
    }
}

/// The LPC's most recent acknowledgement of an expected status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckStatus(pub ExpectedStatus);

/// Handle to the expected-status file and its `.ack` sibling for one data
/// directory.
#[derive(Debug, Clone)]
pub struct ExpectedStatusFile {
    path: Utf8PathBuf,
    ack_path: Utf8PathBuf,
}

impl ExpectedStatusFile {
    /// Resolves the expected-status file path for `data_dir`.
    ///
    /// Follows the XDG Base Directory fallback chain (`$XDG_RUNTIME_DIR`,
    /// else `/run/user/<uid>`, else a `pg-keeper` subdirectory of the system
    /// temp directory), keyed by a filesystem-safe encoding of the
    /// normalized data directory path so multiple keepers on one host never
    /// collide.
    ///
    /// # Errors
    /// Returns an error if the resolved runtime directory cannot be created.
    pub fn for_data_dir(data_dir: &Utf8Path) -> Result<Self> {
        let normalized = normalize(data_dir);
        let key = encode_path_key(&normalized);

        let runtime_root = runtime_root_dir();
        let dir = runtime_root.join("pg-keeper").join(key);
        crate::fs::ensure_dir_exists(&dir)
            .map_err(|err| eyre!("create keeper runtime directory {dir}: {err}"))?;

        Ok(Self {
            path: dir.join("expected-status"),
            ack_path: dir.join("expected-status.ack"),
        })
    }

    /// The expected-status file path (for diagnostics/tests).
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Writes the expected status. Only the node-active loop should call
    /// this (invariant 3).
    ///
    /// # Errors
    /// Returns an error if the atomic write fails.
    pub fn write(&self, status: ExpectedStatus) -> Result<()> {
        atomic_write(&self.path, status.to_string().as_bytes())
    }

    /// Removes the expected-status file entirely, releasing control to the
    /// operator. Per `DESIGN.md`'s resolution of the MAINTENANCE race, the
    /// node-active loop writes `Unknown` and waits for the ack to catch up
    /// before calling this, rather than unlinking first.
    ///
    /// # Errors
    /// Returns an error if removal fails for a reason other than "already
    /// absent".
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(self.path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove {}", self.path)),
        }
    }

    /// Reads the current expected status. Returns `Unknown` if the file is
    /// absent (LPC's read path).
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed.
    pub fn read(&self) -> Result<ExpectedStatus> {
        match std::fs::read_to_string(self.path.as_std_path()) {
            Ok(contents) => contents.parse(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ExpectedStatus::Unknown),
            Err(err) => Err(err).with_context(|| format!("read {}", self.path)),
        }
    }

    /// Writes the LPC's acknowledgement of the status it last observed and
    /// acted on.
    ///
    /// # Errors
    /// Returns an error if the atomic write fails.
    pub fn write_ack(&self, status: ExpectedStatus) -> Result<()> {
        atomic_write(&self.ack_path, status.to_string().as_bytes())
    }

    /// Reads the LPC's last acknowledgement, if any has been written yet.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed.
    pub fn read_ack(&self) -> Result<Option<AckStatus>> {
        match std::fs::read_to_string(self.ack_path.as_std_path()) {
            Ok(contents) => Ok(Some(AckStatus(contents.parse()?))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", self.ack_path)),
        }
    }
}

/// Resolves the XDG runtime directory root, falling back to a uid-scoped
/// path under `/run/user` and finally the system temp directory.
fn runtime_root_dir() -> Utf8PathBuf {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        if let Ok(path) = Utf8PathBuf::from_path_buf(std::path::PathBuf::from(dir)) {
            return path;
        }
    }

    #[cfg(unix)]
    {
        let uid = nix::unistd::getuid();
        let candidate = Utf8PathBuf::from(format!("/run/user/{uid}"));
        if candidate.as_std_path().is_dir() {
            return candidate;
        }
    }

    Utf8PathBuf::from_path_buf(std::env::temp_dir()).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}

fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    path.components().collect()
}

fn encode_path_key(path: &Utf8Path) -> String {
    path.as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
