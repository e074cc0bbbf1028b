//! Minimal `pg_control` inspection (`spec.md` §4.5 step 5: "pg_control
//! fields (timeline, control_version)").
//!
//! Parses `pg_controldata`'s text output rather than the binary
//! `global/pg_control` file directly: the binary layout is version-specific
//! and undocumented outside Postgres's own source, while `pg_controldata` is
//! bundled alongside every `postgresql_embedded` installation and its text
//! report is a stable, documented interface.

use camino::Utf8Path;
use color_eyre::eyre::{Context, Result, eyre};

/// The subset of `pg_controldata`'s report the keeper needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgControlInfo {
    /// `Latest checkpoint's TimeLineID`.
    pub timeline_id: u32,
    /// `Catalog version number`, used as a coarse compatibility check.
    pub catalog_version: u64,
}

/// Runs `pg_controldata` against `pgdata` and parses its report.
///
/// # Errors
/// Returns an error if the binary cannot be run, exits non-zero, or the
/// expected fields are missing from its output.
pub fn inspect(pg_controldata_bin: &Utf8Path, pgdata: &Utf8Path) -> Result<PgControlInfo> {
    let output = std::process::Command::new(pg_controldata_bin.as_std_path())
        .arg(pgdata.as_std_path())
        .output()
        .with_context(|| format!("run {pg_controldata_bin}"))?;

    if !output.status.success() {
        return Err(eyre!(
            "pg_controldata exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    parse(&text)
}

fn parse(text: &str) -> Result<PgControlInfo> {
    let timeline_id = field_u32(text, "Latest checkpoint's TimeLineID")?;
    let catalog_version = field_u64(text, "Catalog version number")?;
    Ok(PgControlInfo {
        timeline_id,
        catalog_version,
    })
}

fn field_value<'a>(text: &'a str, label: &str) -> Result<&'a str> {
    text.lines()
        .find_map(|line| line.strip_prefix(label)?.strip_prefix(':'))
        .map(str::trim)
        .ok_or_else(|| eyre!("pg_controldata output missing field {label:?}"))
}

fn field_u32(text: &str, label: &str) -> Result<u32> {
    field_value(text, label)?
        .parse()
        .with_context(|| format!("parse {label:?} as u32"))
}

fn field_u64(text: &str, label: &str) -> Result<u64> {
    field_value(text, label)?
        .parse()
        .with_context(|| format!("parse {label:?} as u64"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
pg_control version number:            1300
Catalog version number:               202307071
Database system identifier:           7288841671429263000
Latest checkpoint's TimeLineID:       3
Latest checkpoint's REDO location:    0/3000028
";

    #[test]
    fn parses_timeline_and_catalog_version() {
        let info = parse(SAMPLE).expect("parse");
        assert_eq!(info.timeline_id, 3);
        assert_eq!(info.catalog_version, 202_307_071);
    }

    #[test]
    fn missing_field_is_an_error() {
        assert!(parse("nothing useful here\n").is_err());
    }
}
