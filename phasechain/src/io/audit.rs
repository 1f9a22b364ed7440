//! Append-only JSONL audit trail under the configured audit directory.
//!
//! One self-describing JSON record per line. Files are only ever appended to,
//! and can be reloaded with [`read_records`].

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, Clone)]
pub struct AuditPaths {
    pub dir: PathBuf,
    pub telemetry_path: PathBuf,
    pub validation_path: PathBuf,
    pub termination_path: PathBuf,
}

impl AuditPaths {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            telemetry_path: dir.join("telemetry.jsonl"),
            validation_path: dir.join("validation.jsonl"),
            termination_path: dir.join("termination.jsonl"),
        }
    }
}

/// Append `records` to `path`, one JSON document per line.
pub fn append_records<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create audit dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    for record in records {
        buf.push_str(&serde_json::to_string(record).context("serialize audit record")?);
        buf.push('\n');
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open audit log {}", path.display()))?;
    file.write_all(buf.as_bytes())
        .with_context(|| format!("append audit log {}", path.display()))
}

/// Load every record of a JSONL file. A missing file has no records.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read audit log {}", path.display()))?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), idx + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::role_validator::ValidationRecord;

    fn record(role: &str, ok: bool) -> ValidationRecord {
        ValidationRecord {
            role: role.to_string(),
            text: "text".to_string(),
            ok,
            reason: if ok { "allowed" } else { "no_allow_pattern" }.to_string(),
            guidance: None,
        }
    }

    #[test]
    fn appends_accumulate_and_reload() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = AuditPaths::new(&temp.path().join("audit"));

        append_records(&paths.validation_path, &[record("Coder", true)]).expect("append");
        append_records(&paths.validation_path, &[record("Tester", false)]).expect("append");
        append_records::<ValidationRecord>(&paths.validation_path, &[]).expect("noop");

        let loaded: Vec<ValidationRecord> = read_records(&paths.validation_path).expect("read");
        assert_eq!(loaded, vec![record("Coder", true), record("Tester", false)]);
        let raw = fs::read_to_string(&paths.validation_path).expect("raw");
        assert_eq!(raw.lines().count(), 2);
    }

    #[test]
    fn missing_file_reads_empty_and_bad_lines_report_position() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("termination.jsonl");
        let empty: Vec<ValidationRecord> = read_records(&path).expect("missing");
        assert!(empty.is_empty());

        fs::write(&path, "{\"broken\":\n").expect("write");
        let err = read_records::<ValidationRecord>(&path).expect_err("bad line");
        assert!(format!("{err:#}").contains("line 1"));
    }
}
