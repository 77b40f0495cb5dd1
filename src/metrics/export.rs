//! Metrics artifacts: streaming CSV while running, JSON snapshots on
//! shutdown. Neither format is a stable wire contract; they exist for
//! offline analysis of a run.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

/// Appends rows to `<dir>/<component>_<kind>.csv`, writing the header
/// on first creation.
pub struct CsvAppender {
    path: PathBuf,
    file: File,
}

impl CsvAppender {
    pub fn create(dir: &Path, component: &str, kind: &str, header: &[&str]) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating metrics directory {}", dir.display()))?;
        let path = dir.join(format!("{component}_{kind}.csv"));

        let new_file = !path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;

        if new_file {
            writeln!(file, "{}", header.join(","))
                .with_context(|| format!("writing header to {}", path.display()))?;
        }

        Ok(Self { path, file })
    }

    pub fn append(&mut self, fields: &[String]) -> Result<()> {
        writeln!(self.file, "{}", fields.join(","))
            .with_context(|| format!("appending to {}", self.path.display()))
    }
}

/// Writes a shutdown snapshot to
/// `<dir>/<component>_<kind>_<YYYYMMDD_HHMMSS>.json`.
pub fn write_json_snapshot(
    dir: &Path,
    component: &str,
    kind: &str,
    value: &serde_json::Value,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("creating metrics directory {}", dir.display()))?;

    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("{component}_{kind}_{stamp}.json"));
    let body = serde_json::to_string_pretty(value).context("serializing metrics snapshot")?;
    fs::write(&path, body).with_context(|| format!("writing {}", path.display()))?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_appender_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut a =
            CsvAppender::create(dir.path(), "publisher", "tcp", &["ts", "retransmits"]).unwrap();
        a.append(&["1.0".into(), "5".into()]).unwrap();
        drop(a);

        // Reopening appends without duplicating the header.
        let mut a =
            CsvAppender::create(dir.path(), "publisher", "tcp", &["ts", "retransmits"]).unwrap();
        a.append(&["2.0".into(), "6".into()]).unwrap();

        let text = fs::read_to_string(dir.path().join("publisher_tcp.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["ts,retransmits", "1.0,5", "2.0,6"]);
    }

    #[test]
    fn test_json_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let value = serde_json::json!({"frames_received": 10, "decode_failures": 2});
        let path = write_json_snapshot(dir.path(), "publisher", "counters", &value).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, value);
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("publisher_counters_"));
    }
}
