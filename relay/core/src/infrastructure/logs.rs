// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-server log files and the append-only failure log.
//!
//! Upstream stderr output and connection failures are written to plain files
//! under the logs directory — deliberately outside the tracing pipeline so
//! the `tail_log` facade operation and external log-analysis collaborators
//! can read them without a tracing dependency. The failure log is rotated on
//! startup into dated backups; only the most recent backups are kept.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::warn;

use crate::domain::error::{RelayError, Result};

const FAILURE_LOG: &str = "failures.log";
/// Dated failure-log backups kept after rotation.
const FAILURE_BACKUPS_KEPT: usize = 5;

pub struct LogSink {
    logs_dir: PathBuf,
    files: Mutex<HashMap<String, File>>,
    failure: Mutex<File>,
}

impl LogSink {
    pub fn open(logs_dir: &Path) -> Result<Self> {
        fs::create_dir_all(logs_dir).map_err(RelayError::persistence)?;
        rotate_failure_log(logs_dir)?;
        let failure = OpenOptions::new()
            .create(true)
            .append(true)
            .open(logs_dir.join(FAILURE_LOG))
            .map_err(RelayError::persistence)?;
        Ok(Self {
            logs_dir: logs_dir.to_path_buf(),
            files: Mutex::new(HashMap::new()),
            failure: Mutex::new(failure),
        })
    }

    fn server_log_path(&self, server: &str) -> PathBuf {
        // Server names are user-chosen; keep the file name filesystem-safe.
        let safe: String = server
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.logs_dir.join(format!("{safe}.log"))
    }

    /// Append one line to a server's log. Best-effort: log I/O must never
    /// fail the connection hot path.
    pub fn append(&self, server: &str, line: &str) {
        let mut files = self.files.lock();
        let file = match files.entry(server.to_string()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                match OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.server_log_path(server))
                {
                    Ok(f) => e.insert(f),
                    Err(err) => {
                        warn!(server, %err, "failed to open server log");
                        return;
                    }
                }
            }
        };
        let stamped = format!("{} {}\n", Utc::now().to_rfc3339(), line.trim_end());
        if let Err(err) = file.write_all(stamped.as_bytes()) {
            warn!(server, %err, "failed to append to server log");
        }
    }

    /// Last `lines` lines of a server's log.
    pub fn tail(&self, server: &str, lines: usize) -> Result<Vec<String>> {
        let path = self.server_log_path(server);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&path).map_err(RelayError::persistence)?;
        let all: Vec<&str> = text.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].iter().map(|s| s.to_string()).collect())
    }

    /// Append to the failure log (and the server's own log).
    pub fn record_failure(&self, server: &str, message: &str) {
        self.append(server, &format!("FAILURE {message}"));
        let line = format!("{} [{}] {}\n", Utc::now().to_rfc3339(), server, message.trim_end());
        if let Err(err) = self.failure.lock().write_all(line.as_bytes()) {
            warn!(server, %err, "failed to append to failure log");
        }
    }
}

/// Rotate `failures.log` into a dated backup and prune old backups.
fn rotate_failure_log(logs_dir: &Path) -> Result<()> {
    let current = logs_dir.join(FAILURE_LOG);
    if current.exists() && fs::metadata(&current).map(|m| m.len() > 0).unwrap_or(false) {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        fs::rename(&current, logs_dir.join(format!("failures-{stamp}.log")))
            .map_err(RelayError::persistence)?;
    }

    let mut backups: Vec<PathBuf> = fs::read_dir(logs_dir)
        .map_err(RelayError::persistence)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("failures-") && n.ends_with(".log"))
                .unwrap_or(false)
        })
        .collect();
    backups.sort();
    while backups.len() > FAILURE_BACKUPS_KEPT {
        let oldest = backups.remove(0);
        let _ = fs::remove_file(oldest);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_tail_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::open(dir.path()).unwrap();

        for i in 0..10 {
            sink.append("github", &format!("line {i}"));
        }
        let tail = sink.tail("github", 3).unwrap();
        assert_eq!(tail.len(), 3);
        assert!(tail[2].ends_with("line 9"));
    }

    #[test]
    fn tail_of_unknown_server_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::open(dir.path()).unwrap();
        assert!(sink.tail("ghost", 5).unwrap().is_empty());
    }

    #[test]
    fn server_names_are_sanitized_for_paths() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::open(dir.path()).unwrap();
        sink.append("../evil/name", "x");
        assert!(dir.path().join("___evil_name.log").exists());
    }

    #[test]
    fn failure_log_rotates_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let sink = LogSink::open(dir.path()).unwrap();
            sink.record_failure("a", "connection refused");
        }
        // Fabricate a spread of old backups.
        for i in 0..7 {
            fs::write(dir.path().join(format!("failures-2025010{i}-000000.log")), "old").unwrap();
        }
        let _sink = LogSink::open(dir.path()).unwrap();

        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("failures-"))
            .collect();
        assert!(backups.len() <= FAILURE_BACKUPS_KEPT);
    }
}
