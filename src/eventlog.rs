//! Append-only application event log.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::frame::now_ms;

/// Sink for operator-facing lifecycle events (registration, watch start/stop,
/// peer offline, process exit). Independent of `tracing`, which is for
/// developers.
pub trait EventLog: Send + Sync {
    fn record(&self, category: &str, message: &str, fields: &[&str]);

    /// Full log contents, used by the remote `uploadEventLog` request.
    fn contents(&self) -> std::io::Result<String> {
        Ok(String::new())
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventLog;

impl EventLog for NullEventLog {
    fn record(&self, _category: &str, _message: &str, _fields: &[&str]) {}
}

const DEFAULT_MAX_BYTES: u64 = 10_000;

/// Line-oriented log file that starts over once it grows past a size limit.
#[derive(Debug)]
pub struct FileEventLog {
    path: PathBuf,
    max_bytes: u64,
    lock: Mutex<()>,
}

impl FileEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_bytes: DEFAULT_MAX_BYTES,
            lock: Mutex::new(()),
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let oversized = fs::metadata(&self.path)
            .map(|m| m.len() > self.max_bytes)
            .unwrap_or(false);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(!oversized)
            .truncate(oversized)
            .open(&self.path)?;
        if oversized {
            writeln!(file, "{}  log  truncated", now_ms())?;
        }
        writeln!(file, "{line}")
    }
}

impl EventLog for FileEventLog {
    fn record(&self, category: &str, message: &str, fields: &[&str]) {
        let mut line = format!("{}  {}  {}", now_ms(), category, message);
        for field in fields {
            line.push_str("  ");
            line.push_str(field);
        }
        if let Err(err) = self.append(&line) {
            tracing::warn!(path = %self.path.display(), error = %err, "event log write failed");
        }
    }

    fn contents(&self) -> std::io::Result<String> {
        let _guard = self.lock.lock();
        fs::read_to_string(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_lines_with_fields() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileEventLog::new(dir.path().join("m2m_log/log.txt"));
        log.record("websocket", "open and active", &[]);
        log.record("remote client", "start watch event", &["app-1", "temp"]);
        let text = log.contents().unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with("remote client  start watch event  app-1  temp"));
    }

    #[test]
    fn truncates_past_limit() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileEventLog::new(dir.path().join("log.txt")).with_max_bytes(64);
        for i in 0..10 {
            log.record("test", &format!("entry {i}"), &[]);
        }
        let text = log.contents().unwrap();
        assert!(text.len() < 200);
        assert!(text.contains("entry 9"));
        assert!(!text.contains("entry 0"));
    }
}
