//! Per-task agent transcripts.
//!
//! Every line exchanged with an agent process can be appended to
//! `<log_dir>/<task_id>.log`, stamped with an ISO 8601 UTC time. Without a
//! log directory the transcript is a no-op.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};

/// Shared, append-only transcript file.
#[derive(Clone, Default)]
pub struct Transcript {
    file: Arc<Mutex<Option<File>>>,
}

impl Transcript {
    /// Open (or create) `<log_dir>/<id>.log`.
    ///
    /// Failing to open the file disables the transcript instead of failing
    /// the task.
    pub fn open(log_dir: Option<&Path>, id: &str) -> Self {
        let file = log_dir.and_then(|dir| {
            if let Err(e) = std::fs::create_dir_all(dir) {
                log::warn!("Cannot create log dir {}: {}", dir.display(), e);
                return None;
            }
            let path = dir.join(format!("{id}.log"));
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => Some(file),
                Err(e) => {
                    log::warn!("Cannot open transcript {}: {}", path.display(), e);
                    None
                }
            }
        });
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.file.lock().map(|f| f.is_some()).unwrap_or(false)
    }

    /// Append `[timestamp] direction: data`.
    pub fn line(&self, direction: &str, data: &str) {
        if let Ok(mut guard) = self.file.lock() {
            if let Some(file) = guard.as_mut() {
                let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
                let _ = writeln!(file, "[{ts}] {direction}: {data}");
                let _ = file.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn disabled_without_dir() {
        let transcript = Transcript::open(None, "t1");
        assert!(!transcript.is_enabled());
        transcript.line("STDOUT", "ignored");
    }

    #[test]
    fn creates_nested_dir_and_file() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join("logs").join("tasks");
        let transcript = Transcript::open(Some(&log_dir), "t1");
        assert!(transcript.is_enabled());
        assert!(log_dir.join("t1.log").exists());
    }

    #[test]
    fn lines_are_timestamped_and_appended() {
        let dir = tempdir().unwrap();
        let transcript = Transcript::open(Some(dir.path()), "t1");
        transcript.line("PROMPT", "hello");
        Transcript::open(Some(dir.path()), "t1").line("STDOUT", "world");

        let contents = std::fs::read_to_string(dir.path().join("t1.log")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("] PROMPT: hello"));
        assert!(lines[1].ends_with("] STDOUT: world"));

        // [2026-02-04T10:15:30.123Z]
        let ts = &lines[0][1..25];
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[10..11], "T");
        assert_eq!(&ts[19..20], ".");
    }
}
