//! The Log Store (C3): one append-only file per `(plan_id, node_id, attempt)`,
//! with an in-memory tail for live inspection.
//!
//! Each running attempt owns a single open `File` handle; nothing else
//! writes to that path concurrently.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use weave_exec::LogSink;

use crate::ids::{NodeId, PlanId};

const TAIL_CAPACITY: usize = 500;

/// Build the on-disk path for one attempt's log file.
#[must_use]
pub fn log_file_path(workspace_root: &Path, plan_id: PlanId, node_id: NodeId, attempt: u32) -> PathBuf {
    workspace_root
        .join(".orchestrator")
        .join("logs")
        .join(plan_id.to_string())
        .join(format!("{node_id}-{attempt:04}.log"))
}

/// A [`LogSink`] that appends every line to a file, tagged with a phase
/// banner on transitions, while keeping the most recent lines in memory for
/// live status queries.
pub struct AttemptLog {
    file: File,
    path: PathBuf,
    tail: VecDeque<String>,
}

impl AttemptLog {
    /// Create (truncating any stale file at the same path) the log file for
    /// one attempt, creating parent directories as needed.
    ///
    /// # Errors
    /// Returns an I/O error if the parent directory or file cannot be created.
    pub fn create(path: PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).truncate(true).write(true).open(&path)?;
        Ok(Self { file, path, tail: VecDeque::with_capacity(TAIL_CAPACITY) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The most recent lines written, oldest first.
    #[must_use]
    pub fn tail(&self) -> Vec<String> {
        self.tail.iter().cloned().collect()
    }

    fn push_tail(&mut self, line: String) {
        if self.tail.len() == TAIL_CAPACITY {
            self.tail.pop_front();
        }
        self.tail.push_back(line);
    }

    fn write_line(&mut self, line: &str) {
        if writeln!(self.file, "{line}").is_err() {
            return;
        }
        self.push_tail(line.to_owned());
    }
}

impl LogSink for AttemptLog {
    fn line(&mut self, phase: &str, line: &str) {
        self.write_line(&format!("[{phase}] {line}"));
    }

    fn phase_start(&mut self, phase: &str) {
        self.write_line(&format!("== {phase} START =="));
    }

    fn phase_end(&mut self, phase: &str) {
        self.write_line(&format!("== {phase} END =="));
    }
}

/// Read the last N lines of an attempt's log file from disk, for a
/// completed attempt whose `AttemptLog` has gone out of scope.
///
/// # Errors
/// Returns an I/O error if the file cannot be read.
pub fn read_tail(path: &Path, n: usize) -> std::io::Result<Vec<String>> {
    let contents = fs::read_to_string(path)?;
    let lines: Vec<String> = contents.lines().map(str::to_owned).collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].to_vec())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn writes_phase_banners_and_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("attempt.log");
        let mut log = AttemptLog::create(path.clone()).unwrap();
        log.phase_start("work");
        log.line("work", "hello");
        log.phase_end("work");

        let tail = log.tail();
        assert_eq!(tail, vec!["== work START ==", "[work] hello", "== work END =="]);

        let from_disk = read_tail(&path, 10).unwrap();
        assert_eq!(from_disk, tail);
    }

    #[test]
    fn tail_caps_at_capacity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("attempt.log");
        let mut log = AttemptLog::create(path).unwrap();
        for i in 0..(TAIL_CAPACITY + 10) {
            log.line("work", &i.to_string());
        }
        assert_eq!(log.tail().len(), TAIL_CAPACITY);
        assert_eq!(log.tail().first().unwrap(), "[work] 10");
    }

    #[test]
    fn log_file_path_is_stable_for_same_inputs() {
        let root = Path::new("/tmp/ws");
        let plan_id = PlanId::new();
        let node_id = NodeId::new();
        let a = log_file_path(root, plan_id, node_id, 1);
        let b = log_file_path(root, plan_id, node_id, 1);
        assert_eq!(a, b);
    }
}
