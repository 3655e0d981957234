//! [`LogSink`] — the boundary between the executor and the Log Store.
//!
//! `weave-exec` knows nothing about files or plans; it just hands tagged
//! lines to whatever sink the caller provides. The root `weave` crate's
//! Log Store implements this trait.

/// Receives one line of streamed output at a time, tagged with the phase
/// it belongs to (`"prechecks"`, `"work"`, `"postchecks"`).
pub trait LogSink: Send {
    /// Append one line (without trailing newline) tagged with `phase`.
    fn line(&mut self, phase: &str, line: &str);

    /// Mark the start of a phase's output (maps to the Log Store's
    /// `== PHASE START ==` banner).
    fn phase_start(&mut self, phase: &str) {
        let _ = phase;
    }

    /// Mark the end of a phase's output.
    fn phase_end(&mut self, phase: &str) {
        let _ = phase;
    }
}

/// A [`LogSink`] that discards everything, for callers that only care
/// about the exit code (e.g. unit tests).
#[derive(Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn line(&mut self, _phase: &str, _line: &str) {}
}

/// A [`LogSink`] that accumulates every line in memory, for tests.
#[derive(Default)]
pub struct VecSink {
    pub lines: Vec<(String, String)>,
}

impl LogSink for VecSink {
    fn line(&mut self, phase: &str, line: &str) {
        self.lines.push((phase.to_owned(), line.to_owned()));
    }
}
