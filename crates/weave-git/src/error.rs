//! Error type for git porcelain operations.
//!
//! [`GitError`] is the single error type returned by every [`crate::GitPorcelain`]
//! method. It uses rich enum variants so callers can match on specific failure
//! modes (conflict, missing ref, busy worktree) without parsing stderr.

use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by [`crate::GitPorcelain`] operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// A merge (forward or reverse integration) produced conflicts.
    #[error("merge conflict in {path}: {stderr_tail}")]
    Conflict {
        /// Worktree or repo path the merge was attempted in.
        path: PathBuf,
        /// Trailing lines of `git`'s stderr, for diagnosis.
        stderr_tail: String,
    },

    /// A ref or revision specifier could not be resolved.
    #[error("invalid ref `{spec}`: {stderr_tail}")]
    InvalidRef {
        /// The ref or revspec that failed to resolve.
        spec: String,
        /// Trailing lines of `git`'s stderr.
        stderr_tail: String,
    },

    /// The given path is not inside a git repository (or has no `.git`).
    #[error("not a git repository: {}", path.display())]
    NotRepo {
        /// The path that was checked.
        path: PathBuf,
    },

    /// A worktree operation failed because the worktree is locked or already
    /// registered elsewhere.
    #[error("worktree busy at {}: {stderr_tail}", path.display())]
    WorktreeBusy {
        /// Path to the worktree in question.
        path: PathBuf,
        /// Trailing lines of `git`'s stderr.
        stderr_tail: String,
    },

    /// `git` exited non-zero for a reason not covered by the variants above.
    #[error("`git {args}` failed in {}: {stderr_tail}", path.display())]
    CommandFailed {
        /// The arguments passed to `git` (joined, for display only).
        args: String,
        /// Directory the command ran in.
        path: PathBuf,
        /// Trailing lines of stderr.
        stderr_tail: String,
        /// Process exit code, if the process actually exited.
        exit_code: Option<i32>,
    },

    /// Spawning or waiting on the `git` process failed at the OS level.
    #[error("failed to run git: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// Keep only the last few lines of a (possibly long) stderr capture.
    #[must_use]
    pub fn tail(stderr: &str, lines: usize) -> String {
        let all: Vec<&str> = stderr.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}
