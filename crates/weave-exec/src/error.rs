//! Error type for work execution.

use thiserror::Error;

/// Errors raised while preparing or running a [`crate::WorkSpec`].
///
/// A non-zero exit code from the child process is *not* an error here —
/// callers read [`crate::RunOutcome::exit_code`] for that. This type covers
/// failures to even run the work.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The child process could not be spawned.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The configured agent CLI executable was not found on `PATH`.
    #[error("agent CLI `{program}` not found")]
    AgentCliMissing { program: String },

    /// A resume was requested but no prior session id was supplied.
    #[error("agent session lost: no session id to resume from")]
    AgentSessionLost,

    /// Waiting on the child process failed at the OS level.
    #[error("error waiting for child process: {0}")]
    Wait(#[from] std::io::Error),
}
