//! Unified error type for the orchestrator.
//!
//! Defines [`OrchestratorError`], the error type returned by every public
//! [`crate::runner::PlanRunner`] operation. Error messages are written for an
//! agent or operator driving the orchestrator: each variant names what went
//! wrong and, where there is one, how to recover.

use std::fmt;
use std::path::PathBuf;

use crate::ids::{NodeId, PlanId};
use crate::model::plan::PipelineStep;

/// Unified error type for orchestrator operations.
#[derive(Debug)]
pub enum OrchestratorError {
    /// A `PlanSpec` failed topology or field validation before a Plan was built.
    Validation {
        violations: Vec<String>,
    },

    /// The requested plan does not exist.
    PlanNotFound {
        plan_id: PlanId,
    },

    /// The requested node does not exist within its plan.
    NodeNotFound {
        plan_id: PlanId,
        node_id: NodeId,
    },

    /// An operation was attempted against a node in a status that forbids it
    /// (e.g. retrying a `succeeded` node).
    InvalidNodeState {
        node_id: NodeId,
        current: String,
        operation: &'static str,
    },

    /// The git porcelain reported a conflict, invalid ref, missing repo, or
    /// busy worktree.
    Git(weave_git::GitError),

    /// A work step exited non-zero.
    Execution {
        failed_phase: PipelineStep,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    /// The configured agent CLI could not be found, or lost its session.
    Agent {
        detail: String,
    },

    /// The Capacity Broker denied a slot; the caller should retry later.
    CapacityDenied,

    /// The operation was interrupted by cancellation or process restart, not
    /// by a fault in the work itself.
    Interrupted {
        reason: &'static str,
    },

    /// The settings file could not be loaded or parsed.
    Config {
        path: PathBuf,
        detail: String,
    },

    /// An I/O error occurred outside of a tracked git or execution step.
    Io(std::io::Error),

    /// A snapshot on disk could not be parsed, or failed an internal
    /// invariant. Should not occur in normal operation.
    Internal {
        detail: String,
    },
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { violations } => {
                write!(f, "plan spec is invalid:")?;
                for v in violations {
                    write!(f, "\n  - {v}")?;
                }
                Ok(())
            }
            Self::PlanNotFound { plan_id } => {
                write!(f, "plan '{plan_id}' not found.\n  To fix: check the plan id, or list active plans.")
            }
            Self::NodeNotFound { plan_id, node_id } => {
                write!(f, "node '{node_id}' not found in plan '{plan_id}'.")
            }
            Self::InvalidNodeState { node_id, current, operation } => {
                write!(
                    f,
                    "cannot {operation} node '{node_id}': it is '{current}'.\n  To fix: wait for a terminal status, or choose a different node."
                )
            }
            Self::Git(err) => write!(f, "{err}"),
            Self::Execution { failed_phase, exit_code, stderr_tail } => {
                write!(f, "{failed_phase:?} failed")?;
                if let Some(code) = exit_code {
                    write!(f, " (exit code {code})")?;
                }
                if !stderr_tail.is_empty() {
                    write!(f, "\n  stderr: {stderr_tail}")?;
                }
                Ok(())
            }
            Self::Agent { detail } => write!(f, "agent error: {detail}"),
            Self::CapacityDenied => {
                write!(f, "no capacity slot available.\n  To fix: retry once a running node completes, or raise the capacity cap.")
            }
            Self::Interrupted { reason } => write!(f, "interrupted: {reason}"),
            Self::Config { path, detail } => {
                write!(f, "configuration error in '{}': {detail}", path.display())
            }
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::Internal { detail } => write!(f, "internal error: {detail}\n  this should not happen; please file a bug."),
        }
    }
}

impl std::error::Error for OrchestratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Git(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<weave_git::GitError> for OrchestratorError {
    fn from(err: weave_git::GitError) -> Self {
        Self::Git(err)
    }
}

impl From<weave_exec::ExecError> for OrchestratorError {
    fn from(err: weave_exec::ExecError) -> Self {
        Self::Agent { detail: err.to_string() }
    }
}

impl From<crate::model::spec::PlanSpecError> for OrchestratorError {
    fn from(err: crate::model::spec::PlanSpecError) -> Self {
        Self::Validation { violations: err.violations }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_validation_lists_each_violation() {
        let err = OrchestratorError::Validation {
            violations: vec!["duplicate producer_id `a`".to_owned(), "cycle: a -> b -> a".to_owned()],
        };
        let msg = err.to_string();
        assert!(msg.contains("duplicate producer_id"));
        assert!(msg.contains("cycle: a -> b -> a"));
    }

    #[test]
    fn display_invalid_node_state_names_operation() {
        let err = OrchestratorError::InvalidNodeState {
            node_id: NodeId::new(),
            current: "succeeded".to_owned(),
            operation: "retry",
        };
        let msg = err.to_string();
        assert!(msg.contains("cannot retry"));
        assert!(msg.contains("succeeded"));
    }

    #[test]
    fn io_error_round_trips_through_from() {
        let io_err = std::io::Error::other("disk full");
        let err: OrchestratorError = io_err.into();
        assert!(matches!(err, OrchestratorError::Io(_)));
    }
}
