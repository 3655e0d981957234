//! Work Executor for weave.
//!
//! Runs one [`WorkSpec`] — a process, a shell command, or an AI-agent
//! invocation — streaming its output to a caller-supplied [`LogSink`] and
//! honoring a [`CancelToken`] for preemptive termination.

pub mod agent;
pub mod error;
pub mod executor;
pub mod logsink;
pub mod process_group;
pub mod spec;

pub use agent::{extract_session_id, AgentAdapter, AgentOutcome, AgentRun, CliAgentAdapter, FakeAgentAdapter};
pub use error::ExecError;
pub use executor::{CancelToken, ExecRequest, Executor, RunMetrics, RunOutcome};
pub use logsink::{LogSink, NullSink, VecSink};
pub use spec::{AgentSpec, EnvMap, OnFailure, ProcessSpec, ResumePhase, Shell, ShellSpec, WorkSpec};
