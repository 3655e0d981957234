//! The agent adapter boundary (§6.4 of the spec this crate implements).
//!
//! The actual AI-agent CLI — its flags, its model selection, its wire
//! format — is an external collaborator. This module defines the contract
//! the Work Executor needs from it and a default implementation that
//! shells out to a configurable executable, so tests and alternate
//! deployments can substitute a fake without touching the executor.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};

use crate::error::ExecError;
use crate::spec::AgentSpec;

/// What an agent invocation produced.
#[derive(Debug, Default, Clone)]
pub struct AgentOutcome {
    pub success: bool,
    pub session_id: Option<String>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub turns_used: Option<u32>,
}

/// Everything the agent adapter needs to run one invocation.
pub struct AgentRun<'a> {
    pub cwd: &'a std::path::Path,
    pub task: &'a str,
    pub spec: &'a AgentSpec,
    pub session_id: Option<&'a str>,
}

/// The boundary between `weave-exec` and an external agent CLI.
///
/// Implementors receive the working directory and instructions and stream
/// output lines back through `on_output`. The orchestrator never parses
/// agent output beyond a session-id token; everything else is opaque.
pub trait AgentAdapter: Send + Sync {
    fn run(
        &self,
        run: &AgentRun<'_>,
        on_output: &mut dyn FnMut(&str),
        pid_hook: &mut dyn FnMut(u32),
    ) -> Result<AgentOutcome, ExecError>;
}

/// Default adapter: shells out to an external agent CLI binary.
///
/// The binary name is a deployment detail (e.g. `"copilot-agent"`); this
/// crate only assumes it accepts `--resume <id>` and prints a line
/// containing `session: <uuid>` when it starts (or resumes) a session.
pub struct CliAgentAdapter {
    pub program: String,
}

impl CliAgentAdapter {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }
}

const SESSION_MARKER: &str = "session:";

/// Scan a line of agent output for a UUID-shaped token adjacent to the
/// session marker, per the §6.4/§4.2 contract.
#[must_use]
pub fn extract_session_id(line: &str) -> Option<String> {
    let idx = line.find(SESSION_MARKER)?;
    let rest = &line[idx + SESSION_MARKER.len()..];
    let token = rest.split_whitespace().next()?;
    uuid::Uuid::parse_str(token.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-'))
        .ok()
        .map(|u| u.to_string())
}

impl AgentAdapter for CliAgentAdapter {
    fn run(
        &self,
        run: &AgentRun<'_>,
        on_output: &mut dyn FnMut(&str),
        pid_hook: &mut dyn FnMut(u32),
    ) -> Result<AgentOutcome, ExecError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--instructions-stdin");
        if let Some(model) = &run.spec.model {
            cmd.args(["--model", model]);
        }
        if let Some(max_turns) = run.spec.max_turns {
            cmd.args(["--max-turns", &max_turns.to_string()]);
        }
        for file in &run.spec.context_files {
            cmd.args(["--context", file]);
        }
        if run.spec.should_resume()
            && let Some(session_id) = run.session_id
        {
            cmd.args(["--resume", session_id]);
        }
        cmd.current_dir(run.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        crate::process_group::isolate_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        pid_hook(child.id());

        {
            use std::io::Write;
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(run.spec.instructions.as_bytes());
            }
        }

        let mut session_id = run.session_id.map(str::to_owned);
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if let Some(found) = extract_session_id(&line) {
                    session_id = Some(found);
                }
                on_output(&line);
            }
        }
        if let Some(stderr) = child.stderr.take() {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                on_output(&line);
            }
        }

        let status = child.wait()?;
        Ok(AgentOutcome {
            success: status.success(),
            session_id,
            exit_code: status.code(),
            error: if status.success() { None } else { Some(format!("{status}")) },
            turns_used: None,
        })
    }
}

/// An [`AgentAdapter`] for tests: returns a canned outcome without spawning
/// anything.
pub struct FakeAgentAdapter<F> {
    pub f: F,
}

impl<F> AgentAdapter for FakeAgentAdapter<F>
where
    F: Fn(&AgentRun<'_>) -> AgentOutcome + Send + Sync,
{
    fn run(
        &self,
        run: &AgentRun<'_>,
        on_output: &mut dyn FnMut(&str),
        _pid_hook: &mut dyn FnMut(u32),
    ) -> Result<AgentOutcome, ExecError> {
        on_output(&format!("[fake-agent] {}", run.task));
        Ok((self.f)(run))
    }
}
