//! The Work Executor: runs one [`WorkSpec`] and streams its output.

use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::agent::{AgentAdapter, AgentRun, CliAgentAdapter};
use crate::error::ExecError;
use crate::logsink::LogSink;
use crate::process_group;
use crate::spec::{EnvMap, Shell, WorkSpec};

/// A cooperative cancellation token shared between the Plan Runner and a
/// running [`Executor::run`] call.
///
/// Cancellation is cooperative at phase boundaries (the executor checks
/// the flag between output lines) but preemptive at the process level:
/// once tripped, the child's whole process group is signaled immediately.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    child_pid: Arc<AtomicU32>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let pid = self.child_pid.load(Ordering::SeqCst);
        if pid != 0 {
            process_group::kill_process_tree(pid);
        }
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn register_pid(&self, pid: u32) {
        self.child_pid.store(pid, Ordering::SeqCst);
        if self.is_canceled() {
            process_group::kill_process_tree(pid);
        }
    }
}

/// Execution metrics for one run, attached to `AttemptRecord.phase_metrics`
/// by the caller.
#[derive(Debug, Clone, Copy)]
pub struct RunMetrics {
    pub wall_time: Duration,
}

/// What one [`Executor::run`] call produced.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub session_id: Option<String>,
    pub canceled: bool,
}

/// Everything the executor needs to run one work spec.
pub struct ExecRequest<'a> {
    pub spec: &'a WorkSpec,
    pub cwd: &'a Path,
    pub env: &'a EnvMap,
    pub session_id: Option<&'a str>,
    pub phase: &'a str,
    pub task: &'a str,
}

/// Runs [`WorkSpec`]s, dispatching on variant and sharing one
/// logging/cancellation wrapper across process, shell, and agent work.
pub struct Executor {
    agent: Box<dyn AgentAdapter>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(Box::new(CliAgentAdapter::new(
            std::env::var("WEAVE_AGENT_CLI").unwrap_or_else(|_| "weave-agent".to_owned()),
        )))
    }
}

impl Executor {
    #[must_use]
    pub fn new(agent: Box<dyn AgentAdapter>) -> Self {
        Self { agent }
    }

    /// Run `req.spec`, streaming output to `sink` and honoring `cancel`.
    pub fn run(
        &self,
        req: &ExecRequest<'_>,
        sink: &mut dyn LogSink,
        cancel: &CancelToken,
    ) -> Result<(RunOutcome, RunMetrics), ExecError> {
        let started = Instant::now();
        sink.phase_start(req.phase);
        let outcome = match req.spec {
            WorkSpec::Process { spec, .. } => {
                self.run_command(&spec.executable, &spec.args, req, sink, cancel)
            }
            WorkSpec::Shell { spec, .. } => {
                let shell = spec.shell;
                self.run_shell(shell, &spec.command, req, sink, cancel)
            }
            WorkSpec::Agent { spec, .. } => self.run_agent(spec, req, sink, cancel),
        }?;
        sink.phase_end(req.phase);
        Ok((outcome, RunMetrics { wall_time: started.elapsed() }))
    }

    fn run_shell(
        &self,
        shell: Shell,
        command: &str,
        req: &ExecRequest<'_>,
        sink: &mut dyn LogSink,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, ExecError> {
        self.run_command(shell.program(), &[shell.script_flag().to_owned(), command.to_owned()], req, sink, cancel)
    }

    fn run_command(
        &self,
        program: &str,
        args: &[String],
        req: &ExecRequest<'_>,
        sink: &mut dyn LogSink,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, ExecError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(req.cwd)
            .envs(req.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        process_group::isolate_process_group(&mut cmd);

        let mut child =
            cmd.spawn().map_err(|source| ExecError::Spawn { program: program.to_owned(), source })?;
        cancel.register_pid(child.id());

        let (tx, rx) = mpsc::channel::<(String, String)>();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let phase = req.phase.to_owned();
        let out_handle = stdout.map(|s| spawn_line_reader(s, phase.clone(), tx.clone()));
        let err_handle = stderr.map(|s| spawn_line_reader(s, phase, tx));

        let mut canceled = false;
        loop {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok((phase, line)) => sink.line(&phase, &line),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if cancel.is_canceled() {
                        canceled = true;
                        process_group::kill_process_tree(child.id());
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        if let Some(h) = out_handle {
            let _ = h.join();
        }
        if let Some(h) = err_handle {
            let _ = h.join();
        }

        let status = child.wait()?;
        Ok(RunOutcome { exit_code: status.code(), session_id: None, canceled })
    }

    fn run_agent(
        &self,
        spec: &crate::spec::AgentSpec,
        req: &ExecRequest<'_>,
        sink: &mut dyn LogSink,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, ExecError> {
        let session_id = if spec.should_resume() { req.session_id } else { None };
        let run = AgentRun { cwd: req.cwd, task: req.task, spec, session_id };
        let phase = req.phase.to_owned();
        let mut on_output = |line: &str| sink.line(&phase, line);
        let cancel2 = cancel.clone();
        let mut pid_hook = move |pid: u32| cancel2.register_pid(pid);
        let outcome = self.agent.run(&run, &mut on_output, &mut pid_hook)?;
        if !outcome.success && outcome.error.is_none() {
            warn!(exit_code = ?outcome.exit_code, "agent work exited non-zero");
        }
        debug!(turns = ?outcome.turns_used, "agent run complete");
        Ok(RunOutcome {
            exit_code: outcome.exit_code,
            session_id: outcome.session_id,
            canceled: cancel.is_canceled(),
        })
    }
}

fn spawn_line_reader<R: std::io::Read + Send + 'static>(
    reader: R,
    phase: String,
    tx: mpsc::Sender<(String, String)>,
) -> thread::JoinHandle<()> {
    use std::io::BufRead;
    thread::spawn(move || {
        let buf = std::io::BufReader::new(reader);
        for line in buf.lines().map_while(Result::ok) {
            if tx.send((phase.clone(), line)).is_err() {
                break;
            }
        }
    })
}
