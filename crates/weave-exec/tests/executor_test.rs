use std::collections::BTreeMap;
use std::time::Duration;

use tempfile::TempDir;
use weave_exec::{
    AgentOutcome, AgentSpec, CancelToken, ExecRequest, Executor, FakeAgentAdapter, ShellSpec, VecSink,
    WorkSpec,
};

fn shell_spec(cmd: &str) -> WorkSpec {
    WorkSpec::Shell { spec: ShellSpec { command: cmd.to_owned(), shell: weave_exec::Shell::Sh }, on_failure: None }
}

#[test]
fn shell_success_captures_output_and_exit_code() {
    let dir = TempDir::new().unwrap();
    let env = BTreeMap::new();
    let spec = shell_spec("echo hello");
    let req = ExecRequest { spec: &spec, cwd: dir.path(), env: &env, session_id: None, phase: "work", task: "t" };
    let executor = Executor::new(Box::new(FakeAgentAdapter { f: |_| AgentOutcome::default() }));
    let mut sink = VecSink::default();
    let cancel = CancelToken::new();
    let (outcome, _metrics) = executor.run(&req, &mut sink, &cancel).unwrap();
    assert_eq!(outcome.exit_code, Some(0));
    assert!(sink.lines.iter().any(|(_, l)| l == "hello"));
}

#[test]
fn shell_failure_reports_nonzero_exit() {
    let dir = TempDir::new().unwrap();
    let env = BTreeMap::new();
    let spec = shell_spec("exit 3");
    let req = ExecRequest { spec: &spec, cwd: dir.path(), env: &env, session_id: None, phase: "prechecks", task: "t" };
    let executor = Executor::new(Box::new(FakeAgentAdapter { f: |_| AgentOutcome::default() }));
    let mut sink = VecSink::default();
    let cancel = CancelToken::new();
    let (outcome, _metrics) = executor.run(&req, &mut sink, &cancel).unwrap();
    assert_eq!(outcome.exit_code, Some(3));
}

#[test]
fn cancellation_terminates_long_running_shell() {
    let dir = TempDir::new().unwrap();
    let env = BTreeMap::new();
    let spec = shell_spec("sleep 30");
    let req = ExecRequest { spec: &spec, cwd: dir.path(), env: &env, session_id: None, phase: "work", task: "t" };
    let executor = Executor::new(Box::new(FakeAgentAdapter { f: |_| AgentOutcome::default() }));
    let cancel = CancelToken::new();
    let cancel2 = cancel.clone();
    let handle = std::thread::spawn(move || {
        let mut sink = VecSink::default();
        executor.run(&req, &mut sink, &cancel2)
    });
    std::thread::sleep(Duration::from_millis(200));
    cancel.cancel();
    let (outcome, _metrics) = handle.join().unwrap().unwrap();
    assert!(outcome.canceled);
    assert_ne!(outcome.exit_code, Some(0));
}

#[test]
fn agent_work_runs_through_fake_adapter_and_captures_session() {
    let dir = TempDir::new().unwrap();
    let env = BTreeMap::new();
    let spec = WorkSpec::Agent {
        spec: AgentSpec {
            instructions: "do the thing".to_owned(),
            model: None,
            max_turns: None,
            context_files: Vec::new(),
            resume_session: None,
        },
        on_failure: None,
    };
    let req = ExecRequest { spec: &spec, cwd: dir.path(), env: &env, session_id: None, phase: "work", task: "do it" };
    let executor = Executor::new(Box::new(FakeAgentAdapter {
        f: |_| AgentOutcome { success: true, session_id: Some("11111111-1111-1111-1111-111111111111".into()), exit_code: Some(0), error: None, turns_used: Some(1) },
    }));
    let mut sink = VecSink::default();
    let cancel = CancelToken::new();
    let (outcome, _metrics) = executor.run(&req, &mut sink, &cancel).unwrap();
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.session_id.as_deref(), Some("11111111-1111-1111-1111-111111111111"));
}

#[test]
fn extract_session_id_finds_uuid_token() {
    let line = "agent started, session: 11111111-1111-1111-1111-111111111111 ready";
    assert_eq!(
        weave_exec::extract_session_id(line).as_deref(),
        Some("11111111-1111-1111-1111-111111111111")
    );
    assert_eq!(weave_exec::extract_session_id("no marker here"), None);
}
