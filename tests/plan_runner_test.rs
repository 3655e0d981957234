//! End-to-end coverage of [`weave::runner::PlanRunner`] against real,
//! throwaway git repositories: every scenario enqueues a plan, drives the
//! scheduler to completion (or to a specific intermediate state), and
//! inspects the resulting [`weave::model::plan::Plan`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use weave::model::plan::{NodeStatus, PlanStatus};
use weave::model::spec::{JobSpec, PlanSpec};
use weave::reshape::ReshapeOp;
use weave::runner::{PlanRunner, RetryOptions};
use weave::settings::Settings;
use weave_exec::{Executor, FakeAgentAdapter, Shell, ShellSpec, WorkSpec};
use weave_git::CliGit;

fn git_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    let run = |args: &[&str]| {
        let out = std::process::Command::new("git").args(args).current_dir(dir.path()).output().unwrap();
        assert!(out.status.success(), "{:?}", String::from_utf8_lossy(&out.stderr));
    };
    run(&["init", "-q", "-b", "main"]);
    run(&["config", "user.email", "t@example.com"]);
    run(&["config", "user.name", "T"]);
    std::fs::write(dir.path().join("README.md"), "root\n").unwrap();
    run(&["add", "-A"]);
    run(&["commit", "-q", "-m", "initial"]);
    dir
}

fn runner(repo: &Path, workspace: &Path) -> PlanRunner {
    let git = Arc::new(CliGit);
    let agent = FakeAgentAdapter { f: |_run| weave_exec::AgentOutcome { success: true, ..Default::default() } };
    let executor = Arc::new(Executor::new(Box::new(agent)));
    PlanRunner::recover(workspace.to_owned(), repo.to_owned(), git, executor, Settings::default()).unwrap()
}

fn shell(command: &str) -> WorkSpec {
    WorkSpec::Shell { spec: ShellSpec { command: command.to_owned(), shell: Shell::Sh }, on_failure: None }
}

fn job(producer_id: &str, command: &str, deps: &[&str]) -> JobSpec {
    JobSpec {
        producer_id: producer_id.to_owned(),
        task: producer_id.to_owned(),
        work: shell(command),
        dependencies: deps.iter().map(|s| (*s).to_owned()).collect(),
        prechecks: None,
        postchecks: None,
        instructions: None,
        group: None,
        expects_no_changes: false,
        base_branch: None,
    }
}

fn base_spec(jobs: Vec<JobSpec>) -> PlanSpec {
    PlanSpec {
        name: "t".to_owned(),
        base_branch: Some("main".to_owned()),
        target_branch: None,
        max_parallel: 0,
        clean_up_successful_work: true,
        verify_ri: None,
        env: BTreeMap::new(),
        extra_symlinks: Vec::new(),
        start_paused: false,
        jobs,
    }
}

/// Poll `get_status` until the plan is terminal (or `timeout` elapses).
fn wait_settled(runner: &PlanRunner, plan_id: weave::PlanId, timeout: Duration) -> PlanStatus {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = runner.get_status(plan_id) {
            if matches!(
                status,
                PlanStatus::Succeeded | PlanStatus::Failed | PlanStatus::Partial | PlanStatus::Canceled
            ) {
                return status;
            }
        }
        if Instant::now() >= deadline {
            panic!("plan {plan_id} did not settle within {timeout:?}");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Poll until `node_id` reaches `want` (or `timeout` elapses).
fn wait_node_status(runner: &PlanRunner, plan_id: weave::PlanId, node_id: weave::NodeId, want: NodeStatus, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(plan) = runner.get(plan_id) {
            if plan.state(node_id).map(|s| s.status) == Some(want) {
                return;
            }
        }
        if Instant::now() >= deadline {
            panic!("node {node_id} in plan {plan_id} did not reach {want:?} within {timeout:?}");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn linear_chain_succeeds_and_reverse_integrates() {
    let repo = git_repo();
    let workspace = TempDir::new().unwrap();
    let runner = runner(repo.path(), workspace.path());

    let spec = base_spec(vec![job("build", "true", &[]), job("test", "true", &["build"])]);
    let plan = runner.enqueue(spec).unwrap();

    let status = wait_settled(&runner, plan.id, Duration::from_secs(30));
    assert_eq!(status, PlanStatus::Succeeded);

    let plan = runner.get(plan.id).unwrap();
    for node_id in plan.nodes.keys() {
        assert_eq!(plan.state(*node_id).unwrap().status, NodeStatus::Succeeded);
    }
}

#[test]
fn fan_out_fan_in_forward_integrates_before_each_dependent() {
    let repo = git_repo();
    let workspace = TempDir::new().unwrap();
    let runner = runner(repo.path(), workspace.path());

    let spec = base_spec(vec![
        job("root", "true", &[]),
        job("left", "true", &["root"]),
        job("right", "true", &["root"]),
        job("join", "true", &["left", "right"]),
    ]);
    let plan = runner.enqueue(spec).unwrap();

    let status = wait_settled(&runner, plan.id, Duration::from_secs(30));
    assert_eq!(status, PlanStatus::Succeeded);

    let plan = runner.get(plan.id).unwrap();
    let join_id = plan.node_id_for_producer("join").unwrap();
    assert_eq!(plan.state(join_id).unwrap().status, NodeStatus::Succeeded);
}

#[test]
fn precheck_failure_blocks_downstream() {
    let repo = git_repo();
    let workspace = TempDir::new().unwrap();
    let runner = runner(repo.path(), workspace.path());

    let mut failing = job("build", "true", &[]);
    failing.prechecks = Some(shell("false"));
    let spec = base_spec(vec![failing, job("test", "true", &["build"])]);
    let plan = runner.enqueue(spec).unwrap();

    let status = wait_settled(&runner, plan.id, Duration::from_secs(30));
    assert_eq!(status, PlanStatus::Failed);

    let plan = runner.get(plan.id).unwrap();
    let build_id = plan.node_id_for_producer("build").unwrap();
    let test_id = plan.node_id_for_producer("test").unwrap();
    assert_eq!(plan.state(build_id).unwrap().status, NodeStatus::Failed);
    assert_eq!(plan.state(test_id).unwrap().status, NodeStatus::Blocked);
}

#[test]
fn retry_with_replacement_work_clears_prior_failure() {
    let repo = git_repo();
    let workspace = TempDir::new().unwrap();
    let runner = runner(repo.path(), workspace.path());

    let spec = base_spec(vec![job("build", "false", &[])]);
    let plan = runner.enqueue(spec).unwrap();
    wait_settled(&runner, plan.id, Duration::from_secs(30));

    let plan_before = runner.get(plan.id).unwrap();
    let build_id = plan_before.node_id_for_producer("build").unwrap();
    assert_eq!(plan_before.state(build_id).unwrap().status, NodeStatus::Failed);

    runner
        .retry_node(plan.id, build_id, RetryOptions { new_work: Some(shell("true")), ..Default::default() })
        .unwrap();

    let status = wait_settled(&runner, plan.id, Duration::from_secs(30));
    assert_eq!(status, PlanStatus::Succeeded);
    let plan_after = runner.get(plan.id).unwrap();
    assert_eq!(plan_after.state(build_id).unwrap().status, NodeStatus::Succeeded);
}

#[test]
fn cancel_interrupts_a_running_node() {
    let repo = git_repo();
    let workspace = TempDir::new().unwrap();
    let runner = runner(repo.path(), workspace.path());

    let spec = base_spec(vec![job("sleepy", "sleep 30", &[])]);
    let plan = runner.enqueue(spec).unwrap();

    let node_id = {
        let plan = runner.get(plan.id).unwrap();
        plan.node_id_for_producer("sleepy").unwrap()
    };
    wait_node_status(&runner, plan.id, node_id, NodeStatus::Running, Duration::from_secs(10));

    let started = Instant::now();
    runner.cancel(plan.id).unwrap();
    let status = wait_settled(&runner, plan.id, Duration::from_secs(10));
    assert!(started.elapsed() < Duration::from_secs(10), "cancel should interrupt the sleeping subprocess promptly");
    assert_eq!(status, PlanStatus::Canceled);
}

#[test]
fn reshape_inserts_node_before_a_pending_node() {
    let repo = git_repo();
    let workspace = TempDir::new().unwrap();
    let runner = runner(repo.path(), workspace.path());

    let spec = base_spec(vec![job("root", "true", &[]), job("leaf", "true", &["root"])]);
    let plan = runner.enqueue(spec).unwrap();
    runner.pause(plan.id).unwrap();

    runner
        .reshape(plan.id, vec![ReshapeOp::AddBefore { producer_id: "leaf".to_owned(), job: job("mid", "true", &[]) }])
        .unwrap();

    let reshaped = runner.get(plan.id).unwrap();
    let mid_id = reshaped.node_id_for_producer("mid").unwrap();
    let leaf_id = reshaped.node_id_for_producer("leaf").unwrap();
    assert_eq!(reshaped.node(leaf_id).unwrap().dependencies, vec![mid_id]);

    runner.resume(plan.id).unwrap();
    let status = wait_settled(&runner, plan.id, Duration::from_secs(30));
    assert_eq!(status, PlanStatus::Succeeded);
}
