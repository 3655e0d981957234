//! The Node Pipeline (C4): runs exactly one attempt of one node through its
//! setup → merge-fi → prechecks → work → commit → postchecks → merge-ri
//! steps.
//!
//! Split into three phases so a caller never needs to hold a [`Plan`]'s
//! mutex across the blocking git/process I/O that running a node actually
//! does: [`prepare_attempt`] reads what the attempt needs out of `plan`
//! (under the lock), [`execute_attempt`] runs it against that snapshot
//! alone (no lock), and [`apply_outcome`] writes the result back (under the
//! lock again, briefly).

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, warn};
use weave_exec::{AgentSpec, CancelToken, ExecRequest, Executor, OnFailure, WorkSpec};
use weave_git::GitPorcelain;

use crate::error::{OrchestratorError, Result};
use crate::events::{Event, EventBus};
use crate::ids::NodeId;
use crate::logstore::{self, AttemptLog};
use crate::model::metrics::{NodeMetrics, PhaseMetrics, WorkSummary};
use crate::model::plan::{
    AttemptRecord, AttemptStatus, FailureReason, Node, NodeStatus, Plan, PipelineStep, StepStatus,
    TriggerType, fresh_step_statuses,
};

/// Everything the pipeline needs to run one node attempt, independent of any
/// particular [`Plan`].
pub struct PipelineContext<'a> {
    pub git: &'a dyn GitPorcelain,
    pub executor: &'a Executor,
    pub workspace_root: &'a Path,
    pub event_bus: &'a EventBus,
    /// Serializes `merge-ri` and branch-creation across nodes sharing the
    /// primary repository working copy (§5).
    pub repo_mutex: &'a parking_lot::Mutex<()>,
}

/// Where a root node's `base_commit` comes from. Resolved to an actual sha
/// by [`execute_attempt`], outside the plan's lock, since resolving a
/// branch name is itself a git call.
enum BaseSource {
    /// A non-root node's base is its first dependency's completed commit —
    /// already a sha, read from the plan while preparing the attempt.
    DependencyCommit(String),
    /// A root node's base is the tip of a branch name — the node's own
    /// override if set, else the plan's `base_branch` — still unresolved.
    RootBranch(String),
}

/// Everything [`execute_attempt`] needs to run one node attempt without
/// touching the live [`Plan`] (and so without holding its mutex) for the
/// duration of any blocking I/O.
pub struct PreparedAttempt {
    node: Node,
    is_leaf: bool,
    attempt_number: u32,
    trigger: TriggerType,
    worktree_path: PathBuf,
    log_path: PathBuf,
    base_source: BaseSource,
    extra_dep_commits: Vec<String>,
    target_branch: String,
    session_id: Option<String>,
}

/// The result of running one attempt, applied back onto the [`Plan`] by
/// [`apply_outcome`].
pub struct AttemptOutcome {
    attempt: AttemptRecord,
    final_status: NodeStatus,
    completed_commit: Option<String>,
    work_summary: Option<WorkSummary>,
    merged_to_target: bool,
}

/// Snapshot everything one attempt of `node_id` needs out of `plan`, and
/// mark the node `running` in the same stroke. Must be called with the
/// plan's mutex held; the returned [`PreparedAttempt`] borrows nothing from
/// `plan`, so the lock can be released immediately after.
///
/// # Errors
/// Returns an error if the node, or a non-root node's first dependency's
/// completed commit, is missing from the plan.
pub fn prepare_attempt(
    plan: &mut Plan,
    node_id: NodeId,
    trigger: TriggerType,
    ctx: &PipelineContext<'_>,
) -> Result<PreparedAttempt> {
    let node = plan.nodes.get(&node_id).cloned().ok_or(OrchestratorError::NodeNotFound { plan_id: plan.id, node_id })?;
    let is_leaf = plan.leaves.contains(&node_id);

    transition(plan, ctx, node_id, NodeStatus::Running);
    let state = plan.node_states.get_mut(&node_id).ok_or(OrchestratorError::NodeNotFound { plan_id: plan.id, node_id })?;
    state.started_at = Some(Utc::now());
    let attempt_number = state.attempts + 1;
    state.attempts = attempt_number;
    let session_id = state.agent_session_id.clone();

    let worktree_path = weave_git::worktree_path(ctx.workspace_root, &plan.id.to_string(), &node.producer_id);
    let log_path = logstore::log_file_path(ctx.workspace_root, plan.id, node_id, attempt_number);

    let base_source = if let Some(first_dep) = node.dependencies.first() {
        let commit = plan
            .node_states
            .get(first_dep)
            .and_then(|s| s.completed_commit.clone())
            .ok_or_else(|| OrchestratorError::Internal {
                detail: format!("node {node_id}: dependency {first_dep} has no completed_commit yet"),
            })?;
        BaseSource::DependencyCommit(commit)
    } else {
        BaseSource::RootBranch(node.base_branch.clone().unwrap_or_else(|| plan.base_branch.clone()))
    };

    let extra_dep_commits: Vec<String> = node
        .dependencies
        .iter()
        .skip(1)
        .filter_map(|dep| plan.node_states.get(dep).and_then(|s| s.completed_commit.clone()))
        .collect();

    Ok(PreparedAttempt {
        node,
        is_leaf,
        attempt_number,
        trigger,
        worktree_path,
        log_path,
        base_source,
        extra_dep_commits,
        target_branch: plan.target_branch.clone(),
        session_id,
    })
}

/// Run one attempt to completion. Touches only `prepared`, `ctx`'s
/// collaborators, and the filesystem/subprocess surface they expose —
/// never the live [`Plan`], so callers need not hold the plan's mutex for
/// the duration (§5: "reads return immutable snapshots"; nodes of the same
/// plan run concurrently).
pub fn execute_attempt(prepared: PreparedAttempt, ctx: &PipelineContext<'_>, cancel: &CancelToken) -> AttemptOutcome {
    let base_attempt = new_attempt_record(&prepared);

    let mut log = match AttemptLog::create(prepared.log_path.clone()) {
        Ok(log) => log,
        Err(e) => {
            return build_outcome(
                base_attempt,
                StepOutcome::Failed {
                    phase: PipelineStep::MergeFi,
                    error: format!("failed to open attempt log: {e}"),
                    exit_code: None,
                    canceled: false,
                },
            );
        }
    };

    let mut attempt = base_attempt;
    let outcome = run_steps(&prepared, ctx, cancel, &mut log, &mut attempt);
    attempt.ended_at = Some(Utc::now());
    build_outcome(attempt, outcome)
}

fn new_attempt_record(prepared: &PreparedAttempt) -> AttemptRecord {
    AttemptRecord {
        attempt_number: prepared.attempt_number,
        trigger_type: prepared.trigger,
        started_at: Utc::now(),
        ended_at: None,
        status: AttemptStatus::Failed,
        failed_phase: None,
        exit_code: None,
        error: None,
        agent_session_id: None,
        step_statuses: fresh_step_statuses(),
        worktree_path: Some(prepared.worktree_path.display().to_string()),
        base_commit: None,
        work_used: prepared.node.work.clone(),
        log_file_path: Some(prepared.log_path.display().to_string()),
        metrics: None,
        phase_metrics: std::collections::BTreeMap::new(),
    }
}

enum StepOutcome {
    Succeeded { completed_commit: String, work_summary: WorkSummary, merged_to_target: bool },
    Failed { phase: PipelineStep, error: String, exit_code: Option<i32>, canceled: bool },
}

fn run_steps(
    prepared: &PreparedAttempt,
    ctx: &PipelineContext<'_>,
    cancel: &CancelToken,
    log: &mut AttemptLog,
    attempt: &mut AttemptRecord,
) -> StepOutcome {
    let node = &prepared.node;
    let worktree_path = &prepared.worktree_path;

    macro_rules! fail {
        ($phase:expr, $error:expr) => {
            return StepOutcome::Failed { phase: $phase, error: $error, exit_code: None, canceled: cancel.is_canceled() }
        };
    }

    // --- setup ---
    let base_ref = match resolve_base_ref(&prepared.base_source, ctx.git, ctx.workspace_root) {
        Ok(r) => r,
        Err(e) => fail!(PipelineStep::MergeFi, format!("setup: {e}")),
    };
    attempt.base_commit = Some(base_ref.clone());

    if worktree_path.exists() {
        if let Err(e) = ctx.git.reset_detached(worktree_path, &base_ref) {
            fail!(PipelineStep::MergeFi, format!("setup: failed to reset worktree: {e}"));
        }
    } else if let Err(e) = ctx.git.add_worktree(ctx.workspace_root, worktree_path, &base_ref) {
        fail!(PipelineStep::MergeFi, format!("setup: failed to add worktree: {e}"));
    }

    // --- merge-fi ---
    set_step(attempt, PipelineStep::MergeFi, StepStatus::Running);
    if node.dependencies.len() > 1 {
        if let Err(e) = ctx.git.merge_from_refs(worktree_path, &prepared.extra_dep_commits) {
            set_step(attempt, PipelineStep::MergeFi, StepStatus::Failed);
            fail!(PipelineStep::MergeFi, format!("merge-fi conflict: {e}"));
        }
    }
    set_step(attempt, PipelineStep::MergeFi, StepStatus::Success);

    // --- prechecks ---
    if let Some(spec) = &node.prechecks {
        set_step(attempt, PipelineStep::Prechecks, StepStatus::Running);
        match execute(ctx, spec, worktree_path, node, "prechecks", log, cancel, None) {
            Ok(outcome) if outcome.exit_code == Some(0) => {
                set_step(attempt, PipelineStep::Prechecks, StepStatus::Success);
            }
            Ok(outcome) => {
                set_step(attempt, PipelineStep::Prechecks, StepStatus::Failed);
                fail!(PipelineStep::Prechecks, format!("prechecks exited {:?}", outcome.exit_code));
            }
            Err(e) => {
                set_step(attempt, PipelineStep::Prechecks, StepStatus::Failed);
                fail!(PipelineStep::Prechecks, e.to_string());
            }
        }
    } else {
        set_step(attempt, PipelineStep::Prechecks, StepStatus::Skipped);
    }

    // --- work ---
    set_step(attempt, PipelineStep::Work, StepStatus::Running);
    let work_outcome =
        execute(ctx, &node.work, worktree_path, node, "work", log, cancel, prepared.session_id.as_deref());
    let mut work_result = work_outcome;
    if let Ok(outcome) = &work_result
        && outcome.exit_code != Some(0)
        && node.is_snapshot_validation
        && node.work.auto_healable()
    {
        warn!(node = %node.id, "snapshot validation failed; attempting one auto-heal pass");
        let tail = log.tail().join("\n");
        let heal_spec = WorkSpec::Agent {
            spec: AgentSpec {
                instructions: format!(
                    "The following validation failed. Diagnose and fix the underlying issue.\n\n{tail}"
                ),
                model: None,
                max_turns: None,
                context_files: Vec::new(),
                resume_session: Some(false),
            },
            on_failure: Some(OnFailure { no_auto_heal: true, message: None, resume_from_phase: None }),
        };
        attempt.work_used = heal_spec.clone();
        work_result = execute(ctx, &heal_spec, worktree_path, node, "work", log, cancel, None);
    }

    match work_result {
        Ok(outcome) if outcome.exit_code == Some(0) => {
            set_step(attempt, PipelineStep::Work, StepStatus::Success);
            attempt.agent_session_id = outcome.session_id;
        }
        Ok(outcome) => {
            set_step(attempt, PipelineStep::Work, StepStatus::Failed);
            attempt.agent_session_id = outcome.session_id;
            fail!(PipelineStep::Work, format!("work exited {:?}", outcome.exit_code));
        }
        Err(e) => {
            set_step(attempt, PipelineStep::Work, StepStatus::Failed);
            fail!(PipelineStep::Work, e.to_string());
        }
    }

    // --- commit ---
    set_step(attempt, PipelineStep::Commit, StepStatus::Running);
    let message = format!("{} [{}]\n\n{}", node.producer_id, node.producer_id, node.task);
    let commit_result = ctx.git.commit_all(worktree_path, &message);
    let completed_commit = match commit_result {
        Ok(Some(sha)) => sha,
        Ok(None) if node.expects_no_changes => base_ref.clone(),
        Ok(None) => {
            set_step(attempt, PipelineStep::Commit, StepStatus::Failed);
            fail!(PipelineStep::Commit, "no changes produced and expects_no_changes is false".to_owned());
        }
        Err(e) => {
            set_step(attempt, PipelineStep::Commit, StepStatus::Failed);
            fail!(PipelineStep::Commit, e.to_string());
        }
    };
    set_step(attempt, PipelineStep::Commit, StepStatus::Success);

    let work_summary = ctx
        .git
        .diff_stats(worktree_path, Some(&base_ref), &completed_commit)
        .map(WorkSummary::from)
        .unwrap_or_default();

    // --- postchecks ---
    if let Some(spec) = &node.postchecks {
        set_step(attempt, PipelineStep::Postchecks, StepStatus::Running);
        match execute(ctx, spec, worktree_path, node, "postchecks", log, cancel, None) {
            Ok(outcome) if outcome.exit_code == Some(0) => {
                set_step(attempt, PipelineStep::Postchecks, StepStatus::Success);
            }
            Ok(outcome) => {
                set_step(attempt, PipelineStep::Postchecks, StepStatus::Failed);
                fail!(PipelineStep::Postchecks, format!("postchecks exited {:?}", outcome.exit_code));
            }
            Err(e) => {
                set_step(attempt, PipelineStep::Postchecks, StepStatus::Failed);
                fail!(PipelineStep::Postchecks, e.to_string());
            }
        }
    } else {
        set_step(attempt, PipelineStep::Postchecks, StepStatus::Skipped);
    }

    // --- merge-ri ---
    let mut merged_to_target = false;
    if prepared.is_leaf {
        set_step(attempt, PipelineStep::MergeRi, StepStatus::Running);
        let _guard = ctx.repo_mutex.lock();
        if let Err(e) = ctx.git.merge_back(ctx.workspace_root, &prepared.target_branch, &completed_commit) {
            set_step(attempt, PipelineStep::MergeRi, StepStatus::Failed);
            fail!(PipelineStep::MergeRi, format!("merge-ri conflict: {e}"));
        }
        set_step(attempt, PipelineStep::MergeRi, StepStatus::Success);
        merged_to_target = true;
    } else {
        set_step(attempt, PipelineStep::MergeRi, StepStatus::Skipped);
    }

    StepOutcome::Succeeded { completed_commit, work_summary, merged_to_target }
}

fn build_outcome(mut attempt: AttemptRecord, outcome: StepOutcome) -> AttemptOutcome {
    match outcome {
        StepOutcome::Succeeded { completed_commit, work_summary, merged_to_target } => {
            attempt.status = AttemptStatus::Succeeded;
            AttemptOutcome {
                attempt,
                final_status: NodeStatus::Succeeded,
                completed_commit: Some(completed_commit),
                work_summary: Some(work_summary),
                merged_to_target,
            }
        }
        StepOutcome::Failed { phase, error, exit_code, canceled } => {
            attempt.failed_phase = Some(phase);
            attempt.error = Some(error);
            attempt.exit_code = exit_code;
            attempt.status = if canceled { AttemptStatus::Canceled } else { AttemptStatus::Failed };
            AttemptOutcome {
                attempt,
                final_status: if canceled { NodeStatus::Canceled } else { NodeStatus::Failed },
                completed_commit: None,
                work_summary: None,
                merged_to_target: false,
            }
        }
    }
}

/// Apply a completed attempt's outcome back onto `plan`'s node state and
/// emit the node's terminal transition. Must be called with the plan's
/// mutex held; the blocking work that produced `outcome` has already
/// finished by the time this runs, so the lock is held only for this
/// in-memory update.
pub fn apply_outcome(plan: &mut Plan, node_id: NodeId, outcome: AttemptOutcome, ctx: &PipelineContext<'_>) {
    let AttemptOutcome { mut attempt, final_status, completed_commit, work_summary, merged_to_target } = outcome;

    if let Some(state) = plan.node_states.get_mut(&node_id) {
        state.ended_at = attempt.ended_at;
        state.step_statuses = attempt.step_statuses.clone();
        state.agent_session_id = attempt.agent_session_id.clone().or(state.agent_session_id.clone());
        state.error = attempt.error.clone();
        state.base_commit = attempt.base_commit.clone();
        state.failure_reason = match final_status {
            NodeStatus::Canceled => Some(FailureReason::Canceled),
            NodeStatus::Failed => Some(FailureReason::Normal),
            _ => None,
        };
        if let Some(sha) = completed_commit {
            state.completed_commit = Some(sha);
        }
        if let Some(summary) = work_summary {
            state.work_summary = Some(summary);
        }
        if merged_to_target {
            state.merged_to_target = true;
        }

        let mut metrics = NodeMetrics::default();
        metrics.attempt_count = state.attempts;
        for (step, phase) in &attempt.phase_metrics {
            metrics.record_step(*step, phase);
        }
        attempt.metrics = Some(metrics);
        state.metrics = metrics;
        state.last_attempt = Some(attempt.clone());
        state.attempt_history.push(attempt);
        state.status = final_status;
    }
    ctx.event_bus.publish(Event::NodeTransition { plan_id: plan.id, node_id, from: NodeStatus::Running, to: final_status });
}

fn resolve_base_ref(source: &BaseSource, git: &dyn GitPorcelain, repo_root: &Path) -> std::result::Result<String, String> {
    match source {
        BaseSource::DependencyCommit(sha) => Ok(sha.clone()),
        BaseSource::RootBranch(branch) => git.resolve_ref(repo_root, branch).map_err(|e| e.to_string()),
    }
}

#[allow(clippy::too_many_arguments)]
fn execute(
    ctx: &PipelineContext<'_>,
    spec: &WorkSpec,
    cwd: &Path,
    node: &Node,
    phase: &'static str,
    log: &mut AttemptLog,
    cancel: &CancelToken,
    session_id: Option<&str>,
) -> Result<weave_exec::RunOutcome> {
    let env = std::collections::BTreeMap::new();
    let req = ExecRequest { spec, cwd, env: &env, session_id, phase, task: &node.task };
    let (outcome, metrics) = ctx.executor.run(&req, log, cancel)?;
    info!(node = %node.id, phase, wall_time_ms = metrics.wall_time.as_millis() as u64, "pipeline step ran");
    Ok(outcome)
}

fn set_step(attempt: &mut AttemptRecord, step: PipelineStep, status: StepStatus) {
    attempt.step_statuses.insert(step, status);
    attempt.phase_metrics.entry(step).or_insert_with(PhaseMetrics::default).status = Some(status);
}

fn transition(plan: &mut Plan, ctx: &PipelineContext<'_>, node_id: NodeId, to: NodeStatus) {
    let from = plan.node_states.get(&node_id).map_or(NodeStatus::Pending, |s| s.status);
    if let Some(state) = plan.node_states.get_mut(&node_id) {
        state.status = to;
    }
    ctx.event_bus.publish(Event::NodeTransition { plan_id: plan.id, node_id, from, to });
}
