//! Runtime state: [`Plan`], [`Node`], [`NodeState`], and [`AttemptRecord`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use weave_exec::WorkSpec;

use crate::ids::{NodeId, PlanId};
use crate::model::metrics::{NodeMetrics, PhaseMetrics, WorkSummary};
use crate::model::spec::PlanSpec;

/// A node's position in the state machine (§4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Blocked,
    Canceled,
}

impl NodeStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Blocked | Self::Canceled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Normal,
    Crashed,
    Canceled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Succeeded,
    Failed,
    Canceled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Initial,
    Retry,
    AutoHeal,
}

/// One step of the Node Pipeline (§4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineStep {
    MergeFi,
    Prechecks,
    Work,
    Commit,
    Postchecks,
    MergeRi,
}

impl PipelineStep {
    pub const ALL: [Self; 6] =
        [Self::MergeFi, Self::Prechecks, Self::Work, Self::Commit, Self::Postchecks, Self::MergeRi];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

pub type StepStatusMap = BTreeMap<PipelineStep, StepStatus>;

#[must_use]
pub fn fresh_step_statuses() -> StepStatusMap {
    PipelineStep::ALL.into_iter().map(|s| (s, StepStatus::Pending)).collect()
}

/// A node's immutable shape, derived once from a [`crate::model::spec::JobSpec`]
/// at plan-build time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub producer_id: String,
    pub task: String,
    pub work: WorkSpec,
    pub dependencies: Vec<NodeId>,
    /// The transpose of `dependencies`: nodes that depend on this one.
    /// Maintained by the plan builder and by reshape; never edited in place.
    #[serde(default)]
    pub dependents: Vec<NodeId>,
    pub prechecks: Option<WorkSpec>,
    pub postchecks: Option<WorkSpec>,
    pub instructions: Option<String>,
    pub group: Option<String>,
    pub expects_no_changes: bool,
    /// True for the auto-injected Snapshot-Validation node.
    #[serde(default)]
    pub is_snapshot_validation: bool,
    /// Per-node override of the plan's `base_branch`. Only consulted for
    /// root nodes (no dependencies); a non-root node's base is always its
    /// first dependency's `completed_commit`.
    #[serde(default)]
    pub base_branch: Option<String>,
}

/// One completed or aborted execution attempt of a [`Node`]. Appended once,
/// never mutated, and never removed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub trigger_type: TriggerType,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    pub failed_phase: Option<PipelineStep>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub agent_session_id: Option<String>,
    pub step_statuses: StepStatusMap,
    pub worktree_path: Option<String>,
    pub base_commit: Option<String>,
    pub work_used: WorkSpec,
    pub log_file_path: Option<String>,
    pub metrics: Option<NodeMetrics>,
    pub phase_metrics: BTreeMap<PipelineStep, PhaseMetrics>,
}

/// A node's mutable runtime state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    pub attempts: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub base_commit: Option<String>,
    pub completed_commit: Option<String>,
    pub worktree_path: Option<String>,
    pub worktree_cleaned_up: bool,
    /// Meaningful for leaves only.
    pub merged_to_target: bool,
    pub agent_session_id: Option<String>,
    pub step_statuses: StepStatusMap,
    pub last_attempt: Option<AttemptRecord>,
    pub attempt_history: Vec<AttemptRecord>,
    pub phase_metrics: BTreeMap<PipelineStep, PhaseMetrics>,
    pub metrics: NodeMetrics,
    pub work_summary: Option<WorkSummary>,
    /// Leaves only: the sum of `work_summary` across this leaf's ancestry.
    pub aggregated_work_summary: Option<WorkSummary>,
    /// Set by the scheduler's auto-heal pass when it revives this node from
    /// `failed` back to `ready` with a heal work spec swapped in; consumed
    /// (and cleared) by `Scheduler::dispatch` to pick `TriggerType::AutoHeal`
    /// over `TriggerType::Retry` for the next attempt.
    #[serde(default)]
    pub auto_heal_pending: bool,
}

impl NodeState {
    #[must_use]
    pub fn new_pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            attempts: 0,
            scheduled_at: None,
            started_at: None,
            ended_at: None,
            error: None,
            failure_reason: None,
            base_commit: None,
            completed_commit: None,
            worktree_path: None,
            worktree_cleaned_up: false,
            merged_to_target: false,
            agent_session_id: None,
            step_statuses: fresh_step_statuses(),
            last_attempt: None,
            attempt_history: Vec::new(),
            phase_metrics: BTreeMap::new(),
            metrics: NodeMetrics::default(),
            work_summary: None,
            aggregated_work_summary: None,
            auto_heal_pending: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
    Partial,
    Canceled,
}

/// An in-memory DAG of [`Node`]s plus their [`NodeState`]s, owned
/// exclusively by one [`crate::runner::PlanRunner`] entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub spec: PlanSpec,
    pub base_branch: String,
    pub target_branch: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub nodes: BTreeMap<NodeId, Node>,
    pub node_states: BTreeMap<NodeId, NodeState>,
    pub producer_id_to_node_id: BTreeMap<String, NodeId>,
    pub roots: Vec<NodeId>,
    pub leaves: Vec<NodeId>,
    pub is_paused: bool,
    pub parent_plan_id: Option<PlanId>,
    pub work_summary: Option<WorkSummary>,
    pub explicitly_canceled: bool,
}

impl Plan {
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    #[must_use]
    pub fn state(&self, id: NodeId) -> Option<&NodeState> {
        self.node_states.get(&id)
    }

    #[must_use]
    pub fn node_id_for_producer(&self, producer_id: &str) -> Option<NodeId> {
        self.producer_id_to_node_id.get(producer_id).copied()
    }

    /// Plan status rollup per the state-machine's terminal-aggregation rule.
    #[must_use]
    pub fn status(&self) -> PlanStatus {
        if self.explicitly_canceled {
            return PlanStatus::Canceled;
        }
        let statuses: Vec<NodeStatus> = self.node_states.values().map(|s| s.status).collect();
        if statuses.is_empty() {
            return PlanStatus::Pending;
        }
        let any_running = statuses
            .iter()
            .any(|s| matches!(s, NodeStatus::Running | NodeStatus::Scheduled | NodeStatus::Ready));
        let all_terminal = statuses.iter().all(|s| s.is_terminal());
        let none_started = statuses.iter().all(|s| matches!(s, NodeStatus::Pending));

        if self.is_paused && !any_running {
            return PlanStatus::Paused;
        }
        if none_started {
            return PlanStatus::Pending;
        }
        if !all_terminal {
            return PlanStatus::Running;
        }
        let any_succeeded = statuses.iter().any(|s| matches!(s, NodeStatus::Succeeded));
        let any_bad = statuses.iter().any(|s| matches!(s, NodeStatus::Failed | NodeStatus::Blocked | NodeStatus::Canceled));
        match (any_succeeded, any_bad) {
            (true, false) => PlanStatus::Succeeded,
            (false, true) => PlanStatus::Failed,
            (true, true) => PlanStatus::Partial,
            (false, false) => PlanStatus::Pending,
        }
    }
}
