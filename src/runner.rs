//! The Plan Runner (C7): the orchestrator's public control surface.
//!
//! Owns the registry of live [`Plan`]s, one [`parking_lot::Mutex`] per plan
//! (§5), and wires together the builder, reshape, scheduler, pipeline,
//! persistence, capacity broker, and event bus. Every mutating call
//! persists the affected plan's snapshot before returning and then kicks
//! the [`Scheduler`] so admission happens on the same turn, not the next
//! pulse.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::info;
use weave_exec::{CancelToken, Executor, WorkSpec};
use weave_git::GitPorcelain;

use crate::builder;
use crate::capacity::CapacityBroker;
use crate::error::{OrchestratorError, Result};
use crate::events::{Event, EventBus};
use crate::ids::{NodeId, PlanId};
use crate::model::plan::{AttemptRecord, FailureReason, NodeStatus, Plan, PlanStatus};
use crate::model::spec::PlanSpec;
use crate::persistence;
use crate::reshape::{self, ReshapeOp};
use crate::scheduler::Scheduler;
use crate::settings::Settings;

/// Replacement work for [`PlanRunner::retry_node`]. Fields left `None`
/// leave the node's existing work/prechecks/postchecks untouched.
#[derive(Default, Clone)]
pub struct RetryOptions {
    pub new_work: Option<WorkSpec>,
    pub new_prechecks: Option<WorkSpec>,
    pub new_postchecks: Option<WorkSpec>,
    pub clear_worktree: bool,
}

/// Scope for [`PlanRunner::retry_plan`]. `None` retries every `failed`
/// and `canceled` node in the plan.
#[derive(Default, Clone)]
pub struct RetryPlanOptions {
    pub node_ids: Option<Vec<NodeId>>,
}

/// Shared state behind every clone of a [`PlanRunner`]: the plan registry
/// and every collaborator a pipeline attempt needs. Cheap to clone (an
/// `Arc`); [`Scheduler`] holds the same handle.
pub(crate) struct RunnerCore {
    pub workspace_root: PathBuf,
    pub repo_root: PathBuf,
    pub git: Arc<dyn GitPorcelain>,
    pub executor: Arc<Executor>,
    pub event_bus: EventBus,
    pub capacity: CapacityBroker,
    pub settings: Settings,
    pub plans: DashMap<PlanId, Mutex<Plan>>,
    /// Keyed by node id, with the owning plan id alongside so
    /// [`PlanRunner::cancel`] can signal every dispatched node of one plan
    /// without first locking that plan's (possibly long-held-by-a-running-
    /// attempt) mutex.
    pub cancel_tokens: DashMap<NodeId, (PlanId, CancelToken)>,
    /// Serializes merge-ri and target-branch creation against the one
    /// checked-out primary repository (§5).
    pub repo_mutex: Mutex<()>,
}

/// The orchestrator's public API: enqueue/pause/resume/cancel/delete,
/// retry and reshape, and read access to plan/node state.
#[derive(Clone)]
pub struct PlanRunner {
    core: Arc<RunnerCore>,
    scheduler: Scheduler,
}

impl PlanRunner {
    /// Build a runner rooted at `workspace_root`/`repo_root`, recovering any
    /// plan snapshots an earlier, uncleanly terminated process left behind
    /// (§4.9). Starts the scheduler's pulse thread.
    ///
    /// # Errors
    /// Returns an error if the snapshot directory exists but cannot be
    /// read, or a snapshot file is corrupt.
    pub fn recover(
        workspace_root: PathBuf,
        repo_root: PathBuf,
        git: Arc<dyn GitPorcelain>,
        executor: Arc<Executor>,
        settings: Settings,
    ) -> Result<Self> {
        let capacity = CapacityBroker::new(
            &workspace_root,
            settings.effective_global_cap(),
            Duration::from_secs(settings.capacity.lease_ttl_secs),
        );
        let worker_threads = settings.scheduler.worker_threads;

        let core = Arc::new(RunnerCore {
            workspace_root: workspace_root.clone(),
            repo_root,
            git,
            executor,
            event_bus: EventBus::new(),
            capacity,
            settings,
            plans: DashMap::new(),
            cancel_tokens: DashMap::new(),
            repo_mutex: Mutex::new(()),
        });
        let scheduler = Scheduler::new(core.clone(), worker_threads);

        for plan in persistence::recover_all(&workspace_root)? {
            let plan_id = plan.id;
            core.plans.insert(plan_id, Mutex::new(plan));
            core.event_bus.publish(Event::PlanCreated { plan_id });
            info!(%plan_id, "registered recovered plan");
        }

        let runner = Self { core, scheduler };
        runner.scheduler.spawn_pulse();
        runner.scheduler.pump();
        Ok(runner)
    }

    /// Register a subscriber on the runner's [`EventBus`].
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.core.event_bus.subscribe(handler);
    }

    /// Validate and build a new [`Plan`], persist it, and kick the
    /// scheduler.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::Validation`] on topology violations, or
    /// a git error resolving or creating the target branch.
    pub fn enqueue(&self, spec: PlanSpec) -> Result<Plan> {
        let plan = {
            let _guard = self.core.repo_mutex.lock();
            builder::build_plan(spec, &self.core.repo_root, self.core.git.as_ref())?
        };
        persistence::save(&self.core.workspace_root, &plan)?;
        self.core.plans.insert(plan.id, Mutex::new(plan.clone()));
        self.core.event_bus.publish(Event::PlanCreated { plan_id: plan.id });
        self.scheduler.pump();
        Ok(plan)
    }

    /// Pause a plan: nodes already `running` complete, but none new are
    /// admitted until [`Self::resume`].
    ///
    /// # Errors
    /// Returns [`OrchestratorError::PlanNotFound`] if `plan_id` is unknown.
    pub fn pause(&self, plan_id: PlanId) -> Result<()> {
        self.with_plan(plan_id, |plan| {
            plan.is_paused = true;
            Ok(())
        })
    }

    /// Resume a paused plan and kick the scheduler.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::PlanNotFound`] if `plan_id` is unknown.
    pub fn resume(&self, plan_id: PlanId) -> Result<()> {
        self.with_plan(plan_id, |plan| {
            plan.is_paused = false;
            Ok(())
        })?;
        self.scheduler.pump();
        Ok(())
    }

    /// Mark every non-terminal node `canceled` and signal any running
    /// pipeline to stop.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::PlanNotFound`] if `plan_id` is unknown.
    pub fn cancel(&self, plan_id: PlanId) -> Result<()> {
        // Signal every node of this plan currently dispatched to the
        // scheduler's worker pool first. The plan's mutex is free while a
        // node's pipeline runs (it's only held briefly to prepare and to
        // apply the attempt), but the subprocess itself keeps running until
        // killed — signal it before setting every node `canceled` below so
        // the two don't race on which one looks authoritative.
        for entry in &self.core.cancel_tokens {
            let (owner, token) = entry.value();
            if *owner == plan_id {
                token.cancel();
            }
        }

        self.with_plan(plan_id, |plan| {
            for state in plan.node_states.values_mut() {
                if !state.status.is_terminal() {
                    state.status = NodeStatus::Canceled;
                    state.failure_reason = Some(FailureReason::Canceled);
                }
            }
            plan.explicitly_canceled = true;
            plan.ended_at = Some(Utc::now());
            Ok(())
        })?;
        self.core.event_bus.publish(Event::PlanCompleted { plan_id, status: PlanStatus::Canceled });
        Ok(())
    }

    /// Cancel the plan, then remove its worktrees, logs, and persisted
    /// snapshot.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::PlanNotFound`] if `plan_id` is unknown,
    /// or an I/O error removing worktrees/logs.
    pub fn delete(&self, plan_id: PlanId) -> Result<()> {
        self.cancel(plan_id)?;

        let worktrees_dir = self.core.workspace_root.join(".worktrees").join(plan_id.to_string());
        if worktrees_dir.exists() {
            std::fs::remove_dir_all(&worktrees_dir)?;
        }
        let logs_dir = self.core.workspace_root.join(".orchestrator").join("logs").join(plan_id.to_string());
        if logs_dir.exists() {
            std::fs::remove_dir_all(&logs_dir)?;
        }

        persistence::delete(&self.core.workspace_root, plan_id)?;
        self.core.plans.remove(&plan_id);
        self.core.event_bus.publish(Event::PlanDeleted { plan_id });
        Ok(())
    }

    /// Replace a `failed`/`canceled` node's work (and optionally its
    /// prechecks/postchecks) and reset it to `ready`. Upstream `succeeded`
    /// nodes are left untouched.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::InvalidNodeState`] if the node is not
    /// currently `failed` or `canceled`.
    pub fn retry_node(&self, plan_id: PlanId, node_id: NodeId, opts: RetryOptions) -> Result<()> {
        self.with_plan(plan_id, |plan| {
            let status = plan
                .node_states
                .get(&node_id)
                .map(|s| s.status)
                .ok_or(OrchestratorError::NodeNotFound { plan_id, node_id })?;
            if !matches!(status, NodeStatus::Failed | NodeStatus::Canceled) {
                return Err(OrchestratorError::InvalidNodeState {
                    node_id,
                    current: format!("{status:?}"),
                    operation: "retry_node",
                });
            }
            if let Some(node) = plan.nodes.get_mut(&node_id) {
                if let Some(work) = opts.new_work {
                    node.work = work;
                }
                if let Some(pre) = opts.new_prechecks {
                    node.prechecks = Some(pre);
                }
                if let Some(post) = opts.new_postchecks {
                    node.postchecks = Some(post);
                }
            }
            if let Some(state) = plan.node_states.get_mut(&node_id) {
                state.status = NodeStatus::Ready;
                state.error = None;
                state.failure_reason = None;
                if opts.clear_worktree {
                    state.worktree_path = None;
                    state.worktree_cleaned_up = false;
                }
            }
            Ok(())
        })?;
        self.scheduler.pump();
        Ok(())
    }

    /// Apply [`Self::retry_node`] to every targeted node (every
    /// `failed`/`canceled` node, or `opts.node_ids` if given), then resume
    /// the plan.
    ///
    /// # Errors
    /// Propagates the first [`OrchestratorError`] encountered.
    pub fn retry_plan(&self, plan_id: PlanId, opts: RetryPlanOptions) -> Result<()> {
        let targets = match opts.node_ids {
            Some(ids) => ids,
            None => self.with_plan(plan_id, |plan| {
                Ok(plan
                    .node_states
                    .iter()
                    .filter(|(_, s)| matches!(s.status, NodeStatus::Failed | NodeStatus::Canceled))
                    .map(|(id, _)| *id)
                    .collect())
            })?,
        };
        for node_id in targets {
            self.retry_node(plan_id, node_id, RetryOptions::default())?;
        }
        self.resume(plan_id)
    }

    /// Apply a batch of topology edits atomically (§4.7).
    ///
    /// # Errors
    /// Returns [`OrchestratorError::Validation`] if the batch introduces a
    /// cycle or references an unknown node, or
    /// [`OrchestratorError::InvalidNodeState`] if an op targets a node that
    /// is not `pending`/`ready`.
    pub fn reshape(&self, plan_id: PlanId, ops: Vec<ReshapeOp>) -> Result<()> {
        let reshaped = {
            let entry = self.core.plans.get(&plan_id).ok_or(OrchestratorError::PlanNotFound { plan_id })?;
            let plan = entry.value().lock();
            reshape::reshape(&plan, &ops)?
        };
        persistence::save(&self.core.workspace_root, &reshaped)?;
        if let Some(entry) = self.core.plans.get(&plan_id) {
            *entry.value().lock() = reshaped;
        }
        self.scheduler.pump();
        Ok(())
    }

    /// Force a `running`/`scheduled` node to `failed` with
    /// `failure_reason: crashed`, terminating its pipeline.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::InvalidNodeState`] if the node is not
    /// `running`/`scheduled`.
    pub fn force_fail_node(&self, plan_id: PlanId, node_id: NodeId, reason: Option<String>) -> Result<()> {
        // Signal the node's running subprocess first so it stops promptly;
        // otherwise the in-flight attempt could still call `apply_outcome`
        // after we mark the node `failed` below and overwrite our status.
        if let Some(entry) = self.core.cancel_tokens.get(&node_id) {
            entry.value().1.cancel();
        }
        self.with_plan(plan_id, |plan| {
            let status = plan
                .node_states
                .get(&node_id)
                .map(|s| s.status)
                .ok_or(OrchestratorError::NodeNotFound { plan_id, node_id })?;
            if !matches!(status, NodeStatus::Running | NodeStatus::Scheduled) {
                return Err(OrchestratorError::InvalidNodeState {
                    node_id,
                    current: format!("{status:?}"),
                    operation: "force_fail_node",
                });
            }
            if let Some(state) = plan.node_states.get_mut(&node_id) {
                state.status = NodeStatus::Failed;
                state.failure_reason = Some(FailureReason::Crashed);
                state.error = Some(reason.unwrap_or_else(|| "force-failed by operator".to_owned()));
            }
            Ok(())
        })?;
        self.core.cancel_tokens.remove(&node_id);
        self.scheduler.pump();
        Ok(())
    }

    /// Snapshot of every plan currently in the registry.
    #[must_use]
    pub fn get_all(&self) -> Vec<Plan> {
        self.core.plans.iter().map(|e| e.value().lock().clone()).collect()
    }

    /// Snapshot of one plan.
    #[must_use]
    pub fn get(&self, plan_id: PlanId) -> Option<Plan> {
        self.core.plans.get(&plan_id).map(|e| e.value().lock().clone())
    }

    /// A plan's rollup status.
    #[must_use]
    pub fn get_status(&self, plan_id: PlanId) -> Option<PlanStatus> {
        self.core.plans.get(&plan_id).map(|e| e.value().lock().status())
    }

    /// Full log text for a node's most recent attempt, read back from disk.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::NodeNotFound`] if the plan/node is
    /// unknown or has no attempt yet, or an I/O error reading the log file.
    pub fn get_node_logs(&self, plan_id: PlanId, node_id: NodeId) -> Result<String> {
        let path = self.with_plan(plan_id, |plan| {
            plan.node_states
                .get(&node_id)
                .and_then(|s| s.last_attempt.as_ref())
                .and_then(|a| a.log_file_path.clone())
                .ok_or(OrchestratorError::NodeNotFound { plan_id, node_id })
        })?;
        Ok(std::fs::read_to_string(path)?)
    }

    /// Every recorded attempt for one node, oldest first.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::PlanNotFound`]/`NodeNotFound` if either
    /// id is unknown.
    pub fn get_node_attempts(&self, plan_id: PlanId, node_id: NodeId) -> Result<Vec<AttemptRecord>> {
        self.with_plan(plan_id, |plan| {
            plan.node_states
                .get(&node_id)
                .map(|s| s.attempt_history.clone())
                .ok_or(OrchestratorError::NodeNotFound { plan_id, node_id })
        })
    }

    /// The failed phase and error message of a node's most recent attempt,
    /// if it has one.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::PlanNotFound`]/`NodeNotFound` if either
    /// id is unknown.
    pub fn get_node_failure_context(&self, plan_id: PlanId, node_id: NodeId) -> Result<Option<(String, String)>> {
        self.with_plan(plan_id, |plan| {
            let state = plan.node_states.get(&node_id).ok_or(OrchestratorError::NodeNotFound { plan_id, node_id })?;
            Ok(state
                .last_attempt
                .as_ref()
                .filter(|a| a.error.is_some())
                .map(|a| (format!("{:?}", a.failed_phase), a.error.clone().unwrap_or_default())))
        })
    }

    /// A plan's effective end time: its own `ended_at` if set, else the
    /// latest effective end time among its child plans.
    #[must_use]
    pub fn get_effective_ended_at(&self, plan_id: PlanId) -> Option<DateTime<Utc>> {
        let plan = self.get(plan_id)?;
        if let Some(ended) = plan.ended_at {
            return Some(ended);
        }
        let children: Vec<PlanId> = self
            .core
            .plans
            .iter()
            .filter(|e| e.value().lock().parent_plan_id == Some(plan_id))
            .map(|e| *e.key())
            .collect();
        children.into_iter().filter_map(|child| self.get_effective_ended_at(child)).max()
    }

    fn with_plan<T>(&self, plan_id: PlanId, f: impl FnOnce(&mut Plan) -> Result<T>) -> Result<T> {
        let entry = self.core.plans.get(&plan_id).ok_or(OrchestratorError::PlanNotFound { plan_id })?;
        let mut plan = entry.value().lock();
        let result = f(&mut plan)?;
        persistence::save(&self.core.workspace_root, &plan)?;
        Ok(result)
    }
}
