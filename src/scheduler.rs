//! The Scheduler (Pump) (C6): promotes `ready` nodes to `scheduled` under
//! the parallelism cap and dispatches them onto the Node Pipeline.
//!
//! Edge-triggered: [`crate::runner::PlanRunner`] calls [`Scheduler::pump`]
//! after every mutation (enqueue, resume, retry, reshape, node completion).
//! The pulse thread started by [`Scheduler::spawn_pulse`] is a low-frequency
//! fallback only, not required for correctness.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use threadpool::ThreadPool;
use tracing::debug;
use weave_exec::{AgentSpec, CancelToken, OnFailure, WorkSpec};

use crate::capacity::Lease;
use crate::events::Event;
use crate::ids::{NodeId, PlanId};
use crate::logstore;
use crate::model::plan::{FailureReason, NodeStatus, Plan, TriggerType};
use crate::persistence;
use crate::pipeline::{self, PipelineContext};
use crate::runner::RunnerCore;
use crate::state_machine;

/// Dispatches ready nodes onto a bounded worker pool shared by every plan in
/// the registry.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<RunnerCore>,
    pool: ThreadPool,
}

impl Scheduler {
    pub(crate) fn new(core: Arc<RunnerCore>, worker_threads: usize) -> Self {
        Self { core, pool: ThreadPool::new(worker_threads.max(1)) }
    }

    /// Start the periodic pulse thread. Each tick publishes [`Event::Pulse`]
    /// and re-runs [`Self::pump`], catching any readiness change a missed
    /// edge-trigger left unprocessed.
    pub fn spawn_pulse(&self) {
        let scheduler = self.clone();
        let interval = Duration::from_millis(scheduler.core.settings.scheduler.pulse_interval_ms.max(50));
        thread::spawn(move || loop {
            thread::sleep(interval);
            scheduler.core.event_bus.publish(Event::Pulse);
            scheduler.pump();
        });
    }

    /// Recompute readiness across every plan in the registry, then admit as
    /// many `ready` nodes as the capacity cap allows.
    pub fn pump(&self) {
        let plan_ids: Vec<PlanId> = self.core.plans.iter().map(|e| *e.key()).collect();
        let mut candidates: Vec<(PlanId, NodeId)> = Vec::new();

        for plan_id in &plan_ids {
            let Some(entry) = self.core.plans.get(plan_id) else { continue };
            let mut plan = entry.value().lock();

            // Auto-heal runs before readiness propagation so a node revived
            // from `failed` back to `ready` here never lets its dependents
            // get stuck `blocked` by a failure that no longer stands.
            for node_id in apply_auto_heal(&mut plan) {
                self.core.event_bus.publish(Event::NodeTransition {
                    plan_id: *plan_id,
                    node_id,
                    from: NodeStatus::Failed,
                    to: NodeStatus::Ready,
                });
            }

            for node_id in state_machine::advance_readiness(&mut plan) {
                let to = plan.node_states.get(&node_id).map_or(NodeStatus::Pending, |s| s.status);
                self.core.event_bus.publish(Event::NodeTransition {
                    plan_id: *plan_id,
                    node_id,
                    from: NodeStatus::Pending,
                    to,
                });
            }

            if !plan.is_paused && !plan.explicitly_canceled {
                candidates.extend(state_machine::ready_nodes(&plan).into_iter().map(|n| (*plan_id, n)));
            }

            if state_machine::is_plan_settled(&plan) && plan.ended_at.is_none() {
                plan.ended_at = Some(chrono::Utc::now());
                let status = plan.status();
                let _ = persistence::save(&self.core.workspace_root, &plan);
                drop(plan);
                self.core.event_bus.publish(Event::PlanCompleted { plan_id: *plan_id, status });
                continue;
            }
            let _ = persistence::save(&self.core.workspace_root, &plan);
        }

        for (plan_id, node_id) in candidates {
            match self.core.capacity.try_acquire() {
                Ok(Some(lease)) => self.dispatch(plan_id, node_id, lease),
                Ok(None) => {
                    debug!("capacity exhausted; remaining ready nodes wait for the next pump");
                    break;
                }
                Err(err) => {
                    tracing::error!(%err, "capacity broker error; skipping admission this pump");
                    break;
                }
            }
        }
    }

    fn dispatch(&self, plan_id: PlanId, node_id: NodeId, lease: Lease) {
        let prepared = {
            let Some(entry) = self.core.plans.get(&plan_id) else { return };
            let mut plan = entry.value().lock();
            let Some(state) = plan.node_states.get_mut(&node_id) else { return };
            state.status = NodeStatus::Scheduled;
            state.scheduled_at = Some(chrono::Utc::now());
            self.core.event_bus.publish(Event::NodeTransition {
                plan_id,
                node_id,
                from: NodeStatus::Ready,
                to: NodeStatus::Scheduled,
            });
            let trigger = if state.auto_heal_pending {
                state.auto_heal_pending = false;
                TriggerType::AutoHeal
            } else if state.attempts == 0 {
                TriggerType::Initial
            } else {
                TriggerType::Retry
            };

            let ctx = PipelineContext {
                git: self.core.git.as_ref(),
                executor: self.core.executor.as_ref(),
                workspace_root: &self.core.workspace_root,
                event_bus: &self.core.event_bus,
                repo_mutex: &self.core.repo_mutex,
            };
            match pipeline::prepare_attempt(&mut plan, node_id, trigger, &ctx) {
                Ok(prepared) => prepared,
                Err(err) => {
                    tracing::error!(%plan_id, %node_id, %err, "failed to prepare pipeline attempt");
                    return;
                }
            }
        };

        let core = self.core.clone();
        let cancel = CancelToken::new();
        core.cancel_tokens.insert(node_id, (plan_id, cancel.clone()));
        let scheduler = self.clone();

        // The plan's mutex is not held across this closure's body: `prepared`
        // carries its own snapshot, and `execute_attempt` touches only that,
        // `core`'s collaborators, and the filesystem/subprocess surface they
        // expose. This is what lets two nodes of the same plan run truly
        // concurrently and keeps reads (`get`/`get_status`) from blocking on
        // a running node for its whole duration (§5).
        self.pool.execute(move || {
            let ctx = PipelineContext {
                git: core.git.as_ref(),
                executor: core.executor.as_ref(),
                workspace_root: &core.workspace_root,
                event_bus: &core.event_bus,
                repo_mutex: &core.repo_mutex,
            };
            let outcome = pipeline::execute_attempt(prepared, &ctx, &cancel);

            if let Some(entry) = core.plans.get(&plan_id) {
                let mut plan = entry.value().lock();
                pipeline::apply_outcome(&mut plan, node_id, outcome, &ctx);
                let _ = persistence::save(&core.workspace_root, &plan);
            }
            core.cancel_tokens.remove(&node_id);
            let _ = core.capacity.release(lease);

            // This node's completion may free capacity or make successors
            // ready; re-pump so the next admission doesn't wait for a pulse.
            scheduler.pump();
        });
    }
}

/// Revive every ordinary-failed, auto-healable node back to `ready` with a
/// targeted agent [`WorkSpec`] built from its failure log, at most once per
/// node (§7's general auto-heal, distinct from the Snapshot-Validation-
/// specific heal already built into the pipeline's `work` step).
///
/// Must be called with the plan's mutex held. Returns the ids revived, so
/// the caller can emit `node_transition` events without re-diffing the plan.
fn apply_auto_heal(plan: &mut Plan) -> Vec<NodeId> {
    let candidates: Vec<NodeId> = plan
        .node_states
        .iter()
        .filter(|(id, state)| {
            state.status == NodeStatus::Failed
                && state.failure_reason == Some(FailureReason::Normal)
                && plan.nodes.get(id).is_some_and(|n| !n.is_snapshot_validation && n.work.auto_healable())
                && !state.attempt_history.iter().any(|a| a.trigger_type == TriggerType::AutoHeal)
        })
        .map(|(id, _)| *id)
        .collect();

    let mut revived = Vec::new();
    for node_id in candidates {
        let tail = plan
            .node_states
            .get(&node_id)
            .and_then(|s| s.last_attempt.as_ref())
            .and_then(|a| a.log_file_path.as_ref())
            .and_then(|path| logstore::read_tail(Path::new(path), 200).ok())
            .unwrap_or_default()
            .join("\n");
        let error = plan.node_states.get(&node_id).and_then(|s| s.error.clone()).unwrap_or_default();

        let heal_spec = WorkSpec::Agent {
            spec: AgentSpec {
                instructions: format!(
                    "The following work failed: {error}\n\nDiagnose and fix the underlying issue.\n\n{tail}"
                ),
                model: None,
                max_turns: None,
                context_files: Vec::new(),
                resume_session: Some(false),
            },
            on_failure: Some(OnFailure { no_auto_heal: true, message: None, resume_from_phase: None }),
        };

        if let Some(node) = plan.nodes.get_mut(&node_id) {
            node.work = heal_spec;
        }
        if let Some(state) = plan.node_states.get_mut(&node_id) {
            state.status = NodeStatus::Ready;
            state.error = None;
            state.failure_reason = None;
            state.auto_heal_pending = true;
        }
        tracing::warn!(%node_id, "node failed; scheduling one automatic heal attempt");
        revived.push(node_id);
    }
    revived
}
