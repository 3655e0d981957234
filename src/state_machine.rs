//! Node readiness and plan status rollup (§4.5).
//!
//! This module holds the pure transition logic; [`crate::runner::PlanRunner`]
//! and [`crate::scheduler::Scheduler`] call into it and persist the result.

use crate::ids::NodeId;
use crate::model::plan::{NodeStatus, Plan};

/// Recompute `pending → ready` and `pending → blocked` transitions for every
/// node whose dependencies have all reached a terminal status, or whose
/// dependencies include a `failed`/`blocked`/`canceled` node.
///
/// Returns the set of nodes whose status changed, so callers can emit
/// `node_transition` events without re-diffing the whole plan.
pub fn advance_readiness(plan: &mut Plan) -> Vec<NodeId> {
    let mut changed = Vec::new();
    if plan.is_paused {
        return changed;
    }

    let node_ids: Vec<NodeId> = plan.nodes.keys().copied().collect();
    for id in node_ids {
        let Some(state) = plan.node_states.get(&id) else { continue };
        if state.status != NodeStatus::Pending {
            continue;
        }
        let Some(node) = plan.nodes.get(&id) else { continue };

        let mut any_bad = false;
        let mut all_succeeded = true;
        for dep in &node.dependencies {
            match plan.node_states.get(dep).map(|s| s.status) {
                Some(NodeStatus::Succeeded) => {}
                Some(NodeStatus::Failed | NodeStatus::Blocked | NodeStatus::Canceled) => {
                    any_bad = true;
                    all_succeeded = false;
                }
                _ => all_succeeded = false,
            }
        }

        let next = if any_bad {
            Some(NodeStatus::Blocked)
        } else if all_succeeded {
            Some(NodeStatus::Ready)
        } else {
            None
        };

        if let Some(next) = next
            && let Some(state) = plan.node_states.get_mut(&id)
        {
            state.status = next;
            changed.push(id);
        }
    }
    changed
}

/// Nodes currently eligible for scheduling: status `ready` in a plan that is
/// neither paused nor already fully resolved.
#[must_use]
pub fn ready_nodes(plan: &Plan) -> Vec<NodeId> {
    if plan.is_paused {
        return Vec::new();
    }
    plan.node_states
        .iter()
        .filter(|(_, state)| state.status == NodeStatus::Ready)
        .map(|(id, _)| *id)
        .collect()
}

/// `true` once no node can ever transition again: all terminal, or all
/// `pending`/`blocked` with no path to `ready` remaining.
#[must_use]
pub fn is_plan_settled(plan: &Plan) -> bool {
    plan.node_states.values().all(|s| s.status.is_terminal())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use weave_exec::{Shell, ShellSpec, WorkSpec};

    use super::*;
    use crate::ids::PlanId;
    use crate::model::plan::NodeState;
    use crate::model::spec::PlanSpec;

    fn shell_node(id: NodeId, deps: Vec<NodeId>) -> crate::model::plan::Node {
        crate::model::plan::Node {
            id,
            producer_id: id.to_string(),
            task: "do work".to_owned(),
            work: WorkSpec::Shell {
                spec: ShellSpec { command: "true".to_owned(), shell: Shell::Sh },
                on_failure: None,
            },
            dependencies: deps,
            dependents: Vec::new(),
            prechecks: None,
            postchecks: None,
            instructions: None,
            group: None,
            expects_no_changes: false,
            is_snapshot_validation: false,
            base_branch: None,
        }
    }

    fn empty_plan() -> Plan {
        Plan {
            id: PlanId::new(),
            spec: PlanSpec {
                name: "t".to_owned(),
                base_branch: None,
                target_branch: None,
                max_parallel: 0,
                clean_up_successful_work: true,
                verify_ri: None,
                env: BTreeMap::new(),
                extra_symlinks: Vec::new(),
                start_paused: false,
                jobs: Vec::new(),
            },
            base_branch: "main".to_owned(),
            target_branch: "weave/t".to_owned(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            nodes: BTreeMap::new(),
            node_states: BTreeMap::new(),
            producer_id_to_node_id: BTreeMap::new(),
            roots: Vec::new(),
            leaves: Vec::new(),
            is_paused: false,
            parent_plan_id: None,
            work_summary: None,
            explicitly_canceled: false,
        }
    }

    #[test]
    fn root_node_becomes_ready_immediately() {
        let mut plan = empty_plan();
        let root = NodeId::new();
        plan.nodes.insert(root, shell_node(root, vec![]));
        plan.node_states.insert(root, NodeState::new_pending());

        let changed = advance_readiness(&mut plan);
        assert_eq!(changed, vec![root]);
        assert_eq!(plan.node_states[&root].status, NodeStatus::Ready);
    }

    #[test]
    fn dependent_node_blocks_on_failed_dependency() {
        let mut plan = empty_plan();
        let root = NodeId::new();
        let child = NodeId::new();
        plan.nodes.insert(root, shell_node(root, vec![]));
        plan.nodes.insert(child, shell_node(child, vec![root]));
        let mut root_state = NodeState::new_pending();
        root_state.status = NodeStatus::Failed;
        plan.node_states.insert(root, root_state);
        plan.node_states.insert(child, NodeState::new_pending());

        advance_readiness(&mut plan);
        assert_eq!(plan.node_states[&child].status, NodeStatus::Blocked);
    }

    #[test]
    fn dependent_node_stays_pending_until_all_deps_succeed() {
        let mut plan = empty_plan();
        let a = NodeId::new();
        let b = NodeId::new();
        let child = NodeId::new();
        plan.nodes.insert(a, shell_node(a, vec![]));
        plan.nodes.insert(b, shell_node(b, vec![]));
        plan.nodes.insert(child, shell_node(child, vec![a, b]));
        let mut a_state = NodeState::new_pending();
        a_state.status = NodeStatus::Succeeded;
        plan.node_states.insert(a, a_state);
        plan.node_states.insert(b, NodeState::new_pending());
        plan.node_states.insert(child, NodeState::new_pending());

        advance_readiness(&mut plan);
        assert_eq!(plan.node_states[&child].status, NodeStatus::Pending);
    }

    #[test]
    fn paused_plan_never_advances() {
        let mut plan = empty_plan();
        plan.is_paused = true;
        let root = NodeId::new();
        plan.nodes.insert(root, shell_node(root, vec![]));
        plan.node_states.insert(root, NodeState::new_pending());

        assert!(advance_readiness(&mut plan).is_empty());
        assert_eq!(plan.node_states[&root].status, NodeStatus::Pending);
    }
}
