//! Topology editing for a live [`Plan`] (§4.7 `reshape`).
//!
//! Operations are applied to a working copy of the plan; if any operation
//! or the final cycle check fails, the whole batch is discarded and the
//! caller's plan is left untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::builder::{recompute_topology, SNAPSHOT_VALIDATION_PRODUCER_ID};
use crate::error::{OrchestratorError, Result};
use crate::ids::NodeId;
use crate::model::plan::{Node, NodeState, NodeStatus, Plan};
use crate::model::spec::{is_valid_producer_id, JobSpec};

/// One topology edit within a [`reshape`] batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ReshapeOp {
    /// Insert a new, independent node.
    AddNode { job: JobSpec },
    /// Remove a node. It is stripped from every remaining node's
    /// `dependencies`.
    RemoveNode { producer_id: String },
    /// Replace a node's dependency set wholesale.
    UpdateDeps { producer_id: String, dependencies: Vec<String> },
    /// Insert `job` as the sole predecessor of `producer_id`: the new node
    /// inherits `producer_id`'s old dependencies, and `producer_id`'s sole
    /// dependency becomes the new node.
    AddBefore { producer_id: String, job: JobSpec },
    /// Insert `job` as the sole successor of `producer_id`: the new node
    /// depends solely on `producer_id`, and every node that previously
    /// depended on `producer_id` is rewired to depend on the new node
    /// instead.
    AddAfter { producer_id: String, job: JobSpec },
}

/// Apply `ops` atomically to `plan`, returning the reshaped plan. `plan`
/// itself is not mutated; on any failure the caller's plan is unaffected.
///
/// # Errors
/// Returns [`OrchestratorError::Validation`] if an operation names an
/// unknown node, introduces a cycle, or touches a non-`pending`/`ready`
/// node; returns [`OrchestratorError::InvalidNodeState`] if the target of a
/// mutating op is not `pending`/`ready`.
pub fn reshape(plan: &Plan, ops: &[ReshapeOp]) -> Result<Plan> {
    let mut working = plan.clone();
    for op in ops {
        apply_one(&mut working, op)?;
    }
    resync_snapshot_validation(&mut working);
    let (roots, leaves) = recompute_topology(&mut working.nodes);
    working.roots = roots;
    working.leaves = leaves;
    check_acyclic(&working.nodes)?;
    Ok(working)
}

fn require_editable(plan: &Plan, node_id: NodeId, operation: &'static str) -> Result<()> {
    let status = plan.node_states.get(&node_id).map_or(NodeStatus::Pending, |s| s.status);
    if matches!(status, NodeStatus::Pending | NodeStatus::Ready) {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidNodeState { node_id, current: format!("{status:?}"), operation })
    }
}

fn resolve(plan: &Plan, producer_id: &str) -> Result<NodeId> {
    plan.node_id_for_producer(producer_id).ok_or_else(|| OrchestratorError::Validation {
        violations: vec![format!("reshape references unknown producer_id `{producer_id}`")],
    })
}

fn insert_job(plan: &mut Plan, job: &JobSpec, dependencies: Vec<NodeId>) -> Result<NodeId> {
    if !is_valid_producer_id(&job.producer_id) {
        return Err(OrchestratorError::Validation {
            violations: vec![format!("producer_id `{}` does not match ^[a-z0-9-]{{3,64}}$", job.producer_id)],
        });
    }
    if plan.producer_id_to_node_id.contains_key(&job.producer_id) {
        return Err(OrchestratorError::Validation {
            violations: vec![format!("duplicate producer_id `{}`", job.producer_id)],
        });
    }
    let node_id = NodeId::new();
    plan.producer_id_to_node_id.insert(job.producer_id.clone(), node_id);
    plan.nodes.insert(
        node_id,
        Node {
            id: node_id,
            producer_id: job.producer_id.clone(),
            task: job.task.clone(),
            work: job.work.clone(),
            dependencies,
            dependents: Vec::new(),
            prechecks: job.prechecks.clone(),
            postchecks: job.postchecks.clone(),
            instructions: job.instructions.clone(),
            group: job.group.clone(),
            expects_no_changes: job.expects_no_changes,
            is_snapshot_validation: false,
            base_branch: job.base_branch.clone(),
        },
    );
    plan.node_states.insert(node_id, NodeState::new_pending());
    Ok(node_id)
}

fn apply_one(plan: &mut Plan, op: &ReshapeOp) -> Result<()> {
    match op {
        ReshapeOp::AddNode { job } => {
            let dependencies =
                job.dependencies.iter().map(|d| resolve(plan, d)).collect::<Result<Vec<_>>>()?;
            insert_job(plan, job, dependencies)?;
        }
        ReshapeOp::RemoveNode { producer_id } => {
            let node_id = resolve(plan, producer_id)?;
            require_editable(plan, node_id, "remove_node")?;
            plan.nodes.remove(&node_id);
            plan.node_states.remove(&node_id);
            plan.producer_id_to_node_id.remove(producer_id);
            for node in plan.nodes.values_mut() {
                node.dependencies.retain(|d| *d != node_id);
            }
        }
        ReshapeOp::UpdateDeps { producer_id, dependencies } => {
            let node_id = resolve(plan, producer_id)?;
            require_editable(plan, node_id, "update_deps")?;
            let resolved = dependencies.iter().map(|d| resolve(plan, d)).collect::<Result<Vec<_>>>()?;
            if let Some(node) = plan.nodes.get_mut(&node_id) {
                node.dependencies = resolved;
            }
        }
        ReshapeOp::AddBefore { producer_id, job } => {
            let target_id = resolve(plan, producer_id)?;
            require_editable(plan, target_id, "add_before")?;
            let inherited = plan.nodes[&target_id].dependencies.clone();
            let new_id = insert_job(plan, job, inherited)?;
            if let Some(node) = plan.nodes.get_mut(&target_id) {
                node.dependencies = vec![new_id];
            }
        }
        ReshapeOp::AddAfter { producer_id, job } => {
            let target_id = resolve(plan, producer_id)?;
            let new_id = insert_job(plan, job, vec![target_id])?;
            let dependents: Vec<NodeId> = plan
                .nodes
                .values()
                .filter(|n| n.id != new_id && n.dependencies.contains(&target_id))
                .map(|n| n.id)
                .collect();
            for dependent_id in dependents {
                require_editable(plan, dependent_id, "add_after")?;
                if let Some(node) = plan.nodes.get_mut(&dependent_id) {
                    for dep in &mut node.dependencies {
                        if *dep == target_id {
                            *dep = new_id;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// The Snapshot-Validation node always depends on exactly the plan's
/// current leaves (excluding itself) after a topology change.
fn resync_snapshot_validation(plan: &mut Plan) {
    let Some(&snapshot_id) = plan.producer_id_to_node_id.get(SNAPSHOT_VALIDATION_PRODUCER_ID) else {
        return;
    };
    let (_, leaves_before) = {
        let mut scratch = plan.nodes.clone();
        scratch.remove(&snapshot_id);
        recompute_topology(&mut scratch)
    };
    if let Some(node) = plan.nodes.get_mut(&snapshot_id) {
        node.dependencies = leaves_before;
    }
}

fn check_acyclic(nodes: &BTreeMap<NodeId, Node>) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut marks: BTreeMap<NodeId, Mark> = nodes.keys().map(|id| (*id, Mark::Unvisited)).collect();
    let mut stack = Vec::new();

    fn visit(
        id: NodeId,
        nodes: &BTreeMap<NodeId, Node>,
        marks: &mut BTreeMap<NodeId, Mark>,
        stack: &mut Vec<NodeId>,
    ) -> Option<Vec<NodeId>> {
        if marks[&id] == Mark::InProgress {
            let pos = stack.iter().position(|&x| x == id).unwrap_or(0);
            let mut cycle = stack[pos..].to_vec();
            cycle.push(id);
            return Some(cycle);
        }
        if marks[&id] == Mark::Done {
            return None;
        }
        marks.insert(id, Mark::InProgress);
        stack.push(id);
        for dep in &nodes[&id].dependencies {
            if let Some(cycle) = visit(*dep, nodes, marks, stack) {
                return Some(cycle);
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        None
    }

    for id in nodes.keys().copied().collect::<Vec<_>>() {
        if marks[&id] == Mark::Unvisited
            && let Some(cycle) = visit(id, nodes, &mut marks, &mut stack)
        {
            let names: Vec<String> = cycle.iter().map(|id| nodes[id].producer_id.clone()).collect();
            return Err(OrchestratorError::Validation {
                violations: vec![format!("reshape introduces a dependency cycle: {}", names.join(" -> "))],
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::TempDir;
    use weave_exec::{Shell, ShellSpec, WorkSpec};
    use weave_git::CliGit;

    use super::*;
    use crate::builder::build_plan;
    use crate::model::spec::PlanSpec;

    fn git_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let run = |args: &[&str]| {
            let out = std::process::Command::new("git").args(args).current_dir(dir.path()).output().unwrap();
            assert!(out.status.success());
        };
        run(&["init", "-q", "-b", "main"]);
        run(&["config", "user.email", "t@example.com"]);
        run(&["config", "user.name", "T"]);
        std::fs::write(dir.path().join("README.md"), "root\n").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-q", "-m", "initial"]);
        dir
    }

    fn shell_job(producer_id: &str, deps: &[&str]) -> JobSpec {
        JobSpec {
            producer_id: producer_id.to_owned(),
            task: producer_id.to_owned(),
            work: WorkSpec::Shell { spec: ShellSpec { command: "true".to_owned(), shell: Shell::Sh }, on_failure: None },
            dependencies: deps.iter().map(|s| (*s).to_owned()).collect(),
            prechecks: None,
            postchecks: None,
            instructions: None,
            group: None,
            expects_no_changes: false,
            base_branch: None,
        }
    }

    fn plan_with(jobs: Vec<JobSpec>) -> Plan {
        let repo = git_repo();
        let git = CliGit;
        let spec = PlanSpec {
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
        };
        build_plan(spec, repo.path(), &git).unwrap()
    }

    #[test]
    fn add_before_rewires_target_to_depend_solely_on_new_node() {
        let plan = plan_with(vec![shell_job("x", &[]), shell_job("y", &["x"])]);
        let reshaped = reshape(&plan, &[ReshapeOp::AddBefore { producer_id: "y".to_owned(), job: shell_job("z", &[]) }]).unwrap();

        let y = reshaped.node(reshaped.node_id_for_producer("y").unwrap()).unwrap();
        let z_id = reshaped.node_id_for_producer("z").unwrap();
        assert_eq!(y.dependencies, vec![z_id]);
        let z = reshaped.node(z_id).unwrap();
        let x_id = reshaped.node_id_for_producer("x").unwrap();
        assert_eq!(z.dependencies, vec![x_id]);
    }

    #[test]
    fn add_after_rewires_existing_dependents_to_new_node() {
        let plan = plan_with(vec![shell_job("x", &[]), shell_job("y", &["x"])]);
        let reshaped = reshape(&plan, &[ReshapeOp::AddAfter { producer_id: "x".to_owned(), job: shell_job("z", &[]) }]).unwrap();

        let z_id = reshaped.node_id_for_producer("z").unwrap();
        let y = reshaped.node(reshaped.node_id_for_producer("y").unwrap()).unwrap();
        assert_eq!(y.dependencies, vec![z_id]);
    }

    #[test]
    fn remove_node_strips_it_from_dependents() {
        let plan = plan_with(vec![shell_job("x", &[]), shell_job("y", &["x"])]);
        let reshaped = reshape(&plan, &[ReshapeOp::RemoveNode { producer_id: "x".to_owned() }]).unwrap();
        assert!(reshaped.node_id_for_producer("x").is_none());
        let y = reshaped.node(reshaped.node_id_for_producer("y").unwrap()).unwrap();
        assert!(y.dependencies.is_empty());
    }

    #[test]
    fn update_deps_introducing_a_cycle_is_rejected() {
        let plan = plan_with(vec![shell_job("x", &[]), shell_job("y", &["x"])]);
        let err = reshape(&plan, &[ReshapeOp::UpdateDeps { producer_id: "x".to_owned(), dependencies: vec!["y".to_owned()] }])
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation { .. }));
    }

    #[test]
    fn snapshot_validation_resyncs_after_add_node() {
        let mut plan = plan_with(vec![shell_job("a", &[])]);
        let snapshot = shell_job(SNAPSHOT_VALIDATION_PRODUCER_ID, &["a"]);
        plan = reshape(&plan, &[ReshapeOp::AddNode { job: snapshot }]).unwrap();
        plan.nodes.get_mut(&plan.node_id_for_producer(SNAPSHOT_VALIDATION_PRODUCER_ID).unwrap()).unwrap().is_snapshot_validation = true;

        let reshaped = reshape(&plan, &[ReshapeOp::AddNode { job: shell_job("b", &[]) }]).unwrap();
        let snapshot_id = reshaped.node_id_for_producer(SNAPSHOT_VALIDATION_PRODUCER_ID).unwrap();
        let snapshot = reshaped.node(snapshot_id).unwrap();
        let b_id = reshaped.node_id_for_producer("b").unwrap();
        assert!(snapshot.dependencies.contains(&b_id));
    }
}
