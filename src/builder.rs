//! Builds a runtime [`Plan`] from an immutable [`PlanSpec`] (§4.5 topology
//! invariants, §4.7 `enqueue`).
//!
//! This is where the Snapshot-Validation node is synthesized and stitched
//! into the topology, and where the plan's base/target branches are
//! resolved against the repository.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::Utc;
use weave_git::GitPorcelain;

use crate::error::Result;
use crate::ids::{NodeId, PlanId};
use crate::model::plan::{Node, NodeState, Plan};
use crate::model::spec::{JobSpec, PlanSpec};

/// Producer id of the auto-injected Snapshot-Validation node.
pub const SNAPSHOT_VALIDATION_PRODUCER_ID: &str = "snapshot-validation";
const TARGET_BRANCH_PREFIX: &str = "weave";

/// Build a [`Plan`] from `spec`, validating topology and resolving the
/// base/target branches against `repo`. Creates the target branch if it
/// does not yet exist.
///
/// # Errors
/// Returns [`crate::error::OrchestratorError::Validation`] on topology
/// violations, or a git error if branch resolution/creation fails.
pub fn build_plan(spec: PlanSpec, repo: &Path, git: &dyn GitPorcelain) -> Result<Plan> {
    spec.validate()?;

    let id = PlanId::new();
    let base_branch = resolve_base_branch(&spec, repo, git)?;
    let target_branch = resolve_target_branch(&spec, &base_branch, &id, repo, git)?;

    let mut jobs = spec.jobs.clone();
    if let Some(verify_work) = spec.verify_ri.clone() {
        jobs.push(synthetic_snapshot_validation_job(&jobs, verify_work));
    }

    let producer_id_to_node_id: BTreeMap<String, NodeId> =
        jobs.iter().map(|j| (j.producer_id.clone(), NodeId::new())).collect();

    let mut nodes = BTreeMap::new();
    let mut node_states = BTreeMap::new();
    for job in &jobs {
        let node_id = producer_id_to_node_id[&job.producer_id];
        let dependencies: Vec<NodeId> = job.dependencies.iter().map(|d| producer_id_to_node_id[d]).collect();
        nodes.insert(node_id, job_to_node(node_id, job, dependencies, &spec));
        node_states.insert(node_id, NodeState::new_pending());
    }

    link_dependents(&mut nodes);
    let (roots, leaves) = roots_and_leaves(&nodes);

    let is_paused = spec.start_paused;
    Ok(Plan {
        id,
        spec,
        base_branch,
        target_branch,
        created_at: Utc::now(),
        started_at: None,
        ended_at: None,
        nodes,
        node_states,
        producer_id_to_node_id,
        roots,
        leaves,
        is_paused,
        parent_plan_id: None,
        work_summary: None,
        explicitly_canceled: false,
    })
}

fn resolve_base_branch(spec: &PlanSpec, repo: &Path, git: &dyn GitPorcelain) -> Result<String> {
    if let Some(base) = &spec.base_branch {
        return Ok(base.clone());
    }
    Ok(git.current_branch(repo)?.unwrap_or_else(|| "main".to_owned()))
}

fn resolve_target_branch(
    spec: &PlanSpec,
    base_branch: &str,
    id: &PlanId,
    repo: &Path,
    git: &dyn GitPorcelain,
) -> Result<String> {
    if let Some(target) = &spec.target_branch {
        return Ok(target.clone());
    }
    let root = git.resolve_target_root(repo, base_branch, TARGET_BRANCH_PREFIX, &id.to_string())?;
    if root.needs_creation {
        git.create_branch(repo, &root.root_branch, base_branch)?;
    }
    Ok(root.root_branch)
}

fn job_to_node(id: NodeId, job: &JobSpec, dependencies: Vec<NodeId>, spec: &PlanSpec) -> Node {
    Node {
        id,
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
        is_snapshot_validation: spec.verify_ri.is_some() && job.producer_id == SNAPSHOT_VALIDATION_PRODUCER_ID,
        base_branch: job.base_branch.clone(),
    }
}

/// Build the synthetic Snapshot-Validation job: depends on every current
/// leaf (a job not referenced as anyone else's dependency) and becomes the
/// plan's unique final leaf.
fn synthetic_snapshot_validation_job(jobs: &[JobSpec], work: weave_exec::WorkSpec) -> JobSpec {
    let referenced: BTreeSet<&str> =
        jobs.iter().flat_map(|j| j.dependencies.iter().map(String::as_str)).collect();
    let leaf_producer_ids: Vec<String> =
        jobs.iter().filter(|j| !referenced.contains(j.producer_id.as_str())).map(|j| j.producer_id.clone()).collect();

    JobSpec {
        producer_id: SNAPSHOT_VALIDATION_PRODUCER_ID.to_owned(),
        task: "Validate the plan's aggregate result".to_owned(),
        work,
        dependencies: leaf_producer_ids,
        prechecks: None,
        postchecks: None,
        instructions: None,
        group: None,
        expects_no_changes: false,
        base_branch: None,
    }
}

fn link_dependents(nodes: &mut BTreeMap<NodeId, Node>) {
    let edges: Vec<(NodeId, NodeId)> =
        nodes.values().flat_map(|n| n.dependencies.iter().map(move |d| (*d, n.id))).collect();
    for (dep, dependent) in edges {
        if let Some(node) = nodes.get_mut(&dep) {
            node.dependents.push(dependent);
        }
    }
}

fn roots_and_leaves(nodes: &BTreeMap<NodeId, Node>) -> (Vec<NodeId>, Vec<NodeId>) {
    let mut roots = Vec::new();
    let mut leaves = Vec::new();
    for node in nodes.values() {
        if node.dependencies.is_empty() {
            roots.push(node.id);
        }
        if node.dependents.is_empty() {
            leaves.push(node.id);
        }
    }
    (roots, leaves)
}

/// Recompute `dependents`, `roots`, and `leaves` from each node's
/// `dependencies`. Used by [`crate::reshape`] after a topology edit, since
/// reshape operations only ever touch `dependencies` directly.
pub(crate) fn recompute_topology(nodes: &mut BTreeMap<NodeId, Node>) -> (Vec<NodeId>, Vec<NodeId>) {
    for node in nodes.values_mut() {
        node.dependents.clear();
    }
    link_dependents(nodes);
    roots_and_leaves(nodes)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::TempDir;
    use weave_exec::{Shell, ShellSpec, WorkSpec};
    use weave_git::CliGit;

    use super::*;

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

    fn shell_job(producer_id: &str, command: &str, deps: &[&str]) -> JobSpec {
        JobSpec {
            producer_id: producer_id.to_owned(),
            task: producer_id.to_owned(),
            work: WorkSpec::Shell { spec: ShellSpec { command: command.to_owned(), shell: Shell::Sh }, on_failure: None },
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

    #[test]
    fn linear_chain_builds_root_and_leaf() {
        let repo = git_repo();
        let git = CliGit;
        let spec = base_spec(vec![shell_job("build", "true", &[]), shell_job("test", "true", &["build"])]);
        let plan = build_plan(spec, repo.path(), &git).unwrap();

        assert_eq!(plan.roots.len(), 1);
        assert_eq!(plan.leaves.len(), 1);
        let root_id = plan.node_id_for_producer("build").unwrap();
        let leaf_id = plan.node_id_for_producer("test").unwrap();
        assert_eq!(plan.roots, vec![root_id]);
        assert_eq!(plan.leaves, vec![leaf_id]);
        assert_eq!(plan.node(root_id).unwrap().dependents, vec![leaf_id]);
    }

    #[test]
    fn default_branch_synthesizes_feature_branch() {
        let repo = git_repo();
        let git = CliGit;
        let mut spec = base_spec(vec![shell_job("build", "true", &[])]);
        spec.base_branch = None;
        let plan = build_plan(spec, repo.path(), &git).unwrap();
        assert!(plan.target_branch.starts_with("weave/"));
        assert!(git.branch_exists(repo.path(), &plan.target_branch).unwrap());
    }

    #[test]
    fn verify_ri_injects_snapshot_validation_depending_on_every_leaf() {
        let repo = git_repo();
        let git = CliGit;
        let mut spec = base_spec(vec![shell_job("a", "true", &[]), shell_job("b", "true", &[])]);
        spec.verify_ri = Some(WorkSpec::Shell { spec: ShellSpec { command: "true".to_owned(), shell: Shell::Sh }, on_failure: None });
        let plan = build_plan(spec, repo.path(), &git).unwrap();

        assert_eq!(plan.leaves.len(), 1);
        let snapshot_id = plan.node_id_for_producer(SNAPSHOT_VALIDATION_PRODUCER_ID).unwrap();
        assert_eq!(plan.leaves, vec![snapshot_id]);
        let snapshot = plan.node(snapshot_id).unwrap();
        assert!(snapshot.is_snapshot_validation);
        assert_eq!(snapshot.dependencies.len(), 2);
    }

    #[test]
    fn invalid_topology_is_rejected_before_any_branch_is_created() {
        let repo = git_repo();
        let git = CliGit;
        let spec = base_spec(vec![shell_job("a", "true", &["missing"])]);
        let err = build_plan(spec, repo.path(), &git).unwrap_err();
        assert!(matches!(err, crate::error::OrchestratorError::Validation { .. }));
    }
}
