//! Plan snapshot persistence (C9): write-temp-then-rename JSON, and boot-time
//! recovery of interrupted nodes.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{OrchestratorError, Result};
use crate::ids::PlanId;
use crate::model::plan::{FailureReason, NodeStatus, Plan};

/// Path to a plan's snapshot file.
#[must_use]
pub fn plan_path(workspace_root: &Path, plan_id: PlanId) -> PathBuf {
    workspace_root.join(".orchestrator").join("plans").join(format!("{plan_id}.json"))
}

/// Write `plan`'s snapshot atomically: serialize to a temp file in the same
/// directory, then rename over the final path. A reader never observes a
/// torn write.
///
/// # Errors
/// Returns an error if the directory cannot be created, serialization
/// fails, or the filesystem write/rename fails.
pub fn save(workspace_root: &Path, plan: &Plan) -> Result<()> {
    let path = plan_path(workspace_root, plan.id);
    let dir = path.parent().ok_or_else(|| OrchestratorError::Internal {
        detail: "plan snapshot path has no parent directory".to_owned(),
    })?;
    fs::create_dir_all(dir)?;

    let tmp_path = dir.join(format!(".{}.tmp", plan.id));
    let json = serde_json::to_vec_pretty(plan)
        .map_err(|e| OrchestratorError::Internal { detail: format!("failed to serialize plan: {e}") })?;
    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// Delete a plan's snapshot file. Missing file is not an error.
///
/// # Errors
/// Returns an I/O error other than not-found.
pub fn delete(workspace_root: &Path, plan_id: PlanId) -> Result<()> {
    let path = plan_path(workspace_root, plan_id);
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Load every plan snapshot under `<workspace_root>/.orchestrator/plans/`,
/// marking any node left `running`/`scheduled` by a prior, uncleanly
/// terminated process as `failed` with `failure_reason = crashed`.
///
/// # Errors
/// Returns an error if the plans directory exists but cannot be read, or if
/// a snapshot file is corrupt.
pub fn recover_all(workspace_root: &Path) -> Result<Vec<Plan>> {
    let dir = workspace_root.join(".orchestrator").join("plans");
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut plans = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let contents = fs::read_to_string(&path)?;
        let mut plan: Plan = serde_json::from_str(&contents).map_err(|e| OrchestratorError::Internal {
            detail: format!("corrupt plan snapshot at {}: {e}", path.display()),
        })?;
        let recovered = mark_interrupted_as_crashed(&mut plan);
        if recovered > 0 {
            warn!(plan_id = %plan.id, recovered, "recovered plan had in-flight nodes marked crashed");
        }
        info!(plan_id = %plan.id, "recovered plan from snapshot");
        plans.push(plan);
    }
    Ok(plans)
}

fn mark_interrupted_as_crashed(plan: &mut Plan) -> usize {
    let mut count = 0;
    for state in plan.node_states.values_mut() {
        if matches!(state.status, NodeStatus::Running | NodeStatus::Scheduled) {
            state.status = NodeStatus::Failed;
            state.failure_reason = Some(FailureReason::Crashed);
            state.error = Some("interrupted by restart".to_owned());
            count += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use tempfile::TempDir;

    use super::*;
    use crate::model::plan::NodeState;
    use crate::model::spec::PlanSpec;

    fn sample_plan() -> Plan {
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
    fn save_then_recover_round_trips() {
        let dir = TempDir::new().unwrap();
        let plan = sample_plan();
        save(dir.path(), &plan).unwrap();

        let recovered = recover_all(dir.path()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, plan.id);
    }

    #[test]
    fn recover_marks_running_nodes_as_crashed() {
        let dir = TempDir::new().unwrap();
        let mut plan = sample_plan();
        let node_id = crate::ids::NodeId::new();
        let mut state = NodeState::new_pending();
        state.status = NodeStatus::Running;
        plan.node_states.insert(node_id, state);
        save(dir.path(), &plan).unwrap();

        let recovered = recover_all(dir.path()).unwrap();
        let state = &recovered[0].node_states[&node_id];
        assert_eq!(state.status, NodeStatus::Failed);
        assert_eq!(state.failure_reason, Some(FailureReason::Crashed));
    }

    #[test]
    fn recover_empty_directory_yields_no_plans() {
        let dir = TempDir::new().unwrap();
        assert!(recover_all(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn delete_missing_snapshot_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        delete(dir.path(), PlanId::new()).unwrap();
    }
}
