//! [`PlanSpec`] and [`JobSpec`] — the immutable input to
//! [`crate::runner::PlanRunner::enqueue`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use weave_exec::WorkSpec;

/// Validate a producer id against `^[a-z0-9-]{3,64}$`.
#[must_use]
pub fn is_valid_producer_id(id: &str) -> bool {
    let len = id.len();
    (3..=64).contains(&len) && id.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// One work unit in a [`PlanSpec`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique within the plan; must match `^[a-z0-9-]{3,64}$`.
    pub producer_id: String,
    /// Human-readable description of what this node does.
    pub task: String,
    pub work: WorkSpec,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub prechecks: Option<WorkSpec>,
    #[serde(default)]
    pub postchecks: Option<WorkSpec>,
    #[serde(default)]
    pub instructions: Option<String>,
    /// Visual-only grouping; never affects scheduling.
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub expects_no_changes: bool,
    /// Only meaningful for root nodes (no dependencies).
    #[serde(default)]
    pub base_branch: Option<String>,
}

/// Immutable input to [`crate::runner::PlanRunner::enqueue`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanSpec {
    pub name: String,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub target_branch: Option<String>,
    /// `0` defers to the global capacity cap.
    #[serde(default)]
    pub max_parallel: u32,
    #[serde(default = "default_true")]
    pub clean_up_successful_work: bool,
    /// Validation work run by an auto-injected Snapshot-Validation node
    /// that depends on every leaf.
    #[serde(default)]
    pub verify_ri: Option<WorkSpec>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub extra_symlinks: Vec<String>,
    #[serde(default)]
    pub start_paused: bool,
    pub jobs: Vec<JobSpec>,
}

const fn default_true() -> bool {
    true
}

/// One consolidated validation error enumerating every topology/spec
/// violation found in a [`PlanSpec`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("plan spec is invalid:\n{}", violations.join("\n"))]
pub struct PlanSpecError {
    pub violations: Vec<String>,
}

impl PlanSpec {
    /// Validate producer-id syntax, uniqueness, dependency references, and
    /// acyclicity. Does not mutate `self`.
    pub fn validate(&self) -> Result<(), PlanSpecError> {
        let mut violations = Vec::new();
        let mut seen: BTreeMap<&str, usize> = BTreeMap::new();

        for job in &self.jobs {
            if !is_valid_producer_id(&job.producer_id) {
                violations.push(format!(
                    "producer_id `{}` does not match ^[a-z0-9-]{{3,64}}$",
                    job.producer_id
                ));
            }
            if let Some(&prev) = seen.get(job.producer_id.as_str()) {
                violations.push(format!(
                    "duplicate producer_id `{}` (jobs[{prev}] and jobs[{}])",
                    job.producer_id,
                    seen.len()
                ));
            } else {
                seen.insert(&job.producer_id, seen.len());
            }
            if job.task.trim().is_empty() {
                violations.push(format!("job `{}` is missing `task`", job.producer_id));
            }
            if job.dependencies.iter().any(|d| d == &job.producer_id) {
                violations.push(format!("job `{}` depends on itself", job.producer_id));
            }
        }

        let known: std::collections::BTreeSet<&str> =
            self.jobs.iter().map(|j| j.producer_id.as_str()).collect();
        for job in &self.jobs {
            for dep in &job.dependencies {
                if !known.contains(dep.as_str()) {
                    violations.push(format!(
                        "job `{}` depends on unknown producer_id `{dep}`",
                        job.producer_id
                    ));
                }
            }
        }

        if violations.is_empty()
            && let Some(cycle) = find_cycle(&self.jobs)
        {
            violations.push(format!("dependency cycle: {}", cycle.join(" -> ")));
        }

        if violations.is_empty() { Ok(()) } else { Err(PlanSpecError { violations }) }
    }
}

fn find_cycle(jobs: &[JobSpec]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let index: BTreeMap<&str, usize> =
        jobs.iter().enumerate().map(|(i, j)| (j.producer_id.as_str(), i)).collect();
    let mut marks = vec![Mark::Unvisited; jobs.len()];
    let mut stack = Vec::new();

    fn visit(
        i: usize,
        jobs: &[JobSpec],
        index: &BTreeMap<&str, usize>,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        if marks[i] == Mark::InProgress {
            let pos = stack.iter().position(|&x| x == i).unwrap_or(0);
            let mut cycle: Vec<String> = stack[pos..].iter().map(|&x| jobs[x].producer_id.clone()).collect();
            cycle.push(jobs[i].producer_id.clone());
            return Some(cycle);
        }
        if marks[i] == Mark::Done {
            return None;
        }
        marks[i] = Mark::InProgress;
        stack.push(i);
        for dep in &jobs[i].dependencies {
            if let Some(&di) = index.get(dep.as_str())
                && let Some(cycle) = visit(di, jobs, index, marks, stack)
            {
                return Some(cycle);
            }
        }
        stack.pop();
        marks[i] = Mark::Done;
        None
    }

    for i in 0..jobs.len() {
        if marks[i] == Mark::Unvisited
            && let Some(cycle) = visit(i, jobs, &index, &mut marks, &mut stack)
        {
            return Some(cycle);
        }
    }
    None
}
