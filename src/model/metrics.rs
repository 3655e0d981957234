//! Plain serializable metrics structs. No behavior, so they round-trip
//! through the persistence snapshot unchanged.

use serde::{Deserialize, Serialize};

use crate::model::plan::{PipelineStep, StepStatus};

/// Wall-clock duration and exit status of one pipeline step.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct PhaseMetrics {
    pub wall_time_ms: u64,
    pub status: Option<StepStatus>,
    pub exit_code: Option<i32>,
}

/// The sum across the last attempt's steps, plus the attempt count.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub total_wall_time_ms: u64,
    pub attempt_count: u32,
}

impl NodeMetrics {
    pub fn record_step(&mut self, _step: PipelineStep, phase: &PhaseMetrics) {
        self.total_wall_time_ms += phase.wall_time_ms;
    }
}

/// Diff summary produced by `weave_git::GitPorcelain::diff_stats` between a
/// node's `base_commit` and `completed_commit`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkSummary {
    pub files_added: usize,
    pub files_modified: usize,
    pub files_deleted: usize,
    pub commit_subjects: Vec<String>,
}

impl WorkSummary {
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            files_added: self.files_added + other.files_added,
            files_modified: self.files_modified + other.files_modified,
            files_deleted: self.files_deleted + other.files_deleted,
            commit_subjects: self.commit_subjects.iter().chain(&other.commit_subjects).cloned().collect(),
        }
    }
}

impl From<weave_git::DiffStats> for WorkSummary {
    fn from(stats: weave_git::DiffStats) -> Self {
        Self {
            files_added: stats.added,
            files_modified: stats.modified,
            files_deleted: stats.deleted,
            commit_subjects: stats.commit_subjects,
        }
    }
}
