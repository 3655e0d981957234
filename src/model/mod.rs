//! The orchestrator's data model (§3): plan specs, runtime plan state, and
//! metrics.

pub mod metrics;
pub mod plan;
pub mod spec;

pub use metrics::{NodeMetrics, PhaseMetrics, WorkSummary};
pub use plan::{
    AttemptRecord, AttemptStatus, FailureReason, Node, NodeState, NodeStatus, Plan, PipelineStep,
    PlanStatus, StepStatus, StepStatusMap, TriggerType, fresh_step_statuses,
};
pub use spec::{is_valid_producer_id, JobSpec, PlanSpec, PlanSpecError};
