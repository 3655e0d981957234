//! `weave` control-surface subcommands: pause/resume/cancel/delete a plan,
//! retry a node or a whole plan, force-fail a stuck node, and reshape a
//! live plan's topology.

use anyhow::Result;
use weave::reshape::ReshapeOp;
use weave::runner::{RetryOptions, RetryPlanOptions};
use weave::{NodeId, PlanId};

use crate::setup::GlobalOpts;

pub fn pause(opts: &GlobalOpts, plan_id: PlanId) -> Result<()> {
    opts.build_runner()?.pause(plan_id).map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("paused plan {plan_id}");
    Ok(())
}

pub fn resume(opts: &GlobalOpts, plan_id: PlanId) -> Result<()> {
    opts.build_runner()?.resume(plan_id).map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("resumed plan {plan_id}");
    Ok(())
}

pub fn cancel(opts: &GlobalOpts, plan_id: PlanId) -> Result<()> {
    opts.build_runner()?.cancel(plan_id).map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("canceled plan {plan_id}");
    Ok(())
}

pub fn delete(opts: &GlobalOpts, plan_id: PlanId) -> Result<()> {
    opts.build_runner()?.delete(plan_id).map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("deleted plan {plan_id}");
    Ok(())
}

/// `weave retry-node <plan-id> <producer-id>`
pub fn retry_node(opts: &GlobalOpts, plan_id: PlanId, producer_id: &str) -> Result<()> {
    let runner = opts.build_runner()?;
    let node_id = resolve(&runner, plan_id, producer_id)?;
    runner.retry_node(plan_id, node_id, RetryOptions::default()).map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("retrying node {producer_id} in plan {plan_id}");
    Ok(())
}

/// `weave retry-plan <plan-id>`
pub fn retry_plan(opts: &GlobalOpts, plan_id: PlanId) -> Result<()> {
    opts.build_runner()?
        .retry_plan(plan_id, RetryPlanOptions::default())
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("retrying every failed node in plan {plan_id}");
    Ok(())
}

/// `weave force-fail <plan-id> <producer-id> [reason]`
pub fn force_fail(opts: &GlobalOpts, plan_id: PlanId, producer_id: &str, reason: Option<String>) -> Result<()> {
    let runner = opts.build_runner()?;
    let node_id = resolve(&runner, plan_id, producer_id)?;
    runner.force_fail_node(plan_id, node_id, reason).map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("force-failed node {producer_id} in plan {plan_id}");
    Ok(())
}

/// `weave reshape <plan-id> <ops-file>` — `ops-file` is a JSON array of
/// [`ReshapeOp`] values.
pub fn reshape(opts: &GlobalOpts, plan_id: PlanId, ops_path: std::path::PathBuf) -> Result<()> {
    let contents = std::fs::read_to_string(&ops_path)?;
    let ops: Vec<ReshapeOp> = serde_json::from_str(&contents)?;
    let n = ops.len();
    opts.build_runner()?.reshape(plan_id, ops).map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("applied {n} reshape op(s) to plan {plan_id}");
    Ok(())
}

fn resolve(runner: &weave::PlanRunner, plan_id: PlanId, producer_id: &str) -> Result<NodeId> {
    let plan = runner.get(plan_id).ok_or_else(|| anyhow::anyhow!("no such plan: {plan_id}"))?;
    plan.node_id_for_producer(producer_id)
        .ok_or_else(|| anyhow::anyhow!("no node with producer_id `{producer_id}` in plan {plan_id}"))
}
