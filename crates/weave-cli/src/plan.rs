//! `weave plan ...` subcommands: enqueue a plan spec file and inspect the
//! plans currently tracked by the orchestrator.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use weave::model::spec::PlanSpec;
use weave::{NodeId, PlanId};

use crate::setup::GlobalOpts;

/// Read a [`PlanSpec`] from a `.toml` or `.json` file, dispatching on
/// extension.
fn read_plan_spec(path: &Path) -> Result<PlanSpec> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading plan spec {}", path.display()))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&contents).context("parsing plan spec as JSON"),
        Some("toml") | None => toml::from_str(&contents).context("parsing plan spec as TOML"),
        Some(other) => bail!("unrecognized plan spec extension `.{other}` (expected .toml or .json)"),
    }
}

/// `weave plan enqueue <spec-file>`
pub fn enqueue(opts: &GlobalOpts, spec_path: PathBuf) -> Result<()> {
    let spec = read_plan_spec(&spec_path)?;
    let runner = opts.build_runner()?;
    let plan = runner.enqueue(spec).map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("enqueued plan {} ({} jobs)", plan.id, plan.nodes.len());
    Ok(())
}

/// `weave plan list`
pub fn list(opts: &GlobalOpts) -> Result<()> {
    let runner = opts.build_runner()?;
    let mut plans = runner.get_all();
    plans.sort_by_key(|p| p.created_at);
    if plans.is_empty() {
        println!("No plans tracked.");
        return Ok(());
    }
    for plan in &plans {
        println!("{}  {:<10?}  {}  ({} nodes)", plan.id, plan.status(), plan.spec.name, plan.nodes.len());
    }
    Ok(())
}

/// `weave plan show <plan-id>`
pub fn show(opts: &GlobalOpts, plan_id: PlanId) -> Result<()> {
    let runner = opts.build_runner()?;
    let plan = runner.get(plan_id).ok_or_else(|| anyhow::anyhow!("no such plan: {plan_id}"))?;
    println!("plan {} ({}) — {:?}", plan.id, plan.spec.name, plan.status());
    println!("base: {}  target: {}", plan.base_branch, plan.target_branch);
    for (id, node) in &plan.nodes {
        let state = &plan.node_states[id];
        println!(
            "  {:<24} {:<10?} attempts={} {}",
            node.producer_id,
            state.status,
            state.attempts,
            state.error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

/// `weave plan logs <plan-id> <node-producer-id>`
pub fn logs(opts: &GlobalOpts, plan_id: PlanId, producer_id: &str) -> Result<()> {
    let runner = opts.build_runner()?;
    let plan = runner.get(plan_id).ok_or_else(|| anyhow::anyhow!("no such plan: {plan_id}"))?;
    let node_id: NodeId = plan
        .node_id_for_producer(producer_id)
        .ok_or_else(|| anyhow::anyhow!("no node with producer_id `{producer_id}` in plan {plan_id}"))?;
    let text = runner.get_node_logs(plan_id, node_id).map_err(|e| anyhow::anyhow!("{e}"))?;
    print!("{text}");
    Ok(())
}
