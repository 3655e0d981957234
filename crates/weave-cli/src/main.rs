//! `weave` — CLI entry point for the work-unit orchestrator.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use weave_cli::setup::GlobalOpts;
use weave_cli::{control, plan};

#[derive(Parser)]
#[command(name = "weave", version, about = "DAG work-unit orchestrator")]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue a new plan from a spec file (.toml or .json).
    Enqueue {
        spec_path: PathBuf,
    },
    /// List every plan the orchestrator is tracking.
    List,
    /// Show one plan's nodes and their current status.
    Show {
        plan_id: weave::PlanId,
    },
    /// Print a node's most recent attempt log.
    Logs {
        plan_id: weave::PlanId,
        producer_id: String,
    },
    /// Pause a plan: running nodes finish, none new are admitted.
    Pause {
        plan_id: weave::PlanId,
    },
    /// Resume a paused plan.
    Resume {
        plan_id: weave::PlanId,
    },
    /// Cancel every non-terminal node in a plan.
    Cancel {
        plan_id: weave::PlanId,
    },
    /// Cancel a plan and remove its worktrees, logs, and snapshot.
    Delete {
        plan_id: weave::PlanId,
    },
    /// Retry one failed or canceled node.
    RetryNode {
        plan_id: weave::PlanId,
        producer_id: String,
    },
    /// Retry every failed/canceled node in a plan and resume it.
    RetryPlan {
        plan_id: weave::PlanId,
    },
    /// Force a running/scheduled node to failed.
    ForceFail {
        plan_id: weave::PlanId,
        producer_id: String,
        reason: Option<String>,
    },
    /// Apply a batch of topology edits from a JSON ops file.
    Reshape {
        plan_id: weave::PlanId,
        ops_path: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Enqueue { spec_path } => plan::enqueue(&cli.global, spec_path),
        Command::List => plan::list(&cli.global),
        Command::Show { plan_id } => plan::show(&cli.global, plan_id),
        Command::Logs { plan_id, producer_id } => plan::logs(&cli.global, plan_id, &producer_id),
        Command::Pause { plan_id } => control::pause(&cli.global, plan_id),
        Command::Resume { plan_id } => control::resume(&cli.global, plan_id),
        Command::Cancel { plan_id } => control::cancel(&cli.global, plan_id),
        Command::Delete { plan_id } => control::delete(&cli.global, plan_id),
        Command::RetryNode { plan_id, producer_id } => control::retry_node(&cli.global, plan_id, &producer_id),
        Command::RetryPlan { plan_id } => control::retry_plan(&cli.global, plan_id),
        Command::ForceFail { plan_id, producer_id, reason } => {
            control::force_fail(&cli.global, plan_id, &producer_id, reason)
        }
        Command::Reshape { plan_id, ops_path } => control::reshape(&cli.global, plan_id, ops_path),
    }
}
