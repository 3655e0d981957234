//! Wires a [`weave::PlanRunner`] from CLI global options: the workspace
//! root (where snapshots, worktrees, and logs live), the git repository
//! root, the configured agent adapter, and `.orchestrator/config.toml`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use weave::settings::Settings;
use weave::PlanRunner;
use weave_exec::{CliAgentAdapter, Executor};
use weave_git::CliGit;

/// Global options shared by every subcommand.
#[derive(clap::Args, Debug, Clone)]
pub struct GlobalOpts {
    /// Directory holding `.orchestrator/` state (snapshots, logs,
    /// worktrees). Defaults to the current directory.
    #[arg(long, global = true, env = "WEAVE_WORKSPACE_ROOT")]
    pub workspace_root: Option<PathBuf>,

    /// Root of the git repository nodes are worked against. Defaults to
    /// `workspace_root`.
    #[arg(long, global = true, env = "WEAVE_REPO_ROOT")]
    pub repo_root: Option<PathBuf>,

    /// Agent CLI binary invoked for `@agent` work specs.
    #[arg(long, global = true, env = "WEAVE_AGENT_PROGRAM", default_value = "claude")]
    pub agent_program: String,
}

impl GlobalOpts {
    fn workspace_root(&self) -> Result<PathBuf> {
        match &self.workspace_root {
            Some(path) => Ok(path.clone()),
            None => std::env::current_dir().context("resolving current directory"),
        }
    }

    fn repo_root(&self) -> Result<PathBuf> {
        match &self.repo_root {
            Some(path) => Ok(path.clone()),
            None => self.workspace_root(),
        }
    }

    fn settings_path(workspace_root: &Path) -> PathBuf {
        workspace_root.join(".orchestrator").join("config.toml")
    }

    /// Build a recovered [`PlanRunner`] from these options.
    ///
    /// # Errors
    /// Returns an error if `.orchestrator/config.toml` is present but
    /// invalid, or if recovering persisted plan snapshots fails.
    pub fn build_runner(&self) -> Result<PlanRunner> {
        let workspace_root = self.workspace_root()?;
        let repo_root = self.repo_root()?;
        let settings = Settings::load(&Self::settings_path(&workspace_root))
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("loading .orchestrator/config.toml")?;

        let git: Arc<dyn weave_git::GitPorcelain> = Arc::new(CliGit);
        let executor = Arc::new(Executor::new(Box::new(CliAgentAdapter::new(self.agent_program.clone()))));

        PlanRunner::recover(workspace_root, repo_root, git, executor, settings)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("recovering orchestrator state")
    }
}
