//! The [`GitPorcelain`] trait — the single abstraction boundary between
//! weave and git.
//!
//! Every other weave crate interacts with git exclusively through this
//! trait, so a test double or an alternate backend can stand in without
//! touching call sites. The trait is object-safe: callers may use
//! `&dyn GitPorcelain` or `Box<dyn GitPorcelain>`.

use std::path::{Path, PathBuf};

use crate::error::GitError;
use crate::types::{DiffStats, TargetRoot};

/// Typed git operations needed by the Node Pipeline and the Plan Runner.
///
/// All methods take an explicit repo or worktree path rather than assuming
/// a current directory, since a single process may operate on many
/// worktrees of the same repository concurrently.
#[allow(clippy::missing_errors_doc)]
pub trait GitPorcelain: Send + Sync {
    /// The branch `HEAD` currently points to, in `repo`. `None` for a
    /// detached `HEAD`.
    fn current_branch(&self, repo: &Path) -> Result<Option<String>, GitError>;

    /// Whether a local branch with this name exists.
    fn branch_exists(&self, repo: &Path, name: &str) -> Result<bool, GitError>;

    /// Create a local branch named `name` pointing at `from` (a commit-ish).
    fn create_branch(&self, repo: &Path, name: &str, from: &str) -> Result<(), GitError>;

    /// Decide the plan's target root branch.
    ///
    /// If `base_branch` is one of git's conventional default branches
    /// (`main`, `master`), synthesize `"<prefix>/<id>"` instead of
    /// integrating straight onto it. Otherwise the base branch is reused
    /// as-is and no branch needs to be created.
    fn resolve_target_root(
        &self,
        repo: &Path,
        base_branch: &str,
        prefix: &str,
        id: &str,
    ) -> Result<TargetRoot, GitError>;

    /// Add a worktree at `path`, checked out detached at `branch_or_sha`.
    ///
    /// `path`'s parent directories are created as needed. Fails with
    /// [`GitError::WorktreeBusy`] if `path` is already registered.
    fn add_worktree(&self, repo: &Path, path: &Path, branch_or_sha: &str) -> Result<(), GitError>;

    /// Remove a worktree and its administrative metadata.
    ///
    /// No-op if `path` is not a registered worktree.
    fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<(), GitError>;

    /// Detach `HEAD` at its current commit inside the worktree at `path`,
    /// then hard-reset to `target`. Used to reuse a worktree across retries.
    fn reset_detached(&self, path: &Path, target: &str) -> Result<(), GitError>;

    /// Stage every change in the worktree and commit it.
    ///
    /// Returns `Some(sha)` of the new commit, or `None` if there was
    /// nothing to commit.
    fn commit_all(&self, path: &Path, message: &str) -> Result<Option<String>, GitError>;

    /// Merge each of `refs` into the worktree at `path`, in order.
    ///
    /// Returns `Ok(())` on a clean merge. A conflict aborts the merge and
    /// returns [`GitError::Conflict`]; the worktree is left in the
    /// pre-merge state.
    fn merge_from_refs(&self, path: &Path, refs: &[String]) -> Result<(), GitError>;

    /// Merge `from` (a branch name or sha) into `target_branch` of `repo`.
    ///
    /// Used for reverse integration of a leaf node's result. `repo` is the
    /// primary repository working copy (not a node's worktree).
    fn merge_back(&self, repo: &Path, target_branch: &str, from: &str) -> Result<(), GitError>;

    /// The sha `HEAD` currently resolves to in `path`.
    fn head_sha(&self, path: &Path) -> Result<String, GitError>;

    /// Resolve `ref_name` (a branch, tag, or other commit-ish) to a commit
    /// sha inside `repo`, without checking it out or otherwise touching the
    /// working tree. Fails with [`GitError::InvalidRef`] if it cannot be
    /// resolved.
    fn resolve_ref(&self, repo: &Path, ref_name: &str) -> Result<String, GitError>;

    /// Diff summary between two commits (or `None` meaning the empty tree)
    /// evaluated inside `path`.
    fn diff_stats(
        &self,
        path: &Path,
        from_sha: Option<&str>,
        to_sha: &str,
    ) -> Result<DiffStats, GitError>;
}

/// Returned by [`GitPorcelain::add_worktree`] callers that need the path
/// convention in one place.
#[must_use]
pub fn worktree_path(workspace_root: &Path, plan_id: &str, producer_id: &str) -> PathBuf {
    workspace_root.join(".worktrees").join(plan_id).join(producer_id)
}
