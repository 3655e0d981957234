//! [`CliGit`] — a [`GitPorcelain`] implementation that shells out to the
//! `git` binary.
//!
//! Each call spawns one `git` process. This trades a little overhead for
//! never depending on a particular git-library's feature coverage of
//! worktrees and merges, which is exactly the boundary the teacher's own
//! non-stub git backend draws.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::error::GitError;
use crate::porcelain::GitPorcelain;
use crate::types::{DiffStats, FileDiffEntry, TargetRoot, DEFAULT_BRANCHES};

/// `git` CLI-backed [`GitPorcelain`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CliGit;

impl CliGit {
    fn run(&self, dir: &Path, args: &[&str]) -> Result<Output, GitError> {
        Command::new("git").args(args).current_dir(dir).output().map_err(GitError::from)
    }

    fn run_ok(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        let out = self.run(dir, args)?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).into_owned())
        } else {
            Err(self.classify(dir, args, &out))
        }
    }

    fn classify(&self, dir: &Path, args: &[&str], out: &Output) -> GitError {
        let stderr = String::from_utf8_lossy(&out.stderr);
        let tail = GitError::tail(&stderr, 20);
        if stderr.contains("CONFLICT") || stderr.contains("conflict") {
            return GitError::Conflict { path: dir.to_path_buf(), stderr_tail: tail };
        }
        if stderr.contains("already used by worktree") || stderr.contains("is already checked out") {
            return GitError::WorktreeBusy { path: dir.to_path_buf(), stderr_tail: tail };
        }
        if stderr.contains("unknown revision") || stderr.contains("ambiguous argument") {
            return GitError::InvalidRef {
                spec: args.last().unwrap_or(&"").to_string(),
                stderr_tail: tail,
            };
        }
        GitError::CommandFailed {
            args: args.join(" "),
            path: dir.to_path_buf(),
            stderr_tail: tail,
            exit_code: out.status.code(),
        }
    }
}

impl GitPorcelain for CliGit {
    fn current_branch(&self, repo: &Path) -> Result<Option<String>, GitError> {
        let out = self.run_ok(repo, &["symbolic-ref", "--short", "-q", "HEAD"]);
        match out {
            Ok(name) => {
                let name = name.trim();
                if name.is_empty() { Ok(None) } else { Ok(Some(name.to_owned())) }
            }
            // detached HEAD: symbolic-ref exits non-zero, that's not an error for us
            Err(GitError::CommandFailed { exit_code: Some(1), .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn branch_exists(&self, repo: &Path, name: &str) -> Result<bool, GitError> {
        let full = format!("refs/heads/{name}");
        let out = self.run(repo, &["show-ref", "--verify", "--quiet", &full])?;
        Ok(out.status.success())
    }

    fn create_branch(&self, repo: &Path, name: &str, from: &str) -> Result<(), GitError> {
        self.run_ok(repo, &["branch", name, from])?;
        Ok(())
    }

    fn resolve_target_root(
        &self,
        repo: &Path,
        base_branch: &str,
        prefix: &str,
        id: &str,
    ) -> Result<TargetRoot, GitError> {
        if DEFAULT_BRANCHES.contains(&base_branch) {
            let synthesized = format!("{prefix}/{id}");
            let needs_creation = !self.branch_exists(repo, &synthesized)?;
            Ok(TargetRoot { root_branch: synthesized, needs_creation })
        } else {
            let needs_creation = !self.branch_exists(repo, base_branch)?;
            Ok(TargetRoot { root_branch: base_branch.to_owned(), needs_creation })
        }
    }

    fn add_worktree(&self, repo: &Path, path: &Path, branch_or_sha: &str) -> Result<(), GitError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let path_str = path.to_string_lossy().into_owned();
        self.run_ok(repo, &["worktree", "add", "--detach", &path_str, branch_or_sha])?;
        Ok(())
    }

    fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<(), GitError> {
        let path_str = path.to_string_lossy().into_owned();
        let out = self.run(repo, &["worktree", "remove", "--force", &path_str])?;
        if out.status.success() || !path.exists() {
            Ok(())
        } else {
            Err(self.classify(repo, &["worktree", "remove"], &out))
        }
    }

    fn reset_detached(&self, path: &Path, target: &str) -> Result<(), GitError> {
        self.run_ok(path, &["checkout", "--detach", target])?;
        self.run_ok(path, &["reset", "--hard", target])?;
        self.run_ok(path, &["clean", "-fdx"])?;
        Ok(())
    }

    fn commit_all(&self, path: &Path, message: &str) -> Result<Option<String>, GitError> {
        self.run_ok(path, &["add", "-A"])?;
        let status = self.run_ok(path, &["status", "--porcelain"])?;
        if status.trim().is_empty() {
            return Ok(None);
        }
        self.run_ok(path, &["commit", "-m", message, "--no-verify"])?;
        let sha = self.run_ok(path, &["rev-parse", "HEAD"])?;
        Ok(Some(sha.trim().to_owned()))
    }

    fn merge_from_refs(&self, path: &Path, refs: &[String]) -> Result<(), GitError> {
        for r in refs {
            let out = self.run(path, &["merge", "--no-edit", r.as_str()])?;
            if !out.status.success() {
                let _ = self.run(path, &["merge", "--abort"]);
                return Err(self.classify(path, &["merge", r], &out));
            }
        }
        Ok(())
    }

    fn merge_back(&self, repo: &Path, target_branch: &str, from: &str) -> Result<(), GitError> {
        let current = self.current_branch(repo)?;
        self.run_ok(repo, &["checkout", target_branch])?;
        let merge_result = self.run(repo, &["merge", "--no-edit", from]);
        let restore = |this: &Self| {
            if let Some(prev) = &current {
                let _ = this.run(repo, &["checkout", prev]);
            }
        };
        match merge_result {
            Ok(out) if out.status.success() => {
                restore(self);
                Ok(())
            }
            Ok(out) => {
                let _ = self.run(repo, &["merge", "--abort"]);
                let err = self.classify(repo, &["merge", from], &out);
                restore(self);
                Err(err)
            }
            Err(e) => {
                restore(self);
                Err(e)
            }
        }
    }

    fn head_sha(&self, path: &Path) -> Result<String, GitError> {
        Ok(self.run_ok(path, &["rev-parse", "HEAD"])?.trim().to_owned())
    }

    fn resolve_ref(&self, repo: &Path, ref_name: &str) -> Result<String, GitError> {
        Ok(self.run_ok(repo, &["rev-parse", "--verify", ref_name])?.trim().to_owned())
    }

    fn diff_stats(
        &self,
        path: &Path,
        from_sha: Option<&str>,
        to_sha: &str,
    ) -> Result<DiffStats, GitError> {
        let range = match from_sha {
            Some(from) => format!("{from}..{to_sha}"),
            None => to_sha.to_owned(),
        };
        let name_status = self.run_ok(path, &["diff", "--name-status", &range])?;
        let mut stats = DiffStats::default();
        for line in name_status.lines() {
            let mut parts = line.splitn(2, '\t');
            let Some(code) = parts.next() else { continue };
            let Some(file) = parts.next() else { continue };
            let change = code.chars().next().unwrap_or('M');
            match change {
                'A' => stats.added += 1,
                'D' => stats.deleted += 1,
                _ => stats.modified += 1,
            }
            stats.file_entries.push(FileDiffEntry { path: file.to_owned(), change });
        }
        let log_range = match from_sha {
            Some(from) => format!("{from}..{to_sha}"),
            None => to_sha.to_owned(),
        };
        let subjects = self.run_ok(path, &["log", "--format=%s", &log_range])?;
        stats.commit_subjects = subjects.lines().map(str::to_owned).collect();
        Ok(stats)
    }
}

/// Path convention for a node's dedicated worktree.
#[must_use]
pub fn default_worktree_path(workspace_root: &Path, plan_id: &str, producer_id: &str) -> PathBuf {
    crate::porcelain::worktree_path(workspace_root, plan_id, producer_id)
}
