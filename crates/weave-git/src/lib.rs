//! Git porcelain layer for weave.
//!
//! This crate defines [`GitPorcelain`] — the single interface through which
//! the rest of weave talks to git. No other weave crate should spawn a
//! `git` process directly; they depend on `weave-git` and program against
//! the trait.
//!
//! - [`porcelain`] — the [`GitPorcelain`] trait.
//! - [`cli_impl`] — [`CliGit`], the `git`-CLI-backed implementation.
//! - [`types`] — value types used in trait signatures.
//! - [`error`] — the [`GitError`] enum returned by all trait methods.

pub mod cli_impl;
pub mod error;
pub mod porcelain;
pub mod types;

pub use cli_impl::CliGit;
pub use error::GitError;
pub use porcelain::{worktree_path, GitPorcelain};
pub use types::{DiffStats, FileDiffEntry, TargetRoot, DEFAULT_BRANCHES};
