//! weave CLI crate — all CLI-specific modules live here.
//!
//! The binary entry point is in `main.rs`. This lib.rs exposes CLI modules
//! so that `main.rs` can use them as `crate::module`.

pub mod control;
pub mod plan;
pub mod setup;
