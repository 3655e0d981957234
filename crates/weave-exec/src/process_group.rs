//! Cross-platform termination of a child process and its descendants.
//!
//! Unix: the child is spawned into its own process group (`setpgid`), and
//! cancellation sends the group a signal. Windows: a job object would
//! serve the same purpose; this crate targets Unix build hosts directly
//! and leaves the Windows path as an explicit stub, since none of the
//! corpus this was grounded on ships a `windows-sys` job-object wrapper.

use std::process::Command;

/// Put `cmd` in its own process group (Unix) before spawning, so the whole
/// tree can be terminated as a unit.
pub fn isolate_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

/// Terminate the process group rooted at `pid` (as established by
/// [`isolate_process_group`]).
#[cfg(unix)]
pub fn kill_process_tree(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // A negative pid targets the whole process group in POSIX kill(2).
    let pgid = Pid::from_raw(-(i32::try_from(pid).unwrap_or(i32::MAX)));
    let _ = kill(pgid, Signal::SIGTERM);
    let _ = kill(Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX)), Signal::SIGKILL);
}

/// Terminate the process group rooted at `pid`.
///
/// Stubbed on non-Unix targets: wiring up a Windows job object is outside
/// this crate's current scope.
#[cfg(not(unix))]
pub fn kill_process_tree(_pid: u32) {}
