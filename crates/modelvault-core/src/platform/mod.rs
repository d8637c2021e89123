//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific behavior live here rather than in the
//! download logic.

pub mod process;

pub use process::{
    descendant_pids, is_process_alive, kill_process_group, terminate_process_tree, wait_for_exit,
    ProcessGroupGuard,
};

/// Put a command's child into its own session and process group.
///
/// Signals aimed at the foreground process group (e.g. Ctrl-C in a
/// terminal) then never reach the installer directly; only cancellation
/// stops it.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn detach_process_group(cmd: &mut tokio::process::Command) {
    // SAFETY: setsid() is async-signal-safe and touches no parent memory,
    // which is all pre_exec requires.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub fn detach_process_group(_cmd: &mut tokio::process::Command) {}
