//! Process-tree inspection and termination.
//!
//! Cancelling a fetch stops the installer's whole subtree: descendants are
//! terminated first, deepest first, and awaited before the root process is
//! signalled. [`ProcessGroupGuard`] covers the case where the fetch itself
//! is dropped before it could clean up.

use crate::config::DownloadConfig;
use crate::error::{ModelVaultError, Result};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, warn};

fn refreshed_system() -> System {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::new());
    system
}

fn is_running_in(system: &System, pid: u32) -> bool {
    match system.process(Pid::from_u32(pid)) {
        Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

/// Check if a process with the given PID is running.
///
/// Zombies count as exited.
pub fn is_process_alive(pid: u32) -> bool {
    is_running_in(&refreshed_system(), pid)
}

/// All descendants of `pid`, deepest first.
pub fn descendant_pids(pid: u32) -> Vec<u32> {
    collect_descendants(&refreshed_system(), pid)
}

fn collect_descendants(system: &System, pid: u32) -> Vec<u32> {
    let root = Pid::from_u32(pid);
    let mut seen: HashSet<Pid> = HashSet::from([root]);
    let mut ordered = Vec::new();
    let mut frontier = vec![root];

    // Breadth-first, so reversing yields leaves before their parents.
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for (child_pid, process) in system.processes() {
            if let Some(parent) = process.parent() {
                if frontier.contains(&parent) && seen.insert(*child_pid) {
                    ordered.push(child_pid.as_u32());
                    next.push(*child_pid);
                }
            }
        }
        frontier = next;
    }

    ordered.reverse();
    ordered
}

/// Terminate every descendant of `pid`, then signal `pid` itself.
///
/// Descendants get SIGTERM, then `grace` to exit, then SIGKILL. The root
/// only receives SIGTERM; the caller owns its handle and reaps it.
///
/// Returns the number of descendants that were signalled, or a `Process`
/// error naming the first one that survived SIGKILL.
pub async fn terminate_process_tree(pid: u32, grace: Duration) -> Result<usize> {
    let descendants = descendant_pids(pid);
    debug!("Terminating {} descendants of process {}", descendants.len(), pid);

    for &child in &descendants {
        send_terminate(child);
    }
    let survivors = wait_for_exit(&descendants, grace).await;
    for &child in &survivors {
        warn!("Process {} ignored SIGTERM, killing", child);
        send_kill(child);
    }
    if !survivors.is_empty() {
        let stubborn = wait_for_exit(&survivors, grace).await;
        if let Some(&first) = stubborn.first() {
            send_terminate(pid);
            return Err(ModelVaultError::Process {
                pid: first,
                message: format!(
                    "{} descendants of {} still running after SIGKILL",
                    stubborn.len(),
                    pid
                ),
            });
        }
    }

    if is_process_alive(pid) {
        send_terminate(pid);
    } else {
        debug!("Process {} exited before its descendants", pid);
    }
    Ok(descendants.len())
}

/// SIGKILL every process in the group led by `pgid`.
///
/// The installer runs as a session leader, so this reaches descendants that
/// a kill aimed at the direct child would miss. Returns whether anything
/// was signalled.
#[cfg(unix)]
pub fn kill_process_group(pgid: u32) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid as NixPid;

    let Ok(raw) = i32::try_from(pgid) else {
        return false;
    };
    match killpg(NixPid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(e) => {
            warn!("Failed to kill process group {}: {}", pgid, e);
            false
        }
    }
}

/// Kill `pgid` and whatever descendants can still be traced to it.
#[cfg(not(unix))]
pub fn kill_process_group(pgid: u32) -> bool {
    let mut targets = descendant_pids(pgid);
    targets.push(pgid);
    let alive: Vec<u32> = targets.into_iter().filter(|&pid| is_process_alive(pid)).collect();
    for &pid in &alive {
        send_kill(pid);
    }
    !alive.is_empty()
}

/// Kills the installer's process group when dropped.
///
/// Held for the lifetime of a fetch. If the fetch future is aborted, its
/// drop still takes down every process the installer started.
#[derive(Debug)]
pub struct ProcessGroupGuard {
    pgid: u32,
}

impl ProcessGroupGuard {
    pub fn new(pgid: u32) -> Self {
        Self { pgid }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if kill_process_group(self.pgid) {
            warn!("Killed processes left in installer group {}", self.pgid);
        }
    }
}

/// Poll until all `pids` exited or `timeout` elapsed; returns those still
/// running.
pub async fn wait_for_exit(pids: &[u32], timeout: Duration) -> Vec<u32> {
    let deadline = Instant::now() + timeout;
    loop {
        let system = refreshed_system();
        let running: Vec<u32> = pids
            .iter()
            .copied()
            .filter(|&pid| is_running_in(&system, pid))
            .collect();
        if running.is_empty() || Instant::now() >= deadline {
            return running;
        }
        tokio::time::sleep(DownloadConfig::PROCESS_POLL_INTERVAL).await;
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid as NixPid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match kill(NixPid::from_raw(raw), signal) {
        Ok(()) => debug!("Sent {} to process {}", signal, pid),
        Err(nix::errno::Errno::ESRCH) => debug!("Process {} already exited", pid),
        Err(e) => warn!("Failed to send {} to {}: {}", signal, pid, e),
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(unix)]
fn send_kill(pid: u32) {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(not(unix))]
fn send_terminate(pid: u32) {
    send_kill(pid);
}

#[cfg(not(unix))]
fn send_kill(pid: u32) {
    let system = refreshed_system();
    match system.process(Pid::from_u32(pid)) {
        Some(process) => {
            if !process.kill() {
                warn!("Failed to kill process {}", pid);
            }
        }
        None => debug!("Process {} already exited", pid),
    }
}
