//! Process tree teardown.
//!
//! The render tool forks workers (kernels, servers) that may leave its process
//! group, so killing the direct child is not enough. Descendants are found by
//! walking parent links outward from the child's pid only; unrelated processes
//! are never signalled. Teardown sends a graceful signal first and escalates
//! to a forced kill for whatever is still alive after the grace period.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use log::{debug, info, warn};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

/// Interval between liveness checks while waiting for the tree to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeSignal {
    Terminate,
    Kill,
}

/// Result of a teardown attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Every pid that was signalled.
    pub signalled: Vec<u32>,
    /// Pids still alive when the wait budget ran out.
    pub survivors: Vec<u32>,
    /// Whether the forced kill was needed.
    pub escalated: bool,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.survivors.is_empty()
    }
}

fn refresh_all() -> System {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    sys
}

fn descendants_in(sys: &System, root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in sys.processes() {
        // Linux threads show up as tasks with their own tid
        if process.thread_kind().is_some() {
            continue;
        }
        if let Some(parent) = process.parent() {
            children
                .entry(parent.as_u32())
                .or_default()
                .push(pid.as_u32());
        }
    }

    let mut found = Vec::new();
    let mut frontier = vec![root];
    while let Some(pid) = frontier.pop() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if kid != root && !found.contains(&kid) {
                    found.push(kid);
                    frontier.push(kid);
                }
            }
        }
    }
    found
}

/// All transitive children of `root`, not including `root` itself.
pub fn descendants(root: u32) -> Vec<u32> {
    descendants_in(&refresh_all(), root)
}

fn running(process: &sysinfo::Process) -> bool {
    !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

/// Whether `pid` refers to a live process. Zombies count as exited.
pub fn is_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(running).unwrap_or(false)
}

fn alive_among(pids: &BTreeSet<u32>) -> BTreeSet<u32> {
    if pids.is_empty() {
        return BTreeSet::new();
    }
    let wanted: Vec<Pid> = pids.iter().map(|&pid| Pid::from_u32(pid)).collect();
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&wanted), true);
    pids.iter()
        .copied()
        .filter(|&pid| sys.process(Pid::from_u32(pid)).map(running).unwrap_or(false))
        .collect()
}

#[cfg(unix)]
fn send_signal(pid: u32, group: Option<i32>, signal: TreeSignal) {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid as NixPid;

    let sig = match signal {
        TreeSignal::Terminate => Signal::SIGTERM,
        TreeSignal::Kill => Signal::SIGKILL,
    };

    if let Some(pgid) = group.filter(|&pgid| pgid as u32 == pid) {
        if let Err(e) = killpg(NixPid::from_raw(pgid), sig) {
            if e != nix::errno::Errno::ESRCH {
                warn!("[process-tree] Failed to signal group {}: {}", pgid, e);
            }
        }
    }

    if let Err(e) = kill(NixPid::from_raw(pid as i32), sig) {
        if e != nix::errno::Errno::ESRCH {
            warn!("[process-tree] Failed to send {} to {}: {}", sig, pid, e);
        }
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _group: Option<i32>, signal: TreeSignal) {
    let target = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    if let Some(process) = sys.process(target) {
        let delivered = match signal {
            TreeSignal::Terminate => process
                .kill_with(sysinfo::Signal::Term)
                .unwrap_or_else(|| process.kill()),
            TreeSignal::Kill => process.kill(),
        };
        if !delivered {
            warn!("[process-tree] Failed to terminate {}", pid);
        }
    }
}

async fn wait_for_exit(pids: &BTreeSet<u32>, budget: Duration) -> BTreeSet<u32> {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let alive = alive_among(pids);
        if alive.is_empty() || tokio::time::Instant::now() >= deadline {
            return alive;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

/// Terminate `root` and every process descended from it.
///
/// `group` is the process group the root leads, if it was spawned as a group
/// leader; the whole group is signalled alongside the individual pids.
/// SIGTERM goes out first; anything alive after `grace` gets SIGKILL, and the
/// call waits at most `timeout` in total before reporting survivors.
pub async fn terminate_tree(
    root: u32,
    group: Option<i32>,
    grace: Duration,
    timeout: Duration,
) -> TeardownReport {
    let mut targets: BTreeSet<u32> = descendants(root).into_iter().collect();
    targets.insert(root);

    debug!(
        "[process-tree] Terminating {} process(es) rooted at {}",
        targets.len(),
        root
    );
    for &pid in &targets {
        send_signal(pid, group, TreeSignal::Terminate);
    }

    let grace = grace.min(timeout);
    let alive = wait_for_exit(&targets, grace).await;
    if alive.is_empty() {
        info!("[process-tree] Tree rooted at {} exited after SIGTERM", root);
        return TeardownReport {
            signalled: targets.into_iter().collect(),
            survivors: Vec::new(),
            escalated: false,
        };
    }

    // Survivors may have forked while shutting down
    let sys = refresh_all();
    for &pid in &alive {
        targets.extend(descendants_in(&sys, pid));
    }
    let remaining: BTreeSet<u32> = alive_among(&targets);

    warn!(
        "[process-tree] {} process(es) ignored SIGTERM, sending SIGKILL",
        remaining.len()
    );
    for &pid in &remaining {
        send_signal(pid, group, TreeSignal::Kill);
    }

    let survivors = wait_for_exit(&remaining, timeout.saturating_sub(grace)).await;
    TeardownReport {
        signalled: targets.into_iter().collect(),
        survivors: survivors.into_iter().collect(),
        escalated: true,
    }
}

#[cfg(unix)]
fn group_exists(pgid: i32) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid as NixPid;

    // EPERM still means somebody is in the group
    !matches!(
        killpg(NixPid::from_raw(pgid), None),
        Err(nix::errno::Errno::ESRCH)
    )
}

#[cfg(unix)]
async fn wait_for_group_exit(pgid: i32, budget: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if !group_exists(pgid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

#[cfg(unix)]
fn signal_group(pgid: i32, signal: TreeSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid as NixPid;

    let sig = match signal {
        TreeSignal::Terminate => Signal::SIGTERM,
        TreeSignal::Kill => Signal::SIGKILL,
    };
    if let Err(e) = killpg(NixPid::from_raw(pgid), sig) {
        if e != nix::errno::Errno::ESRCH {
            warn!("[process-tree] Failed to signal group {}: {}", pgid, e);
        }
    }
}

/// Terminate what is left of a process group whose leader was already reaped.
///
/// Only the group is signalled. The leader's pid is never targeted and no
/// descendant walk starts from it, since the pid may have been reused.
/// `survivors` holds the group id if members outlived `timeout`.
#[cfg(unix)]
pub async fn terminate_group(pgid: i32, grace: Duration, timeout: Duration) -> TeardownReport {
    if !group_exists(pgid) {
        return TeardownReport::default();
    }

    debug!("[process-tree] Terminating leaderless group {}", pgid);
    signal_group(pgid, TreeSignal::Terminate);
    let grace = grace.min(timeout);
    if wait_for_group_exit(pgid, grace).await {
        return TeardownReport::default();
    }

    warn!("[process-tree] Group {} ignored SIGTERM, sending SIGKILL", pgid);
    signal_group(pgid, TreeSignal::Kill);
    let gone = wait_for_group_exit(pgid, timeout.saturating_sub(grace)).await;
    TeardownReport {
        signalled: Vec::new(),
        survivors: if gone { Vec::new() } else { vec![pgid as u32] },
        escalated: true,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn test_descendants_of_spawned_shell() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 30 & sleep 30 & wait"])
            .stdout(Stdio::null())
            .spawn()
            .unwrap();

        // Give the shell a moment to fork
        let mut found = Vec::new();
        for _ in 0..40 {
            found = descendants(child.id());
            if found.len() >= 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(25));
        }

        let _ = child.kill();
        let _ = child.wait();
        for pid in &found {
            send_signal(*pid, None, TreeSignal::Kill);
        }

        assert_eq!(found.len(), 2, "expected two sleep children, got {:?}", found);
    }

    #[tokio::test]
    async fn test_terminate_group_of_reaped_leader() {
        use std::io::Read;
        use std::os::unix::process::CommandExt;

        // The leader exits right away and leaves a member behind in its group
        let mut leader = Command::new("sh")
            .args(["-c", "sleep 30 >/dev/null 2>&1 & echo $!"])
            .stdout(Stdio::piped())
            .process_group(0)
            .spawn()
            .unwrap();
        let pgid = leader.id() as i32;
        let mut out = String::new();
        leader.stdout.take().unwrap().read_to_string(&mut out).unwrap();
        leader.wait().unwrap();
        let member: u32 = out.trim().parse().unwrap();
        assert!(is_alive(member));

        let report =
            terminate_group(pgid, Duration::from_millis(500), Duration::from_secs(3)).await;

        // Zombies stay in the group until init reaps them, so check the pid
        assert!(report.signalled.is_empty());
        assert!(!is_alive(member));
    }

    #[tokio::test]
    async fn test_terminate_group_without_members_is_noop() {
        use std::os::unix::process::CommandExt;

        let mut leader = Command::new("true").process_group(0).spawn().unwrap();
        let pgid = leader.id() as i32;
        leader.wait().unwrap();

        let report =
            terminate_group(pgid, Duration::from_millis(100), Duration::from_secs(1)).await;
        assert_eq!(report, TeardownReport::default());
    }

    #[tokio::test]
    async fn test_terminate_tree_escalates_for_ignored_sigterm() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "trap '' TERM; while true; do sleep 0.05; done"])
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report =
            terminate_tree(pid, None, Duration::from_millis(200), Duration::from_secs(3)).await;
        let _ = child.wait().await;

        assert!(report.escalated);
        assert!(report.is_clean(), "survivors: {:?}", report.survivors);
        assert!(!is_alive(pid));
    }
}
