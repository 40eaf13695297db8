//! Process-tree termination: snapshot the process table, kill descendants post-order,
//! then kill the root and confirm it actually exited.

use std::collections::{HashMap, HashSet};
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Bounded wait for the root process to disappear after the kill.
pub const EXIT_WAIT: Duration = Duration::from_secs(2);
const EXIT_POLL: Duration = Duration::from_millis(25);

#[cfg(unix)]
const INVALID_PID_CODE: i32 = libc::EINVAL;
#[cfg(not(unix))]
const INVALID_PID_CODE: i32 = 87; // ERROR_INVALID_PARAMETER

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KillError {
    #[error("Access Denied")]
    AccessDenied { code: i32 },
    #[error("Invalid Parameter/PID")]
    InvalidPid { code: i32 },
    #[error("process still running after {0:?}")]
    ExitTimeout(Duration),
    #[error("{message}")]
    Os { code: Option<i32>, message: String },
}

impl KillError {
    pub fn code(&self) -> Option<i32> {
        match self {
            KillError::AccessDenied { code } | KillError::InvalidPid { code } => Some(*code),
            KillError::ExitTimeout(_) => None,
            KillError::Os { code, .. } => *code,
        }
    }
}

/// parent pid -> direct children, threads excluded.
pub fn snapshot_children() -> HashMap<u32, Vec<u32>> {
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().without_tasks(),
    );
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for p in sys.processes().values() {
        if p.thread_kind().is_some() {
            continue;
        }
        if let Some(parent) = p.parent() {
            children
                .entry(parent.as_u32())
                .or_default()
                .push(p.pid().as_u32());
        }
    }
    children
}

/// Every descendant of `root` before its parent, `root` last. Explicit stack, so deep
/// trees cannot blow the call stack; the seen-set also guards against pid cycles in a
/// racy snapshot.
pub fn termination_order(root: u32, children: &HashMap<u32, Vec<u32>>) -> Vec<u32> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![(root, false)];
    while let Some((pid, expanded)) = stack.pop() {
        if expanded {
            order.push(pid);
            continue;
        }
        if !seen.insert(pid) {
            continue;
        }
        stack.push((pid, true));
        if let Some(kids) = children.get(&pid) {
            for &kid in kids.iter().rev() {
                if !seen.contains(&kid) {
                    stack.push((kid, false));
                }
            }
        }
    }
    order
}

/// Kill `pid` and all of its descendants. Returns how many processes were targeted.
pub fn kill_process_tree(pid: u32, exit_wait: Duration) -> Result<usize, KillError> {
    if pid == 0 || pid == std::process::id() {
        return Err(KillError::InvalidPid {
            code: INVALID_PID_CODE,
        });
    }
    let order = termination_order(pid, &snapshot_children());
    let own = std::process::id();
    if order.contains(&own) {
        warn!(pid, own, "refusing to kill a process tree that contains the agent");
        return Err(KillError::InvalidPid {
            code: INVALID_PID_CODE,
        });
    }
    let descendants = &order[..order.len().saturating_sub(1)];
    for &child in descendants {
        // children may already be gone by the time we get to them
        if let Err(e) = terminate(child) {
            debug!(pid = child, error = %e, "descendant termination failed");
        }
    }
    terminate(pid)?;
    wait_for_exit(pid, exit_wait)?;
    info!(pid, killed = order.len(), "process tree terminated");
    Ok(order.len())
}

pub fn wait_for_exit(pid: u32, timeout: Duration) -> Result<(), KillError> {
    let start = Instant::now();
    loop {
        if process_exited(pid) {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(KillError::ExitTimeout(timeout));
        }
        thread::sleep(EXIT_POLL);
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<(), KillError> {
    let raw = i32::try_from(pid).map_err(|_| KillError::InvalidPid {
        code: INVALID_PID_CODE,
    })?;
    let rc = unsafe { libc::kill(raw, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    Err(match err.raw_os_error() {
        Some(libc::EPERM) => KillError::AccessDenied { code: libc::EPERM },
        Some(libc::ESRCH) => KillError::InvalidPid { code: libc::ESRCH },
        code => KillError::Os {
            code,
            message: err.to_string(),
        },
    })
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> Result<(), KillError> {
    let target = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::nothing(),
    );
    match sys.process(target) {
        None => Err(KillError::InvalidPid {
            code: INVALID_PID_CODE,
        }),
        Some(p) if p.kill() => Ok(()),
        Some(_) => Err(KillError::Os {
            code: None,
            message: "TerminateProcess failed".into(),
        }),
    }
}

/// Gone, or a zombie waiting for its parent to reap it.
pub fn process_exited(pid: u32) -> bool {
    let target = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::nothing(),
    );
    match sys.process(target) {
        None => true,
        Some(p) => matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_is_post_order_with_root_last() {
        let mut tree = HashMap::new();
        tree.insert(1, vec![2, 3]);
        tree.insert(2, vec![4]);
        tree.insert(4, vec![5]);
        let order = termination_order(1, &tree);
        assert_eq!(order, vec![5, 4, 2, 3, 1]);
    }

    #[test]
    fn order_survives_cycles() {
        let mut tree = HashMap::new();
        tree.insert(10, vec![11]);
        tree.insert(11, vec![10]);
        assert_eq!(termination_order(10, &tree), vec![11, 10]);
    }

    #[test]
    fn deep_chain_does_not_recurse() {
        let tree: HashMap<u32, Vec<u32>> = (1..100_000).map(|p| (p, vec![p + 1])).collect();
        let order = termination_order(1, &tree);
        assert_eq!(order.len(), 100_000);
        assert_eq!(order.first(), Some(&100_000));
        assert_eq!(order.last(), Some(&1));
    }

    #[test]
    fn refuses_own_pid_and_zero() {
        assert!(matches!(
            kill_process_tree(std::process::id(), EXIT_WAIT),
            Err(KillError::InvalidPid { .. })
        ));
        assert!(matches!(
            kill_process_tree(0, EXIT_WAIT),
            Err(KillError::InvalidPid { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn refuses_a_tree_containing_the_agent() {
        let parent = std::os::unix::process::parent_id();
        let order = termination_order(parent, &snapshot_children());
        assert!(order.contains(&std::process::id()));
        assert!(matches!(
            kill_process_tree(parent, EXIT_WAIT),
            Err(KillError::InvalidPid { .. })
        ));
        assert!(!process_exited(parent));
    }

    #[cfg(unix)]
    #[test]
    fn reaped_and_zombie_children_count_as_exited() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        assert!(wait_for_exit(pid, Duration::from_secs(2)).is_ok());
        child.wait().unwrap();
        assert!(process_exited(pid));
    }

    #[test]
    fn live_process_times_out() {
        let res = wait_for_exit(std::process::id(), Duration::from_millis(60));
        assert_eq!(res, Err(KillError::ExitTimeout(Duration::from_millis(60))));
    }
}
