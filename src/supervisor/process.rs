//! OS-level process probes and signals.

use std::fs;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What a probe found at a pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Alive,
    Dead,
    /// Exited but not yet reaped.
    Zombie,
    /// Something else now runs under this pid.
    Reused,
}

impl Liveness {
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Alive)
    }
}

/// Pids that must never be signalled: init, the process group marker and
/// ourselves.
pub fn is_protected(pid: u32) -> bool {
    pid <= 1 || pid == std::process::id() || i32::try_from(pid).is_err()
}

/// `kill(pid, 0)`. EPERM means the process exists.
pub fn pid_exists(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let result = unsafe { libc::kill(raw, 0) };
    if result == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// State letter and start time (clock ticks since boot) from
/// `/proc/<pid>/stat`. `None` where procfs is unavailable.
pub fn proc_stat(pid: u32) -> Option<(char, u64)> {
    let content = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat(&content)
}

fn parse_stat(content: &str) -> Option<(char, u64)> {
    // The command name may contain spaces and parentheses; fields resume
    // after the last ')'.
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let state = fields.first()?.chars().next()?;
    let start_ticks = fields.get(19)?.parse().ok()?;
    Some((state, start_ticks))
}

/// Start time of a live process, for pid-reuse detection.
pub fn start_ticks(pid: u32) -> Option<u64> {
    proc_stat(pid).map(|(_, ticks)| ticks)
}

/// Probe `pid`, comparing its start time with `expected_ticks` when known.
pub fn probe(pid: u32, expected_ticks: Option<u64>) -> Liveness {
    if !pid_exists(pid) {
        return Liveness::Dead;
    }
    match proc_stat(pid) {
        Some(('Z', _)) | Some(('X', _)) => Liveness::Zombie,
        Some((_, ticks)) if expected_ticks.is_some_and(|t| t != ticks) => Liveness::Reused,
        _ => Liveness::Alive,
    }
}

/// How a termination ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Termination {
    /// Exited within the grace period after SIGTERM.
    Terminated,
    /// Needed SIGKILL.
    Killed,
    /// Still present after SIGKILL and a second grace period.
    Survived,
}

fn send(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let raw = i32::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: pid was range-checked and is never 0 or negative here, so the
    // signal targets exactly one process.
    let result = unsafe { libc::kill(raw, signal) };
    if result == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

fn wait_gone(pid: u32, ticks: Option<u64>, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        if !probe(pid, ticks).is_alive() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
pub fn terminate(pid: u32, ticks: Option<u64>, grace: Duration) -> io::Result<Termination> {
    if is_protected(pid) {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("refusing to signal protected pid {}", pid),
        ));
    }
    send(pid, libc::SIGTERM)?;
    if wait_gone(pid, ticks, grace) {
        return Ok(Termination::Terminated);
    }
    tracing::warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
    send(pid, libc::SIGKILL)?;
    if wait_gone(pid, ticks, grace) {
        Ok(Termination::Killed)
    } else {
        Ok(Termination::Survived)
    }
}

/// Pid of the process that invoked us.
pub fn parent_pid() -> u32 {
    // SAFETY: getppid has no preconditions and cannot fail.
    let ppid = unsafe { libc::getppid() };
    u32::try_from(ppid).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_parse_stat_handles_odd_names() {
        let line = "4242 (my (weird) proc) S 1 4242 4242 0 -1 4194560 100 0 0 0 1 2 0 0 20 0 1 0 987654 1000 200";
        assert_eq!(parse_stat(line), Some(('S', 987654)));
        assert_eq!(parse_stat("garbage"), None);
    }

    #[test]
    fn test_probe_own_process_is_alive() {
        let me = std::process::id();
        assert!(pid_exists(me));
        assert_eq!(probe(me, start_ticks(me)), Liveness::Alive);
        assert!(is_protected(me));
        assert!(is_protected(0));
        assert!(is_protected(1));
    }

    #[test]
    fn test_probe_detects_reuse_and_zombies() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let ticks = start_ticks(pid);
        assert_eq!(probe(pid, ticks), Liveness::Alive);
        if let Some(t) = ticks {
            assert_eq!(probe(pid, Some(t + 1)), Liveness::Reused);
        }

        child.kill().unwrap();
        // Unreaped: still in the process table as a zombie.
        thread::sleep(Duration::from_millis(200));
        assert!(!probe(pid, ticks).is_alive());
        child.wait().unwrap();
        assert_eq!(probe(pid, ticks), Liveness::Dead);
    }

    #[test]
    fn test_terminate_stops_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let outcome = terminate(pid, start_ticks(pid), Duration::from_secs(2)).unwrap();
        assert_eq!(outcome, Termination::Terminated);
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn test_terminate_refuses_protected() {
        assert!(terminate(std::process::id(), None, Duration::from_millis(10)).is_err());
    }
}
