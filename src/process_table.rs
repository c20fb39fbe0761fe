use std::time::{Duration, Instant};

use regex::Regex;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMatch {
    pub pid: u32,
    pub command_line: String,
}

pub fn is_supported() -> bool {
    sysinfo::IS_SUPPORTED_SYSTEM
}

pub fn find(pattern: &Regex) -> Option<Vec<ProcessMatch>> {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );

    let own_pid = std::process::id();
    let mut matches: Vec<ProcessMatch> = system
        .processes()
        .iter()
        .filter(|(pid, _)| pid.as_u32() != own_pid)
        .filter_map(|(pid, process)| {
            let command_line = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");
            if command_line.is_empty() || !pattern.is_match(&command_line) {
                return None;
            }
            Some(ProcessMatch {
                pid: pid.as_u32(),
                command_line,
            })
        })
        .collect();

    if matches.is_empty() {
        return None;
    }
    matches.sort_by_key(|found| found.pid);
    Some(matches)
}

#[cfg(unix)]
pub async fn kill_pids(pids: &[u32], timeout: Duration) {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let mut remaining = Vec::with_capacity(pids.len());
    for &pid in pids {
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => remaining.push(pid),
            Err(Errno::ESRCH) => {}
            Err(err) => {
                warn!("failed to send SIGTERM to {pid}: {err}");
                remaining.push(pid);
            }
        }
    }

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        remaining.retain(|pid| process_exists(*pid));
        if remaining.is_empty() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }

    for pid in remaining {
        if process_exists(pid) {
            debug!("pid {pid} survived SIGTERM, sending SIGKILL");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
pub async fn kill_pids(pids: &[u32], _timeout: Duration) {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    for pid in pids {
        if let Some(process) = system.process(sysinfo::Pid::from_u32(*pid)) {
            process.kill();
        }
    }
}

#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn process_exists(pid: u32) -> bool {
    let mut system = System::new();
    let target = sysinfo::Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    system.process(target).is_some()
}
