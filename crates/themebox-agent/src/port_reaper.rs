use std::{io, time::Duration};

use async_trait::async_trait;

/// OS access needed to clear stale occupants off a port.
#[async_trait]
pub trait PortReaper: Send + Sync {
    /// PIDs with a TCP socket in LISTEN state on `port`.
    async fn pids_listening(&self, port: u16) -> io::Result<Vec<u32>>;

    /// SIGTERM, then SIGKILL after a grace period. `Ok(false)` if the process
    /// was already gone.
    async fn terminate(&self, pid: u32) -> io::Result<bool>;

    /// Same as [`PortReaper::terminate`] for a whole process group.
    async fn terminate_group(&self, pgid: i32) -> io::Result<bool>;

    /// Whether a live member of group `pgid` has `key=value` in its
    /// environment. Group ids get recycled, so a persisted one is only
    /// signalled when this holds.
    async fn group_has_env(&self, pgid: i32, key: &str, value: &str) -> io::Result<bool>;
}

/// Outcome of one best-effort kill-by-port step. Never an error: callers log
/// it and move on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub port: u16,
    pub found: Vec<u32>,
    pub killed: Vec<u32>,
    pub failures: Vec<String>,
    pub lookup_error: Option<String>,
}

impl ReapReport {
    pub fn killed_count(&self) -> usize {
        self.killed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.lookup_error.is_none()
    }
}

pub async fn kill_port(reaper: &dyn PortReaper, port: u16) -> ReapReport {
    let mut report = ReapReport {
        port,
        ..ReapReport::default()
    };

    let pids = match reaper.pids_listening(port).await {
        Ok(pids) => pids,
        Err(e) => {
            tracing::warn!(port, error = %e, "failed to list processes on port");
            report.lookup_error = Some(e.to_string());
            return report;
        }
    };

    let me = std::process::id();
    for pid in pids.into_iter().filter(|p| *p != me) {
        report.found.push(pid);
        match reaper.terminate(pid).await {
            Ok(true) => {
                tracing::info!(port, pid, "terminated stale process on port");
                report.killed.push(pid);
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(port, pid, error = %e, "failed to terminate process on port");
                report.failures.push(format!("pid {pid}: {e}"));
            }
        }
    }
    report
}

#[derive(Debug, Clone)]
pub struct OsPortReaper {
    grace: Duration,
}

impl OsPortReaper {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

#[async_trait]
impl PortReaper for OsPortReaper {
    async fn pids_listening(&self, port: u16) -> io::Result<Vec<u32>> {
        let output = tokio::process::Command::new("lsof")
            .args(["-nP", "-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
            .stdin(std::process::Stdio::null())
            .output()
            .await;

        match output {
            // lsof exits 1 with no output when nothing matches.
            Ok(out) => Ok(parse_pid_lines(&String::from_utf8_lossy(&out.stdout))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tokio::task::spawn_blocking(move || procfs_listening_pids(port))
                    .await
                    .map_err(io::Error::other)?
            }
            Err(e) => Err(e),
        }
    }

    async fn terminate(&self, pid: u32) -> io::Result<bool> {
        let pid = i32::try_from(pid).map_err(|_| io::Error::other("pid out of range"))?;
        signal_and_wait(pid, self.grace).await
    }

    async fn terminate_group(&self, pgid: i32) -> io::Result<bool> {
        if pgid <= 1 {
            return Err(io::Error::other(format!("refusing to signal group {pgid}")));
        }
        signal_and_wait(-pgid, self.grace).await
    }

    async fn group_has_env(&self, pgid: i32, key: &str, value: &str) -> io::Result<bool> {
        if pgid <= 1 {
            return Ok(false);
        }
        let entry = format!("{key}={value}").into_bytes();
        tokio::task::spawn_blocking(move || procfs_group_has_env(pgid, &entry))
            .await
            .map_err(io::Error::other)?
    }
}

/// Process group id from the text of `/proc/<pid>/stat`.
pub(crate) fn parse_stat_pgrp(stat: &str) -> Option<i32> {
    // comm may contain spaces and parentheses; fields resume after the last ')'.
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(2)?.parse().ok()
}

#[cfg(target_os = "linux")]
fn procfs_group_has_env(pgid: i32, entry: &[u8]) -> io::Result<bool> {
    for proc_entry in std::fs::read_dir("/proc")?.flatten() {
        let is_pid = proc_entry
            .file_name()
            .to_str()
            .is_some_and(|s| s.bytes().all(|b| b.is_ascii_digit()));
        if !is_pid {
            continue;
        }
        let Ok(stat) = std::fs::read_to_string(proc_entry.path().join("stat")) else {
            continue;
        };
        if parse_stat_pgrp(&stat) != Some(pgid) {
            continue;
        }
        // Unreadable (other users) or empty (zombies) environments never match.
        let Ok(environ) = std::fs::read(proc_entry.path().join("environ")) else {
            continue;
        };
        if environ.split(|b| *b == 0).any(|e| e == entry) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Without procfs a recorded group cannot be verified and is left alone;
/// kill-by-port still clears the sandbox ports.
#[cfg(not(target_os = "linux"))]
fn procfs_group_has_env(_pgid: i32, _entry: &[u8]) -> io::Result<bool> {
    Ok(false)
}

pub(crate) fn parse_pid_lines(raw: &str) -> Vec<u32> {
    let mut out: Vec<u32> = raw
        .lines()
        .filter_map(|l| l.trim().parse::<u32>().ok())
        .filter(|p| *p > 0)
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// `target` follows kill(2): positive is a pid, negative a process group.
#[cfg(unix)]
async fn signal_and_wait(target: i32, grace: Duration) -> io::Result<bool> {
    if !send_signal(target, libc::SIGTERM)? {
        return Ok(false);
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !send_signal(target, 0)? {
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    send_signal(target, libc::SIGKILL)?;
    Ok(true)
}

#[cfg(not(unix))]
async fn signal_and_wait(_target: i32, _grace: Duration) -> io::Result<bool> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process signals are only supported on unix",
    ))
}

/// `Ok(false)` when the target no longer exists.
#[cfg(unix)]
fn send_signal(target: i32, sig: libc::c_int) -> io::Result<bool> {
    let rc = unsafe { libc::kill(target, sig) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(err)
}

/// Socket inodes in LISTEN state for `port`, from /proc/net/tcp{,6} text.
pub(crate) fn parse_listen_inodes(table: &str, port: u16) -> Vec<u64> {
    const TCP_LISTEN: &str = "0A";
    let mut out = Vec::new();
    for line in table.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        let (Some(local), Some(state), Some(inode)) = (cols.get(1), cols.get(3), cols.get(9))
        else {
            continue;
        };
        if *state != TCP_LISTEN {
            continue;
        }
        let Some((_, port_hex)) = local.rsplit_once(':') else {
            continue;
        };
        if u16::from_str_radix(port_hex, 16).ok() != Some(port) {
            continue;
        }
        if let Ok(inode) = inode.parse::<u64>()
            && inode != 0
        {
            out.push(inode);
        }
    }
    out
}

#[cfg(target_os = "linux")]
fn procfs_listening_pids(port: u16) -> io::Result<Vec<u32>> {
    let mut inodes = Vec::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(raw) = std::fs::read_to_string(table) {
            inodes.extend(parse_listen_inodes(&raw, port));
        }
    }
    if inodes.is_empty() {
        return Ok(Vec::new());
    }
    let wanted: Vec<String> = inodes.iter().map(|i| format!("socket:[{i}]")).collect();

    let mut pids = Vec::new();
    for entry in std::fs::read_dir("/proc")?.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Processes we cannot inspect (other users) are skipped.
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        let owns_socket = fds.flatten().any(|fd| {
            std::fs::read_link(fd.path())
                .ok()
                .and_then(|t| t.to_str().map(|s| wanted.iter().any(|w| w == s)))
                .unwrap_or(false)
        });
        if owns_socket {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    Ok(pids)
}

#[cfg(not(target_os = "linux"))]
fn procfs_listening_pids(_port: u16) -> io::Result<Vec<u32>> {
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "lsof is not installed and /proc is unavailable",
    ))
}
