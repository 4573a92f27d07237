use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use themebox_process::{PortPair, SandboxId, UserId};
use tokio::io::AsyncWriteExt;

use crate::{
    config::{AgentConfig, LogConfig},
    logs::{DevLog, LogTail},
    port_reaper::{PortReaper, ReapReport, kill_port},
    support::{truncate_utf8, unix_ms_now},
};

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(250);
const LOG_POLL_INTERVAL: Duration = Duration::from_millis(50);
const RAW_OUTPUT_MAX_BYTES: usize = 64 * 1024;

/// Env var naming the JSON status file a child may write instead of (or in
/// addition to) printing a ready marker.
pub const STATUS_FILE_ENV: &str = "THEMEBOX_STATUS_FILE";

pub fn status_file_in(workdir: &Path) -> PathBuf {
    workdir.join(".themebox").join("status.json")
}

/// Everything the dev launcher needs for one sandbox.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub user_id: UserId,
    pub sandbox_id: SandboxId,
    pub store_domain: String,
    pub access_token: String,
    pub theme_id: i64,
    pub store_password: Option<String>,
    pub ports: PortPair,
    pub workdir: PathBuf,
}

impl LaunchSpec {
    /// Positional arguments in launcher order; the password is only passed
    /// when set.
    fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.user_id.0.clone(),
            self.sandbox_id.0.clone(),
            self.store_domain.clone(),
            self.access_token.clone(),
            self.theme_id.to_string(),
            self.ports.app_port.to_string(),
            self.ports.proxy_port.to_string(),
        ];
        if let Some(pw) = self.store_password.as_ref().filter(|p| !p.is_empty()) {
            args.push(pw.clone());
        }
        args
    }

    fn redacted_args(&self) -> Vec<String> {
        let mut args = self.args();
        args[3] = "<redacted>".to_string();
        if args.len() > 7 {
            args[7] = "<redacted>".to_string();
        }
        args
    }

    pub fn status_file(&self) -> PathBuf {
        status_file_in(&self.workdir)
    }

}

/// How the start was confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confirmation {
    Marker,
    StatusFile,
    /// Launcher exited 0 after printing output, leaving its servers behind.
    LauncherExited,
    /// Nothing confirmed before the startup timeout; the probe decides.
    TimedOut,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StartOutcome {
    pub started: bool,
    pub pid: Option<u32>,
    /// Process group of the launcher (the PID registry entry).
    pub pgid: Option<i32>,
    pub observed_ports: Vec<u16>,
    pub raw_output: String,
    pub confirmation: Confirmation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip)]
    pub reaped: Vec<ReapReport>,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("dev server script not found: {}", .0.display())]
    ScriptMissing(PathBuf),
    #[error("dev server script is not executable: {}", .0.display())]
    NotExecutable(PathBuf),
    #[error("failed to spawn dev server: {0}")]
    Spawn(#[source] io::Error),
    #[error("dev server exited before producing any output (code {code:?})")]
    NoOutput { code: Option<i32> },
    #[error("dev server exited with code {code:?} before confirming startup")]
    ExitedEarly { code: Option<i32>, output: String },
    #[error("dev server reported failure: {message}")]
    Reported { message: String, output: String },
}

impl StartError {
    pub fn raw_output(&self) -> Option<&str> {
        match self {
            StartError::ExitedEarly { output, .. } | StartError::Reported { output, .. } => {
                Some(output)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct StatusReport {
    #[serde(default)]
    state: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, serde::Serialize)]
struct RunInfo {
    sandbox_id: String,
    user_id: String,
    started_at_unix_ms: u64,
    agent_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pgid: Option<i32>,
    script: String,
    // Credentials are redacted.
    args: Vec<String>,
    app_port: u16,
    proxy_port: u16,
    cwd: String,
    log: String,
}

async fn write_run_json(dir: &Path, info: &RunInfo) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .context("create sandbox dir")?;
    let path = dir.join("run.json");
    let tmp = dir.join("run.json.tmp");
    let data = serde_json::to_vec_pretty(info).context("serialize run.json")?;
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .context("create run.json.tmp")?;
    f.write_all(&data).await.context("write run.json.tmp")?;
    f.flush().await.ok();
    tokio::fs::rename(&tmp, &path)
        .await
        .context("persist run.json")?;
    Ok(())
}

async fn read_status_file(path: &Path) -> Option<StatusReport> {
    let raw = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&raw).ok()
}

async fn check_script(path: &Path) -> Result<(), StartError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) if m.is_file() => m,
        _ => return Err(StartError::ScriptMissing(path.to_path_buf())),
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(StartError::NotExecutable(path.to_path_buf()));
        }
    }
    #[cfg(not(unix))]
    let _ = meta;
    Ok(())
}

/// Ports mentioned in launcher output: `127.0.0.1:N`, `localhost:N`, `port N`.
pub fn scan_ports(output: &str) -> Vec<u16> {
    fn leading_port(s: &str) -> Option<u16> {
        let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse::<u16>().ok().filter(|p| *p != 0)
    }

    let mut out = Vec::new();
    let lower = output.to_ascii_lowercase();
    for needle in ["127.0.0.1:", "localhost:", "0.0.0.0:"] {
        for (idx, _) in lower.match_indices(needle) {
            if let Some(p) = leading_port(&lower[idx + needle.len()..]) {
                out.push(p);
            }
        }
    }
    for (idx, _) in lower.match_indices("port") {
        let rest = lower[idx + 4..].trim_start_matches([' ', ':', '=']);
        if let Some(p) = leading_port(rest) {
            out.push(p);
        }
    }
    out.sort_unstable();
    out.dedup();
    out
}

/// Starts and hands off per-sandbox dev launchers. Children are detached and
/// write straight to their dev log; the manager never waits on them past
/// confirmation.
#[derive(Clone)]
pub struct ProcessManager {
    script: PathBuf,
    startup_timeout: Duration,
    ready_markers: Vec<String>,
    logs: LogConfig,
    reaper: Arc<dyn PortReaper>,
}

impl ProcessManager {
    pub fn new(cfg: &AgentConfig, reaper: Arc<dyn PortReaper>) -> Self {
        Self {
            script: cfg.dev_script.clone(),
            startup_timeout: cfg.startup_timeout(),
            ready_markers: cfg.ready_markers.clone(),
            logs: cfg.logs.clone(),
            reaper,
        }
    }

    fn is_marker(&self, line: &str) -> bool {
        let lower = line.to_ascii_lowercase();
        self.ready_markers
            .iter()
            .any(|m| !m.is_empty() && lower.contains(&m.to_ascii_lowercase()))
    }

    /// Best-effort kill-by-port on both ports of a pair.
    pub async fn reap_ports(&self, ports: PortPair) -> Vec<ReapReport> {
        let mut reports = Vec::with_capacity(2);
        for port in [ports.app_port, ports.proxy_port] {
            reports.push(kill_port(self.reaper.as_ref(), port).await);
        }
        reports
    }

    /// Stops the launcher group an earlier start from `workdir` recorded, as
    /// long as it still carries that sandbox's status-file variable.
    /// `Ok(false)` when no such group is left.
    pub async fn stop_recorded_group(&self, workdir: &Path, pgid: i32) -> io::Result<bool> {
        let status_file = status_file_in(workdir);
        let owned = self
            .reaper
            .group_has_env(pgid, STATUS_FILE_ENV, &status_file.to_string_lossy())
            .await?;
        if !owned {
            tracing::debug!(pgid, workdir = %workdir.display(), "recorded process group is gone or reused");
            return Ok(false);
        }
        self.reaper.terminate_group(pgid).await
    }

    /// Reads back the dev log of the sandbox living in `workdir`.
    pub async fn tail_logs(
        &self,
        workdir: &Path,
        cursor: u64,
        limit: usize,
    ) -> io::Result<Option<LogTail>> {
        DevLog::in_workdir(workdir)
            .tail(
                cursor,
                limit.min(self.logs.max_tail_lines),
                self.logs.tail_scan_bytes,
            )
            .await
    }

    pub async fn start(&self, spec: &LaunchSpec) -> Result<StartOutcome, StartError> {
        check_script(&self.script).await?;

        let reaped = self.reap_ports(spec.ports).await;

        let status_file = spec.status_file();
        if let Some(parent) = status_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(StartError::Spawn)?;
        }
        let _ = tokio::fs::remove_file(&status_file).await;

        let log = DevLog::in_workdir(&spec.workdir);
        if let Err(e) = log.rotate(self.logs.keep_files).await {
            tracing::warn!(sandbox_id = %spec.sandbox_id, error = %e, "failed to rotate dev log");
        }

        let args = spec.args();
        let mut cmd = tokio::process::Command::new(&self.script);
        cmd.args(&args)
            .current_dir(&spec.workdir)
            .env(STATUS_FILE_ENV, &status_file)
            .env("THEMEBOX_APP_PORT", spec.ports.app_port.to_string())
            .env("THEMEBOX_PROXY_PORT", spec.ports.proxy_port.to_string())
            .stdin(Stdio::null());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // Own session: survives the request and can be signalled as a group.
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    // Writes to a vanished reader fail with EPIPE instead of killing the group.
                    libc::signal(libc::SIGPIPE, libc::SIG_IGN);
                    Ok(())
                });
            }
        }

        let mut run = RunInfo {
            sandbox_id: spec.sandbox_id.0.clone(),
            user_id: spec.user_id.0.clone(),
            started_at_unix_ms: unix_ms_now(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            pid: None,
            pgid: None,
            script: self.script.display().to_string(),
            args: spec.redacted_args(),
            app_port: spec.ports.app_port,
            proxy_port: spec.ports.proxy_port,
            cwd: spec.workdir.display().to_string(),
            log: log.path().display().to_string(),
        };

        log.note(&format!(
            "exec: {} {} (app {}, proxy {})",
            run.script,
            run.args.join(" "),
            spec.ports.app_port,
            spec.ports.proxy_port
        ))
        .await;

        let (stdout, stderr) = log.child_stdio().map_err(StartError::Spawn)?;
        let mut follower = log
            .follow_from(log.size().await)
            .await
            .map_err(StartError::Spawn)?;
        cmd.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                StartError::NotExecutable(self.script.clone())
            } else {
                StartError::Spawn(e)
            }
        })?;
        // The child holds its own copies of the log handles.
        drop(cmd);
        let pid = child.id();
        let pgid = pid.map(|p| p as i32);

        run.pid = pid;
        run.pgid = pgid;
        if let Err(e) = write_run_json(&spec.workdir, &run).await {
            tracing::warn!(sandbox_id = %spec.sandbox_id, error = %e, "failed to write run.json");
        }

        tracing::info!(
            sandbox_id = %spec.sandbox_id,
            pid = ?pid,
            app_port = spec.ports.app_port,
            proxy_port = spec.ports.proxy_port,
            "dev server spawned"
        );

        let deadline = tokio::time::Instant::now() + self.startup_timeout;
        let mut output = CapturedOutput::default();
        let mut log_tick = tokio::time::interval(LOG_POLL_INTERVAL);
        let mut status_tick = tokio::time::interval(STATUS_POLL_INTERVAL);
        let mut launcher_exited = false;

        let confirmation = loop {
            tokio::select! {
                _ = log_tick.tick() => {
                    match follower.read_lines().await {
                        Ok(lines) => {
                            if output.absorb(lines, |l| self.is_marker(l)) {
                                break Confirmation::Marker;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(sandbox_id = %spec.sandbox_id, error = %e, "dev log read failed");
                        }
                    }
                }
                res = child.wait() => {
                    let code = res.ok().and_then(|s| s.code());
                    launcher_exited = true;
                    // The launcher wrote straight to the file: everything it
                    // printed is there once it has exited.
                    let rest = follower.read_remaining().await.unwrap_or_default();
                    let marker_seen = output.absorb(rest, |l| self.is_marker(l));
                    log.note(&format!("launcher exited (code {code:?})")).await;

                    if marker_seen {
                        break Confirmation::Marker;
                    }
                    if output.is_empty() {
                        return Err(StartError::NoOutput { code });
                    }
                    if code == Some(0) {
                        break Confirmation::LauncherExited;
                    }
                    return Err(StartError::ExitedEarly { code, output: output.joined() });
                }
                _ = status_tick.tick() => {
                    if let Some(report) = read_status_file(&status_file).await {
                        match report.state.as_str() {
                            "ready" | "running" => break Confirmation::StatusFile,
                            "failed" | "error" => {
                                let message = report
                                    .message
                                    .unwrap_or_else(|| "launcher reported failure".to_string());
                                if let Some(pgid) = pgid {
                                    let _ = self.reaper.terminate_group(pgid).await;
                                }
                                let _ = child.start_kill();
                                if let Ok(rest) = follower.read_remaining().await {
                                    output.absorb(rest, |_| false);
                                }
                                return Err(StartError::Reported {
                                    message,
                                    output: output.joined(),
                                });
                            }
                            _ => {}
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break Confirmation::TimedOut,
            }
        };

        let warning = (confirmation == Confirmation::TimedOut).then(|| {
            format!(
                "no startup confirmation within {}ms; continuing to readiness probe",
                self.startup_timeout.as_millis()
            )
        });
        if let Some(w) = &warning {
            tracing::warn!(sandbox_id = %spec.sandbox_id, "{w}");
            log.note(w).await;
        }

        // Hand off: the child keeps running on its own; this task only reaps it.
        if !launcher_exited {
            let sandbox_id = spec.sandbox_id.clone();
            let exit_log = log.clone();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => {
                        tracing::info!(sandbox_id = %sandbox_id, code = ?status.code(), "dev launcher exited");
                        exit_log
                            .note(&format!("launcher exited (code {:?})", status.code()))
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!(sandbox_id = %sandbox_id, error = %e, "failed to wait for dev launcher");
                    }
                }
            });
        }

        let raw_output = output.joined();
        tracing::info!(
            sandbox_id = %spec.sandbox_id,
            confirmation = ?confirmation,
            "dev server start confirmed"
        );
        Ok(StartOutcome {
            started: true,
            pid,
            pgid,
            observed_ports: scan_ports(&raw_output),
            raw_output,
            confirmation,
            warning,
            reaped,
        })
    }
}

/// Launcher output seen before confirmation, capped for the caller.
#[derive(Default)]
struct CapturedOutput {
    lines: Vec<String>,
    bytes: usize,
}

impl CapturedOutput {
    /// Keeps `lines` (up to the cap) and reports whether any matched.
    fn absorb(&mut self, lines: Vec<String>, is_marker: impl Fn(&str) -> bool) -> bool {
        let mut hit = false;
        for line in lines {
            hit |= is_marker(&line);
            if self.bytes < RAW_OUTPUT_MAX_BYTES {
                self.bytes += line.len() + 1;
                self.lines.push(line);
            }
        }
        hit
    }

    fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn joined(&self) -> String {
        truncate_utf8(&self.lines.join("\n"), RAW_OUTPUT_MAX_BYTES)
    }
}
