use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

use crate::support::{env_bool, env_string, env_u16, env_u64, env_usize, millis};

pub const DEFAULT_READY_MARKERS: &[&str] = &["both servers are running", "development server available"];

/// Paired port ranges. Slot `i` maps to `app_base + i` / `proxy_base + i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct PortPoolConfig {
    pub app_base: u16,
    pub proxy_base: u16,
    pub size: u16,
}

impl Default for PortPoolConfig {
    fn default() -> Self {
        Self {
            app_base: 3100,
            proxy_base: 4100,
            size: 300,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub max_attempts: u32,
    pub interval_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            interval_ms: 500,
            connect_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub enabled: bool,
    pub command: String,
    /// `{port}` is replaced with the local port being forwarded.
    pub args: Vec<String>,
    /// Only URLs whose host ends with this suffix are accepted, if set.
    pub url_suffix: Option<String>,
    pub auth_token: Option<String>,
    /// Env var the token is exported as for the tunnel command.
    pub auth_token_env: String,
    pub timeout_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "cloudflared".to_string(),
            args: vec![
                "tunnel".to_string(),
                "--no-autoupdate".to_string(),
                "--url".to_string(),
                "http://127.0.0.1:{port}".to_string(),
            ],
            url_suffix: Some(".trycloudflare.com".to_string()),
            auth_token: None,
            auth_token_env: "TUNNEL_TOKEN".to_string(),
            timeout_ms: 15_000,
        }
    }
}

impl TunnelConfig {
    pub fn timeout(&self) -> Duration {
        millis(self.timeout_ms)
    }
}

/// Limits for the per-sandbox `logs/dev.log` capture.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Previous launches kept as `dev.log.1..N`.
    pub keep_files: usize,
    /// Bytes read from the end of the log for a tail request.
    pub tail_scan_bytes: u64,
    pub max_tail_lines: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            keep_files: 3,
            tail_scan_bytes: 1024 * 1024,
            max_tail_lines: 2000,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    /// Launcher for the dev server + header-stripping forwarder pair.
    pub dev_script: PathBuf,
    /// Optional `pull`/`push` theme sync script run before the dev start.
    pub sync_script: Option<PathBuf>,
    pub sync_timeout_ms: u64,
    pub ports: PortPoolConfig,
    pub startup_timeout_ms: u64,
    pub ready_markers: Vec<String>,
    pub readiness: ReadinessConfig,
    pub tunnel: TunnelConfig,
    pub logs: LogConfig,
    pub kill_grace_ms: u64,
    /// Host used when building the local (non-tunnel) preview URL.
    pub local_host: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            dev_script: PathBuf::from("./scripts/start-dev-server.sh"),
            sync_script: None,
            sync_timeout_ms: 120_000,
            ports: PortPoolConfig::default(),
            startup_timeout_ms: 30_000,
            ready_markers: DEFAULT_READY_MARKERS.iter().map(|s| s.to_string()).collect(),
            readiness: ReadinessConfig::default(),
            tunnel: TunnelConfig::default(),
            logs: LogConfig::default(),
            kill_grace_ms: 2_000,
            local_host: "127.0.0.1".to_string(),
        }
    }
}

impl AgentConfig {
    /// Defaults, then the TOML file named by `THEMEBOX_CONFIG`, then env.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match env_string("THEMEBOX_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str::<Self>(raw)?)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_string("THEMEBOX_DATA_ROOT") {
            self.data_root = PathBuf::from(v);
        }
        if let Some(v) = env_string("THEMEBOX_DEV_SCRIPT") {
            self.dev_script = PathBuf::from(v);
        }
        if let Some(v) = env_string("THEMEBOX_SYNC_SCRIPT") {
            self.sync_script = Some(PathBuf::from(v));
        }
        if let Some(v) = env_u16("THEMEBOX_APP_PORT_BASE") {
            self.ports.app_base = v;
        }
        if let Some(v) = env_u16("THEMEBOX_PROXY_PORT_BASE") {
            self.ports.proxy_base = v;
        }
        if let Some(v) = env_u16("THEMEBOX_PORT_POOL_SIZE") {
            self.ports.size = v;
        }
        if let Some(v) = env_u64("THEMEBOX_STARTUP_TIMEOUT_MS") {
            self.startup_timeout_ms = v.clamp(1_000, 10 * 60 * 1000);
        }
        if let Some(v) = env_u64("THEMEBOX_READY_MAX_ATTEMPTS") {
            self.readiness.max_attempts = v.clamp(1, 10_000) as u32;
        }
        if let Some(v) = env_u64("THEMEBOX_READY_INTERVAL_MS") {
            self.readiness.interval_ms = v.clamp(50, 60_000);
        }
        if let Some(v) = env_bool("THEMEBOX_TUNNEL_ENABLED") {
            self.tunnel.enabled = v;
        }
        if let Some(v) = env_string("THEMEBOX_TUNNEL_COMMAND") {
            self.tunnel.command = v;
        }
        if let Some(v) = env_string("THEMEBOX_TUNNEL_AUTH_TOKEN") {
            self.tunnel.auth_token = Some(v);
        }
        if let Some(v) = env_u64("THEMEBOX_TUNNEL_TIMEOUT_MS") {
            self.tunnel.timeout_ms = v.clamp(1_000, 5 * 60 * 1000);
        }
        if let Some(v) = env_usize("THEMEBOX_LOG_KEEP_FILES") {
            self.logs.keep_files = v.min(20);
        }
        if let Some(v) = env_u64("THEMEBOX_LOG_TAIL_SCAN_BYTES") {
            self.logs.tail_scan_bytes = v.clamp(4 * 1024, 64 * 1024 * 1024);
        }
        if let Some(v) = env_usize("THEMEBOX_LOG_MAX_TAIL_LINES") {
            self.logs.max_tail_lines = v.clamp(1, 50_000);
        }
        if let Some(v) = env_u64("THEMEBOX_KILL_GRACE_MS") {
            self.kill_grace_ms = v.clamp(0, 60_000);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let p = self.ports;
        if p.size == 0 {
            anyhow::bail!("port pool size must be > 0");
        }
        let app_end = u32::from(p.app_base) + u32::from(p.size);
        let proxy_end = u32::from(p.proxy_base) + u32::from(p.size);
        if app_end > u32::from(u16::MAX) + 1 || proxy_end > u32::from(u16::MAX) + 1 {
            anyhow::bail!("port pool overflows the u16 port range");
        }
        let overlaps = u32::from(p.app_base) < proxy_end && u32::from(p.proxy_base) < app_end;
        if overlaps {
            anyhow::bail!(
                "app ports {}..{} overlap proxy ports {}..{}",
                p.app_base,
                app_end,
                p.proxy_base,
                proxy_end
            );
        }
        if p.app_base == 0 || p.proxy_base == 0 {
            anyhow::bail!("port pool bases must be non-zero");
        }
        if self.logs.tail_scan_bytes < 4 * 1024 {
            anyhow::bail!("logs.tail_scan_bytes must be at least 4096");
        }
        if self.logs.max_tail_lines == 0 {
            anyhow::bail!("logs.max_tail_lines must be > 0");
        }
        if self.ready_markers.iter().all(|m| m.trim().is_empty()) {
            tracing::warn!("no startup markers configured; startup always waits for the timeout");
        }
        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        millis(self.startup_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        millis(self.sync_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        millis(self.kill_grace_ms)
    }

    pub fn sandboxes_root(&self) -> PathBuf {
        self.data_root.join("sandboxes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AgentConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.ports.size, 300);
        assert_eq!(cfg.tunnel.timeout(), Duration::from_secs(15));
    }

    #[test]
    fn toml_overrides_nested_sections() {
        let cfg = AgentConfig::from_toml(
            r#"
            dev_script = "/opt/themebox/dev.sh"
            [ports]
            app_base = 9000
            proxy_base = 9500
            size = 20
            [tunnel]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.dev_script, PathBuf::from("/opt/themebox/dev.sh"));
        assert_eq!(cfg.ports.app_base, 9000);
        assert_eq!(cfg.ports.size, 20);
        assert!(!cfg.tunnel.enabled);
        // Untouched keys keep their defaults.
        assert_eq!(cfg.readiness.max_attempts, 60);
        assert_eq!(cfg.tunnel.command, "cloudflared");
    }

    #[test]
    fn log_limits_come_from_the_logs_section() {
        let cfg = AgentConfig::from_toml(
            r#"
            [logs]
            keep_files = 5
            tail_scan_bytes = 65536
            "#,
        )
        .unwrap();
        assert_eq!(cfg.logs.keep_files, 5);
        assert_eq!(cfg.logs.tail_scan_bytes, 65_536);
        assert_eq!(cfg.logs.max_tail_lines, LogConfig::default().max_tail_lines);
        cfg.validate().unwrap();

        let mut tiny = cfg.clone();
        tiny.logs.tail_scan_bytes = 10;
        assert!(tiny.validate().unwrap_err().to_string().contains("tail_scan_bytes"));
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let mut cfg = AgentConfig::default();
        cfg.ports = PortPoolConfig {
            app_base: 5000,
            proxy_base: 5100,
            size: 300,
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn overflowing_range_is_rejected() {
        let mut cfg = AgentConfig::default();
        cfg.ports.proxy_base = 65_400;
        assert!(cfg.validate().is_err());
    }
}
