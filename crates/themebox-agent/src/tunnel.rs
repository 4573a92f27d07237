use std::{collections::HashMap, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use themebox_process::{SandboxId, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Child,
    sync::{Mutex, mpsc},
};

use crate::config::TunnelConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error("tunnel creation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("tunnel provider failed: {0}")]
    Provider(String),
    #[error("public tunnels are disabled")]
    Disabled,
    #[error("failed to close tunnel: {0}")]
    Close(String),
}

/// A live public forward. Closing releases the public address.
#[async_trait]
pub trait TunnelHandle: Send + Sync {
    fn url(&self) -> &str;

    async fn close(&mut self) -> Result<(), TunnelError>;
}

/// Opaque "forward(port) -> public URL" capability.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    async fn forward(
        &self,
        local_port: u16,
        auth_token: Option<&str>,
    ) -> Result<Box<dyn TunnelHandle>, TunnelError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelKey {
    pub user_id: UserId,
    pub sandbox_id: SandboxId,
}

impl TunnelKey {
    pub fn new(user_id: &UserId, sandbox_id: &SandboxId) -> Self {
        Self {
            user_id: user_id.clone(),
            sandbox_id: sandbox_id.clone(),
        }
    }
}

struct TunnelEntry {
    local_port: u16,
    public_url: String,
    created_at: chrono::DateTime<chrono::Utc>,
    handle: Box<dyn TunnelHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TunnelInfo {
    pub user_id: String,
    pub sandbox_id: String,
    pub local_port: u16,
    pub public_url: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Process-wide set of open tunnels, at most one per key. Entries own their
/// handle; removing an entry and closing its handle always happen together.
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    inner: Arc<Mutex<HashMap<TunnelKey, TunnelEntry>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn public_url(&self, key: &TunnelKey) -> Option<String> {
        self.inner
            .lock()
            .await
            .get(key)
            .map(|e| e.public_url.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub async fn list(&self) -> Vec<TunnelInfo> {
        let map = self.inner.lock().await;
        let mut out: Vec<TunnelInfo> = map
            .iter()
            .map(|(k, e)| TunnelInfo {
                user_id: k.user_id.0.clone(),
                sandbox_id: k.sandbox_id.0.clone(),
                local_port: e.local_port,
                public_url: e.public_url.clone(),
                created_at: e.created_at,
            })
            .collect();
        out.sort_by(|a, b| a.sandbox_id.cmp(&b.sandbox_id));
        out
    }

    /// Inserts unless the key is already live; on conflict the rejected
    /// entry is handed back so its handle can be closed.
    async fn insert_if_absent(
        &self,
        key: TunnelKey,
        entry: TunnelEntry,
    ) -> Result<(), (String, TunnelEntry)> {
        let mut map = self.inner.lock().await;
        if let Some(existing) = map.get(&key) {
            return Err((existing.public_url.clone(), entry));
        }
        map.insert(key, entry);
        Ok(())
    }

    async fn take(&self, key: &TunnelKey) -> Option<TunnelEntry> {
        self.inner.lock().await.remove(key)
    }

    async fn drain(&self) -> Vec<(TunnelKey, TunnelEntry)> {
        self.inner.lock().await.drain().collect()
    }
}

pub struct TunnelManager {
    provider: Arc<dyn TunnelProvider>,
    registry: TunnelRegistry,
    timeout: Duration,
    auth_token: Option<String>,
    enabled: bool,
}

impl TunnelManager {
    pub fn new(provider: Arc<dyn TunnelProvider>, registry: TunnelRegistry, cfg: &TunnelConfig) -> Self {
        Self {
            provider,
            registry,
            timeout: cfg.timeout(),
            auth_token: cfg.auth_token.clone(),
            enabled: cfg.enabled,
        }
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Opens (or reuses) the public tunnel for a sandbox. Provider calls are
    /// raced against the configured timeout; timeouts are recoverable.
    pub async fn create_tunnel(
        &self,
        local_port: u16,
        user_id: &UserId,
        sandbox_id: &SandboxId,
    ) -> Result<String, TunnelError> {
        if !self.enabled {
            return Err(TunnelError::Disabled);
        }

        let key = TunnelKey::new(user_id, sandbox_id);
        if let Some(url) = self.registry.public_url(&key).await {
            tracing::debug!(sandbox_id = %sandbox_id, %url, "reusing existing tunnel");
            return Ok(url);
        }

        let forward = self.provider.forward(local_port, self.auth_token.as_deref());
        let handle = match tokio::time::timeout(self.timeout, forward).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                tracing::warn!(sandbox_id = %sandbox_id, local_port, error = %e, "tunnel provider failed");
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(
                    sandbox_id = %sandbox_id,
                    local_port,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "tunnel creation timed out"
                );
                return Err(TunnelError::Timeout(self.timeout));
            }
        };

        let public_url = handle.url().to_string();
        let entry = TunnelEntry {
            local_port,
            public_url: public_url.clone(),
            created_at: chrono::Utc::now(),
            handle,
        };

        match self.registry.insert_if_absent(key, entry).await {
            Ok(()) => {
                tracing::info!(sandbox_id = %sandbox_id, local_port, url = %public_url, "tunnel opened");
                Ok(public_url)
            }
            Err((existing, mut rejected)) => {
                // Lost a race with a concurrent create for the same sandbox.
                if let Err(e) = rejected.handle.close().await {
                    tracing::warn!(sandbox_id = %sandbox_id, error = %e, "failed to close duplicate tunnel");
                }
                Ok(existing)
            }
        }
    }

    /// `false` when no tunnel was open for the key.
    pub async fn close_tunnel(&self, user_id: &UserId, sandbox_id: &SandboxId) -> bool {
        let key = TunnelKey::new(user_id, sandbox_id);
        let Some(mut entry) = self.registry.take(&key).await else {
            return false;
        };
        if let Err(e) = entry.handle.close().await {
            tracing::warn!(sandbox_id = %sandbox_id, url = %entry.public_url, error = %e, "tunnel close failed");
        } else {
            tracing::info!(sandbox_id = %sandbox_id, url = %entry.public_url, "tunnel closed");
        }
        true
    }

    /// Closes every tunnel concurrently and empties the registry. Individual
    /// failures are logged; returns how many closed cleanly.
    pub async fn close_all(&self) -> usize {
        let entries = self.registry.drain().await;
        if entries.is_empty() {
            return 0;
        }
        tracing::info!(count = entries.len(), "closing all tunnels");

        let closes = entries.into_iter().map(|(key, mut entry)| async move {
            let res = entry.handle.close().await;
            (key, res)
        });

        let mut ok = 0;
        for (key, res) in futures_util::future::join_all(closes).await {
            match res {
                Ok(()) => ok += 1,
                Err(e) => {
                    tracing::warn!(sandbox_id = %key.sandbox_id, error = %e, "tunnel close failed during shutdown");
                }
            }
        }
        ok
    }
}

/// Runs a tunnel CLI per forward and scrapes its output for the public URL.
#[derive(Debug, Clone)]
pub struct CommandTunnelProvider {
    command: String,
    args: Vec<String>,
    url_suffix: Option<String>,
    auth_token_env: String,
}

impl CommandTunnelProvider {
    pub fn from_config(cfg: &TunnelConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            args: cfg.args.clone(),
            url_suffix: cfg.url_suffix.clone().filter(|s| !s.is_empty()),
            auth_token_env: cfg.auth_token_env.clone(),
        }
    }
}

#[async_trait]
impl TunnelProvider for CommandTunnelProvider {
    async fn forward(
        &self,
        local_port: u16,
        auth_token: Option<&str>,
    ) -> Result<Box<dyn TunnelHandle>, TunnelError> {
        let port = local_port.to_string();
        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(self.args.iter().map(|a| a.replace("{port}", &port)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the forward future (timeout) must not leak the CLI.
            .kill_on_drop(true);
        if let Some(token) = auth_token {
            cmd.env(&self.auth_token_env, token);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| TunnelError::Provider(format!("spawn {}: {e}", self.command)))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if let Some(out) = child.stdout.take() {
            forward_lines(out, tx.clone());
        }
        if let Some(err) = child.stderr.take() {
            forward_lines(err, tx.clone());
        }
        drop(tx);

        let mut url = None;
        while let Some(line) = rx.recv().await {
            if let Some(found) = extract_public_url(&line, self.url_suffix.as_deref()) {
                url = Some(found);
                break;
            }
        }
        let Some(url) = url else {
            let status = child.wait().await.ok();
            return Err(TunnelError::Provider(format!(
                "{} exited before printing a public url (status {:?})",
                self.command,
                status.and_then(|s| s.code())
            )));
        };

        // Keep draining so the CLI never blocks on a full pipe.
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                tracing::trace!(target: "themebox::tunnel", "{line}");
            }
        });

        Ok(Box::new(CommandTunnelHandle {
            url,
            child: Some(child),
        }))
    }
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            // CLI banners are not always valid UTF-8; keep reading past them.
            let line = String::from_utf8_lossy(&buf)
                .trim_end_matches(['\r', '\n'])
                .to_string();
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

struct CommandTunnelHandle {
    url: String,
    child: Option<Child>,
}

#[async_trait]
impl TunnelHandle for CommandTunnelHandle {
    fn url(&self) -> &str {
        &self.url
    }

    async fn close(&mut self) -> Result<(), TunnelError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }

        match tokio::time::timeout(Duration::from_secs(3), child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(TunnelError::Close(e.to_string())),
            Err(_) => child
                .kill()
                .await
                .map_err(|e| TunnelError::Close(e.to_string())),
        }
    }
}

/// First `https://` URL in a line of tunnel CLI output, optionally restricted
/// to hosts ending in `suffix`.
pub(crate) fn extract_public_url(line: &str, suffix: Option<&str>) -> Option<String> {
    line.split(|c: char| c.is_whitespace() || matches!(c, '|' | '"' | '\'' | '<' | '>'))
        .filter_map(|tok| {
            let tok = tok.trim_end_matches(['.', ',', ';', ')', ']']);
            let rest = tok.strip_prefix("https://")?;
            let host = rest.split(['/', ':']).next()?;
            if host.is_empty() {
                return None;
            }
            if let Some(sfx) = suffix
                && !host.ends_with(sfx)
            {
                return None;
            }
            Some(tok.to_string())
        })
        .next()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    pub(crate) struct FakeProvider {
        pub(crate) forwards: AtomicUsize,
        pub(crate) closes: Arc<AtomicUsize>,
        pub(crate) fail: bool,
        pub(crate) hang: bool,
    }

    struct FakeHandle {
        url: String,
        closes: Arc<AtomicUsize>,
        fail_close: bool,
    }

    #[async_trait]
    impl TunnelHandle for FakeHandle {
        fn url(&self) -> &str {
            &self.url
        }

        async fn close(&mut self) -> Result<(), TunnelError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(TunnelError::Close("provider said no".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl TunnelProvider for FakeProvider {
        async fn forward(
            &self,
            local_port: u16,
            _auth_token: Option<&str>,
        ) -> Result<Box<dyn TunnelHandle>, TunnelError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.fail {
                return Err(TunnelError::Provider("quota exceeded".into()));
            }
            let n = self.forwards.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeHandle {
                url: format!("https://t{n}-{local_port}.tunnel.test"),
                closes: self.closes.clone(),
                // Port 1 stands in for a tunnel whose close fails.
                fail_close: local_port == 1,
            }))
        }
    }

    pub(crate) fn manager(provider: Arc<FakeProvider>) -> TunnelManager {
        TunnelManager::new(provider, TunnelRegistry::new(), &TunnelConfig::default())
    }

    fn ids(user: &str, sandbox: &str) -> (UserId, SandboxId) {
        (UserId(user.into()), SandboxId(sandbox.into()))
    }

    #[tokio::test]
    async fn second_create_reuses_the_live_tunnel() {
        let provider = Arc::new(FakeProvider::default());
        let mgr = manager(provider.clone());
        let (u, s) = ids("u1", "s1");

        let first = mgr.create_tunnel(4100, &u, &s).await.unwrap();
        let second = mgr.create_tunnel(4100, &u, &s).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.forwards.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.registry().len().await, 1);
    }

    #[tokio::test]
    async fn close_unknown_key_is_false() {
        let mgr = manager(Arc::new(FakeProvider::default()));
        let (u, s) = ids("u1", "nope");
        assert!(!mgr.close_tunnel(&u, &s).await);
    }

    #[tokio::test]
    async fn close_removes_entry_and_closes_handle() {
        let provider = Arc::new(FakeProvider::default());
        let mgr = manager(provider.clone());
        let (u, s) = ids("u1", "s1");

        mgr.create_tunnel(4100, &u, &s).await.unwrap();
        assert!(mgr.close_tunnel(&u, &s).await);
        assert_eq!(provider.closes.load(Ordering::SeqCst), 1);
        assert!(mgr.registry().is_empty().await);

        // A fresh tunnel can be opened after closing.
        mgr.create_tunnel(4100, &u, &s).await.unwrap();
        assert_eq!(provider.forwards.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_all_survives_individual_failures() {
        let provider = Arc::new(FakeProvider::default());
        let mgr = manager(provider.clone());
        mgr.create_tunnel(1, &UserId("u".into()), &SandboxId("bad".into()))
            .await
            .unwrap();
        mgr.create_tunnel(4100, &UserId("u".into()), &SandboxId("a".into()))
            .await
            .unwrap();
        mgr.create_tunnel(4101, &UserId("u".into()), &SandboxId("b".into()))
            .await
            .unwrap();

        assert_eq!(mgr.close_all().await, 2);
        assert_eq!(provider.closes.load(Ordering::SeqCst), 3);
        assert!(mgr.registry().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_provider_times_out_on_schedule() {
        let provider = Arc::new(FakeProvider {
            hang: true,
            ..FakeProvider::default()
        });
        let mgr = manager(provider);
        let (u, s) = ids("u1", "s1");

        let started = tokio::time::Instant::now();
        let err = mgr.create_tunnel(4100, &u, &s).await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err, TunnelError::Timeout(Duration::from_secs(15)));
        assert!(elapsed >= Duration::from_secs(15));
        assert!(elapsed < Duration::from_millis(15_500));
        assert!(mgr.registry().is_empty().await);
    }

    #[tokio::test]
    async fn provider_failure_and_disabled_are_typed_errors() {
        let mgr = manager(Arc::new(FakeProvider {
            fail: true,
            ..FakeProvider::default()
        }));
        let (u, s) = ids("u1", "s1");
        assert!(matches!(
            mgr.create_tunnel(4100, &u, &s).await,
            Err(TunnelError::Provider(_))
        ));

        let cfg = TunnelConfig {
            enabled: false,
            ..TunnelConfig::default()
        };
        let off = TunnelManager::new(Arc::new(FakeProvider::default()), TunnelRegistry::new(), &cfg);
        assert_eq!(
            off.create_tunnel(4100, &u, &s).await,
            Err(TunnelError::Disabled)
        );
    }

    #[test]
    fn extracts_urls_from_cli_banners() {
        let cf = "2024-01-01T00:00:00Z INF |  https://quiet-fox-1.trycloudflare.com                  |";
        assert_eq!(
            extract_public_url(cf, Some(".trycloudflare.com")).as_deref(),
            Some("https://quiet-fox-1.trycloudflare.com")
        );

        let docs = "INF Visit https://www.cloudflare.com/website-terms/ for terms.";
        assert_eq!(extract_public_url(docs, Some(".trycloudflare.com")), None);
        assert_eq!(
            extract_public_url(docs, None).as_deref(),
            Some("https://www.cloudflare.com/website-terms/")
        );

        let ngrok = r#"{"lvl":"info","msg":"started tunnel","url":"https://ab12.ngrok-free.app"}"#;
        assert_eq!(
            extract_public_url(ngrok, None).as_deref(),
            Some("https://ab12.ngrok-free.app")
        );
        assert_eq!(extract_public_url("no urls here", None), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_provider_scrapes_url_and_closes() {
        let cfg = TunnelConfig {
            command: "sh".into(),
            args: vec![
                "-c".into(),
                "printf 'caf\\351\\n'; echo starting {port} >&2; echo '| https://demo-{port}.trycloudflare.com |'; exec sleep 30".into(),
            ],
            ..TunnelConfig::default()
        };
        let provider = CommandTunnelProvider::from_config(&cfg);
        let mut handle = provider.forward(4100, None).await.unwrap();
        assert_eq!(handle.url(), "https://demo-4100.trycloudflare.com");
        handle.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_provider_reports_early_exit() {
        let cfg = TunnelConfig {
            command: "sh".into(),
            args: vec!["-c".into(), "echo nope; exit 3".into()],
            ..TunnelConfig::default()
        };
        let provider = CommandTunnelProvider::from_config(&cfg);
        let err = provider.forward(4100, None).await.err().unwrap();
        assert!(matches!(err, TunnelError::Provider(_)));
    }
}
