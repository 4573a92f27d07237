use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use themebox_process::{
    IdError, LifecycleStage, PortPair, SandboxId, SandboxStatus, UserId,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    config::{AgentConfig, ReadinessConfig},
    logs::LogTail,
    port_alloc::{AllocError, PortAllocator, PortPool},
    port_reaper::{PortReaper, ReapReport},
    process_manager::{LaunchSpec, ProcessManager, StartError},
    readiness::ReadinessProber,
    store::{NewSandbox, SandboxRecord, SandboxStore, StoreError, StoredUrls},
    sync::{SyncDirection, SyncError, ThemeSync},
    tunnel::{TunnelError, TunnelManager},
};

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CreateSandboxParams {
    /// Generated when absent.
    #[serde(default)]
    pub sandbox_id: Option<String>,
    pub user_id: String,
    pub store_domain: String,
    pub access_token: String,
    pub theme_id: i64,
    #[serde(default)]
    pub store_password: Option<String>,
}

/// Addresses a sandbox is reachable at after create/refresh.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SandboxUrls {
    pub sandbox_id: String,
    /// Public tunnel URL when available, otherwise the local proxy URL.
    pub preview_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    pub local_url: String,
    pub ports: PortPair,
    pub ready: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Per-step result of a delete. Each step is attempted regardless of the
/// others; only the final record deletion can fail the operation.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TeardownReport {
    pub killed_count: usize,
    pub tunnel_closed: bool,
    pub files_removed: bool,
    pub record_deleted: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
    #[serde(skip)]
    pub reaped: Vec<ReapReport>,
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("invalid {field}: {source}")]
    InvalidId {
        field: &'static str,
        #[source]
        source: IdError,
    },
    #[error("sandbox not found: {0}")]
    NotFound(String),
    #[error("sandbox {0} belongs to a different user")]
    OwnerMismatch(String),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Start(#[from] StartError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to prepare sandbox directory {}: {source}", .path.display())]
    Workdir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read sandbox log in {}: {source}", .path.display())]
    Logs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LifecycleError {
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::InvalidId { .. } => "invalid_id",
            LifecycleError::NotFound(_) => "not_found",
            LifecycleError::OwnerMismatch(_) => "owner_mismatch",
            LifecycleError::Alloc(AllocError::PoolExhausted { .. }) => "pool_exhausted",
            LifecycleError::Alloc(AllocError::Contended { .. }) => "port_contended",
            LifecycleError::Alloc(AllocError::UnknownSandbox(_)) => "not_found",
            LifecycleError::Alloc(AllocError::Store(_)) => "store_error",
            LifecycleError::Start(
                StartError::ScriptMissing(_) | StartError::NotExecutable(_) | StartError::Spawn(_),
            ) => "spawn_failed",
            LifecycleError::Start(_) => "startup_failed",
            LifecycleError::Sync(SyncError::Timeout { .. }) => "theme_sync_timeout",
            LifecycleError::Sync(_) => "theme_sync_failed",
            LifecycleError::Store(StoreError::NotFound(_)) => "not_found",
            LifecycleError::Store(_) => "store_error",
            LifecycleError::Workdir { .. } | LifecycleError::Logs { .. } => "io_error",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self.code() {
            "pool_exhausted" => Some("All preview slots are in use. Delete an unused sandbox or retry later."),
            "spawn_failed" => Some("Check THEMEBOX_DEV_SCRIPT points at an executable launcher."),
            "startup_failed" => Some("Inspect the sandbox logs for the launcher output."),
            "theme_sync_failed" | "theme_sync_timeout" => {
                Some("Verify the store domain, access token and theme id.")
            }
            _ => None,
        }
    }

    pub fn is_retriable(&self) -> bool {
        match self {
            LifecycleError::Alloc(e) => e.is_retriable(),
            LifecycleError::Sync(SyncError::Timeout { .. }) => true,
            _ => false,
        }
    }
}

/// One async mutex per sandbox id so create/refresh/delete on the same
/// sandbox never interleave. Entries live only while someone holds or waits
/// for them.
#[derive(Default)]
struct SandboxLocks {
    inner: std::sync::Mutex<HashMap<SandboxId, Arc<Mutex<()>>>>,
}

impl SandboxLocks {
    async fn acquire(&self, id: &SandboxId) -> SandboxLockGuard<'_> {
        // Built before waiting so a dropped waiter still releases the entry.
        let mut held = SandboxLockGuard {
            locks: self,
            id: id.clone(),
            guard: None,
        };
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        held.guard = Some(lock.lock_owned().await);
        held
    }

    fn release(&self, id: &SandboxId) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map's own reference left: nobody holds or awaits it.
        if map.get(id).is_some_and(|l| Arc::strong_count(l) == 1) {
            map.remove(id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

struct SandboxLockGuard<'a> {
    locks: &'a SandboxLocks,
    id: SandboxId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SandboxLockGuard<'_> {
    fn drop(&mut self) {
        // Unlock first so the map holds the last reference.
        self.guard.take();
        self.locks.release(&self.id);
    }
}

/// Drives sandboxes through allocate, sync, start, probe and tunnel, and
/// tears them down again.
pub struct SandboxLifecycle {
    store: Arc<dyn SandboxStore>,
    allocator: PortAllocator,
    processes: ProcessManager,
    sync: ThemeSync,
    prober: ReadinessProber,
    readiness: ReadinessConfig,
    tunnels: Arc<TunnelManager>,
    sandboxes_root: PathBuf,
    local_host: String,
    locks: SandboxLocks,
}

impl SandboxLifecycle {
    pub fn new(
        cfg: &AgentConfig,
        store: Arc<dyn SandboxStore>,
        reaper: Arc<dyn PortReaper>,
        tunnels: Arc<TunnelManager>,
    ) -> Self {
        Self {
            allocator: PortAllocator::new(store.clone(), PortPool::new(cfg.ports)),
            store,
            processes: ProcessManager::new(cfg, reaper),
            sync: ThemeSync::new(cfg),
            prober: ReadinessProber::from_config(&cfg.readiness),
            readiness: cfg.readiness.clone(),
            tunnels,
            sandboxes_root: cfg.sandboxes_root(),
            local_host: cfg.local_host.clone(),
            locks: SandboxLocks::default(),
        }
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.allocator
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    pub fn sandbox_dir(&self, user_id: &UserId, sandbox_id: &SandboxId) -> PathBuf {
        self.sandboxes_root.join(user_id.as_str()).join(sandbox_id.as_str())
    }

    pub async fn get(&self, sandbox_id: &str) -> Result<SandboxRecord, LifecycleError> {
        let id = parse_sandbox_id(sandbox_id)?;
        self.store
            .get(&id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(id.0.clone()))
    }

    pub async fn create(&self, params: CreateSandboxParams) -> Result<SandboxUrls, LifecycleError> {
        let sandbox_id = match params.sandbox_id.as_deref() {
            Some(raw) => parse_sandbox_id(raw)?,
            None => SandboxId::new(),
        };
        let user_id = UserId::parse(&params.user_id).map_err(|source| LifecycleError::InvalidId {
            field: "user_id",
            source,
        })?;

        let _guard = self.locks.acquire(&sandbox_id).await;

        let record = match self.store.get(&sandbox_id).await? {
            Some(existing) if existing.user_id != user_id => {
                return Err(LifecycleError::OwnerMismatch(sandbox_id.0.clone()));
            }
            Some(existing) => {
                tracing::info!(sandbox_id = %sandbox_id, "reusing existing sandbox record");
                existing
            }
            None => {
                self.store
                    .insert(NewSandbox {
                        id: sandbox_id.clone(),
                        user_id: user_id.clone(),
                        store_domain: params.store_domain,
                        access_token: params.access_token,
                        store_password: params.store_password,
                        theme_id: params.theme_id,
                    })
                    .await?
            }
        };

        log_stage(&sandbox_id, LifecycleStage::Allocating);
        let ports = match self.allocator.get_or_allocate(&sandbox_id).await {
            Ok(p) => p,
            Err(e) => return Err(self.fail(&user_id, &sandbox_id, e.into()).await),
        };

        let spec = self.launch_spec(&record, ports);
        if let Err(e) = ensure_dir(&spec.workdir).await {
            return Err(self.fail(&user_id, &sandbox_id, e).await);
        }

        log_stage(&sandbox_id, LifecycleStage::Syncing);
        if let Err(e) = self.sync_theme(&spec).await {
            return Err(self.fail(&user_id, &sandbox_id, e).await);
        }

        self.launch(&spec, record.pid).await
    }

    pub async fn refresh(&self, sandbox_id: &str) -> Result<SandboxUrls, LifecycleError> {
        let sandbox_id = parse_sandbox_id(sandbox_id)?;
        let _guard = self.locks.acquire(&sandbox_id).await;

        let record = self
            .store
            .get(&sandbox_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(sandbox_id.0.clone()))?;

        let closed = self.tunnels.close_tunnel(&record.user_id, &sandbox_id).await;
        tracing::info!(sandbox_id = %sandbox_id, tunnel_closed = closed, "refreshing sandbox");

        // A record that failed before allocation gets its pair now.
        let ports = match record.ports {
            Some(p) => p,
            None => match self.allocator.get_or_allocate(&sandbox_id).await {
                Ok(p) => p,
                Err(e) => return Err(self.fail(&record.user_id, &sandbox_id, e.into()).await),
            },
        };

        let spec = self.launch_spec(&record, ports);
        if let Err(e) = ensure_dir(&spec.workdir).await {
            return Err(self.fail(&record.user_id, &sandbox_id, e).await);
        }
        self.launch(&spec, record.pid).await
    }

    pub async fn delete(&self, sandbox_id: &str) -> Result<TeardownReport, LifecycleError> {
        let sandbox_id = parse_sandbox_id(sandbox_id)?;
        let _guard = self.locks.acquire(&sandbox_id).await;

        let record = self
            .store
            .get(&sandbox_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(sandbox_id.0.clone()))?;

        log_stage(&sandbox_id, LifecycleStage::Deleting);
        let mut report = TeardownReport::default();
        let dir = self.sandbox_dir(&record.user_id, &sandbox_id);

        if let Some(pgid) = record.pid {
            match self.processes.stop_recorded_group(&dir, pgid).await {
                Ok(true) => report.killed_count += 1,
                Ok(false) => {}
                Err(e) => report.failures.push(format!("process group {pgid}: {e}")),
            }
        }

        if let Some(ports) = record.ports {
            for reap in self.processes.reap_ports(ports).await {
                report.killed_count += reap.killed_count();
                report.failures.extend(reap.failures.iter().cloned());
                if let Some(err) = &reap.lookup_error {
                    report.failures.push(format!("port {}: {err}", reap.port));
                }
                report.reaped.push(reap);
            }
        }

        report.tunnel_closed = self.tunnels.close_tunnel(&record.user_id, &sandbox_id).await;

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => report.files_removed = true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(sandbox_id = %sandbox_id, path = %dir.display(), error = %e, "failed to remove sandbox files");
                report.failures.push(format!("remove {}: {e}", dir.display()));
            }
        }
        // Authoritative step; frees the port pair.
        report.record_deleted = self.store.delete(&sandbox_id).await?;

        log_stage(&sandbox_id, LifecycleStage::Deleted);
        tracing::info!(
            sandbox_id = %sandbox_id,
            killed = report.killed_count,
            tunnel_closed = report.tunnel_closed,
            failures = report.failures.len(),
            "sandbox deleted"
        );
        Ok(report)
    }

    pub async fn tail_logs(
        &self,
        sandbox_id: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<LogTail, LifecycleError> {
        let record = self.get(sandbox_id).await?;
        let workdir = self.sandbox_dir(&record.user_id, &record.id);
        let tail = self
            .processes
            .tail_logs(&workdir, cursor, limit)
            .await
            .map_err(|source| LifecycleError::Logs {
                path: workdir.clone(),
                source,
            })?;
        Ok(tail.unwrap_or(LogTail {
            lines: Vec::new(),
            next_cursor: cursor,
        }))
    }

    /// Closes every tunnel. Sandbox processes are left running.
    pub async fn shutdown(&self) -> usize {
        self.tunnels.close_all().await
    }

    fn launch_spec(&self, record: &SandboxRecord, ports: PortPair) -> LaunchSpec {
        LaunchSpec {
            user_id: record.user_id.clone(),
            sandbox_id: record.id.clone(),
            store_domain: record.store_domain.clone(),
            access_token: record.access_token.clone(),
            theme_id: record.theme_id,
            store_password: record.store_password.clone(),
            ports,
            workdir: self.sandbox_dir(&record.user_id, &record.id),
        }
    }

    async fn sync_theme(&self, spec: &LaunchSpec) -> Result<(), LifecycleError> {
        let id = &spec.sandbox_id;
        self.sync.run(SyncDirection::Pull, spec).await?;
        self.store
            .update_status(id, SandboxStatus::ThemePulled, None)
            .await?;
        self.sync.run(SyncDirection::Push, spec).await?;
        self.store
            .update_status(id, SandboxStatus::ThemePushed, None)
            .await?;
        Ok(())
    }

    /// Start, probe, tunnel, persist. Shared by create and refresh.
    async fn launch(
        &self,
        spec: &LaunchSpec,
        previous_pgid: Option<i32>,
    ) -> Result<SandboxUrls, LifecycleError> {
        let id = &spec.sandbox_id;
        let ports = spec.ports;

        log_stage(id, LifecycleStage::Starting);
        self.store
            .update_status(id, SandboxStatus::DevServerStarting, None)
            .await?;

        // PID registry: stop the previous launcher group before reusing its ports.
        if let Some(pgid) = previous_pgid {
            match self.processes.stop_recorded_group(&spec.workdir, pgid).await {
                Ok(stopped) => {
                    if stopped {
                        tracing::info!(sandbox_id = %id, pgid, "stopped previous process group");
                    }
                    if let Err(e) = self.store.set_pid(id, None).await {
                        tracing::warn!(sandbox_id = %id, error = %e, "failed to clear process group");
                    }
                }
                Err(e) => tracing::warn!(sandbox_id = %id, pgid, error = %e, "failed to stop previous process group"),
            }
        }

        let outcome = match self.processes.start(spec).await {
            Ok(o) => o,
            Err(e) => return Err(self.fail(&spec.user_id, id, e.into()).await),
        };
        let mut warnings: Vec<String> = outcome.warning.clone().into_iter().collect();

        if let Err(e) = self.store.set_pid(id, outcome.pgid).await {
            tracing::warn!(sandbox_id = %id, error = %e, "failed to record process group");
        }

        log_stage(id, LifecycleStage::Probing);
        let probe = self
            .prober
            .probe(
                ports.proxy_port,
                self.readiness.max_attempts,
                Duration::from_millis(self.readiness.interval_ms),
            )
            .await;
        if !probe.ready {
            let msg = format!(
                "proxy port {} not accepting connections after {} attempts",
                ports.proxy_port, probe.attempts
            );
            tracing::warn!(sandbox_id = %id, "{msg}");
            warnings.push(msg);
        }

        log_stage(id, LifecycleStage::Tunneling);
        let local_url = format!("http://{}:{}", self.local_host, ports.proxy_port);
        let public_url = match self
            .tunnels
            .create_tunnel(ports.proxy_port, &spec.user_id, id)
            .await
        {
            Ok(url) => Some(url),
            Err(TunnelError::Disabled) => None,
            Err(e) => {
                warnings.push(format!("public tunnel unavailable, using local address: {e}"));
                None
            }
        };
        let preview_url = public_url.clone().unwrap_or_else(|| local_url.clone());

        let urls = StoredUrls {
            preview_url: Some(preview_url.clone()),
            public_url: public_url.clone(),
            local_url: Some(local_url.clone()),
        };
        let persisted = async {
            self.store.set_urls(id, &urls).await?;
            self.store
                .update_status(id, SandboxStatus::Ready, None)
                .await
        }
        .await;
        if let Err(e) = persisted {
            return Err(self.fail(&spec.user_id, id, e.into()).await);
        }

        log_stage(id, LifecycleStage::Ready);
        tracing::info!(sandbox_id = %id, preview_url = %preview_url, "sandbox ready");
        Ok(SandboxUrls {
            sandbox_id: id.0.clone(),
            preview_url,
            public_url,
            local_url,
            ports,
            ready: probe.ready,
            warnings,
        })
    }

    /// Closes any tunnel still published for the sandbox, records `error`
    /// status (both best-effort) and hands the error back.
    async fn fail(&self, user_id: &UserId, id: &SandboxId, err: LifecycleError) -> LifecycleError {
        log_stage(id, LifecycleStage::Error);
        tracing::warn!(sandbox_id = %id, code = err.code(), error = %err, "sandbox operation failed");
        if self.tunnels.close_tunnel(user_id, id).await {
            tracing::info!(sandbox_id = %id, "closed tunnel of failed sandbox");
        }
        if let Err(e) = self
            .store
            .update_status(id, SandboxStatus::Error, Some(err.to_string()))
            .await
        {
            tracing::warn!(sandbox_id = %id, error = %e, "failed to record error status");
        }
        err
    }
}

fn parse_sandbox_id(raw: &str) -> Result<SandboxId, LifecycleError> {
    SandboxId::parse(raw).map_err(|source| LifecycleError::InvalidId {
        field: "sandbox_id",
        source,
    })
}

async fn ensure_dir(path: &Path) -> Result<(), LifecycleError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| LifecycleError::Workdir {
            path: path.to_path_buf(),
            source,
        })
}

fn log_stage(id: &SandboxId, stage: LifecycleStage) {
    tracing::debug!(sandbox_id = %id, stage = stage.as_str(), "lifecycle stage");
}
