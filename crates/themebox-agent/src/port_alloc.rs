use std::{collections::HashSet, sync::Arc};

use themebox_process::{PortPair, SandboxId};
use tokio::sync::Mutex;

use crate::config::PortPoolConfig;
use crate::store::{PortAssignment, SandboxStore, StoreError};

const MAX_ASSIGN_ATTEMPTS: u32 = 5;

/// Two equal-length, disjoint port ranges paired by offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPool {
    app_base: u16,
    proxy_base: u16,
    size: u16,
}

impl PortPool {
    pub fn new(cfg: PortPoolConfig) -> Self {
        Self {
            app_base: cfg.app_base,
            proxy_base: cfg.proxy_base,
            size: cfg.size,
        }
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn pair_at(&self, offset: u16) -> Option<PortPair> {
        if offset >= self.size {
            return None;
        }
        Some(PortPair {
            app_port: self.app_base.checked_add(offset)?,
            proxy_port: self.proxy_base.checked_add(offset)?,
        })
    }

    /// Offset of `pair` if both ports sit at the same slot of this pool.
    pub fn offset_of(&self, pair: PortPair) -> Option<u16> {
        let app = pair.app_port.checked_sub(self.app_base)?;
        let proxy = pair.proxy_port.checked_sub(self.proxy_base)?;
        (app == proxy && app < self.size).then_some(app)
    }

    /// Lowest offset whose app AND proxy port are both untaken.
    pub fn first_free(&self, taken: &[PortAssignment]) -> Option<PortPair> {
        let app_taken: HashSet<u16> = taken.iter().map(|a| a.ports.app_port).collect();
        let proxy_taken: HashSet<u16> = taken.iter().map(|a| a.ports.proxy_port).collect();

        (0..self.size)
            .filter_map(|offset| self.pair_at(offset))
            .find(|p| !app_taken.contains(&p.app_port) && !proxy_taken.contains(&p.proxy_port))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("port pool exhausted: all {size} slots are in use")]
    PoolExhausted { size: u16 },
    #[error("sandbox not found: {0}")]
    UnknownSandbox(String),
    #[error("port assignment kept conflicting after {attempts} attempts")]
    Contended { attempts: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AllocError {
    /// Capacity problems clear up as sandboxes are deleted; retry later.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            AllocError::PoolExhausted { .. } | AllocError::Contended { .. }
        )
    }
}

/// Hands out port pairs, using the sandbox store as the only source of truth.
///
/// Scan-and-assign runs under an in-process lock; writers in other processes
/// are caught by the store's unique port indexes and the scan is retried.
pub struct PortAllocator {
    store: Arc<dyn SandboxStore>,
    pool: PortPool,
    lock: Mutex<()>,
}

impl PortAllocator {
    pub fn new(store: Arc<dyn SandboxStore>, pool: PortPool) -> Self {
        Self {
            store,
            pool,
            lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> PortPool {
        self.pool
    }

    pub async fn find_available_pair(&self) -> Result<Option<PortPair>, StoreError> {
        let taken = self.store.list_port_assignments().await?;
        Ok(self.pool.first_free(&taken))
    }

    /// Returns the sandbox's persisted pair, allocating and persisting one if
    /// it has none. Repeated calls return the same pair.
    pub async fn get_or_allocate(&self, sandbox_id: &SandboxId) -> Result<PortPair, AllocError> {
        if let Some(ports) = self.existing(sandbox_id).await? {
            return Ok(ports);
        }

        let _guard = self.lock.lock().await;
        for attempt in 1..=MAX_ASSIGN_ATTEMPTS {
            // Re-read under the lock: a concurrent call may have assigned it.
            if let Some(ports) = self.existing(sandbox_id).await? {
                return Ok(ports);
            }

            let Some(pair) = self.find_available_pair().await? else {
                tracing::warn!(sandbox_id = %sandbox_id, size = self.pool.size, "port pool exhausted");
                return Err(AllocError::PoolExhausted {
                    size: self.pool.size,
                });
            };

            match self.store.assign_ports_if_unset(sandbox_id, pair).await {
                Ok(true) => {
                    tracing::info!(
                        sandbox_id = %sandbox_id,
                        app_port = pair.app_port,
                        proxy_port = pair.proxy_port,
                        "allocated port pair"
                    );
                    return Ok(pair);
                }
                Ok(false) => continue,
                Err(StoreError::Conflict(msg)) => {
                    tracing::warn!(
                        sandbox_id = %sandbox_id,
                        attempt,
                        app_port = pair.app_port,
                        error = %msg,
                        "port pair taken by a concurrent writer; rescanning"
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AllocError::Contended {
            attempts: MAX_ASSIGN_ATTEMPTS,
        })
    }

    async fn existing(&self, sandbox_id: &SandboxId) -> Result<Option<PortPair>, AllocError> {
        let record = self
            .store
            .get(sandbox_id)
            .await?
            .ok_or_else(|| AllocError::UnknownSandbox(sandbox_id.to_string()))?;
        Ok(record.ports)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use themebox_process::SandboxStatus;

    use super::*;
    use crate::store::tests::{memory_store, new_sandbox};
    use crate::store::{DbSandboxStore, NewSandbox, SandboxRecord, StoredUrls};

    fn pool(size: u16) -> PortPool {
        PortPool::new(PortPoolConfig {
            app_base: 3100,
            proxy_base: 4100,
            size,
        })
    }

    async fn allocator_with(size: u16, ids: &[&str]) -> (Arc<DbSandboxStore>, PortAllocator) {
        let store = Arc::new(memory_store().await);
        for id in ids {
            store.insert(new_sandbox(id)).await.unwrap();
        }
        let alloc = PortAllocator::new(store.clone(), pool(size));
        (store, alloc)
    }

    #[test]
    fn first_free_needs_both_ports_free_at_the_same_offset() {
        let p = pool(3);
        // Offset 0 app port and offset 1 proxy port are held by odd rows.
        let taken = vec![
            PortAssignment {
                sandbox_id: SandboxId("x".into()),
                ports: PortPair {
                    app_port: 3100,
                    proxy_port: 4150,
                },
            },
            PortAssignment {
                sandbox_id: SandboxId("y".into()),
                ports: PortPair {
                    app_port: 3150,
                    proxy_port: 4101,
                },
            },
        ];
        let got = p.first_free(&taken).unwrap();
        assert_eq!(
            got,
            PortPair {
                app_port: 3102,
                proxy_port: 4102
            }
        );
        assert_eq!(p.offset_of(got), Some(2));
        assert_eq!(
            p.offset_of(PortPair {
                app_port: 3100,
                proxy_port: 4101
            }),
            None
        );
    }

    #[tokio::test]
    async fn allocates_lowest_slots_then_reports_exhaustion() {
        let (_store, alloc) = allocator_with(2, &["a", "b", "c"]).await;

        let first = alloc.find_available_pair().await.unwrap().unwrap();
        assert_eq!(alloc.pool().offset_of(first), Some(0));

        let a = alloc.get_or_allocate(&SandboxId("a".into())).await.unwrap();
        assert_eq!(a, first);
        let b = alloc.get_or_allocate(&SandboxId("b".into())).await.unwrap();
        assert_eq!(alloc.pool().offset_of(b), Some(1));

        assert!(alloc.find_available_pair().await.unwrap().is_none());
        let err = alloc
            .get_or_allocate(&SandboxId("c".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, AllocError::PoolExhausted { size: 2 }));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn get_or_allocate_is_idempotent() {
        let (_store, alloc) = allocator_with(5, &["a"]).await;
        let id = SandboxId("a".into());
        let first = alloc.get_or_allocate(&id).await.unwrap();
        let second = alloc.get_or_allocate(&id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn deleted_sandbox_frees_its_slot_for_reuse() {
        let (store, alloc) = allocator_with(3, &["a", "b"]).await;
        let a = alloc.get_or_allocate(&SandboxId("a".into())).await.unwrap();
        alloc.get_or_allocate(&SandboxId("b".into())).await.unwrap();

        store.delete(&SandboxId("a".into())).await.unwrap();
        store.insert(new_sandbox("c")).await.unwrap();
        let c = alloc.get_or_allocate(&SandboxId("c".into())).await.unwrap();
        assert_eq!(c, a);
    }

    #[tokio::test]
    async fn unknown_sandbox_is_rejected() {
        let (_store, alloc) = allocator_with(3, &[]).await;
        let err = alloc
            .get_or_allocate(&SandboxId("ghost".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, AllocError::UnknownSandbox(_)));
    }

    #[tokio::test]
    async fn concurrent_allocations_never_share_a_port() {
        let ids: Vec<String> = (0..12).map(|i| format!("sb-{i}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let (_store, alloc) = allocator_with(20, &refs).await;
        let alloc = Arc::new(alloc);

        let mut tasks = Vec::new();
        for id in &ids {
            let alloc = alloc.clone();
            let id = SandboxId(id.clone());
            tasks.push(tokio::spawn(async move {
                alloc.get_or_allocate(&id).await.unwrap()
            }));
        }

        let mut app = HashSet::new();
        let mut proxy = HashSet::new();
        for t in tasks {
            let pair = t.await.unwrap();
            assert!(app.insert(pair.app_port));
            assert!(proxy.insert(pair.proxy_port));
            assert!(alloc.pool().offset_of(pair).is_some());
        }
    }

    /// Steals the first pair the allocator tries to write, the way another
    /// control process racing on the same database would.
    struct RacingStore {
        inner: DbSandboxStore,
        raced: AtomicBool,
    }

    #[async_trait]
    impl SandboxStore for RacingStore {
        async fn insert(&self, new: NewSandbox) -> Result<SandboxRecord, StoreError> {
            self.inner.insert(new).await
        }
        async fn get(&self, id: &SandboxId) -> Result<Option<SandboxRecord>, StoreError> {
            self.inner.get(id).await
        }
        async fn list_port_assignments(&self) -> Result<Vec<PortAssignment>, StoreError> {
            self.inner.list_port_assignments().await
        }
        async fn assign_ports_if_unset(
            &self,
            id: &SandboxId,
            ports: PortPair,
        ) -> Result<bool, StoreError> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                self.inner
                    .assign_ports_if_unset(&SandboxId("intruder".into()), ports)
                    .await?;
            }
            self.inner.assign_ports_if_unset(id, ports).await
        }
        async fn update_status(
            &self,
            id: &SandboxId,
            status: SandboxStatus,
            message: Option<String>,
        ) -> Result<(), StoreError> {
            self.inner.update_status(id, status, message).await
        }
        async fn set_urls(&self, id: &SandboxId, urls: &StoredUrls) -> Result<(), StoreError> {
            self.inner.set_urls(id, urls).await
        }
        async fn set_pid(&self, id: &SandboxId, pid: Option<i32>) -> Result<(), StoreError> {
            self.inner.set_pid(id, pid).await
        }
        async fn delete(&self, id: &SandboxId) -> Result<bool, StoreError> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn conflicting_writer_triggers_rescan() {
        let inner = memory_store().await;
        inner.insert(new_sandbox("intruder")).await.unwrap();
        inner.insert(new_sandbox("mine")).await.unwrap();
        let store = Arc::new(RacingStore {
            inner,
            raced: AtomicBool::new(false),
        });
        let alloc = PortAllocator::new(store.clone(), pool(4));

        let mine = alloc
            .get_or_allocate(&SandboxId("mine".into()))
            .await
            .unwrap();
        assert_eq!(alloc.pool().offset_of(mine), Some(1));

        let intruder = store
            .get(&SandboxId("intruder".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(intruder.ports.and_then(|p| alloc.pool().offset_of(p)), Some(0));
    }
}
