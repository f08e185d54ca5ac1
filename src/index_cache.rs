//! Bounded LRU of loaded vector indexes.
//!
//! At most `size` tenant indexes are resident at once. A miss loads the
//! blob + sidecar pair from the object store (an empty index if neither
//! exists yet); the least-recently-used entry is evicted to make room,
//! persisting first when dirty.
//!
//! Handles expose a reader-writer lock: queries take shared read access,
//! ingestion takes exclusive write access and marks the handle dirty.
//! Persists coalesce to at most one per `flush_interval` per tenant, plus
//! unconditional persists on eviction and shutdown. A persist failure
//! leaves the handle dirty; queries keep serving the in-memory state and
//! the next flush retries.
//!
//! The cache map lock covers only bookkeeping. Loads run under a
//! per-tenant gate (concurrent acquirers of one tenant share a single
//! load) and eviction persists run with the map lock released, so one
//! tenant's I/O never stalls another tenant's acquire. Each acquire is
//! bounded by a timeout and fails with `DeadlineExceeded` when storage
//! stalls past it.
//!
//! A blob that fails its checksum quarantines the tenant: every acquire
//! returns `Unavailable` until an explicit rebuild clears it. No silent
//! rebuild.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::index::TenantIndex;
use crate::object_store::{index_blob_key, sidecar_key, ObjectStore};

#[derive(Debug)]
pub struct IndexHandle {
    lock: RwLock<TenantIndex>,
    dirty: AtomicBool,
    last_flush: std::sync::Mutex<Option<Instant>>,
}

impl IndexHandle {
    fn new(index: TenantIndex) -> Self {
        Self {
            lock: RwLock::new(index),
            dirty: AtomicBool::new(false),
            last_flush: std::sync::Mutex::new(None),
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, TenantIndex> {
        self.lock.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, TenantIndex> {
        self.lock.write().await
    }

    /// Writers call this after mutating; the flusher clears it.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }
}

struct CacheEntry {
    handle: Arc<IndexHandle>,
    last_used: u64,
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    /// Per-tenant load gates: a miss loads under its own tenant's gate so
    /// concurrent acquirers of one tenant share a single load, while other
    /// tenants proceed untouched.
    loading: HashMap<String, Arc<Mutex<()>>>,
    quarantined: HashSet<String>,
    tick: u64,
}

/// Upper bound on one acquire, covering any wait for a concurrent load of
/// the same tenant plus this call's own load and eviction persists.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct IndexCache {
    store: Arc<dyn ObjectStore>,
    dims: usize,
    capacity: usize,
    flush_interval: Duration,
    inner: Mutex<Inner>,
}

impl IndexCache {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        dims: usize,
        capacity: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            store,
            dims,
            capacity,
            flush_interval,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                loading: HashMap::new(),
                quarantined: HashSet::new(),
                tick: 0,
            }),
        }
    }

    /// Get the tenant's index handle, loading it on a miss. Waits are
    /// bounded: an acquire that cannot complete within the timeout
    /// (e.g. stalled object-store I/O) fails with `DeadlineExceeded`.
    pub async fn acquire(&self, tenant_id: &str) -> Result<Arc<IndexHandle>> {
        tokio::time::timeout(ACQUIRE_TIMEOUT, self.acquire_inner(tenant_id))
            .await
            .map_err(|_| {
                Error::DeadlineExceeded(format!(
                    "index acquire for tenant {} timed out",
                    tenant_id
                ))
            })?
    }

    /// The map lock is held only for short bookkeeping sections; loads and
    /// eviction persists run with it released so one tenant's I/O never
    /// serializes another tenant's acquire.
    async fn acquire_inner(&self, tenant_id: &str) -> Result<Arc<IndexHandle>> {
        let gate = {
            let mut inner = self.inner.lock().await;
            if let Some(handle) = check_resident(&mut inner, tenant_id)? {
                return Ok(handle);
            }
            inner
                .loading
                .entry(tenant_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let _loading = gate.lock().await;

        // A concurrent holder of the gate may have finished the load (or
        // quarantined the tenant) while this caller waited.
        {
            let mut inner = self.inner.lock().await;
            if let Some(handle) = check_resident(&mut inner, tenant_id)? {
                inner.loading.remove(tenant_id);
                return Ok(handle);
            }
        }

        let loaded = self.load(tenant_id).await;

        let mut inner = self.inner.lock().await;
        inner.loading.remove(tenant_id);

        let index = match loaded {
            Ok(index) => index,
            Err(err @ Error::Unavailable(_)) => {
                inner.quarantined.insert(tenant_id.to_string());
                tracing::error!(tenant = tenant_id, "index quarantined: {}", err);
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        // A load racing through a recreated gate may have published first;
        // the resident handle wins and this load's copy is discarded.
        if let Some(handle) = check_resident(&mut inner, tenant_id)? {
            return Ok(handle);
        }

        // Detach LRU victims under the lock; their persists happen after
        // it is released.
        let mut victims = Vec::new();
        while inner.entries.len() >= self.capacity {
            let victim = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else { break };
            if let Some(entry) = inner.entries.remove(&victim) {
                tracing::debug!(tenant = %victim, "evicting index from cache");
                victims.push((victim, entry.handle));
            }
        }

        inner.tick += 1;
        let tick = inner.tick;
        let handle = Arc::new(IndexHandle::new(index));
        inner.entries.insert(
            tenant_id.to_string(),
            CacheEntry {
                handle: handle.clone(),
                last_used: tick,
            },
        );
        drop(inner);

        for (victim, victim_handle) in victims {
            self.persist_if_dirty(&victim, &victim_handle).await;
        }

        Ok(handle)
    }

    async fn load(&self, tenant_id: &str) -> Result<TenantIndex> {
        let blob = self.store.get(&index_blob_key(tenant_id)).await?;
        let sidecar = self.store.get(&sidecar_key(tenant_id)).await?;

        match (blob, sidecar) {
            (None, None) => Ok(TenantIndex::new(self.dims)),
            (Some(blob), Some(sidecar)) => TenantIndex::decode(&blob, &sidecar),
            // The pair is written blob-first; a lone artifact means a torn
            // publish that the atomic rename should have prevented.
            _ => Err(Error::Unavailable(format!(
                "index artifacts for tenant {} are incomplete",
                tenant_id
            ))),
        }
    }

    /// Persist if dirty and the per-tenant interval has elapsed. Called by
    /// writers after releasing their write guard.
    pub async fn maybe_flush(&self, tenant_id: &str, handle: &IndexHandle) {
        let due = {
            let last = handle.last_flush.lock().unwrap();
            match *last {
                Some(at) => at.elapsed() >= self.flush_interval,
                None => true,
            }
        };
        if due {
            self.persist_if_dirty(tenant_id, handle).await;
        }
    }

    async fn persist_if_dirty(&self, tenant_id: &str, handle: &IndexHandle) {
        if !handle.is_dirty() {
            return;
        }
        let (blob, sidecar) = {
            let index = handle.read().await;
            index.encode()
        };
        // Blob first, sidecar second: readers treat a missing sidecar as a
        // torn publish and refuse the pair.
        let result = async {
            self.store.put(&index_blob_key(tenant_id), &blob).await?;
            self.store.put(&sidecar_key(tenant_id), &sidecar).await
        }
        .await;

        match result {
            Ok(()) => {
                handle.dirty.store(false, Ordering::SeqCst);
                *handle.last_flush.lock().unwrap() = Some(Instant::now());
                tracing::debug!(tenant = tenant_id, "index persisted");
            }
            Err(err) => {
                // Stay dirty; queries continue on the in-memory state and
                // a later flush retries.
                tracing::warn!(tenant = tenant_id, "index persist failed: {}", err);
            }
        }
    }

    /// Persist every dirty resident index. Used at shutdown.
    pub async fn flush_all(&self) {
        let entries: Vec<(String, Arc<IndexHandle>)> = {
            let inner = self.inner.lock().await;
            inner
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.handle.clone()))
                .collect()
        };
        for (tenant_id, handle) in entries {
            self.persist_if_dirty(&tenant_id, &handle).await;
        }
    }

    /// Drop the tenant's resident index and clear any quarantine. The next
    /// acquire reloads from the object store.
    pub async fn invalidate(&self, tenant_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.entries.remove(tenant_id);
        inner.quarantined.remove(tenant_id);
    }

    pub async fn is_quarantined(&self, tenant_id: &str) -> bool {
        self.inner.lock().await.quarantined.contains(tenant_id)
    }
}

/// Short bookkeeping step shared by the fast path and the post-gate
/// re-check: refuse quarantined tenants, bump recency on a hit.
fn check_resident(inner: &mut Inner, tenant_id: &str) -> Result<Option<Arc<IndexHandle>>> {
    if inner.quarantined.contains(tenant_id) {
        return Err(Error::Unavailable(format!(
            "index for tenant {} is quarantined",
            tenant_id
        )));
    }
    inner.tick += 1;
    let tick = inner.tick;
    if let Some(entry) = inner.entries.get_mut(tenant_id) {
        entry.last_used = tick;
        return Ok(Some(entry.handle.clone()));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::LocalStore;
    use tempfile::TempDir;

    fn cache(root: &std::path::Path, capacity: usize) -> IndexCache {
        let store = Arc::new(LocalStore::new(root.to_path_buf()));
        IndexCache::new(store, 4, capacity, Duration::from_secs(0))
    }

    async fn put_vector(cache: &IndexCache, tenant: &str, axis: usize) {
        let handle = cache.acquire(tenant).await.unwrap();
        {
            let mut index = handle.write().await;
            let mut v = vec![0.0f32; 4];
            v[axis] = 1.0;
            index.upsert(&[format!("c{}", axis)], &[v]).unwrap();
        }
        handle.mark_dirty();
        cache.maybe_flush(tenant, &handle).await;
    }

    #[tokio::test]
    async fn miss_creates_empty_index() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(tmp.path(), 4);
        let handle = cache.acquire("t1").await.unwrap();
        assert!(handle.read().await.is_empty());
    }

    #[tokio::test]
    async fn eviction_persists_dirty_index() {
        let tmp = TempDir::new().unwrap();
        // Interval long enough that only eviction persists.
        let store = Arc::new(LocalStore::new(tmp.path().to_path_buf()));
        let cache = IndexCache::new(store.clone(), 4, 1, Duration::from_secs(3600));

        let handle = cache.acquire("t1").await.unwrap();
        {
            let mut index = handle.write().await;
            index.upsert(&["c0".to_string()], &[vec![1.0, 0.0, 0.0, 0.0]]).unwrap();
        }
        handle.mark_dirty();

        // Acquiring a second tenant evicts t1 and persists it.
        cache.acquire("t2").await.unwrap();
        assert!(store.get(&index_blob_key("t1")).await.unwrap().is_some());
        assert!(store.get(&sidecar_key("t1")).await.unwrap().is_some());

        // Reload round-trips.
        let reloaded = cache.acquire("t1").await.unwrap();
        assert_eq!(reloaded.read().await.live_len(), 1);
    }

    #[tokio::test]
    async fn capacity_is_bounded() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(tmp.path(), 2);
        for tenant in ["a", "b", "c", "d"] {
            put_vector(&cache, tenant, 0).await;
        }
        let inner = cache.inner.lock().await;
        assert!(inner.entries.len() <= 2);
    }

    #[tokio::test]
    async fn corrupt_blob_quarantines_tenant() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(tmp.path().to_path_buf()));
        let cache = IndexCache::new(store.clone(), 4, 4, Duration::from_secs(0));

        put_vector(&cache, "t1", 0).await;
        cache.invalidate("t1").await;

        // Corrupt the persisted blob.
        let mut blob = store.get(&index_blob_key("t1")).await.unwrap().unwrap();
        let mid = blob.len() / 2;
        blob[mid] ^= 0xff;
        store.put(&index_blob_key("t1"), &blob).await.unwrap();

        let err = cache.acquire("t1").await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert!(cache.is_quarantined("t1").await);

        // Still quarantined on the next acquire; no silent rebuild.
        assert!(cache.acquire("t1").await.is_err());
    }

    #[tokio::test]
    async fn concurrent_acquires_share_one_handle() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(cache(tmp.path(), 4));

        let a = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.acquire("t1").await.unwrap() })
        };
        let b = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.acquire("t1").await.unwrap() })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(Arc::ptr_eq(&a, &b), "both callers see the same handle");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_storage_times_out_with_deadline_exceeded() {
        use async_trait::async_trait;

        struct StallStore;

        #[async_trait]
        impl crate::object_store::ObjectStore for StallStore {
            async fn get(&self, _key: &str) -> crate::error::Result<Option<Vec<u8>>> {
                std::future::pending::<()>().await;
                unreachable!()
            }
            async fn put(&self, _key: &str, _bytes: &[u8]) -> crate::error::Result<()> {
                Ok(())
            }
            async fn delete(&self, _key: &str) -> crate::error::Result<()> {
                Ok(())
            }
        }

        let cache = IndexCache::new(Arc::new(StallStore), 4, 4, Duration::from_secs(0));
        let err = cache.acquire("t1").await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded(_)));
    }

    #[tokio::test]
    async fn invalidate_clears_quarantine() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(tmp.path().to_path_buf()));
        let cache = IndexCache::new(store.clone(), 4, 4, Duration::from_secs(0));

        put_vector(&cache, "t1", 0).await;
        cache.invalidate("t1").await;
        let mut blob = store.get(&index_blob_key("t1")).await.unwrap().unwrap();
        blob[10] ^= 0xff;
        store.put(&index_blob_key("t1"), &blob).await.unwrap();
        assert!(cache.acquire("t1").await.is_err());

        // A rebuild path rewrites the artifacts and invalidates.
        store.delete(&index_blob_key("t1")).await.unwrap();
        store.delete(&sidecar_key("t1")).await.unwrap();
        cache.invalidate("t1").await;
        assert!(cache.acquire("t1").await.is_ok());
    }
}
