//! Fixed-origin LRU cache of hosting contexts.
//!
//! Building a [`HostingContext`] is expensive (config reads, credential
//! lookups, possibly spawning an external process), so the pool amortizes
//! it across requests. Entries live for a fixed window measured from
//! creation; access refreshes the LRU ordering but never the TTL, so a
//! context can never outlive its origin by being popular.

use crate::config::HostingConfig;
use crate::context::HostingContext;
use crate::descriptor::ConnectorKey;
use crate::error::{HostingError, Result};
use crate::traits::ContextFactory;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct PoolEntry {
    context: Arc<HostingContext>,
    created_at: Instant,
    last_access: Mutex<Instant>,
    hits: AtomicU64,
}

impl PoolEntry {
    fn expired(&self, ttl: std::time::Duration) -> bool {
        self.created_at.elapsed() >= ttl
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
        self.hits.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct ServerPool {
    config: HostingConfig,
    factory: Arc<dyn ContextFactory>,
    entries: RwLock<HashMap<ConnectorKey, Arc<PoolEntry>>>,
    /// Serializes context construction so a cache-miss stampede builds
    /// each context once.
    build_lock: AsyncMutex<()>,
    shutdown: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ServerPool {
    #[must_use]
    pub fn new(config: HostingConfig, factory: Arc<dyn ContextFactory>) -> Self {
        Self {
            config,
            factory,
            entries: RwLock::new(HashMap::new()),
            build_lock: AsyncMutex::new(()),
            shutdown: CancellationToken::new(),
            reaper: Mutex::new(None),
        }
    }

    /// Fetch the context for a key, building and caching it on a miss.
    /// The caller's bearer token is stamped onto the context on every
    /// call, hit or miss, so cached contexts always carry the freshest
    /// credential seen.
    ///
    /// # Errors
    ///
    /// `Unavailable` when the factory cannot build a context; the failure
    /// is not cached and the next call retries.
    pub async fn get_or_build(
        &self,
        key: &ConnectorKey,
        bearer: Option<&str>,
    ) -> Result<Arc<HostingContext>> {
        if let Some(entry) = self.live_entry(key) {
            entry.touch();
            entry.context.set_bearer(bearer);
            return Ok(Arc::clone(&entry.context));
        }

        let _guard = self.build_lock.lock().await;
        // Double-check: another task may have built it while we waited.
        if let Some(entry) = self.live_entry(key) {
            entry.touch();
            entry.context.set_bearer(bearer);
            return Ok(Arc::clone(&entry.context));
        }

        tracing::debug!(key = %key, "building hosting context");
        let context = self
            .factory
            .build(&key.tenant_id, &key.connector_id)
            .await
            .map_err(|e| match e {
                HostingError::NotFound(_) => e,
                other => HostingError::Unavailable(format!("{key}: {other}")),
            })?;
        context.set_bearer(bearer);

        let now = Instant::now();
        let entry = Arc::new(PoolEntry {
            context: Arc::clone(&context),
            created_at: now,
            last_access: Mutex::new(now),
            hits: AtomicU64::new(1),
        });

        {
            let mut entries = self.entries.write();
            if entries.len() >= self.config.pool_capacity {
                evict_lru(&mut entries);
            }
            entries.insert(key.clone(), entry);
        }
        Ok(context)
    }

    /// Drop one connector's context. The next request rebuilds it.
    pub fn invalidate(&self, tenant_id: &str, connector_id: &str) {
        let key = ConnectorKey::new(tenant_id, connector_id);
        if self.entries.write().remove(&key).is_some() {
            tracing::info!(key = %key, "pool entry invalidated");
        }
    }

    /// Drop every context belonging to a tenant.
    pub fn invalidate_tenant(&self, tenant_id: &str) {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|k, _| k.tenant_id != tenant_id);
        let dropped = before - entries.len();
        if dropped > 0 {
            tracing::info!(tenant_id, dropped, "tenant pool entries invalidated");
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Start the background sweep that drops expired entries. Idempotent.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let mut slot = self.reaper.lock();
        if slot.is_some() {
            return;
        }
        let pool = Arc::clone(self);
        let ct = self.shutdown.clone();
        let interval = self.config.pool_reap_interval;
        *slot = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = ct.cancelled() => break,
                    _ = tick.tick() => {}
                }
                pool.reap_expired();
            }
        }));
    }

    /// One sweep over the map; also usable directly from tests.
    pub fn reap_expired(&self) {
        let ttl = self.config.pool_ttl;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| !e.expired(ttl));
        let dropped = before - entries.len();
        if dropped > 0 {
            tracing::debug!(dropped, "expired pool entries reaped");
        }
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let reaper = self.reaper.lock().take();
        if let Some(handle) = reaper {
            let _ = handle.await;
        }
        self.entries.write().clear();
    }

    fn live_entry(&self, key: &ConnectorKey) -> Option<Arc<PoolEntry>> {
        let expired = {
            let entries = self.entries.read();
            let entry = entries.get(key)?;
            if !entry.expired(self.config.pool_ttl) {
                return Some(Arc::clone(entry));
            }
            true
        };
        if expired {
            // TTL is measured from creation, so remove eagerly rather than
            // waiting for the reaper.
            self.entries.write().remove(key);
            tracing::debug!(key = %key, "pool entry expired");
        }
        None
    }
}

fn evict_lru(entries: &mut HashMap<ConnectorKey, Arc<PoolEntry>>) {
    let victim = entries
        .iter()
        .min_by_key(|(_, e)| *e.last_access.lock())
        .map(|(k, _)| k.clone());
    if let Some(key) = victim {
        tracing::debug!(key = %key, "evicting least recently used pool entry");
        entries.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingFactory {
        builds: AtomicUsize,
        delay: Duration,
    }

    impl CountingFactory {
        fn new() -> Self {
            Self {
                builds: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl ContextFactory for CountingFactory {
        async fn build(
            &self,
            tenant_id: &str,
            connector_id: &str,
        ) -> Result<Arc<HostingContext>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(Arc::new(HostingContext::new(tenant_id, connector_id, vec![], HashMap::new())))
        }
    }

    struct FailingFactory;

    #[async_trait]
    impl ContextFactory for FailingFactory {
        async fn build(&self, _: &str, _: &str) -> Result<Arc<HostingContext>> {
            Err(HostingError::Spawn("connector exploded".into()))
        }
    }

    fn config(ttl: Duration, capacity: usize) -> HostingConfig {
        HostingConfig {
            pool_ttl: ttl,
            pool_capacity: capacity,
            ..HostingConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hit_reuses_cached_context() {
        let factory = Arc::new(CountingFactory::new());
        let pool = ServerPool::new(config(Duration::from_secs(600), 10), Arc::clone(&factory) as _);
        let key = ConnectorKey::new("t1", "c1");

        let a = pool.get_or_build(&key, None).await.expect("build");
        let b = pool.get_or_build(&key, None).await.expect("hit");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_is_fixed_origin_even_under_access() {
        let factory = Arc::new(CountingFactory::new());
        let pool = ServerPool::new(config(Duration::from_secs(600), 10), Arc::clone(&factory) as _);
        let key = ConnectorKey::new("t1", "c1");

        pool.get_or_build(&key, None).await.expect("build");

        // Keep touching the entry; accesses must not extend its life.
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(100)).await;
            pool.get_or_build(&key, None).await.expect("hit");
        }
        tokio::time::advance(Duration::from_secs(101)).await;
        pool.get_or_build(&key, None).await.expect("rebuild");
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2, "expired at origin + ttl");
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_evicts_least_recently_used() {
        let factory = Arc::new(CountingFactory::new());
        let pool = ServerPool::new(config(Duration::from_secs(600), 2), Arc::clone(&factory) as _);
        let k1 = ConnectorKey::new("t1", "c1");
        let k2 = ConnectorKey::new("t1", "c2");
        let k3 = ConnectorKey::new("t1", "c3");

        pool.get_or_build(&k1, None).await.expect("c1");
        tokio::time::advance(Duration::from_secs(1)).await;
        pool.get_or_build(&k2, None).await.expect("c2");
        tokio::time::advance(Duration::from_secs(1)).await;
        // Touch c1 so c2 becomes the LRU.
        pool.get_or_build(&k1, None).await.expect("c1 again");
        tokio::time::advance(Duration::from_secs(1)).await;
        pool.get_or_build(&k3, None).await.expect("c3");

        assert_eq!(pool.len(), 2);
        assert_eq!(factory.builds.load(Ordering::SeqCst), 3);
        // c2 was evicted: fetching it builds again, and the re-insert at
        // capacity pushes out the new LRU, c1.
        pool.get_or_build(&k2, None).await.expect("c2 rebuild");
        assert_eq!(factory.builds.load(Ordering::SeqCst), 4);
        // c3 survived both evictions.
        pool.get_or_build(&k3, None).await.expect("c3 still cached");
        assert_eq!(factory.builds.load(Ordering::SeqCst), 4);
        // c1 went out with the second eviction.
        pool.get_or_build(&k1, None).await.expect("c1 rebuild");
        assert_eq!(factory.builds.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_build_once() {
        let factory = Arc::new(CountingFactory {
            builds: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
        });
        let pool = Arc::new(ServerPool::new(
            config(Duration::from_secs(600), 10),
            Arc::clone(&factory) as _,
        ));
        let key = ConnectorKey::new("t1", "c1");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let key = key.clone();
                tokio::spawn(async move { pool.get_or_build(&key, None).await })
            })
            .collect();
        for task in tasks {
            task.await.expect("join").expect("build");
        }
        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn build_failure_is_not_cached() {
        let pool = ServerPool::new(config(Duration::from_secs(600), 10), Arc::new(FailingFactory));
        let key = ConnectorKey::new("t1", "c1");

        let err = pool.get_or_build(&key, None).await.expect_err("must fail");
        assert!(matches!(err, HostingError::Unavailable(_)));
        assert!(pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_is_scoped() {
        let factory = Arc::new(CountingFactory::new());
        let pool = ServerPool::new(config(Duration::from_secs(600), 10), Arc::clone(&factory) as _);

        pool.get_or_build(&ConnectorKey::new("t1", "c1"), None).await.expect("build");
        pool.get_or_build(&ConnectorKey::new("t1", "c2"), None).await.expect("build");
        pool.get_or_build(&ConnectorKey::new("t2", "c1"), None).await.expect("build");

        pool.invalidate("t1", "c1");
        assert_eq!(pool.len(), 2);

        pool.invalidate_tenant("t1");
        assert_eq!(pool.len(), 1);
        // t2 untouched.
        pool.get_or_build(&ConnectorKey::new("t2", "c1"), None).await.expect("hit");
        assert_eq!(factory.builds.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reap_drops_only_expired_entries() {
        let factory = Arc::new(CountingFactory::new());
        let pool = ServerPool::new(config(Duration::from_secs(600), 10), factory as _);

        pool.get_or_build(&ConnectorKey::new("t1", "old"), None).await.expect("build");
        tokio::time::advance(Duration::from_secs(500)).await;
        pool.get_or_build(&ConnectorKey::new("t1", "new"), None).await.expect("build");
        tokio::time::advance(Duration::from_secs(101)).await;

        pool.reap_expired();
        assert_eq!(pool.len(), 1);
    }
}
