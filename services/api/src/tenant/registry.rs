use std::{collections::HashMap, future::Future, ops::Deref, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;

use super::{
    retry::{self, Retryable, RetryPolicy},
    SchemaName,
};
use crate::{
    config::RegistryConfig,
    store::{SchemaBackend, StoreError, TenantClient},
};

/// A tenant client handed out by the registry. While any clone is alive the
/// registry will not close or evict the underlying connections.
#[derive(Clone)]
pub struct ScopedClient {
    schema: SchemaName,
    inner: Arc<dyn TenantClient>,
}

impl ScopedClient {
    pub fn schema(&self) -> &SchemaName {
        &self.schema
    }
}

impl std::fmt::Debug for ScopedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedClient")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl Deref for ScopedClient {
    type Target = dyn TenantClient;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

struct Entry {
    client: Arc<dyn TenantClient>,
    last_used: Instant,
}

impl Entry {
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.client) > 1
    }
}

enum Lookup {
    Hit(ScopedClient),
    Full,
    /// Not cached; carries the invalidation generation observed.
    Miss(u64),
}

enum Slot {
    Ready(ScopedClient),
    Full,
    /// The tenant was invalidated while its client was being opened.
    Stale,
}

#[derive(Default)]
struct Cache {
    entries: HashMap<SchemaName, Entry>,
    generations: HashMap<SchemaName, u64>,
}

impl Cache {
    fn generation(&self, schema: &SchemaName) -> u64 {
        self.generations.get(schema).copied().unwrap_or(0)
    }
}

/// Keyed cache of per-tenant clients with LRU capacity eviction, idle
/// eviction and explicit invalidation. Keys are schema names and nothing
/// else, so a handle can never be served to another tenant.
pub struct ClientRegistry {
    backend: Arc<dyn SchemaBackend>,
    cache: Mutex<Cache>,
    capacity: usize,
    idle_ttl: Duration,
    retry: RetryPolicy,
}

impl ClientRegistry {
    pub fn new(backend: Arc<dyn SchemaBackend>, config: &RegistryConfig) -> Self {
        Self {
            backend,
            cache: Mutex::new(Cache::default()),
            capacity: config.capacity.max(1),
            idle_ttl: config.idle_ttl,
            retry: config.retry,
        }
    }

    pub fn backend(&self) -> &Arc<dyn SchemaBackend> {
        &self.backend
    }

    /// Returns the client for `schema`, opening it on first use and retrying
    /// with backoff while connections are exhausted.
    pub async fn acquire(&self, schema: &SchemaName) -> Result<ScopedClient, StoreError> {
        retry::with_backoff(&self.retry, move || self.acquire_once(schema)).await
    }

    /// Runs `op` against the tenant's client. The whole operation is retried
    /// when it fails because connections ran out, so `op` must be safe to
    /// repeat. Multi-step writes should [`acquire`](Self::acquire) instead.
    pub async fn with_client<T, E, F, Fut>(&self, schema: &SchemaName, op: F) -> Result<T, E>
    where
        E: From<StoreError> + Retryable,
        F: Fn(ScopedClient) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let op = &op;
        retry::with_backoff(&self.retry, move || async move {
            let client = self.acquire_once(schema).await?;
            op(client).await
        })
        .await
    }

    async fn acquire_once(&self, schema: &SchemaName) -> Result<ScopedClient, StoreError> {
        loop {
            let generation = match self.lookup(schema) {
                Lookup::Hit(client) => return Ok(client),
                Lookup::Full => return Err(StoreError::Exhausted),
                Lookup::Miss(generation) => generation,
            };

            let opened = self.backend.open(schema).await?;
            let (slot, evicted, discarded) = self.install(schema, opened, generation);
            if let Some(stale) = evicted {
                tracing::debug!(tenant = %stale.schema(), "evicted least recently used tenant client");
                stale.close().await;
            }
            if let Some(loser) = discarded {
                loser.close().await;
            }
            match slot {
                Slot::Ready(client) => {
                    tracing::debug!(tenant = %schema, "opened tenant client");
                    return Ok(client);
                }
                Slot::Full => return Err(StoreError::Exhausted),
                // reopening re-checks that the tenant is still active
                Slot::Stale => {
                    tracing::debug!(tenant = %schema, "tenant invalidated while opening, reopening");
                }
            }
        }
    }

    /// Fast path: a cached client, or `Full` when opening another one could
    /// not succeed right now.
    fn lookup(&self, schema: &SchemaName) -> Lookup {
        let mut cache = self.cache.lock();
        let generation = cache.generation(schema);
        if let Some(entry) = cache.entries.get_mut(schema) {
            entry.last_used = Instant::now();
            return Lookup::Hit(ScopedClient {
                schema: schema.clone(),
                inner: entry.client.clone(),
            });
        }
        if cache.entries.len() >= self.capacity && cache.entries.values().all(Entry::in_use) {
            return Lookup::Full;
        }
        Lookup::Miss(generation)
    }

    #[allow(clippy::type_complexity)]
    fn install(
        &self,
        schema: &SchemaName,
        opened: Arc<dyn TenantClient>,
        generation: u64,
    ) -> (Slot, Option<Arc<dyn TenantClient>>, Option<Arc<dyn TenantClient>>) {
        let mut cache = self.cache.lock();
        if cache.generation(schema) != generation {
            return (Slot::Stale, None, Some(opened));
        }
        let entries = &mut cache.entries;
        let now = Instant::now();

        if let Some(existing) = entries.get_mut(schema) {
            // another request opened the same tenant first
            existing.last_used = now;
            let client = ScopedClient {
                schema: schema.clone(),
                inner: existing.client.clone(),
            };
            return (Slot::Ready(client), None, Some(opened));
        }

        let mut evicted = None;
        if entries.len() >= self.capacity {
            let victim = entries
                .iter()
                .filter(|(_, entry)| !entry.in_use())
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            match victim.and_then(|key| entries.remove(&key)) {
                Some(entry) => evicted = Some(entry.client),
                None => return (Slot::Full, None, Some(opened)),
            }
        }

        entries.insert(
            schema.clone(),
            Entry {
                client: opened.clone(),
                last_used: now,
            },
        );
        let client = ScopedClient {
            schema: schema.clone(),
            inner: opened,
        };
        (Slot::Ready(client), evicted, None)
    }

    /// Closes clients idle for longer than the configured TTL. Clients still
    /// held by a request are left alone. Returns how many were evicted.
    pub async fn evict_idle(&self) -> usize {
        let expired: Vec<Arc<dyn TenantClient>> = {
            let mut cache = self.cache.lock();
            let entries = &mut cache.entries;
            let now = Instant::now();
            let stale: Vec<SchemaName> = entries
                .iter()
                .filter(|(_, entry)| {
                    !entry.in_use() && now.duration_since(entry.last_used) >= self.idle_ttl
                })
                .map(|(key, _)| key.clone())
                .collect();
            stale
                .iter()
                .filter_map(|key| entries.remove(key))
                .map(|entry| entry.client)
                .collect()
        };

        let count = expired.len();
        for client in expired {
            tracing::debug!(tenant = %client.schema(), "closing idle tenant client");
            client.close().await;
        }
        count
    }

    /// Forgets the tenant's client, typically after deprovisioning. Requests
    /// already holding it finish with their handle; new ones reopen. Opens
    /// already in flight are discarded instead of cached.
    pub async fn invalidate(&self, schema: &SchemaName) -> bool {
        let removed = {
            let mut cache = self.cache.lock();
            *cache.generations.entry(schema.clone()).or_default() += 1;
            cache.entries.remove(schema)
        };
        match removed {
            Some(entry) => {
                if !entry.in_use() {
                    entry.client.close().await;
                }
                tracing::info!(tenant = %schema, "invalidated tenant client");
                true
            }
            None => false,
        }
    }

    pub async fn shutdown(&self) {
        let drained: Vec<Entry> = self
            .cache
            .lock()
            .entries
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in drained {
            entry.client.close().await;
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, schema: &SchemaName) -> bool {
        self.cache.lock().entries.contains_key(schema)
    }
}

/// Periodically evicts idle tenant clients until the registry is dropped.
pub fn spawn_idle_sweeper(registry: Arc<ClientRegistry>, every: Duration) -> tokio::task::JoinHandle<()> {
    let registry = Arc::downgrade(&registry);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(registry) = registry.upgrade() else {
                break;
            };
            let evicted = registry.evict_idle().await;
            if evicted > 0 {
                tracing::info!(evicted, remaining = registry.len(), "idle tenant clients evicted");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryBackend;
    use async_trait::async_trait;
    use models::Complex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    /// Holds the next `open` after the tenant passed its liveness check,
    /// until the test releases it.
    struct Gated {
        inner: Arc<MemoryBackend>,
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl Gated {
        fn new(inner: Arc<MemoryBackend>) -> Arc<Self> {
            Arc::new(Self {
                inner,
                armed: AtomicBool::new(true),
                entered: Notify::new(),
                release: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl SchemaBackend for Gated {
        async fn open(&self, schema: &SchemaName) -> Result<Arc<dyn TenantClient>, StoreError> {
            let client = self.inner.open(schema).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(client)
        }

        async fn provision(&self, name: &str, schema: &SchemaName) -> Result<Complex, StoreError> {
            self.inner.provision(name, schema).await
        }

        async fn deactivate(&self, schema: &SchemaName) -> Result<(), StoreError> {
            self.inner.deactivate(schema).await
        }
    }

    fn schema(name: &str) -> SchemaName {
        SchemaName::parse(name).unwrap()
    }

    fn config(capacity: usize, idle_ttl: Duration) -> RegistryConfig {
        RegistryConfig {
            capacity,
            idle_ttl,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..RegistryConfig::default()
        }
    }

    async fn backend_with(tenants: &[&str]) -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        for tenant in tenants {
            backend.provision(tenant, &schema(tenant)).await.unwrap();
        }
        backend
    }

    #[tokio::test]
    async fn clients_are_cached_per_tenant() {
        let backend = backend_with(&["tenant_a", "tenant_b"]).await;
        let registry = ClientRegistry::new(backend.clone(), &config(4, Duration::from_secs(60)));

        let a1 = registry.acquire(&schema("tenant_a")).await.unwrap();
        let a2 = registry.acquire(&schema("tenant_a")).await.unwrap();
        let b = registry.acquire(&schema("tenant_b")).await.unwrap();

        assert_eq!(a1.schema().as_str(), "tenant_a");
        assert_eq!(a2.schema(), a1.schema());
        assert_eq!(b.schema().as_str(), "tenant_b");
        assert_eq!(backend.open_count(), 2);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn unknown_tenant_leaves_registry_untouched() {
        let backend = backend_with(&["tenant_a"]).await;
        let registry = ClientRegistry::new(backend, &config(4, Duration::from_secs(60)));
        registry.acquire(&schema("tenant_a")).await.unwrap();

        let err = registry.acquire(&schema("tenant_x")).await.err().unwrap();
        assert!(matches!(err, StoreError::TenantNotFound(_)));
        assert_eq!(registry.len(), 1);
        assert!(!registry.contains(&schema("tenant_x")));
    }

    #[tokio::test]
    async fn full_registry_evicts_least_recently_used_idle_client() {
        let backend = backend_with(&["tenant_a", "tenant_b", "tenant_c"]).await;
        let registry = ClientRegistry::new(backend, &config(2, Duration::from_secs(60)));

        drop(registry.acquire(&schema("tenant_a")).await.unwrap());
        let held_b = registry.acquire(&schema("tenant_b")).await.unwrap();
        drop(registry.acquire(&schema("tenant_c")).await.unwrap());

        assert!(!registry.contains(&schema("tenant_a")));
        assert!(registry.contains(&schema("tenant_b")));
        assert!(registry.contains(&schema("tenant_c")));
        drop(held_b);
    }

    #[tokio::test]
    async fn clients_in_use_are_never_evicted() {
        let backend = backend_with(&["tenant_a", "tenant_b"]).await;
        let registry = ClientRegistry::new(backend, &config(1, Duration::from_secs(60)));

        let held = registry.acquire(&schema("tenant_a")).await.unwrap();
        let err = registry.acquire(&schema("tenant_b")).await.err().unwrap();
        assert!(matches!(err, StoreError::Exhausted));
        assert!(registry.contains(&schema("tenant_a")));

        drop(held);
        registry.acquire(&schema("tenant_b")).await.unwrap();
        assert!(!registry.contains(&schema("tenant_a")));
    }

    #[tokio::test]
    async fn exhausted_backend_is_retried_before_giving_up() {
        let backend = backend_with(&["tenant_a"]).await;
        let registry = ClientRegistry::new(backend.clone(), &config(4, Duration::from_secs(60)));

        backend.exhaust_next_opens(2);
        registry.acquire(&schema("tenant_a")).await.unwrap();

        registry.invalidate(&schema("tenant_a")).await;
        backend.exhaust_next_opens(3);
        let err = registry.acquire(&schema("tenant_a")).await.err().unwrap();
        assert!(matches!(err, StoreError::Exhausted));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn idle_clients_are_swept() {
        let backend = backend_with(&["tenant_a", "tenant_b"]).await;
        let registry = ClientRegistry::new(backend, &config(4, Duration::ZERO));

        drop(registry.acquire(&schema("tenant_a")).await.unwrap());
        let held = registry.acquire(&schema("tenant_b")).await.unwrap();

        assert_eq!(registry.evict_idle().await, 1);
        assert!(registry.contains(&schema("tenant_b")));
        drop(held);
        assert_eq!(registry.evict_idle().await, 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn deactivated_tenant_cannot_be_reacquired_after_invalidation() {
        let backend = backend_with(&["tenant_a"]).await;
        let registry = ClientRegistry::new(backend.clone(), &config(4, Duration::from_secs(60)));
        registry.acquire(&schema("tenant_a")).await.unwrap();

        backend.deactivate(&schema("tenant_a")).await.unwrap();
        assert!(registry.invalidate(&schema("tenant_a")).await);

        let err = registry.acquire(&schema("tenant_a")).await.err().unwrap();
        assert!(matches!(err, StoreError::TenantNotFound(_)));
    }

    #[tokio::test]
    async fn open_racing_an_invalidation_is_not_cached() {
        let memory = backend_with(&["tenant_a"]).await;
        let gated = Gated::new(memory.clone());
        let registry = Arc::new(ClientRegistry::new(gated.clone(), &config(4, Duration::from_secs(60))));

        let in_flight = tokio::spawn({
            let registry = registry.clone();
            async move { registry.acquire(&schema("tenant_a")).await.map(|_| ()) }
        });
        gated.entered.notified().await;

        memory.deactivate(&schema("tenant_a")).await.unwrap();
        registry.invalidate(&schema("tenant_a")).await;
        gated.release.notify_one();

        let err = in_flight.await.unwrap().unwrap_err();
        assert!(matches!(err, StoreError::TenantNotFound(_)));
        assert!(!registry.contains(&schema("tenant_a")));
        assert_eq!(memory.close_count(), 1);

        let err = registry.acquire(&schema("tenant_a")).await.err().unwrap();
        assert!(matches!(err, StoreError::TenantNotFound(_)));
    }

    #[tokio::test]
    async fn invalidation_without_deactivation_reopens_the_tenant() {
        let memory = backend_with(&["tenant_a"]).await;
        let gated = Gated::new(memory.clone());
        let registry = Arc::new(ClientRegistry::new(gated.clone(), &config(4, Duration::from_secs(60))));

        let in_flight = tokio::spawn({
            let registry = registry.clone();
            async move { registry.acquire(&schema("tenant_a")).await.map(|_| ()) }
        });
        gated.entered.notified().await;
        registry.invalidate(&schema("tenant_a")).await;
        gated.release.notify_one();

        in_flight.await.unwrap().unwrap();
        assert!(registry.contains(&schema("tenant_a")));
        assert_eq!(memory.open_count(), 2);
        assert_eq!(memory.close_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_open_keeps_the_first_client_and_closes_the_other() {
        let memory = backend_with(&["tenant_a"]).await;
        let gated = Gated::new(memory.clone());
        let registry = Arc::new(ClientRegistry::new(gated.clone(), &config(4, Duration::from_secs(60))));

        let slow = tokio::spawn({
            let registry = registry.clone();
            async move { registry.acquire(&schema("tenant_a")).await }
        });
        gated.entered.notified().await;

        let fast = registry.acquire(&schema("tenant_a")).await.unwrap();
        assert_eq!(memory.close_count(), 0);
        gated.release.notify_one();

        let slow = slow.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&slow.inner, &fast.inner));
        assert_eq!(memory.open_count(), 2);
        assert_eq!(memory.close_count(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_every_cached_client() {
        let backend = backend_with(&["tenant_a", "tenant_b", "tenant_c"]).await;
        let registry = ClientRegistry::new(backend.clone(), &config(4, Duration::from_secs(60)));
        for tenant in ["tenant_a", "tenant_b", "tenant_c"] {
            drop(registry.acquire(&schema(tenant)).await.unwrap());
        }

        registry.shutdown().await;
        assert_eq!(backend.close_count(), 3);
        assert!(registry.is_empty());
    }
}
