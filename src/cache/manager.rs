//! Cache Manager - Tier Orchestrator
//!
//! Single entry point for callers. Lookups walk the tiers a namespace is
//! configured for, fast → slow, and copy hits back into the faster tiers.
//! Writes land in L1 before returning, then fan out to the remote tiers.
//!
//! Remote failures never reach the caller: a lookup that cannot reach a
//! tier treats it as a miss, and a write that cannot reach one logs and
//! moves on. Only misuse (unknown namespace, bad TTL) is returned as an
//! error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::clock::{Clock, SystemClock};
use super::entry::{CacheEntry, CacheKey};
use super::l1::{MemoryTier, SetOutcome};
use super::l2::{SharedStore, SharedTier};
use super::l3::{PersistentBackend, PersistentTier};
use super::metrics::{CacheMetrics, StatsSnapshot};
use super::policy::{CacheConfig, NamespaceConfig, TierKind};
use super::tier::CacheTier;
use crate::error::{Error, Result};
use crate::monitoring::health::{HealthReport, TierHealth, TierStatus};

/// Concurrent per-key deletes while invalidating a namespace
const INVALIDATION_FANOUT: usize = 16;

/// Cache lookup result
#[derive(Debug, Clone)]
pub struct CacheHit {
    /// Payload, uncompressed
    pub value: Bytes,
    /// Which tier answered
    pub tier: TierKind,
    /// When the entry stops being served
    pub expires_at: DateTime<Utc>,
}

impl CacheHit {
    fn new(entry: CacheEntry, tier: TierKind) -> Self {
        Self {
            expires_at: entry.expires_at(),
            value: entry.into_value(),
            tier,
        }
    }
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Expired entries dropped from L1
    pub memory_expired: u64,
    /// Entries evicted to bring L1 under budget
    pub evicted: u64,
    /// Bytes released by those evictions
    pub evicted_bytes: u64,
    /// Expired rows deleted from the persistent tier
    pub persistent_expired: u64,
}

/// Frequently read entry with its estimated saving
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopularEntry {
    pub namespace: String,
    pub key: String,
    pub hits: u64,
    pub size_bytes: u64,
    pub cost_saved: f64,
}

/// Operational summary for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Worst tier status
    pub status: TierStatus,
    /// Per-tier health
    pub tiers: Vec<TierHealth>,
    pub gets: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    /// Bytes resident in L1
    pub bytes_stored: u64,
    pub bytes_evicted: u64,
    pub estimated_cost_saved: f64,
    pub checked_at: DateTime<Utc>,
}

/// Namespace with its tiers resolved against what is actually configured
struct ResolvedNamespace {
    config: Arc<NamespaceConfig>,
    /// Remote tiers, fast → slow
    remotes: Vec<Arc<dyn CacheTier>>,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`CacheManager`]
pub struct CacheManagerBuilder {
    config: CacheConfig,
    shared: Option<Arc<dyn SharedStore>>,
    persistent: Option<Arc<dyn PersistentBackend>>,
    clock: Arc<dyn Clock>,
}

impl CacheManagerBuilder {
    /// Attach a shared store (L2)
    pub fn shared_store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.shared = Some(store);
        self
    }

    /// Attach a persistent backend (L3)
    pub fn persistent_backend(mut self, backend: Arc<dyn PersistentBackend>) -> Self {
        self.persistent = Some(backend);
        self
    }

    /// Use a custom time source
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and build the manager
    pub fn build(self) -> Result<CacheManager> {
        let mut config = self.config;
        config.validate()?;

        let memory = Arc::new(MemoryTier::new(config.memory_budget_bytes));
        let shared = self
            .shared
            .map(|store| Arc::new(SharedTier::new(store, &config)));
        let persistent = self
            .persistent
            .map(|backend| Arc::new(PersistentTier::new(backend, &config)));

        let mut namespaces = HashMap::with_capacity(config.namespaces.len());
        for ns in &mut config.namespaces {
            let mut remotes: Vec<Arc<dyn CacheTier>> = Vec::new();
            let mut effective = vec![TierKind::Memory];

            for tier in ns.tiers.iter().filter(|t| **t != TierKind::Memory) {
                let resolved: Option<Arc<dyn CacheTier>> = match tier {
                    TierKind::Shared => shared.clone().map(|t| t as Arc<dyn CacheTier>),
                    TierKind::Persistent => persistent.clone().map(|t| t as Arc<dyn CacheTier>),
                    TierKind::Memory => None,
                };
                match resolved {
                    Some(t) => {
                        remotes.push(t);
                        effective.push(*tier);
                    }
                    None => warn!(
                        namespace = %ns.name,
                        tier = %tier,
                        "Tier not configured, namespace will not use it"
                    ),
                }
            }

            ns.tiers = effective;
            namespaces.insert(
                ns.name.clone(),
                ResolvedNamespace {
                    config: Arc::new(ns.clone()),
                    remotes,
                },
            );
        }

        let metrics = Arc::new(CacheMetrics::new(&config.namespaces));

        info!(
            namespaces = namespaces.len(),
            memory_budget = config.memory_budget_bytes,
            shared = shared.is_some(),
            persistent = persistent.is_some(),
            "Cache manager ready"
        );

        Ok(CacheManager {
            config,
            namespaces,
            memory,
            shared,
            persistent,
            metrics,
            clock: self.clock,
            shutdown: RwLock::new(false),
            wake: Notify::new(),
        })
    }
}

// =============================================================================
// Cache Manager
// =============================================================================

/// Multi-tier cache orchestrator
pub struct CacheManager {
    config: CacheConfig,
    namespaces: HashMap<String, ResolvedNamespace>,
    memory: Arc<MemoryTier>,
    shared: Option<Arc<SharedTier>>,
    persistent: Option<Arc<PersistentTier>>,
    metrics: Arc<CacheMetrics>,
    clock: Arc<dyn Clock>,
    shutdown: RwLock<bool>,
    wake: Notify,
}

impl CacheManager {
    /// Start building a manager
    pub fn builder(config: CacheConfig) -> CacheManagerBuilder {
        CacheManagerBuilder {
            config,
            shared: None,
            persistent: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Memory-only manager
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    fn resolve(&self, namespace: &str) -> Result<&ResolvedNamespace> {
        self.namespaces
            .get(namespace)
            .ok_or_else(|| Error::UnknownNamespace(namespace.to_string()))
    }

    /// Effective policy of a namespace, tiers reduced to those configured
    pub fn namespace(&self, namespace: &str) -> Option<&NamespaceConfig> {
        self.namespaces.get(namespace).map(|ns| ns.config.as_ref())
    }

    /// Get configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get the L1 tier
    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    // =========================================================================
    // Lookups and writes
    // =========================================================================

    /// Look up a key, trying each configured tier in order
    pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheHit>> {
        let ns = self.resolve(namespace)?;
        let now = self.clock.now();

        let start = Instant::now();
        if let Some(entry) = self.memory.get(&CacheKey::new(namespace, key), now) {
            self.metrics
                .record_read_latency(TierKind::Memory, start.elapsed());
            self.metrics.record_hit(namespace, TierKind::Memory);
            return Ok(Some(CacheHit::new(entry, TierKind::Memory)));
        }
        self.metrics.record_tier_miss(TierKind::Memory);

        for (index, tier) in ns.remotes.iter().enumerate() {
            let kind = tier.kind();
            let start = Instant::now();

            match tier.get(&ns.config, key, now).await {
                Ok(Some(entry)) => {
                    self.metrics.record_read_latency(kind, start.elapsed());
                    self.metrics.record_hit(namespace, kind);
                    debug!(namespace, key, tier = %kind, "Cache hit");
                    self.backfill(ns, key, &entry, index, now);
                    return Ok(Some(CacheHit::new(entry, kind)));
                }
                Ok(None) => self.metrics.record_tier_miss(kind),
                Err(Error::Decode(reason)) => {
                    warn!(namespace, key, tier = %kind, "Dropped undecodable entry: {}", reason);
                    self.metrics.record_decode_error();
                    self.metrics.record_tier_miss(kind);
                }
                Err(e) => {
                    debug!(namespace, key, tier = %kind, "Tier skipped on lookup: {}", e);
                    self.metrics.record_tier_error(kind);
                    self.metrics.record_tier_miss(kind);
                }
            }
        }

        self.metrics.record_miss(namespace);
        debug!(namespace, key, "Cache miss");
        Ok(None)
    }

    /// Store a value. L1 is written before this returns; remote writes are
    /// best effort.
    pub async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: impl Into<Bytes>,
        ttl_override: Option<Duration>,
    ) -> Result<()> {
        let ns = self.resolve(namespace)?;
        let ttl = match ttl_override {
            Some(ttl) if ttl.is_zero() => {
                return Err(Error::Config(format!(
                    "ttl override for {}:{} must be positive",
                    namespace, key
                )))
            }
            Some(ttl) => ttl,
            None => ns.config.ttl,
        };

        let now = self.clock.now();
        let entry = CacheEntry::new(value.into(), now, ttl);
        self.metrics.record_set(namespace, entry.size_bytes());

        let outcome = self
            .memory
            .set(CacheKey::new(namespace, key), entry.clone());
        self.record_memory_write(namespace, key, &outcome);

        let writes = ns.remotes.iter().map(|tier| {
            let entry = &entry;
            let config = &ns.config;
            async move { (tier.kind(), tier.set(config, key, entry, now).await) }
        });
        for (kind, result) in join_all(writes).await {
            if let Err(e) = result {
                debug!(namespace, key, tier = %kind, "Write skipped tier: {}", e);
                self.metrics.record_tier_error(kind);
            }
        }

        Ok(())
    }

    /// Delete a key from every tier. Returns true if any tier held it.
    pub async fn invalidate(&self, namespace: &str, key: &str) -> Result<bool> {
        let ns = self.resolve(namespace)?;
        let mut removed = self.memory.remove(&CacheKey::new(namespace, key));

        let deletes = ns
            .remotes
            .iter()
            .map(|tier| async move { (tier.kind(), tier.delete(namespace, key).await) });
        for (kind, result) in join_all(deletes).await {
            match result {
                Ok(found) => removed |= found,
                Err(e) => {
                    warn!(namespace, key, tier = %kind, "Invalidation did not reach tier: {}", e);
                    self.metrics.record_tier_error(kind);
                }
            }
        }

        debug!(namespace, key, removed, "Invalidated key");
        Ok(removed)
    }

    /// Delete every key of a namespace that L1 knows about from every tier,
    /// then purge the namespace from remote tiers. Returns the number of L1
    /// keys invalidated.
    #[instrument(skip(self))]
    pub async fn invalidate_namespace(&self, namespace: &str) -> Result<u64> {
        let ns = self.resolve(namespace)?;
        let keys = self.memory.remove_namespace(namespace);

        for tier in &ns.remotes {
            let kind = tier.kind();

            let results: Vec<Result<bool>> = stream::iter(keys.iter())
                .map(|key| tier.delete(namespace, key))
                .buffer_unordered(INVALIDATION_FANOUT)
                .collect()
                .await;
            let failed = results.iter().filter(|r| r.is_err()).count();
            if failed > 0 {
                warn!(tier = %kind, failed, "Some keys could not be deleted");
                self.metrics.record_tier_error(kind);
            }

            match tier.purge_namespace(namespace).await {
                Ok(purged) => debug!(tier = %kind, purged, "Purged namespace"),
                Err(e) => {
                    warn!(tier = %kind, "Namespace purge failed: {}", e);
                    self.metrics.record_tier_error(kind);
                }
            }
        }

        info!(count = keys.len(), "Invalidated namespace");
        Ok(keys.len() as u64)
    }

    /// Deserialize a cached JSON value
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<T>> {
        match self.get(namespace, key).await? {
            Some(hit) => Ok(Some(serde_json::from_slice(&hit.value)?)),
            None => Ok(None),
        }
    }

    /// Serialize a value as JSON and cache it
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        ttl_override: Option<Duration>,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(namespace, key, bytes, ttl_override).await
    }

    /// Drop every L1 entry and purge every namespace from remote tiers
    pub async fn clear(&self) -> u64 {
        let cleared = self.memory.clear();

        for ns in self.namespaces.values() {
            for tier in &ns.remotes {
                if let Err(e) = tier.purge_namespace(&ns.config.name).await {
                    warn!(namespace = %ns.config.name, tier = %tier.kind(), "Purge failed: {}", e);
                    self.metrics.record_tier_error(tier.kind());
                }
            }
        }

        info!(cleared, "Cache cleared");
        cleared
    }

    fn backfill(
        &self,
        ns: &ResolvedNamespace,
        key: &str,
        entry: &CacheEntry,
        hit_index: usize,
        now: DateTime<Utc>,
    ) {
        let outcome = self
            .memory
            .set(CacheKey::new(&ns.config.name, key), entry.clone());
        if outcome.admitted {
            self.metrics.record_backfill(TierKind::Memory);
        }
        self.record_memory_write(&ns.config.name, key, &outcome);

        if hit_index == 0 {
            return;
        }

        // Remote tiers faster than the one that answered
        let faster: Vec<Arc<dyn CacheTier>> = ns.remotes[..hit_index].to_vec();
        let config = ns.config.clone();
        let metrics = self.metrics.clone();
        let key = key.to_string();
        let entry = entry.clone();

        tokio::spawn(async move {
            for tier in faster {
                match tier.set(&config, &key, &entry, now).await {
                    Ok(()) => metrics.record_backfill(tier.kind()),
                    Err(e) => {
                        debug!(namespace = %config.name, key = %key, tier = %tier.kind(), "Backfill failed: {}", e);
                        metrics.record_tier_error(tier.kind());
                    }
                }
            }
        });
    }

    fn record_memory_write(&self, namespace: &str, key: &str, outcome: &SetOutcome) {
        self.metrics
            .record_evictions(outcome.evicted.len() as u64, outcome.bytes_evicted);
        if !outcome.admitted {
            self.metrics.record_oversize_rejection();
            warn!(
                namespace,
                key,
                budget = self.config.memory_budget_bytes,
                "Entry exceeds the memory budget, kept in remote tiers only"
            );
        }
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    /// Statistics snapshot
    pub fn stats(&self) -> StatsSnapshot {
        self.metrics.snapshot(self.memory.stats())
    }

    /// Every configured tier, fast → slow
    fn tiers(&self) -> Vec<Arc<dyn CacheTier>> {
        let mut tiers: Vec<Arc<dyn CacheTier>> = vec![self.memory.clone() as Arc<dyn CacheTier>];
        if let Some(shared) = &self.shared {
            tiers.push(shared.clone());
        }
        if let Some(persistent) = &self.persistent {
            tiers.push(persistent.clone());
        }
        tiers
    }

    /// Probe every configured tier
    pub async fn health_check(&self) -> HealthReport {
        let tiers = self.tiers();
        let results = join_all(tiers.iter().map(|t| t.probe())).await;
        HealthReport::new(results, self.clock.now())
    }

    /// Health plus headline statistics
    pub async fn status(&self) -> StatusReport {
        let health = self.health_check().await;
        let stats = self.stats();

        StatusReport {
            status: health.status,
            tiers: health.tiers,
            gets: stats.gets,
            hits: stats.hits,
            misses: stats.misses,
            hit_rate: stats.hit_ratio,
            bytes_stored: stats.bytes_stored,
            bytes_evicted: stats.bytes_evicted,
            estimated_cost_saved: stats.cost_saved,
            checked_at: health.checked_at,
        }
    }

    /// Most-read L1 entries with their estimated saving
    pub fn popular_entries(&self, limit: usize) -> Vec<PopularEntry> {
        self.memory
            .popular(limit)
            .into_iter()
            .map(|e| {
                let unit_cost = self
                    .namespaces
                    .get(&e.namespace)
                    .map(|ns| ns.config.unit_cost)
                    .unwrap_or(0.0);
                PopularEntry {
                    cost_saved: e.hits as f64 * unit_cost,
                    namespace: e.namespace,
                    key: e.key,
                    hits: e.hits,
                    size_bytes: e.size_bytes,
                }
            })
            .collect()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// One sweep: expire a batch of L1 entries, enforce the budget and
    /// delete a batch of expired persistent rows.
    pub async fn run_maintenance_once(&self) -> SweepReport {
        let now = self.clock.now();
        let batch = self.config.sweep_batch_size;

        let memory_expired = self.memory.sweep_expired(now, batch);
        let eviction = self.memory.evict_to_budget(self.config.memory_budget_bytes);
        self.metrics.record_evictions(eviction.count, eviction.bytes);

        let mut persistent_expired = 0;
        if let Some(persistent) = &self.persistent {
            match persistent.sweep_expired(now, batch).await {
                Ok(removed) => persistent_expired = removed,
                Err(e) => debug!("Persistent sweep skipped: {}", e),
            }
        }

        SweepReport {
            memory_expired,
            evicted: eviction.count,
            evicted_bytes: eviction.bytes,
            persistent_expired,
        }
    }

    /// Run the maintenance loop until [`CacheManager::shutdown`] is called
    #[instrument(skip(self))]
    pub async fn run_maintenance(self: Arc<Self>) {
        info!(
            interval = ?self.config.sweep_interval,
            batch = self.config.sweep_batch_size,
            "Starting cache maintenance"
        );

        let mut tick = interval(self.config.sweep_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if *self.shutdown.read().await {
                        break;
                    }

                    let report = self.run_maintenance_once().await;
                    if report != SweepReport::default() {
                        debug!(?report, "Maintenance pass");
                    }
                }

                _ = self.wake.notified() => {
                    if *self.shutdown.read().await {
                        break;
                    }
                }
            }
        }

        info!("Cache maintenance stopped");
    }

    /// Spawn [`CacheManager::run_maintenance`] on the runtime
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run_maintenance())
    }

    /// Signal the maintenance loop to stop
    pub async fn shutdown(&self) {
        *self.shutdown.write().await = true;
        self.wake.notify_one();
    }
}

// =============================================================================
// Tests
// =============================================================================
