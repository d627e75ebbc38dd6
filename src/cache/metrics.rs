//! Cache Metrics Collection
//!
//! Process-wide counters read by the stats endpoint and the Prometheus
//! exporter. Lookup totals are derived from hits and misses so the two can
//! never disagree in a snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::l1::MemoryStats;
use super::policy::{NamespaceConfig, TierKind};

/// Cost is accumulated in millionths to stay on integer atomics
const COST_SCALE: f64 = 1_000_000.0;

/// Counters for one tier
#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    backfills: AtomicU64,
    read_latency_us: AtomicU64,
}

/// Counters for one namespace
#[derive(Debug)]
struct NamespaceCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    unit_cost_micros: u64,
    cost_saved_micros: AtomicU64,
}

impl NamespaceCounters {
    fn new(unit_cost: f64) -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            unit_cost_micros: (unit_cost * COST_SCALE).round() as u64,
            cost_saved_micros: AtomicU64::new(0),
        }
    }
}

/// Cache metrics collector
#[derive(Debug)]
pub struct CacheMetrics {
    memory: TierCounters,
    shared: TierCounters,
    persistent: TierCounters,

    sets: AtomicU64,
    bytes_written: AtomicU64,
    evictions: AtomicU64,
    bytes_evicted: AtomicU64,
    decode_errors: AtomicU64,
    oversize_rejections: AtomicU64,

    // Fixed at construction; the namespace table never changes
    namespaces: HashMap<String, NamespaceCounters>,
}

impl CacheMetrics {
    /// Create a collector with one counter set per namespace
    pub fn new<'a>(namespaces: impl IntoIterator<Item = &'a NamespaceConfig>) -> Self {
        Self {
            memory: TierCounters::default(),
            shared: TierCounters::default(),
            persistent: TierCounters::default(),
            sets: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            bytes_evicted: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            oversize_rejections: AtomicU64::new(0),
            namespaces: namespaces
                .into_iter()
                .map(|ns| (ns.name.clone(), NamespaceCounters::new(ns.unit_cost)))
                .collect(),
        }
    }

    fn tier(&self, tier: TierKind) -> &TierCounters {
        match tier {
            TierKind::Memory => &self.memory,
            TierKind::Shared => &self.shared,
            TierKind::Persistent => &self.persistent,
        }
    }

    // Lookups

    /// A `get` was answered by `tier`
    pub fn record_hit(&self, namespace: &str, tier: TierKind) {
        self.tier(tier).hits.fetch_add(1, Ordering::Relaxed);
        if let Some(ns) = self.namespaces.get(namespace) {
            ns.hits.fetch_add(1, Ordering::Relaxed);
            ns.cost_saved_micros
                .fetch_add(ns.unit_cost_micros, Ordering::Relaxed);
        }
    }

    /// A `get` found nothing in any tier
    pub fn record_miss(&self, namespace: &str) {
        if let Some(ns) = self.namespaces.get(namespace) {
            ns.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// `tier` was consulted and did not have the key
    pub fn record_tier_miss(&self, tier: TierKind) {
        self.tier(tier).misses.fetch_add(1, Ordering::Relaxed);
    }

    /// `tier` failed or timed out
    pub fn record_tier_error(&self, tier: TierKind) {
        self.tier(tier).errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A hit was copied into `tier`
    pub fn record_backfill(&self, tier: TierKind) {
        self.tier(tier).backfills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_latency(&self, tier: TierKind, duration: Duration) {
        update_latency_ema(&self.tier(tier).read_latency_us, duration);
    }

    // Writes and L1 housekeeping

    pub fn record_set(&self, namespace: &str, bytes: u64) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        if let Some(ns) = self.namespaces.get(namespace) {
            ns.sets.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_evictions(&self, count: u64, bytes: u64) {
        if count > 0 {
            self.evictions.fetch_add(count, Ordering::Relaxed);
            self.bytes_evicted.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn record_oversize_rejection(&self) {
        self.oversize_rejections.fetch_add(1, Ordering::Relaxed);
    }

    // Readers

    /// Lookups answered by any tier
    pub fn hits(&self) -> u64 {
        self.namespaces
            .values()
            .map(|ns| ns.hits.load(Ordering::Relaxed))
            .sum()
    }

    /// Lookups that missed every tier
    pub fn misses(&self) -> u64 {
        self.namespaces
            .values()
            .map(|ns| ns.misses.load(Ordering::Relaxed))
            .sum()
    }

    /// Total lookups
    pub fn gets(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// Hit ratio across all lookups
    pub fn hit_ratio(&self) -> f64 {
        let gets = self.gets();
        if gets == 0 {
            0.0
        } else {
            self.hits() as f64 / gets as f64
        }
    }

    /// Estimated cost avoided by hits
    pub fn cost_saved(&self) -> f64 {
        self.namespaces
            .values()
            .map(|ns| ns.cost_saved_micros.load(Ordering::Relaxed))
            .sum::<u64>() as f64
            / COST_SCALE
    }

    /// Get snapshot of all metrics alongside current L1 occupancy
    pub fn snapshot(&self, memory: MemoryStats) -> StatsSnapshot {
        // Per-namespace counters are read first and totals derived from the
        // same loads, so hits + misses == gets holds inside one snapshot.
        let mut namespaces: Vec<NamespaceSnapshot> = self
            .namespaces
            .iter()
            .map(|(name, ns)| NamespaceSnapshot {
                name: name.clone(),
                hits: ns.hits.load(Ordering::Relaxed),
                misses: ns.misses.load(Ordering::Relaxed),
                sets: ns.sets.load(Ordering::Relaxed),
                cost_saved: ns.cost_saved_micros.load(Ordering::Relaxed) as f64 / COST_SCALE,
            })
            .collect();
        namespaces.sort_by(|a, b| a.name.cmp(&b.name));

        let hits: u64 = namespaces.iter().map(|ns| ns.hits).sum();
        let misses: u64 = namespaces.iter().map(|ns| ns.misses).sum();
        let gets = hits + misses;

        let tiers = TierKind::ALL
            .iter()
            .map(|kind| {
                let t = self.tier(*kind);
                TierSnapshot {
                    tier: *kind,
                    hits: t.hits.load(Ordering::Relaxed),
                    misses: t.misses.load(Ordering::Relaxed),
                    errors: t.errors.load(Ordering::Relaxed),
                    backfills: t.backfills.load(Ordering::Relaxed),
                    read_latency_us: t.read_latency_us.load(Ordering::Relaxed),
                }
            })
            .collect();

        StatsSnapshot {
            gets,
            hits,
            misses,
            hit_ratio: if gets == 0 { 0.0 } else { hits as f64 / gets as f64 },
            sets: self.sets.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            bytes_evicted: self.bytes_evicted.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            oversize_rejections: self.oversize_rejections.load(Ordering::Relaxed),
            cost_saved: namespaces.iter().map(|ns| ns.cost_saved).sum(),
            bytes_stored: memory.resident_bytes,
            memory,
            tiers,
            namespaces,
        }
    }
}

fn update_latency_ema(target: &AtomicU64, duration: Duration) {
    let new_us = duration.as_micros() as u64;
    let alpha = 0.1; // EMA smoothing factor

    loop {
        let current = target.load(Ordering::Relaxed);
        let updated = if current == 0 {
            new_us
        } else {
            ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
        };

        if target
            .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
}

/// Per-tier counters
#[derive(Debug, Clone, Serialize)]
pub struct TierSnapshot {
    pub tier: TierKind,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub backfills: u64,
    pub read_latency_us: u64,
}

/// Per-namespace counters
#[derive(Debug, Clone, Serialize)]
pub struct NamespaceSnapshot {
    pub name: String,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub cost_saved: f64,
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub gets: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub sets: u64,
    pub bytes_written: u64,
    pub evictions: u64,
    pub bytes_evicted: u64,
    pub decode_errors: u64,
    pub oversize_rejections: u64,
    pub cost_saved: f64,
    /// Bytes resident in L1
    pub bytes_stored: u64,
    pub memory: MemoryStats,
    pub tiers: Vec<TierSnapshot>,
    pub namespaces: Vec<NamespaceSnapshot>,
}

impl StatsSnapshot {
    /// Counters for one tier
    pub fn tier(&self, tier: TierKind) -> Option<&TierSnapshot> {
        self.tiers.iter().find(|t| t.tier == tier)
    }

    /// Counters for one namespace
    pub fn namespace(&self, name: &str) -> Option<&NamespaceSnapshot> {
        self.namespaces.iter().find(|ns| ns.name == name)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> CacheMetrics {
        CacheMetrics::new(&NamespaceConfig::defaults())
    }

    fn memory() -> MemoryStats {
        MemoryStats {
            entries: 2,
            resident_bytes: 512,
            budget_bytes: 1024,
            utilization: 0.5,
            expirations: 0,
        }
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = metrics();
        assert_eq!(metrics.gets(), 0);
        assert_eq!(metrics.hit_ratio(), 0.0);
        assert_eq!(metrics.snapshot(memory()).namespaces.len(), 5);
    }

    #[test]
    fn test_hit_tracking() {
        let metrics = metrics();

        metrics.record_hit("api-response", TierKind::Memory);
        metrics.record_hit("api-response", TierKind::Shared);
        metrics.record_tier_miss(TierKind::Memory);
        metrics.record_miss("api-response");

        assert_eq!(metrics.hits(), 2);
        assert_eq!(metrics.misses(), 1);
        assert_eq!(metrics.gets(), 3);
        assert!((metrics.hit_ratio() - 0.666).abs() < 0.01);

        let snapshot = metrics.snapshot(memory());
        assert_eq!(snapshot.tier(TierKind::Memory).unwrap().hits, 1);
        assert_eq!(snapshot.tier(TierKind::Memory).unwrap().misses, 1);
        assert_eq!(snapshot.tier(TierKind::Shared).unwrap().hits, 1);
        assert_eq!(snapshot.namespace("api-response").unwrap().hits, 2);
    }

    #[test]
    fn test_cost_saved_uses_unit_cost() {
        let ns = vec![
            NamespaceConfig::new("cheap", Duration::from_secs(1)),
            NamespaceConfig::new("pricey", Duration::from_secs(1)).with_unit_cost(0.5),
        ];
        let metrics = CacheMetrics::new(&ns);

        for _ in 0..10 {
            metrics.record_hit("cheap", TierKind::Memory);
        }
        metrics.record_hit("pricey", TierKind::Memory);

        assert!((metrics.cost_saved() - 0.52).abs() < 1e-9);
        let snapshot = metrics.snapshot(memory());
        assert!((snapshot.namespace("cheap").unwrap().cost_saved - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_namespace_is_not_counted() {
        let metrics = metrics();
        metrics.record_miss("nope");
        metrics.record_set("nope", 10);

        assert_eq!(metrics.gets(), 0);
        assert_eq!(metrics.snapshot(memory()).sets, 1);
    }

    #[test]
    fn test_latency_tracking() {
        let metrics = metrics();

        metrics.record_read_latency(TierKind::Shared, Duration::from_micros(100));
        assert_eq!(metrics.snapshot(memory()).tier(TierKind::Shared).unwrap().read_latency_us, 100);

        // EMA should smooth values
        metrics.record_read_latency(TierKind::Shared, Duration::from_micros(200));
        let latency = metrics.snapshot(memory()).tier(TierKind::Shared).unwrap().read_latency_us;
        assert!(latency > 100 && latency < 200);
    }

    #[test]
    fn test_eviction_and_write_counters() {
        let metrics = metrics();

        metrics.record_set("user-session", 64);
        metrics.record_set("user-session", 36);
        metrics.record_evictions(2, 80);
        metrics.record_evictions(0, 0);
        metrics.record_decode_error();

        let snapshot = metrics.snapshot(memory());
        assert_eq!(snapshot.sets, 2);
        assert_eq!(snapshot.bytes_written, 100);
        assert_eq!(snapshot.evictions, 2);
        assert_eq!(snapshot.bytes_evicted, 80);
        assert_eq!(snapshot.decode_errors, 1);
        assert_eq!(snapshot.bytes_stored, 512);
        assert_eq!(snapshot.namespace("user-session").unwrap().sets, 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = metrics();
        metrics.record_hit("llm-response", TierKind::Shared);

        let json = serde_json::to_value(metrics.snapshot(memory())).unwrap();
        assert_eq!(json["hits"], 1);
        assert_eq!(json["tiers"][1]["tier"], "shared");
    }
}
