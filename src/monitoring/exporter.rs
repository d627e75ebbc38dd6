//! Prometheus Exposition
//!
//! Cache counters live in [`CacheMetrics`](crate::cache::CacheMetrics) as
//! plain atomics. The exporter mirrors a [`StatsSnapshot`] into gauges on
//! each scrape, so it never has to be threaded through the hot path.
//! Monotonic totals carry the `_total` suffix and only ever grow.

use prometheus::{Encoder, Gauge, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::StatsSnapshot;
use crate::error::Result;
use crate::monitoring::health::HealthReport;

const PREFIX: &str = "panel_cache";

/// Cache metrics registered in a private registry
pub struct CacheExporter {
    registry: Registry,
    tier_hits: IntGaugeVec,
    tier_misses: IntGaugeVec,
    tier_errors: IntGaugeVec,
    tier_backfills: IntGaugeVec,
    tier_latency_seconds: GaugeVec,
    tier_up: IntGaugeVec,
    namespace_hits: IntGaugeVec,
    namespace_misses: IntGaugeVec,
    namespace_cost_saved: GaugeVec,
    gets: IntGauge,
    sets: IntGauge,
    hit_ratio: Gauge,
    bytes_stored: IntGauge,
    bytes_evicted: IntGauge,
    evictions: IntGauge,
    memory_entries: IntGauge,
    memory_utilization: Gauge,
    expirations: IntGauge,
    decode_errors: IntGauge,
    oversize_rejections: IntGauge,
    cost_saved: Gauge,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(format!("{}_{}", PREFIX, name), help)
}

impl CacheExporter {
    /// Create and register all cache metrics
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        macro_rules! register {
            ($metric:expr) => {{
                let metric = $metric;
                registry.register(Box::new(metric.clone()))?;
                metric
            }};
        }

        Ok(Self {
            tier_hits: register!(IntGaugeVec::new(
                opts("tier_hits_total", "Lookups answered by each tier"),
                &["tier"]
            )?),
            tier_misses: register!(IntGaugeVec::new(
                opts("tier_misses_total", "Lookups each tier could not answer"),
                &["tier"]
            )?),
            tier_errors: register!(IntGaugeVec::new(
                opts("tier_errors_total", "Failed or skipped tier operations"),
                &["tier"]
            )?),
            tier_backfills: register!(IntGaugeVec::new(
                opts("tier_backfills_total", "Entries copied into each tier after a slower hit"),
                &["tier"]
            )?),
            tier_latency_seconds: register!(GaugeVec::new(
                opts("tier_read_latency_seconds", "Moving average of hit latency"),
                &["tier"]
            )?),
            tier_up: register!(IntGaugeVec::new(
                opts("tier_up", "1 if the tier answered its last health check"),
                &["tier"]
            )?),
            namespace_hits: register!(IntGaugeVec::new(
                opts("namespace_hits_total", "Hits per namespace"),
                &["namespace"]
            )?),
            namespace_misses: register!(IntGaugeVec::new(
                opts("namespace_misses_total", "Misses per namespace"),
                &["namespace"]
            )?),
            namespace_cost_saved: register!(GaugeVec::new(
                opts("namespace_cost_saved_total", "Estimated cost avoided per namespace"),
                &["namespace"]
            )?),
            gets: register!(IntGauge::with_opts(opts("gets_total", "Total lookups"))?),
            sets: register!(IntGauge::with_opts(opts("sets_total", "Total writes"))?),
            hit_ratio: register!(Gauge::with_opts(opts("hit_ratio", "Hits over lookups"))?),
            bytes_stored: register!(IntGauge::with_opts(opts(
                "bytes_stored",
                "Bytes resident in the memory tier"
            ))?),
            bytes_evicted: register!(IntGauge::with_opts(opts(
                "bytes_evicted_total",
                "Bytes evicted from the memory tier"
            ))?),
            evictions: register!(IntGauge::with_opts(opts(
                "evictions_total",
                "Entries evicted from the memory tier"
            ))?),
            memory_entries: register!(IntGauge::with_opts(opts(
                "memory_entries",
                "Entries resident in the memory tier"
            ))?),
            memory_utilization: register!(Gauge::with_opts(opts(
                "memory_utilization",
                "Resident bytes over budget"
            ))?),
            expirations: register!(IntGauge::with_opts(opts(
                "expirations_total",
                "Expired entries dropped from the memory tier"
            ))?),
            decode_errors: register!(IntGauge::with_opts(opts(
                "decode_errors_total",
                "Remote entries discarded as undecodable"
            ))?),
            oversize_rejections: register!(IntGauge::with_opts(opts(
                "oversize_rejections_total",
                "Writes larger than the memory budget"
            ))?),
            cost_saved: register!(Gauge::with_opts(opts(
                "cost_saved_total",
                "Estimated cost avoided by cache hits"
            ))?),
            registry,
        })
    }

    /// Mirror a statistics snapshot into the registered gauges
    pub fn update(&self, stats: &StatsSnapshot) {
        for tier in &stats.tiers {
            let label = [tier.tier.name()];
            self.tier_hits.with_label_values(&label).set(tier.hits as i64);
            self.tier_misses.with_label_values(&label).set(tier.misses as i64);
            self.tier_errors.with_label_values(&label).set(tier.errors as i64);
            self.tier_backfills
                .with_label_values(&label)
                .set(tier.backfills as i64);
            self.tier_latency_seconds
                .with_label_values(&label)
                .set(tier.read_latency_us as f64 / 1_000_000.0);
        }

        for ns in &stats.namespaces {
            let label = [ns.name.as_str()];
            self.namespace_hits.with_label_values(&label).set(ns.hits as i64);
            self.namespace_misses
                .with_label_values(&label)
                .set(ns.misses as i64);
            self.namespace_cost_saved
                .with_label_values(&label)
                .set(ns.cost_saved);
        }

        self.gets.set(stats.gets as i64);
        self.sets.set(stats.sets as i64);
        self.hit_ratio.set(stats.hit_ratio);
        self.bytes_stored.set(stats.bytes_stored as i64);
        self.bytes_evicted.set(stats.bytes_evicted as i64);
        self.evictions.set(stats.evictions as i64);
        self.memory_entries.set(stats.memory.entries as i64);
        self.memory_utilization.set(stats.memory.utilization);
        self.expirations.set(stats.memory.expirations as i64);
        self.decode_errors.set(stats.decode_errors as i64);
        self.oversize_rejections.set(stats.oversize_rejections as i64);
        self.cost_saved.set(stats.cost_saved);
    }

    /// Mirror tier reachability from a health report
    pub fn update_health(&self, report: &HealthReport) {
        for tier in &report.tiers {
            self.tier_up
                .with_label_values(&[tier.tier.name()])
                .set(i64::from(tier.status.is_operational()));
        }
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| crate::error::Error::Internal(format!("Non-UTF-8 metrics output: {}", e)))
    }

    /// Content type for [`CacheExporter::render`]
    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }

    /// Underlying registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheManager};

    #[tokio::test]
    async fn test_render_reflects_stats() {
        let cache = CacheManager::new(CacheConfig::default()).unwrap();
        cache.set("llm-response", "k", "v", None).await.unwrap();
        cache.get("llm-response", "k").await.unwrap();
        cache.get("llm-response", "other").await.unwrap();

        let exporter = CacheExporter::new().unwrap();
        exporter.update(&cache.stats());
        exporter.update_health(&cache.health_check().await);
        let text = exporter.render().unwrap();

        assert!(text.contains("panel_cache_gets_total 2"));
        assert!(text.contains("panel_cache_hit_ratio 0.5"));
        assert!(text.contains(r#"panel_cache_tier_hits_total{tier="memory"} 1"#));
        assert!(text.contains(r#"panel_cache_namespace_misses_total{namespace="llm-response"} 1"#));
        assert!(text.contains(r#"panel_cache_tier_up{tier="memory"} 1"#));
    }

    #[test]
    fn test_monotonic_totals_use_total_suffix() {
        let cache = CacheManager::new(CacheConfig::default()).unwrap();
        let exporter = CacheExporter::new().unwrap();
        exporter.update(&cache.stats());
        let text = exporter.render().unwrap();

        for name in [
            "gets_total",
            "sets_total",
            "evictions_total",
            "bytes_evicted_total",
            "expirations_total",
            "decode_errors_total",
            "oversize_rejections_total",
            "cost_saved_total",
        ] {
            assert!(text.contains(&format!("panel_cache_{} 0", name)), "{}", name);
        }
        assert!(!text.contains("panel_cache_gets "));
        assert!(!text.contains("panel_cache_evictions "));
        // Point-in-time values keep their plain names
        assert!(text.contains("panel_cache_bytes_stored 0"));
        assert!(text.contains("panel_cache_memory_entries 0"));
    }

    #[test]
    fn test_exporters_are_independent() {
        // Private registries, so two instances never collide
        let a = CacheExporter::new().unwrap();
        let b = CacheExporter::new().unwrap();
        a.gets.set(3);
        assert_eq!(b.gets.get(), 0);
        assert!(!a.registry().gather().is_empty());
    }
}
