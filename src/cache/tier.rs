//! Tier Abstraction
//!
//! Every cache level answers the same small contract. Remote tiers (shared
//! and persistent) additionally run each call through a [`RemoteGuard`],
//! which bounds it with a timeout and parks the tier for a cool-down period
//! after a failure so a dead backend does not add latency to every lookup.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::entry::CacheEntry;
use super::policy::{NamespaceConfig, TierKind};
use crate::error::{Error, Result};
use crate::monitoring::health::TierHealth;

/// One level of the cache hierarchy.
///
/// Entries cross this boundary uncompressed; tiers that compress do so
/// internally according to the namespace policy.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Which level this is
    fn kind(&self) -> TierKind;

    /// Fetch a live entry. Expired entries read as absent.
    async fn get(
        &self,
        ns: &NamespaceConfig,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>>;

    /// Store an entry, replacing any previous one
    async fn set(
        &self,
        ns: &NamespaceConfig,
        key: &str,
        entry: &CacheEntry,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Remove an entry; `Ok(false)` if it was not there
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    /// Remove every entry of a namespace, returning how many went
    async fn purge_namespace(&self, namespace: &str) -> Result<u64>;

    /// Drop up to `limit` expired entries
    async fn sweep_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<u64>;

    /// Report reachability
    async fn probe(&self) -> TierHealth;
}

// =============================================================================
// Remote Guard
// =============================================================================

/// Timeout and cool-down wrapper for calls to a remote tier
#[derive(Debug)]
pub struct RemoteGuard {
    tier: TierKind,
    timeout: Duration,
    cooldown: Duration,
    degraded_latency: Duration,
    down_until: Mutex<Option<Instant>>,
    last_error: Mutex<Option<String>>,
    failures: AtomicU64,
    failures_since_probe: AtomicU64,
}

impl RemoteGuard {
    /// Create a guard
    pub fn new(
        tier: TierKind,
        timeout: Duration,
        cooldown: Duration,
        degraded_latency: Duration,
    ) -> Self {
        Self {
            tier,
            timeout,
            cooldown,
            degraded_latency,
            down_until: Mutex::new(None),
            last_error: Mutex::new(None),
            failures: AtomicU64::new(0),
            failures_since_probe: AtomicU64::new(0),
        }
    }

    /// Tier being guarded
    pub fn tier(&self) -> TierKind {
        self.tier
    }

    /// Total failed calls
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Whether calls are currently being skipped
    pub fn is_cooling_down(&self) -> bool {
        let mut down_until = self.down_until.lock();
        match *down_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                *down_until = None;
                false
            }
            None => false,
        }
    }

    /// Run one tier operation.
    ///
    /// Backend errors and timeouts become [`Error::TierUnavailable`] and start
    /// a cool-down. Decode errors describe bad data, not a bad tier, and pass
    /// through untouched.
    pub async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cooling_down() {
            return Err(Error::unavailable(self.tier, "cooling down after failure"));
        }

        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e @ Error::Decode(_))) => Err(e),
            Ok(Err(e)) => Err(self.trip(op, e.to_string())),
            Err(_) => Err(self.trip(op, format!("timed out after {:?}", self.timeout))),
        }
    }

    /// Health probe. Ignores the cool-down so a recovered tier is noticed,
    /// and clears it on success.
    pub async fn probe<F>(&self, ping: F) -> TierHealth
    where
        F: Future<Output = Result<()>>,
    {
        let start = Instant::now();
        let result = tokio::time::timeout(self.timeout, ping).await;
        let latency = start.elapsed();

        match result {
            Ok(Ok(())) => {
                *self.down_until.lock() = None;
                let recent = self.failures_since_probe.swap(0, Ordering::Relaxed);

                let health = if latency > self.degraded_latency {
                    TierHealth::degraded(
                        self.tier,
                        format!("slow round trip ({} ms)", latency.as_millis()),
                    )
                } else if recent > 0 {
                    let last = self.last_error.lock().clone().unwrap_or_default();
                    TierHealth::degraded(
                        self.tier,
                        format!("{} failed calls since last check, last: {}", recent, last),
                    )
                } else {
                    TierHealth::operational(self.tier)
                };
                health.with_latency(latency)
            }
            Ok(Err(e)) => {
                let reason = e.to_string();
                self.trip("probe", reason.clone());
                TierHealth::unavailable(self.tier, reason).with_latency(latency)
            }
            Err(_) => {
                let reason = format!("probe timed out after {:?}", self.timeout);
                self.trip("probe", reason.clone());
                TierHealth::unavailable(self.tier, reason).with_latency(latency)
            }
        }
    }

    fn trip(&self, op: &'static str, reason: String) -> Error {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.failures_since_probe.fetch_add(1, Ordering::Relaxed);

        let mut down_until = self.down_until.lock();
        if down_until.is_none() {
            tracing::warn!(
                tier = %self.tier,
                op,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "Tier call failed, pausing: {}",
                reason
            );
        }
        *down_until = Some(Instant::now() + self.cooldown);
        *self.last_error.lock() = Some(reason.clone());

        Error::unavailable(self.tier, reason)
    }
}

// =============================================================================
// Tests
// =============================================================================
