//! L2 Cache - Shared Networked Tier
//!
//! Entries live in a key/value store reachable by every instance (Redis in
//! production). Values are written as self-describing envelopes so any
//! reader can tell whether the payload is compressed and when it expires,
//! and the store's own TTL removes them without a sweep.
//!
//! # Design
//!
//! - Pluggable [`SharedStore`] (Redis, or in-memory for tests)
//! - Every call bounded by the [`RemoteGuard`] timeout and cool-down
//! - Undecodable values are deleted on sight

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use redis::AsyncCommands;

use super::compression::Codec;
use super::entry::{decode_envelope, encode_envelope, CacheEntry};
use super::policy::{CacheConfig, NamespaceConfig, TierKind};
use super::tier::{CacheTier, RemoteGuard};
use crate::error::{Error, Result};
use crate::monitoring::health::TierHealth;

/// Raw byte store backing the shared tier
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Fetch a blob
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store a blob that the store expires after `ttl`
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Delete a blob
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete every blob whose key starts with `prefix`
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Round trip to check reachability
    async fn ping(&self) -> Result<()>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

// =============================================================================
// Redis Store
// =============================================================================

/// Redis-backed store
pub struct RedisStore {
    client: redis::Client,
    /// Reused across calls and dropped after an error so the next call
    /// reconnects
    conn: tokio::sync::Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisStore {
    /// Create a store. No connection is made until the first call, so an
    /// unreachable server only degrades the tier.
    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            conn: tokio::sync::Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self.client.get_multiplexed_async_connection().await?;
        tracing::info!("Connected to Redis at {}", self.client.get_connection_info().addr);
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self) {
        *self.conn.lock().await = None;
    }

    /// Drop the cached connection when a command fails
    async fn checked<T>(&self, result: redis::RedisResult<T>) -> Result<T> {
        match result {
            Ok(v) => Ok(v),
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                    self.reset().await;
                }
                Err(e.into())
            }
        }
    }
}

/// Escape glob metacharacters for `SCAN MATCH`
fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.connection().await?;
        let data: Option<Vec<u8>> = self.checked(conn.get(key).await).await?;
        Ok(data.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        self.checked(conn.pset_ex::<_, _, ()>(key, value.as_ref(), ttl_ms).await)
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let deleted: i64 = self.checked(conn.del(key).await).await?;
        Ok(deleted > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut conn = self.connection().await?;

        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut total_deleted = 0;

        loop {
            let scanned: redis::RedisResult<(u64, Vec<String>)> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await;
            let (next_cursor, keys) = self.checked(scanned).await?;

            if !keys.is_empty() {
                let deleted: i64 = self.checked(conn.del(&keys).await).await?;
                total_deleted += deleted as u64;
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(total_deleted)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        self.checked(pong).await.map(|_| ())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// In-process stand-in for a shared store, with outage and latency
/// injection for tests and local runs
#[derive(Default)]
pub struct InMemorySharedStore {
    data: DashMap<String, (Bytes, Instant)>,
    unavailable: AtomicBool,
    latency: Mutex<Duration>,
}

impl InMemorySharedStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going down or coming back
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Relaxed);
    }

    /// Add a delay to every call
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Write a blob directly, bypassing the tier
    pub fn insert_raw(&self, key: impl Into<String>, value: Bytes, ttl: Duration) {
        self.data.insert(key.into(), (value, Instant::now() + ttl));
    }

    /// Whether a live blob exists under `key`
    pub fn contains(&self, key: &str) -> bool {
        self.data
            .get(key)
            .is_some_and(|v| v.1 > Instant::now())
    }

    /// Number of live blobs
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|v| v.1 > now).count()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn simulate(&self) -> Result<()> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(Error::Internal("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SharedStore for InMemorySharedStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.simulate().await?;
        let now = Instant::now();
        let value = self
            .data
            .get(key)
            .filter(|v| v.1 > now)
            .map(|v| v.0.clone());
        if value.is_none() {
            self.data.remove_if(key, |_, v| v.1 <= now);
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.simulate().await?;
        self.insert_raw(key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.simulate().await?;
        Ok(self.data.remove(key).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        self.simulate().await?;
        let before = self.data.len();
        self.data.retain(|k, _| !k.starts_with(prefix));
        Ok((before - self.data.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        self.simulate().await
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

// =============================================================================
// Shared Tier
// =============================================================================

/// L2 Cache - tier over a [`SharedStore`]
pub struct SharedTier {
    store: Arc<dyn SharedStore>,
    codec: Codec,
    guard: RemoteGuard,
    key_prefix: String,
}

impl SharedTier {
    /// Create the tier using timeouts and prefix from `config`
    pub fn new(store: Arc<dyn SharedStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            codec: Codec::with_config(config.codec),
            guard: RemoteGuard::new(
                TierKind::Shared,
                config.remote_timeout,
                config.cooldown,
                config.degraded_latency,
            ),
            key_prefix: config.key_prefix.clone(),
        }
    }

    /// Key under which `namespace:key` is stored
    pub fn full_key(&self, namespace: &str, key: &str) -> String {
        format!("{}{}:{}", self.key_prefix, namespace, key)
    }

    /// Get the guard (for inspection)
    pub fn guard(&self) -> &RemoteGuard {
        &self.guard
    }

    async fn discard(&self, full_key: &str) {
        if let Err(e) = self.guard.call("delete", self.store.delete(full_key)).await {
            tracing::debug!(key = full_key, "Could not delete bad shared entry: {}", e);
        }
    }
}

#[async_trait]
impl CacheTier for SharedTier {
    fn kind(&self) -> TierKind {
        TierKind::Shared
    }

    async fn get(
        &self,
        ns: &NamespaceConfig,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>> {
        let full_key = self.full_key(&ns.name, key);
        let Some(blob) = self.guard.call("get", self.store.get(&full_key)).await? else {
            return Ok(None);
        };

        let stored = match decode_envelope(blob) {
            Ok(stored) => stored,
            Err(e) => {
                self.discard(&full_key).await;
                return Err(e);
            }
        };

        // The store's TTL is coarse; trust the envelope
        if stored.is_expired(now) {
            self.discard(&full_key).await;
            return Ok(None);
        }

        match self.codec.decode(stored.value(), stored.is_compressed()) {
            Ok(value) => Ok(Some(stored.with_value(value, false))),
            Err(e) => {
                self.discard(&full_key).await;
                Err(e)
            }
        }
    }

    async fn set(
        &self,
        ns: &NamespaceConfig,
        key: &str,
        entry: &CacheEntry,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(ttl) = entry.remaining_ttl(now) else {
            return Ok(());
        };

        let stored = if ns.compress {
            let (value, compressed) = self.codec.encode(entry.value());
            entry.with_value(value, compressed)
        } else {
            entry.with_value(entry.value().clone(), false)
        };

        let full_key = self.full_key(&ns.name, key);
        self.guard
            .call("set", self.store.set(&full_key, encode_envelope(&stored), ttl))
            .await
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let full_key = self.full_key(namespace, key);
        self.guard.call("delete", self.store.delete(&full_key)).await
    }

    async fn purge_namespace(&self, namespace: &str) -> Result<u64> {
        let prefix = self.full_key(namespace, "");
        self.guard
            .call("purge", self.store.delete_prefix(&prefix))
            .await
    }

    async fn sweep_expired(&self, _now: DateTime<Utc>, _limit: usize) -> Result<u64> {
        // The store expires keys itself
        Ok(0)
    }

    async fn probe(&self) -> TierHealth {
        let mut health = self.guard.probe(self.store.ping()).await;
        if health.message.is_none() {
            health.message = Some(format!("{} reachable", self.store.name()));
        }
        health
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::health::TierStatus;
    use assert_matches::assert_matches;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn setup() -> (Arc<InMemorySharedStore>, SharedTier) {
        let store = Arc::new(InMemorySharedStore::new());
        let tier = SharedTier::new(store.clone(), &CacheConfig::default());
        (store, tier)
    }

    fn compressed_ns() -> NamespaceConfig {
        NamespaceConfig::new("llm-response", Duration::from_secs(600))
            .with_compression(true)
            .with_tiers([TierKind::Memory, TierKind::Shared])
    }

    #[tokio::test]
    async fn test_roundtrip_with_compression() {
        let (store, tier) = setup();
        let ns = compressed_ns();
        let payload = Bytes::from(b"The panel agrees on a modular monolith. ".repeat(100));
        let entry = CacheEntry::new(payload.clone(), now(), ns.ttl);

        tier.set(&ns, "prompt-1", &entry, now()).await.unwrap();
        assert!(store.contains("panel_cache:llm-response:prompt-1"));

        let got = tier.get(&ns, "prompt-1", now()).await.unwrap().unwrap();
        assert_eq!(got.value(), &payload);
        assert!(!got.is_compressed());
        assert_eq!(
            got.expires_at().timestamp_millis(),
            entry.expires_at().timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_missing_key() {
        let (_, tier) = setup();
        assert!(tier.get(&compressed_ns(), "nope", now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_poison_entry_is_deleted() {
        let (store, tier) = setup();
        let ns = compressed_ns();
        store.insert_raw(
            "panel_cache:llm-response:bad",
            Bytes::from_static(b"not an envelope at all"),
            Duration::from_secs(60),
        );

        assert_matches!(tier.get(&ns, "bad", now()).await, Err(Error::Decode(_)));
        assert!(!store.contains("panel_cache:llm-response:bad"));
        assert!(!tier.guard().is_cooling_down());
    }

    #[tokio::test]
    async fn test_corrupt_compressed_payload_is_deleted() {
        let (store, tier) = setup();
        let ns = compressed_ns();
        let bogus = CacheEntry::new(Bytes::from_static(b"\x10\x00\x00\x00junk"), now(), ns.ttl)
            .with_value(Bytes::from_static(b"\x10\x00\x00\x00junk"), true);
        store.insert_raw(
            "panel_cache:llm-response:bad",
            encode_envelope(&bogus),
            Duration::from_secs(60),
        );

        assert_matches!(tier.get(&ns, "bad", now()).await, Err(Error::Decode(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_envelope_expiry_is_respected() {
        let (_, tier) = setup();
        let ns = compressed_ns();
        let entry = CacheEntry::new(Bytes::from_static(b"v"), now(), Duration::from_secs(60));
        tier.set(&ns, "k", &entry, now()).await.unwrap();

        let later = now() + chrono::Duration::seconds(61);
        assert!(tier.get(&ns, "k", later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_outage_surfaces_as_unavailable() {
        let (store, tier) = setup();
        store.set_available(false);

        let result = tier.get(&compressed_ns(), "k", now()).await;
        assert_matches!(result, Err(Error::TierUnavailable { tier: TierKind::Shared, .. }));
        assert!(tier.guard().is_cooling_down());

        let health = tier.probe().await;
        assert_eq!(health.status, TierStatus::Unavailable);
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let store = Arc::new(InMemorySharedStore::new());
        let config = CacheConfig {
            remote_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let tier = SharedTier::new(store.clone(), &config);
        store.set_latency(Duration::from_millis(300));

        let result = tier.get(&compressed_ns(), "k", now()).await;
        assert_matches!(result, Err(Error::TierUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_purge_namespace() {
        let (store, tier) = setup();
        let ns = compressed_ns();
        let other = NamespaceConfig::new("llm-response-v2", Duration::from_secs(60));
        let entry = CacheEntry::new(Bytes::from_static(b"v"), now(), ns.ttl);

        tier.set(&ns, "a", &entry, now()).await.unwrap();
        tier.set(&ns, "b", &entry, now()).await.unwrap();
        tier.set(&other, "a", &entry, now()).await.unwrap();

        assert_eq!(tier.purge_namespace("llm-response").await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("panel_cache:ns:"), "panel_cache:ns:");
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }
}
