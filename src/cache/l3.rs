//! L3 Cache - Persistent Tier
//!
//! Durable storage for namespaces whose entries should survive restarts.
//! Writes are best effort; a failed write is logged by the orchestrator and
//! the request carries on.
//!
//! # Design
//!
//! - Pluggable [`PersistentBackend`] (SQLite, or in-memory for tests)
//! - Expiry stored next to the value and checked on read
//! - Maintenance deletes expired rows in bounded batches

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::compression::Codec;
use super::entry::{millis_to_utc, CacheEntry};
use super::policy::{CacheConfig, NamespaceConfig, TierKind};
use super::tier::{CacheTier, RemoteGuard};
use crate::error::{Error, Result};
use crate::monitoring::health::TierHealth;

/// Persistent storage backend trait
#[async_trait]
pub trait PersistentBackend: Send + Sync {
    /// Get a stored entry, expired or not
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry>>;

    /// Insert or replace an entry
    async fn put(&self, namespace: &str, key: &str, entry: &CacheEntry) -> Result<()>;

    /// Delete an entry
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    /// Delete every entry of a namespace
    async fn delete_namespace(&self, namespace: &str) -> Result<u64>;

    /// Delete up to `limit` entries expired at `now`
    async fn delete_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<u64>;

    /// Check reachability
    async fn ping(&self) -> Result<()>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

// =============================================================================
// SQLite Backend
// =============================================================================

/// SQLite-backed persistent storage
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (creating if needed) a database file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        tracing::info!("Opened persistent cache at {}", path.display());
        Self::with_pool(pool).await
    }

    /// Private in-memory database
    pub async fn in_memory() -> Result<Self> {
        // Every connection to :memory: is a separate database
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS cache_entries (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                compressed INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, key)
            )
            ",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cache_entries_expires_at ON cache_entries (expires_at)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl PersistentBackend for SqliteBackend {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            r"
            SELECT value, compressed, created_at, expires_at
            FROM cache_entries
            WHERE namespace = ?1 AND key = ?2
            ",
        )
        .bind(namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let value: Vec<u8> = row.try_get("value")?;
                let compressed: bool = row.try_get("compressed")?;
                let created_at: i64 = row.try_get("created_at")?;
                let expires_at: i64 = row.try_get("expires_at")?;

                Ok(Some(CacheEntry::from_parts(
                    value.into(),
                    millis_to_utc(created_at)?,
                    millis_to_utc(expires_at)?,
                    compressed,
                )))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, namespace: &str, key: &str, entry: &CacheEntry) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO cache_entries (namespace, key, value, compressed, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value,
                compressed = excluded.compressed,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            ",
        )
        .bind(namespace)
        .bind(key)
        .bind(entry.value().to_vec())
        .bind(entry.is_compressed())
        .bind(entry.created_at().timestamp_millis())
        .bind(entry.expires_at().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE namespace = ?1 AND key = ?2")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE namespace = ?1")
            .bind(namespace)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM cache_entries
            WHERE rowid IN (
                SELECT rowid FROM cache_entries WHERE expires_at <= ?1 LIMIT ?2
            )
            ",
        )
        .bind(now.timestamp_millis())
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

// =============================================================================
// In-Memory Backend
// =============================================================================

/// In-memory backend for tests, with outage injection.
/// Uses DashMap for lock-free concurrent access.
#[derive(Default)]
pub struct InMemoryPersistentBackend {
    /// namespace -> key -> entry
    storage: DashMap<String, DashMap<String, CacheEntry>>,
    unavailable: AtomicBool,
}

impl InMemoryPersistentBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backend going down or coming back
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Relaxed);
    }

    /// Whether an entry is stored, expired or not
    pub fn contains(&self, namespace: &str, key: &str) -> bool {
        self.storage
            .get(namespace)
            .is_some_and(|ns| ns.contains_key(key))
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.storage.iter().map(|ns| ns.len()).sum()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(Error::Internal("database is locked".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistentBackend for InMemoryPersistentBackend {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry>> {
        self.check()?;
        let Some(ns) = self.storage.get(namespace) else {
            return Ok(None);
        };
        let entry = ns.get(key).map(|e| e.value().clone());
        Ok(entry)
    }

    async fn put(&self, namespace: &str, key: &str, entry: &CacheEntry) -> Result<()> {
        self.check()?;
        self.storage
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), entry.clone());
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self
            .storage
            .get(namespace)
            .is_some_and(|ns| ns.remove(key).is_some()))
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<u64> {
        self.check()?;
        Ok(self
            .storage
            .remove(namespace)
            .map(|(_, ns)| ns.len() as u64)
            .unwrap_or(0))
    }

    async fn delete_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<u64> {
        self.check()?;
        let mut removed = 0u64;
        for ns in self.storage.iter() {
            let expired: Vec<String> = ns
                .iter()
                .filter(|e| e.is_expired(now))
                .map(|e| e.key().clone())
                .take(limit - removed as usize)
                .collect();
            for key in expired {
                if ns.remove(&key).is_some() {
                    removed += 1;
                }
            }
            if removed as usize >= limit {
                break;
            }
        }
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

// =============================================================================
// Persistent Tier
// =============================================================================

/// L3 Cache - tier over a [`PersistentBackend`]
pub struct PersistentTier {
    backend: Arc<dyn PersistentBackend>,
    codec: Codec,
    guard: RemoteGuard,
}

impl PersistentTier {
    /// Create the tier using timeouts from `config`
    pub fn new(backend: Arc<dyn PersistentBackend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            codec: Codec::with_config(config.codec),
            guard: RemoteGuard::new(
                TierKind::Persistent,
                config.remote_timeout,
                config.cooldown,
                config.degraded_latency,
            ),
        }
    }

    /// Get the guard (for inspection)
    pub fn guard(&self) -> &RemoteGuard {
        &self.guard
    }

    async fn discard(&self, namespace: &str, key: &str) {
        if let Err(e) = self
            .guard
            .call("delete", self.backend.delete(namespace, key))
            .await
        {
            tracing::debug!(namespace, key, "Could not delete bad persistent entry: {}", e);
        }
    }
}

#[async_trait]
impl CacheTier for PersistentTier {
    fn kind(&self) -> TierKind {
        TierKind::Persistent
    }

    async fn get(
        &self,
        ns: &NamespaceConfig,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>> {
        let stored = match self
            .guard
            .call("get", self.backend.get(&ns.name, key))
            .await
        {
            Ok(Some(stored)) => stored,
            Ok(None) => return Ok(None),
            Err(e @ Error::Decode(_)) => {
                self.discard(&ns.name, key).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if stored.is_expired(now) {
            return Ok(None);
        }

        match self.codec.decode(stored.value(), stored.is_compressed()) {
            Ok(value) => Ok(Some(stored.with_value(value, false))),
            Err(e) => {
                self.discard(&ns.name, key).await;
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
        if entry.is_expired(now) {
            return Ok(());
        }

        let stored = if ns.compress {
            let (value, compressed) = self.codec.encode(entry.value());
            entry.with_value(value, compressed)
        } else {
            entry.with_value(entry.value().clone(), false)
        };

        self.guard
            .call("set", self.backend.put(&ns.name, key, &stored))
            .await
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        self.guard
            .call("delete", self.backend.delete(namespace, key))
            .await
    }

    async fn purge_namespace(&self, namespace: &str) -> Result<u64> {
        self.guard
            .call("purge", self.backend.delete_namespace(namespace))
            .await
    }

    async fn sweep_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<u64> {
        self.guard
            .call("sweep", self.backend.delete_expired(now, limit))
            .await
    }

    async fn probe(&self) -> TierHealth {
        let mut health = self.guard.probe(self.backend.ping()).await;
        if health.message.is_none() {
            health.message = Some(format!("{} reachable", self.backend.name()));
        }
        health
    }
}

// =============================================================================
// Tests
// =============================================================================
