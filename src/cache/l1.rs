//! L1 Cache - In-Process Memory Tier
//!
//! Byte-budgeted map guarded by a single mutex. Insertion order is tracked
//! in a side index so eviction always drops the oldest write first.
//!
//! # Design
//!
//! - Every write takes a fresh sequence number; re-setting a key moves it to
//!   the back of the eviction queue
//! - Resident size never exceeds the budget once a write returns
//! - Expired entries vanish lazily on read and in bounded sweep batches

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::entry::{CacheEntry, CacheKey};
use super::policy::{NamespaceConfig, TierKind};
use super::tier::CacheTier;
use super::DEFAULT_MEMORY_BUDGET;
use crate::error::Result;
use crate::monitoring::health::TierHealth;

/// Result of a write into L1
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOutcome {
    /// False when the entry alone exceeds the budget
    pub admitted: bool,
    /// Keys dropped to make room, oldest first
    pub evicted: Vec<CacheKey>,
    /// Bytes released by those evictions
    pub bytes_evicted: u64,
}

/// Entries removed by an eviction pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub count: u64,
    pub bytes: u64,
}

/// Frequently read entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopularEntry {
    pub namespace: String,
    pub key: String,
    pub hits: u64,
    pub size_bytes: u64,
}

/// L1 statistics
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub entries: u64,
    pub resident_bytes: u64,
    pub budget_bytes: u64,
    pub utilization: f64,
    /// Entries dropped because they expired
    pub expirations: u64,
}

struct Slot {
    entry: CacheEntry,
    seq: u64,
    hits: u64,
}

#[derive(Default)]
struct State {
    slots: HashMap<CacheKey, Slot>,
    /// seq → key, oldest first
    order: BTreeMap<u64, CacheKey>,
    next_seq: u64,
    resident: u64,
    /// Where the next sweep batch starts
    sweep_cursor: u64,
}

impl State {
    fn remove(&mut self, key: &CacheKey) -> Option<Slot> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.seq);
        self.resident -= slot.entry.size_bytes();
        Some(slot)
    }

    fn pop_oldest(&mut self) -> Option<(CacheKey, u64)> {
        let (_, key) = self.order.pop_first()?;
        let slot = self.slots.remove(&key)?;
        let size = slot.entry.size_bytes();
        self.resident -= size;
        Some((key, size))
    }
}

/// L1 Cache - process-local memory tier
pub struct MemoryTier {
    state: Mutex<State>,
    budget: u64,
    expirations: AtomicU64,
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_BUDGET)
    }
}

impl MemoryTier {
    /// Create with a byte budget
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            state: Mutex::new(State::default()),
            budget: budget_bytes,
            expirations: AtomicU64::new(0),
        }
    }

    /// Get an entry if present and live at `now`
    pub fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<CacheEntry> {
        let mut state = self.state.lock();

        let expired = match state.slots.get_mut(key) {
            None => return None,
            Some(slot) if slot.entry.is_expired(now) => true,
            Some(slot) => {
                slot.hits += 1;
                return Some(slot.entry.clone());
            }
        };

        if expired {
            state.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Insert or replace an entry, evicting the oldest writes until the
    /// budget holds.
    pub fn set(&self, key: CacheKey, entry: CacheEntry) -> SetOutcome {
        let size = entry.size_bytes();
        let mut state = self.state.lock();

        // The new write supersedes the old one whether or not it is admitted
        state.remove(&key);

        if size > self.budget {
            tracing::debug!(key = %key, size, budget = self.budget, "Entry larger than L1 budget, not admitted");
            return SetOutcome::default();
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.insert(seq, key.clone());
        state.slots.insert(key, Slot { entry, seq, hits: 0 });
        state.resident += size;

        // The newest entry fits on its own, so it is never chosen here
        let mut outcome = SetOutcome {
            admitted: true,
            ..Default::default()
        };
        while state.resident > self.budget {
            match state.pop_oldest() {
                Some((evicted, bytes)) => {
                    outcome.bytes_evicted += bytes;
                    outcome.evicted.push(evicted);
                }
                None => break,
            }
        }

        if !outcome.evicted.is_empty() {
            tracing::debug!(
                count = outcome.evicted.len(),
                bytes = outcome.bytes_evicted,
                "Evicted oldest L1 entries"
            );
        }
        outcome
    }

    /// Remove one entry
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.state.lock().remove(key).is_some()
    }

    /// Remove every entry of a namespace, returning their keys
    pub fn remove_namespace(&self, namespace: &str) -> Vec<String> {
        let mut state = self.state.lock();
        let keys: Vec<CacheKey> = state
            .slots
            .keys()
            .filter(|k| k.namespace() == namespace)
            .cloned()
            .collect();

        for key in &keys {
            state.remove(key);
        }
        keys.into_iter().map(|k| k.key().to_string()).collect()
    }

    /// Drop oldest entries until resident size is at most `max_bytes`
    pub fn evict_to_budget(&self, max_bytes: u64) -> EvictionReport {
        let mut state = self.state.lock();
        let mut report = EvictionReport::default();
        while state.resident > max_bytes {
            match state.pop_oldest() {
                Some((_, bytes)) => {
                    report.count += 1;
                    report.bytes += bytes;
                }
                None => break,
            }
        }
        report
    }

    /// Inspect at most `max_inspect` entries for expiry, continuing where the
    /// previous call stopped and wrapping at the end.
    pub fn sweep_expired(&self, now: DateTime<Utc>, max_inspect: usize) -> u64 {
        let mut state = self.state.lock();
        if state.order.is_empty() || max_inspect == 0 {
            return 0;
        }

        let mut inspected = 0usize;
        let mut last_seq = None;
        let mut expired = Vec::new();

        for (seq, key) in state.order.range(state.sweep_cursor..) {
            if inspected == max_inspect {
                break;
            }
            inspected += 1;
            last_seq = Some(*seq);
            if state.slots.get(key).is_some_and(|s| s.entry.is_expired(now)) {
                expired.push(key.clone());
            }
        }

        state.sweep_cursor = match last_seq {
            Some(seq) if inspected == max_inspect => seq + 1,
            // Reached the end of the queue
            _ => 0,
        };

        for key in &expired {
            state.remove(key);
        }

        let removed = expired.len() as u64;
        if removed > 0 {
            self.expirations.fetch_add(removed, Ordering::Relaxed);
        }
        removed
    }

    /// Keys currently held for a namespace
    pub fn keys(&self, namespace: &str) -> Vec<String> {
        self.state
            .lock()
            .slots
            .keys()
            .filter(|k| k.namespace() == namespace)
            .map(|k| k.key().to_string())
            .collect()
    }

    /// Most-read entries, highest hit count first
    pub fn popular(&self, limit: usize) -> Vec<PopularEntry> {
        let state = self.state.lock();
        let mut entries: Vec<PopularEntry> = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.hits > 0)
            .map(|(key, slot)| PopularEntry {
                namespace: key.namespace().to_string(),
                key: key.key().to_string(),
                hits: slot.hits,
                size_bytes: slot.entry.size_bytes(),
            })
            .collect();
        drop(state);

        entries.sort_by(|a, b| {
            b.hits
                .cmp(&a.hits)
                .then_with(|| a.namespace.cmp(&b.namespace))
                .then_with(|| a.key.cmp(&b.key))
        });
        entries.truncate(limit);
        entries
    }

    /// Drop everything
    pub fn clear(&self) -> u64 {
        let mut state = self.state.lock();
        let count = state.slots.len() as u64;
        let next_seq = state.next_seq;
        *state = State {
            next_seq,
            ..Default::default()
        };
        count
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently held
    pub fn resident_bytes(&self) -> u64 {
        self.state.lock().resident
    }

    /// Configured budget
    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Entries dropped because they expired
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Get statistics
    pub fn stats(&self) -> MemoryStats {
        let state = self.state.lock();
        MemoryStats {
            entries: state.slots.len() as u64,
            resident_bytes: state.resident,
            budget_bytes: self.budget,
            utilization: state.resident as f64 / self.budget.max(1) as f64,
            expirations: self.expirations(),
        }
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn kind(&self) -> TierKind {
        TierKind::Memory
    }

    async fn get(
        &self,
        ns: &NamespaceConfig,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>> {
        Ok(MemoryTier::get(self, &CacheKey::new(&ns.name, key), now))
    }

    async fn set(
        &self,
        ns: &NamespaceConfig,
        key: &str,
        entry: &CacheEntry,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        MemoryTier::set(self, CacheKey::new(&ns.name, key), entry.clone());
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        Ok(self.remove(&CacheKey::new(namespace, key)))
    }

    async fn purge_namespace(&self, namespace: &str) -> Result<u64> {
        Ok(self.remove_namespace(namespace).len() as u64)
    }

    async fn sweep_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<u64> {
        Ok(MemoryTier::sweep_expired(self, now, limit))
    }

    async fn probe(&self) -> TierHealth {
        let stats = self.stats();
        TierHealth::operational(TierKind::Memory).with_message(format!(
            "{} entries, {}/{} bytes",
            stats.entries, stats.resident_bytes, stats.budget_bytes
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        super::super::entry::millis_to_utc(1_700_000_000_000).unwrap()
    }

    fn entry(size: usize, ttl_secs: u64) -> CacheEntry {
        CacheEntry::new(Bytes::from(vec![b'x'; size]), now(), Duration::from_secs(ttl_secs))
    }

    fn key(k: &str) -> CacheKey {
        CacheKey::new("ns", k)
    }

    #[test]
    fn test_set_and_get() {
        let l1 = MemoryTier::new(1024);
        let outcome = l1.set(key("a"), entry(10, 60));

        assert!(outcome.admitted);
        assert!(outcome.evicted.is_empty());
        assert_eq!(l1.get(&key("a"), now()).unwrap().size_bytes(), 10);
        assert_eq!(l1.resident_bytes(), 10);
        assert!(l1.get(&key("b"), now()).is_none());
    }

    #[test]
    fn test_replace_adjusts_size() {
        let l1 = MemoryTier::new(1024);
        l1.set(key("a"), entry(100, 60));
        l1.set(key("a"), entry(40, 60));

        assert_eq!(l1.len(), 1);
        assert_eq!(l1.resident_bytes(), 40);
    }

    #[test]
    fn test_expired_entry_reads_as_absent() {
        let l1 = MemoryTier::new(1024);
        l1.set(key("a"), entry(10, 60));

        let later = now() + chrono::Duration::seconds(60);
        assert!(l1.get(&key("a"), later).is_none());
        assert!(l1.is_empty());
        assert_eq!(l1.resident_bytes(), 0);
        assert_eq!(l1.expirations(), 1);
    }

    #[test]
    fn test_fifo_eviction() {
        let l1 = MemoryTier::new(100);
        l1.set(key("a"), entry(40, 60));
        l1.set(key("b"), entry(40, 60));

        // Reads do not refresh position
        assert!(l1.get(&key("a"), now()).is_some());

        let outcome = l1.set(key("c"), entry(40, 60));
        assert!(outcome.admitted);
        assert_eq!(outcome.evicted, vec![key("a")]);
        assert_eq!(outcome.bytes_evicted, 40);
        assert!(l1.get(&key("a"), now()).is_none());
        assert!(l1.get(&key("b"), now()).is_some());
        assert!(l1.get(&key("c"), now()).is_some());
        assert!(l1.resident_bytes() <= 100);
    }

    #[test]
    fn test_rewrite_moves_key_to_back() {
        let l1 = MemoryTier::new(100);
        l1.set(key("a"), entry(40, 60));
        l1.set(key("b"), entry(40, 60));
        l1.set(key("a"), entry(40, 60));

        let outcome = l1.set(key("c"), entry(40, 60));
        assert_eq!(outcome.evicted, vec![key("b")]);
    }

    #[test]
    fn test_oversize_entry_not_admitted() {
        let l1 = MemoryTier::new(100);
        l1.set(key("a"), entry(50, 60));

        let outcome = l1.set(key("a"), entry(101, 60));
        assert!(!outcome.admitted);
        // The stale value must not survive its replacement
        assert!(l1.get(&key("a"), now()).is_none());
        assert_eq!(l1.resident_bytes(), 0);
    }

    #[test]
    fn test_sweep_is_bounded_and_wraps() {
        let l1 = MemoryTier::new(10_000);
        for i in 0..10 {
            l1.set(key(&format!("k{}", i)), entry(1, if i % 2 == 0 { 1 } else { 600 }));
        }

        let later = now() + chrono::Duration::seconds(5);
        assert_eq!(l1.sweep_expired(later, 4), 2);
        assert_eq!(l1.len(), 8);
        assert_eq!(l1.sweep_expired(later, 4), 2);
        assert_eq!(l1.sweep_expired(later, 4), 1);
        assert_eq!(l1.len(), 5);

        // Cursor wrapped; nothing left to expire
        assert_eq!(l1.sweep_expired(later, 100), 0);
        assert_eq!(l1.expirations(), 5);
    }

    #[test]
    fn test_evict_to_budget() {
        let l1 = MemoryTier::new(1000);
        for i in 0..10 {
            l1.set(key(&format!("k{}", i)), entry(100, 60));
        }

        let report = l1.evict_to_budget(450);
        assert_eq!(report.count, 6);
        assert_eq!(report.bytes, 600);
        assert!(l1.get(&key("k0"), now()).is_none());
        assert!(l1.get(&key("k9"), now()).is_some());
    }

    #[test]
    fn test_namespace_removal() {
        let l1 = MemoryTier::new(1000);
        l1.set(CacheKey::new("a", "1"), entry(1, 60));
        l1.set(CacheKey::new("a", "2"), entry(1, 60));
        l1.set(CacheKey::new("b", "1"), entry(1, 60));

        let mut keys = l1.keys("a");
        keys.sort();
        assert_eq!(keys, vec!["1", "2"]);

        let mut removed = l1.remove_namespace("a");
        removed.sort();
        assert_eq!(removed, vec!["1", "2"]);
        assert_eq!(l1.len(), 1);
        assert!(l1.keys("a").is_empty());
    }

    #[test]
    fn test_popular_ranks_by_hits() {
        let l1 = MemoryTier::new(1000);
        l1.set(key("cold"), entry(1, 60));
        l1.set(key("warm"), entry(1, 60));
        l1.set(key("hot"), entry(1, 60));

        for _ in 0..3 {
            l1.get(&key("hot"), now());
        }
        l1.get(&key("warm"), now());

        let popular = l1.popular(10);
        assert_eq!(popular.len(), 2);
        assert_eq!(popular[0].key, "hot");
        assert_eq!(popular[0].hits, 3);
        assert_eq!(popular[1].key, "warm");
        assert_eq!(l1.popular(1).len(), 1);
    }

    #[test]
    fn test_clear() {
        let l1 = MemoryTier::new(1000);
        l1.set(key("a"), entry(10, 60));
        l1.set(key("b"), entry(10, 60));

        assert_eq!(l1.clear(), 2);
        assert!(l1.is_empty());
        assert_eq!(l1.resident_bytes(), 0);

        l1.set(key("c"), entry(10, 60));
        assert_eq!(l1.len(), 1);
    }

    #[tokio::test]
    async fn test_tier_trait() {
        let l1 = MemoryTier::new(1000);
        let ns = NamespaceConfig::new("ns", Duration::from_secs(60));

        CacheTier::set(&l1, &ns, "a", &entry(5, 60), now()).await.unwrap();
        let got = CacheTier::get(&l1, &ns, "a", now()).await.unwrap();
        assert_eq!(got.unwrap().size_bytes(), 5);
        assert!(CacheTier::delete(&l1, "ns", "a").await.unwrap());

        let health = l1.probe().await;
        assert!(health.status.is_healthy());
    }
}
