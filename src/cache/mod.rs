//! Multi-Tier Response Cache
//!
//! Sits between the orchestration layer and slow or billable work (LLM
//! calls, per-agent analyses, assembled project results).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Cache Manager                               │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  L1 Memory            │ L2 Shared            │ L3 Persistent         │
//! │  ┌────────────────┐   │ ┌────────────────┐   │ ┌──────────────────┐  │
//! │  │ Byte-budgeted  │   │ │ Redis          │   │ │ SQLite table     │  │
//! │  │ FIFO map       │   │ │ (native TTL)   │   │ │ (expires_at idx) │  │
//! │  └────────────────┘   │ └────────────────┘   │ └──────────────────┘  │
//! │         │             │         │            │          │            │
//! │         └─────────────┴─────────┴────────────┴──────────┘            │
//! │                              │                                       │
//! │              Read fast → slow, backfill on hit                       │
//! │              Write fan-out, remote failures absorbed                 │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - L1 never holds more than its byte budget once a write returns
//! - Expired entries are never returned, from any tier
//! - A remote tier being down costs at most one timeout per cool-down window
//!
//! Namespaces decide which tiers an entry may occupy; see
//! [`NamespaceConfig::defaults`].

mod clock;
mod entry;
mod l1;
mod l2;
mod l3;
mod manager;
mod metrics;
mod policy;
mod tier;
pub mod compression;
pub mod keys;

/// Default L1 budget (100 MiB)
pub const DEFAULT_MEMORY_BUDGET: u64 = 100 * 1024 * 1024;

/// Default estimated cost of recomputing one entry, in dollars
pub const DEFAULT_UNIT_COST: f64 = 0.002;

pub use clock::{Clock, ManualClock, SystemClock};
pub use compression::{Codec, CodecConfig};
pub use entry::{decode_envelope, encode_envelope, CacheEntry, CacheKey};
pub use l1::{EvictionReport, MemoryStats, MemoryTier, SetOutcome};
pub use l2::{InMemorySharedStore, RedisStore, SharedStore, SharedTier};
pub use l3::{InMemoryPersistentBackend, PersistentBackend, PersistentTier, SqliteBackend};
pub use manager::{
    CacheHit, CacheManager, CacheManagerBuilder, PopularEntry, StatusReport, SweepReport,
};
pub use metrics::{CacheMetrics, NamespaceSnapshot, StatsSnapshot, TierSnapshot};
pub use policy::{format_duration, parse_duration, CacheConfig, NamespaceConfig, TierKind};
pub use tier::{CacheTier, RemoteGuard};
