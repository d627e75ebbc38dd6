//! Panel Cache - Multi-Tier Response Cache
//!
//! Caches LLM responses, per-agent analyses and assembled project results
//! for an expert-panel orchestrator. Three tiers sit behind one facade:
//!
//! ```text
//! caller → CacheManager → L1 memory → L2 Redis → L3 SQLite
//! ```
//!
//! Repeated requests are absorbed by the fastest tier holding the entry. A
//! shared or persistent tier going down degrades hit rate, never
//! correctness.
//!
//! # Modules
//!
//! - [`cache`] - Tiers, codec, namespace policy and the orchestrator
//! - [`error`] - Error types
//! - [`monitoring`] - Tier health and Prometheus exposition
//!
//! # Example
//!
//! ```no_run
//! use panel_cache::cache::{CacheConfig, CacheManager};
//!
//! # async fn demo() -> panel_cache::Result<()> {
//! let cache = CacheManager::new(CacheConfig::default())?;
//! cache.set("llm-response", "prompt-hash", "answer", None).await?;
//! if let Some(hit) = cache.get("llm-response", "prompt-hash").await? {
//!     println!("{} bytes from {}", hit.value.len(), hit.tier);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod error;
pub mod monitoring;

pub use cache::{CacheConfig, CacheHit, CacheManager, NamespaceConfig, StatsSnapshot, TierKind};
pub use error::{Error, Result};
pub use monitoring::{HealthReport, TierHealth, TierStatus};
