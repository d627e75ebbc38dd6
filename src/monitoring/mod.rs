//! Observability
//!
//! Tier health reporting and Prometheus exposition for the cache.

pub mod exporter;
pub mod health;

pub use exporter::CacheExporter;
pub use health::{HealthReport, TierHealth, TierStatus};
