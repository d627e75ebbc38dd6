//! Health Checks
//!
//! Per-tier status for the cache health endpoint.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::TierKind;

/// Tier status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierStatus {
    /// Reachable and responsive
    Operational,
    /// Reachable but slow or erroring intermittently
    Degraded,
    /// Unreachable or timed out
    Unavailable,
}

impl TierStatus {
    /// Check if the tier can currently serve traffic
    pub fn is_operational(&self) -> bool {
        matches!(self, TierStatus::Operational | TierStatus::Degraded)
    }

    /// Check if status is fully healthy
    pub fn is_healthy(&self) -> bool {
        *self == TierStatus::Operational
    }
}

impl std::fmt::Display for TierStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierStatus::Operational => write!(f, "operational"),
            TierStatus::Degraded => write!(f, "degraded"),
            TierStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Health of one tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierHealth {
    /// Tier
    pub tier: TierKind,
    /// Status
    pub status: TierStatus,
    /// Message
    pub message: Option<String>,
    /// Duration of the probe
    pub latency_ms: u64,
}

impl TierHealth {
    /// Create an operational result
    pub fn operational(tier: TierKind) -> Self {
        Self {
            tier,
            status: TierStatus::Operational,
            message: None,
            latency_ms: 0,
        }
    }

    /// Create a degraded result
    pub fn degraded(tier: TierKind, message: impl Into<String>) -> Self {
        Self {
            tier,
            status: TierStatus::Degraded,
            message: Some(message.into()),
            latency_ms: 0,
        }
    }

    /// Create an unavailable result
    pub fn unavailable(tier: TierKind, message: impl Into<String>) -> Self {
        Self {
            tier,
            status: TierStatus::Unavailable,
            message: Some(message.into()),
            latency_ms: 0,
        }
    }

    /// Attach a message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Set probe duration
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = latency.as_millis() as u64;
        self
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst status among tiers that are configured
    pub status: TierStatus,
    /// Individual tier results, fast → slow
    pub tiers: Vec<TierHealth>,
    /// Version
    pub version: String,
    /// When the report was produced
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Create a new health report
    pub fn new(mut tiers: Vec<TierHealth>, checked_at: DateTime<Utc>) -> Self {
        tiers.sort_by_key(|t| t.tier);
        let status = tiers
            .iter()
            .map(|t| t.status)
            .max()
            .unwrap_or(TierStatus::Operational);

        Self {
            status,
            tiers,
            version: env!("CARGO_PKG_VERSION").to_string(),
            checked_at,
        }
    }

    /// Status of a single tier, `None` if the tier is not configured
    pub fn tier(&self, tier: TierKind) -> Option<TierStatus> {
        self.tiers.iter().find(|t| t.tier == tier).map(|t| t.status)
    }

    /// The cache can serve traffic as long as L1 does
    pub fn is_serving(&self) -> bool {
        self.tier(TierKind::Memory)
            .map(|s| s.is_operational())
            .unwrap_or(false)
    }
}

// =============================================================================
// Tests
// =============================================================================
