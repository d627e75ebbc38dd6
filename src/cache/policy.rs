//! Namespace Policies and Cache Configuration
//!
//! A namespace is a named policy bucket (TTL, compression, tier set, unit
//! cost) applied to a family of keys. The table is loaded once at startup
//! and never changes afterwards.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::compression::CodecConfig;
use super::{DEFAULT_MEMORY_BUDGET, DEFAULT_UNIT_COST};
use crate::error::{Error, Result};

// =============================================================================
// Tier Kind
// =============================================================================

/// Cache tier identity, ordered fast → slow
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// L1 - process-local memory
    Memory,
    /// L2 - networked store shared across instances
    Shared,
    /// L3 - durable store
    Persistent,
}

impl TierKind {
    /// All tiers in lookup order
    pub const ALL: [TierKind; 3] = [TierKind::Memory, TierKind::Shared, TierKind::Persistent];

    /// Configuration name
    pub fn name(&self) -> &'static str {
        match self {
            TierKind::Memory => "memory",
            TierKind::Shared => "shared",
            TierKind::Persistent => "persistent",
        }
    }

    /// Short level label
    pub fn level(&self) -> &'static str {
        match self {
            TierKind::Memory => "L1",
            TierKind::Shared => "L2",
            TierKind::Persistent => "L3",
        }
    }
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Namespace Configuration
// =============================================================================

/// Policy for one cache namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Unique namespace name
    pub name: String,
    /// Entry lifetime (e.g. `30m`, `7d`)
    #[serde(with = "duration_format")]
    pub ttl: Duration,
    /// Compress payloads before they leave L1
    #[serde(default)]
    pub compress: bool,
    /// Tiers this namespace may occupy
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierKind>,
    /// Advisory cost avoided per hit
    #[serde(default = "default_unit_cost")]
    pub unit_cost: f64,
}

fn default_tiers() -> Vec<TierKind> {
    vec![TierKind::Memory]
}

fn default_unit_cost() -> f64 {
    DEFAULT_UNIT_COST
}

impl NamespaceConfig {
    /// Create a memory-only namespace
    pub fn new(name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            ttl,
            compress: false,
            tiers: default_tiers(),
            unit_cost: DEFAULT_UNIT_COST,
        }
    }

    /// Set compression
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Set tier list
    pub fn with_tiers(mut self, tiers: impl Into<Vec<TierKind>>) -> Self {
        self.tiers = tiers.into();
        self
    }

    /// Set unit cost
    pub fn with_unit_cost(mut self, unit_cost: f64) -> Self {
        self.unit_cost = unit_cost;
        self
    }

    /// Whether the namespace may occupy `tier`
    pub fn uses(&self, tier: TierKind) -> bool {
        self.tiers.contains(&tier)
    }

    /// Check invariants and put the tier list in fast → slow order
    pub fn validate(&mut self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("namespace name must not be empty".into()));
        }
        // Names become remote key prefixes and SCAN patterns
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(Error::Config(format!(
                "namespace '{}': name may only contain letters, digits, '-', '_' and '.'",
                self.name
            )));
        }
        if self.ttl.is_zero() {
            return Err(Error::Config(format!(
                "namespace '{}': ttl must be strictly positive",
                self.name
            )));
        }
        if self.tiers.is_empty() {
            return Err(Error::Config(format!(
                "namespace '{}': at least one tier is required",
                self.name
            )));
        }
        let unique: HashSet<_> = self.tiers.iter().collect();
        if unique.len() != self.tiers.len() {
            return Err(Error::Config(format!(
                "namespace '{}': duplicate tier in {:?}",
                self.name, self.tiers
            )));
        }
        if !self.uses(TierKind::Memory) {
            return Err(Error::Config(format!(
                "namespace '{}': the memory tier is mandatory",
                self.name
            )));
        }
        if !self.unit_cost.is_finite() || self.unit_cost < 0.0 {
            return Err(Error::Config(format!(
                "namespace '{}': unit_cost must be a non-negative number",
                self.name
            )));
        }
        self.tiers.sort();
        Ok(())
    }

    /// Default namespace table
    pub fn defaults() -> Vec<NamespaceConfig> {
        const HOUR: u64 = 3600;
        const DAY: u64 = 24 * HOUR;

        vec![
            NamespaceConfig::new("llm-response", Duration::from_secs(7 * DAY))
                .with_compression(true)
                .with_tiers([TierKind::Memory, TierKind::Shared]),
            NamespaceConfig::new("agent-analysis", Duration::from_secs(DAY))
                .with_compression(true)
                .with_tiers([TierKind::Memory, TierKind::Shared]),
            NamespaceConfig::new("project-data", Duration::from_secs(30 * DAY))
                .with_tiers([TierKind::Memory, TierKind::Persistent]),
            NamespaceConfig::new("user-session", Duration::from_secs(HOUR)),
            NamespaceConfig::new("api-response", Duration::from_secs(30 * 60))
                .with_compression(true)
                .with_tiers([TierKind::Memory, TierKind::Shared]),
        ]
    }
}

// =============================================================================
// Cache Configuration
// =============================================================================

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// L1 byte budget
    pub memory_budget_bytes: u64,
    /// Background sweep period
    #[serde(with = "duration_format")]
    pub sweep_interval: Duration,
    /// Maximum entries inspected per sweep tick
    pub sweep_batch_size: usize,
    /// Per-operation timeout for shared/persistent tiers
    #[serde(with = "duration_format")]
    pub remote_timeout: Duration,
    /// How long a failed tier is skipped without a fresh attempt
    #[serde(with = "duration_format")]
    pub cooldown: Duration,
    /// Probe round trips slower than this report `degraded`
    #[serde(with = "duration_format")]
    pub degraded_latency: Duration,
    /// Prefix for keys written to remote tiers
    pub key_prefix: String,
    /// Codec settings
    pub codec: CodecConfig,
    /// Namespace table
    pub namespaces: Vec<NamespaceConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET,
            sweep_interval: Duration::from_secs(60),
            sweep_batch_size: 1000,
            remote_timeout: Duration::from_millis(100),
            cooldown: Duration::from_secs(5),
            degraded_latency: Duration::from_millis(50),
            key_prefix: "panel_cache:".to_string(),
            codec: CodecConfig::default(),
            namespaces: NamespaceConfig::defaults(),
        }
    }
}

impl CacheConfig {
    /// Parse from YAML text; missing fields take defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mut config: CacheConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Check invariants across the whole configuration
    pub fn validate(&mut self) -> Result<()> {
        if self.memory_budget_bytes == 0 {
            return Err(Error::Config("memory_budget_bytes must be positive".into()));
        }
        if self.sweep_batch_size == 0 {
            return Err(Error::Config("sweep_batch_size must be positive".into()));
        }
        if self.remote_timeout.is_zero() {
            return Err(Error::Config("remote_timeout must be positive".into()));
        }
        if self.namespaces.is_empty() {
            return Err(Error::Config("at least one namespace is required".into()));
        }

        let mut seen = HashSet::new();
        for ns in &mut self.namespaces {
            ns.validate()?;
            if !seen.insert(ns.name.clone()) {
                return Err(Error::Config(format!("duplicate namespace '{}'", ns.name)));
            }
        }
        Ok(())
    }

    /// Replace the namespace table
    pub fn with_namespaces(mut self, namespaces: Vec<NamespaceConfig>) -> Self {
        self.namespaces = namespaces;
        self
    }

    /// Look up a namespace by name
    pub fn namespace(&self, name: &str) -> Option<&NamespaceConfig> {
        self.namespaces.iter().find(|ns| ns.name == name)
    }
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a duration string like `30s`, `5m`, `1h`, `7d` or `1h30m`.
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Config("empty duration string".to_string()));
    }

    // Millisecond suffix
    if let Some(ms) = s.strip_suffix("ms") {
        let ms: u64 = ms
            .parse()
            .map_err(|_| Error::Config(format!("invalid number in duration: {}", s)))?;
        return Ok(Duration::from_millis(ms));
    }

    let mut total_secs: u64 = 0;
    let mut num_buf = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            num_buf.push(c);
        } else {
            let num: u64 = num_buf
                .parse()
                .map_err(|_| Error::Config(format!("invalid number in duration: {}", s)))?;
            num_buf.clear();

            let multiplier = match c {
                'd' | 'D' => 86400,
                'h' | 'H' => 3600,
                'm' | 'M' => 60,
                's' | 'S' => 1,
                _ => return Err(Error::Config(format!("unknown duration unit: {}", c))),
            };

            total_secs = num
                .checked_mul(multiplier)
                .and_then(|secs| total_secs.checked_add(secs))
                .ok_or_else(|| Error::Config(format!("duration overflows: {}", s)))?;
        }
    }

    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::Config(format!("invalid number in duration: {}", s)))?;
        total_secs = total_secs
            .checked_add(num)
            .ok_or_else(|| Error::Config(format!("duration overflows: {}", s)))?;
    }

    Ok(Duration::from_secs(total_secs))
}

/// Format a duration the way [`parse_duration`] reads it
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() != 0 || d.as_secs() == 0 {
        return format!("{}ms", d.as_millis());
    }
    let secs = d.as_secs();
    if secs % 86400 == 0 {
        format!("{}d", secs / 86400)
    } else if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Serde adapter: durations as strings, or bare integers as seconds
mod duration_format {
    use std::time::Duration;

    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a duration such as \"30m\" or a number of seconds")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                u64::try_from(v)
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom("duration must not be negative"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                super::parse_duration(v).map_err(E::custom)
            }
        }

        d.deserialize_any(DurationVisitor)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_namespaces() {
        let defaults = NamespaceConfig::defaults();
        assert_eq!(defaults.len(), 5);

        let by_name = |n: &str| defaults.iter().find(|ns| ns.name == n).unwrap().clone();

        let llm = by_name("llm-response");
        assert_eq!(llm.ttl, Duration::from_secs(7 * 86400));
        assert!(llm.compress);
        assert_eq!(llm.tiers, vec![TierKind::Memory, TierKind::Shared]);

        let analysis = by_name("agent-analysis");
        assert_eq!(analysis.ttl, Duration::from_secs(86400));
        assert!(analysis.compress);

        let project = by_name("project-data");
        assert_eq!(project.ttl, Duration::from_secs(30 * 86400));
        assert!(!project.compress);
        assert_eq!(project.tiers, vec![TierKind::Memory, TierKind::Persistent]);

        let session = by_name("user-session");
        assert_eq!(session.ttl, Duration::from_secs(3600));
        assert_eq!(session.tiers, vec![TierKind::Memory]);

        let api = by_name("api-response");
        assert_eq!(api.ttl, Duration::from_secs(1800));
        assert!(api.compress);
        assert_eq!(api.tiers, vec![TierKind::Memory, TierKind::Shared]);
    }

    #[test]
    fn test_default_config_validates() {
        let mut config = CacheConfig::default();
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_sorts_tiers() {
        let mut ns = NamespaceConfig::new("x", Duration::from_secs(1))
            .with_tiers([TierKind::Persistent, TierKind::Memory]);
        ns.validate().unwrap();
        assert_eq!(ns.tiers, vec![TierKind::Memory, TierKind::Persistent]);
    }

    #[test]
    fn test_validate_rejects_bad_namespaces() {
        let mut zero_ttl = NamespaceConfig::new("x", Duration::ZERO);
        assert_matches!(zero_ttl.validate(), Err(Error::Config(_)));

        let mut no_tiers = NamespaceConfig::new("x", Duration::from_secs(1)).with_tiers(Vec::new());
        assert_matches!(no_tiers.validate(), Err(Error::Config(_)));

        let mut no_memory =
            NamespaceConfig::new("x", Duration::from_secs(1)).with_tiers([TierKind::Shared]);
        assert_matches!(no_memory.validate(), Err(Error::Config(_)));

        let mut dup = NamespaceConfig::new("x", Duration::from_secs(1))
            .with_tiers([TierKind::Memory, TierKind::Memory]);
        assert_matches!(dup.validate(), Err(Error::Config(_)));

        let mut negative = NamespaceConfig::new("x", Duration::from_secs(1)).with_unit_cost(-1.0);
        assert_matches!(negative.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let mut config = CacheConfig::default().with_namespaces(vec![
            NamespaceConfig::new("a", Duration::from_secs(1)),
            NamespaceConfig::new("a", Duration::from_secs(2)),
        ]);
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(7 * 86400));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5x").is_err());
    }

    #[test]
    fn test_parse_duration_overflow_is_config_error() {
        assert_matches!(parse_duration("999999999999999999d"), Err(Error::Config(_)));
        assert_matches!(
            parse_duration("18446744073709551615s1s"),
            Err(Error::Config(_))
        );
        assert_matches!(
            CacheConfig::from_yaml_str("namespaces:\n  - name: x\n    ttl: 999999999999999999d\n"),
            Err(_)
        );
    }

    #[test]
    fn test_namespace_name_charset() {
        for name in ["a:b", "llm*", "x?", "ns[1]", "has space"] {
            let mut ns = NamespaceConfig::new(name, Duration::from_secs(60));
            assert_matches!(ns.validate(), Err(Error::Config(_)), "{} accepted", name);
        }
        for name in ["llm-response", "agent_analysis", "v1.project"] {
            let mut ns = NamespaceConfig::new(name, Duration::from_secs(60));
            assert!(ns.validate().is_ok(), "{} rejected", name);
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(7 * 86400)), "7d");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::from_secs(1800)), "30m");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_millis(100)), "100ms");
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
memory_budget_bytes: 1048576
remote_timeout: 80ms
namespaces:
  - name: llm-response
    ttl: 7d
    compress: true
    tiers: [shared, memory]
    unit_cost: 0.01
  - name: user-session
    ttl: 3600
"#;
        let config = CacheConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.memory_budget_bytes, 1_048_576);
        assert_eq!(config.remote_timeout, Duration::from_millis(80));
        assert_eq!(config.sweep_batch_size, 1000);
        assert_eq!(config.namespaces.len(), 2);

        let llm = config.namespace("llm-response").unwrap();
        assert_eq!(llm.tiers, vec![TierKind::Memory, TierKind::Shared]);
        assert_eq!(llm.unit_cost, 0.01);

        let session = config.namespace("user-session").unwrap();
        assert_eq!(session.ttl, Duration::from_secs(3600));
        assert_eq!(session.tiers, vec![TierKind::Memory]);
        assert_eq!(session.unit_cost, DEFAULT_UNIT_COST);
    }

    #[test]
    fn test_yaml_rejects_invalid_namespace() {
        let yaml = r#"
namespaces:
  - name: broken
    ttl: 0
"#;
        assert_matches!(CacheConfig::from_yaml_str(yaml), Err(Error::Config(_)));
    }

    #[test]
    fn test_tier_kind_display_and_order() {
        assert_eq!(TierKind::Memory.to_string(), "memory");
        assert_eq!(TierKind::Shared.level(), "L2");
        assert!(TierKind::Memory < TierKind::Shared);
        assert!(TierKind::Shared < TierKind::Persistent);
    }
}
