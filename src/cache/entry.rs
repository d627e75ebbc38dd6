//! Cache Entry Types
//!
//! Entries are immutable: a `set` on an existing key builds a new entry that
//! supersedes the old one.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

use crate::error::{Error, Result};

/// Cache key - composite of namespace and caller key
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    namespace: String,
    key: String,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    /// Get namespace name
    #[inline]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Get caller key
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace, self.key)
    }
}

/// Cache entry containing the payload and its lifetime
#[derive(Clone, PartialEq, Eq)]
pub struct CacheEntry {
    value: Bytes,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    compressed: bool,
}

impl CacheEntry {
    /// Create an uncompressed entry living `ttl` from `now`
    pub fn new(value: Bytes, now: DateTime<Utc>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        Self {
            value,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            compressed: false,
        }
    }

    /// Rebuild an entry read back from a tier
    pub fn from_parts(
        value: Bytes,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        compressed: bool,
    ) -> Self {
        Self {
            value,
            created_at,
            expires_at,
            compressed,
        }
    }

    /// Same timestamps, different payload representation
    pub fn with_value(&self, value: Bytes, compressed: bool) -> Self {
        Self {
            value,
            created_at: self.created_at,
            expires_at: self.expires_at,
            compressed,
        }
    }

    /// Get payload (zero-copy)
    #[inline]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Consume into the payload
    pub fn into_value(self) -> Bytes {
        self.value
    }

    /// Payload size as stored
    #[inline]
    pub fn size_bytes(&self) -> u64 {
        self.value.len() as u64
    }

    /// Whether the payload is codec-compressed
    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Creation time
    #[inline]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Expiry time
    #[inline]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Check if expired at `now`
    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Remaining lifetime at `now`, `None` once expired
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.expires_at - now).to_std().ok().filter(|d| !d.is_zero())
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("size", &self.value.len())
            .field("compressed", &self.compressed)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// =============================================================================
// Envelope
// =============================================================================
//
// Layout used for blobs in the shared tier:
//
//   [0]      format version
//   [1]      flags (bit 0 = compressed)
//   [2..10]  created_at, unix millis, big endian i64
//   [10..18] expires_at, unix millis, big endian i64
//   [18..]   payload

const ENVELOPE_VERSION: u8 = 1;
const ENVELOPE_HEADER_LEN: usize = 18;
const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Serialize an entry into a self-describing blob
pub fn encode_envelope(entry: &CacheEntry) -> Bytes {
    let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_LEN + entry.value.len());
    buf.put_u8(ENVELOPE_VERSION);
    buf.put_u8(if entry.compressed { FLAG_COMPRESSED } else { 0 });
    buf.put_i64(entry.created_at.timestamp_millis());
    buf.put_i64(entry.expires_at.timestamp_millis());
    buf.put_slice(&entry.value);
    buf.freeze()
}

/// Parse a blob written by [`encode_envelope`]
pub fn decode_envelope(mut blob: Bytes) -> Result<CacheEntry> {
    if blob.len() < ENVELOPE_HEADER_LEN {
        return Err(Error::Decode(format!(
            "envelope too short ({} bytes)",
            blob.len()
        )));
    }

    let version = blob.get_u8();
    if version != ENVELOPE_VERSION {
        return Err(Error::Decode(format!("unknown envelope version {}", version)));
    }

    let flags = blob.get_u8();
    if flags & !FLAG_COMPRESSED != 0 {
        return Err(Error::Decode(format!("unknown envelope flags {:#04x}", flags)));
    }

    let created_at = millis_to_utc(blob.get_i64())?;
    let expires_at = millis_to_utc(blob.get_i64())?;

    Ok(CacheEntry::from_parts(
        blob,
        created_at,
        expires_at,
        flags & FLAG_COMPRESSED != 0,
    ))
}

/// Convert unix milliseconds to a UTC timestamp
pub(crate) fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::Decode(format!("timestamp out of range: {}", ms)))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn at(ms: i64) -> DateTime<Utc> {
        millis_to_utc(ms).unwrap()
    }

    #[test]
    fn test_cache_key() {
        let key = CacheKey::new("llm-response", "abc123");
        assert_eq!(key.namespace(), "llm-response");
        assert_eq!(key.key(), "abc123");
        assert_eq!(key.to_string(), "llm-response:abc123");
        assert_ne!(key, CacheKey::new("api-response", "abc123"));
    }

    #[test]
    fn test_entry_expiry() {
        let now = at(1_700_000_000_000);
        let entry = CacheEntry::new(Bytes::from_static(b"v"), now, Duration::from_secs(60));

        assert_eq!(entry.expires_at() - entry.created_at(), chrono::Duration::seconds(60));
        assert!(!entry.is_expired(now));
        assert!(!entry.is_expired(now + chrono::Duration::seconds(59)));
        assert!(entry.is_expired(now + chrono::Duration::seconds(60)));
        assert_eq!(
            entry.remaining_ttl(now + chrono::Duration::seconds(20)),
            Some(Duration::from_secs(40))
        );
        assert_eq!(entry.remaining_ttl(now + chrono::Duration::seconds(61)), None);
    }

    #[test]
    fn test_with_value_keeps_timestamps() {
        let now = at(1_700_000_000_000);
        let entry = CacheEntry::new(Bytes::from_static(b"raw"), now, Duration::from_secs(5));
        let packed = entry.with_value(Bytes::from_static(b"zz"), true);

        assert!(packed.is_compressed());
        assert_eq!(packed.size_bytes(), 2);
        assert_eq!(packed.expires_at(), entry.expires_at());
    }

    #[test]
    fn test_envelope_preserves_entry() {
        let now = at(1_700_000_123_456);
        let entry = CacheEntry::new(Bytes::from_static(b"payload"), now, Duration::from_secs(1800))
            .with_value(Bytes::from_static(b"compressed-bytes"), true);

        let decoded = decode_envelope(encode_envelope(&entry)).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_envelope_rejects_garbage() {
        assert_matches!(decode_envelope(Bytes::from_static(b"short")), Err(Error::Decode(_)));

        let mut bad_version = encode_envelope(&CacheEntry::new(
            Bytes::from_static(b"x"),
            at(0),
            Duration::from_secs(1),
        ))
        .to_vec();
        bad_version[0] = 9;
        assert_matches!(decode_envelope(Bytes::from(bad_version)), Err(Error::Decode(_)));

        let mut bad_flags = encode_envelope(&CacheEntry::new(
            Bytes::from_static(b"x"),
            at(0),
            Duration::from_secs(1),
        ))
        .to_vec();
        bad_flags[1] = 0x80;
        assert_matches!(decode_envelope(Bytes::from(bad_flags)), Err(Error::Decode(_)));
    }

    #[test]
    fn test_entry_debug() {
        let entry = CacheEntry::new(Bytes::from_static(b"Test"), at(0), Duration::from_secs(1));
        let debug = format!("{:?}", entry);
        assert!(debug.contains("CacheEntry"));
        assert!(debug.contains("size"));
    }
}
