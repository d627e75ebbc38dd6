//! Payload Codec
//!
//! LZ4 block compression applied to payloads before they leave L1. Small
//! payloads and payloads that do not shrink are stored raw; the caller
//! records the returned flag next to the bytes so a reader never guesses.
//!
//! # Example
//!
//! ```
//! use panel_cache::cache::compression::Codec;
//!
//! let codec = Codec::default();
//! let data = b"panel consensus: use postgres. ".repeat(64);
//!
//! let (stored, compressed) = codec.encode(&data);
//! assert!(compressed);
//!
//! let restored = codec.decode(&stored, compressed).unwrap();
//! assert_eq!(restored.as_ref(), &data[..]);
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Codec Configuration
// =============================================================================

/// Configuration for the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Payloads at or below this size are stored raw
    pub min_size_bytes: usize,
    /// LZ4 high-compression level
    pub level: i32,
    /// Upper bound accepted for a declared decompressed size
    pub max_decompressed_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            min_size_bytes: 1024,
            level: 4,
            max_decompressed_bytes: 64 * 1024 * 1024,
        }
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Size of the little-endian length prefix LZ4 prepends to a block
const LZ4_SIZE_PREFIX: usize = 4;

/// Stateless LZ4 codec, shared by value
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    config: CodecConfig,
}

impl Codec {
    /// Create with custom config
    pub fn with_config(config: CodecConfig) -> Self {
        Self { config }
    }

    /// Get configuration
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Compress unconditionally
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.config.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    /// Decompress a block produced by [`Codec::compress`]
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < LZ4_SIZE_PREFIX {
            return Err(Error::Decode(format!(
                "LZ4 block too short ({} bytes)",
                data.len()
            )));
        }

        // Reject absurd declared sizes before lz4 allocates for them
        let declared = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if declared < 0 || declared as usize > self.config.max_decompressed_bytes {
            return Err(Error::Decode(format!(
                "LZ4 block declares {} bytes (limit {})",
                declared, self.config.max_decompressed_bytes
            )));
        }

        let out =
            lz4::block::decompress(data, None).map_err(|e| Error::Decode(format!("LZ4: {}", e)))?;

        // lz4 returns whatever it managed to decode; a short result means corruption
        if out.len() != declared as usize {
            return Err(Error::Decode(format!(
                "LZ4 block declares {} bytes but decoded {}",
                declared,
                out.len()
            )));
        }
        Ok(out)
    }

    /// Compress when it pays off.
    ///
    /// Returns `(stored_bytes, compressed)`. Falls back to the raw bytes if
    /// the payload is small, compression fails, or the output is not smaller.
    pub fn encode(&self, data: &[u8]) -> (Bytes, bool) {
        if data.len() <= self.config.min_size_bytes {
            return (Bytes::copy_from_slice(data), false);
        }

        match self.compress(data) {
            Ok(compressed) if compressed.len() < data.len() => (Bytes::from(compressed), true),
            Ok(_) => (Bytes::copy_from_slice(data), false),
            Err(e) => {
                tracing::warn!("Compression failed, storing uncompressed: {}", e);
                (Bytes::copy_from_slice(data), false)
            }
        }
    }

    /// Reverse [`Codec::encode`] using the stored flag
    pub fn decode(&self, data: &[u8], compressed: bool) -> Result<Bytes> {
        if !compressed {
            return Ok(Bytes::copy_from_slice(data));
        }
        self.decompress(data).map(Bytes::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    const TEST_DATA: &[u8] = b"Hello, this is test data that should compress well. \
        It has some repetition: Hello, this is test data that should compress well.";

    fn large_repetitive() -> Vec<u8> {
        TEST_DATA.repeat(40)
    }

    #[test]
    fn test_lz4_roundtrip() {
        let codec = Codec::default();

        let compressed = codec.compress(TEST_DATA).unwrap();
        let decompressed = codec.decompress(&compressed).unwrap();
        assert_eq!(decompressed, TEST_DATA);
    }

    #[test]
    fn test_small_payload_stays_raw() {
        let codec = Codec::default();

        let (stored, compressed) = codec.encode(b"tiny");
        assert!(!compressed);
        assert_eq!(stored.as_ref(), b"tiny");
    }

    #[test]
    fn test_large_payload_is_compressed() {
        let codec = Codec::default();
        let data = large_repetitive();

        let (stored, compressed) = codec.encode(&data);
        assert!(compressed);
        assert!(stored.len() < data.len());
        assert_eq!(codec.decode(&stored, true).unwrap().as_ref(), &data[..]);
    }

    #[test]
    fn test_incompressible_data_stays_raw() {
        let codec = Codec::with_config(CodecConfig {
            min_size_bytes: 16,
            ..Default::default()
        });

        // xorshift noise does not shrink under LZ4
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let noise: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();

        let (stored, compressed) = codec.encode(&noise);
        if !compressed {
            assert_eq!(stored.as_ref(), &noise[..]);
        } else {
            assert!(stored.len() < noise.len());
        }
    }

    #[test]
    fn test_decode_uncompressed_is_identity() {
        let codec = Codec::default();
        assert_eq!(codec.decode(b"raw", false).unwrap().as_ref(), b"raw");
    }

    #[test]
    fn test_malformed_input_is_decode_error() {
        let codec = Codec::default();

        assert_matches!(codec.decompress(b"ab"), Err(Error::Decode(_)));
        assert_matches!(codec.decode(b"\x10\x00\x00\x00garbage", true), Err(Error::Decode(_)));
    }

    #[test]
    fn test_inflated_size_prefix_is_decode_error() {
        let codec = Codec::default();
        let data = large_repetitive();
        let mut block = codec.compress(&data).unwrap();

        let declared = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        block[..4].copy_from_slice(&(declared + 50).to_le_bytes());

        assert_matches!(codec.decompress(&block), Err(Error::Decode(_)));
        assert_matches!(codec.decode(&block, true), Err(Error::Decode(_)));
    }

    #[test]
    fn test_declared_size_ceiling() {
        let codec = Codec::with_config(CodecConfig {
            max_decompressed_bytes: 1024,
            ..Default::default()
        });

        let compressed = codec.compress(&vec![7u8; 4096]).unwrap();
        assert_matches!(codec.decompress(&compressed), Err(Error::Decode(_)));

        let negative = [0xff, 0xff, 0xff, 0xff, 0x00];
        assert_matches!(codec.decompress(&negative), Err(Error::Decode(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// decompress(compress(x)) == x for arbitrary payloads
        #[test]
        fn prop_compress_roundtrip(data in prop::collection::vec(any::<u8>(), 1..8192)) {
            let codec = Codec::default();
            let compressed = codec.compress(&data)?;
            prop_assert_eq!(codec.decompress(&compressed)?, data);
        }

        /// decode(encode(x)) == x regardless of which branch encode takes
        #[test]
        fn prop_encode_roundtrip(data in prop::collection::vec(any::<u8>(), 0..8192)) {
            let codec = Codec::default();
            let (stored, compressed) = codec.encode(&data);
            let decoded = codec.decode(&stored, compressed)?;
            prop_assert_eq!(decoded.as_ref(), &data[..]);
        }
    }
}
