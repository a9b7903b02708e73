//! Opaque cache keys.

use std::fmt;
use std::str::FromStr;

/// Size of a cache key in bytes.
pub const CACHE_KEY_SIZE: usize = 16;

/// Opaque 16-byte cache key produced by the store layer.
///
/// The map never interprets the bytes beyond hashing them as two native-endian
/// 64-bit words.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CacheKey([u8; CACHE_KEY_SIZE]);

impl CacheKey {
    pub const fn new(bytes: [u8; CACHE_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a key from its two 64-bit words.
    pub fn from_words(lo: u64, hi: u64) -> Self {
        let mut bytes = [0u8; CACHE_KEY_SIZE];
        bytes[..8].copy_from_slice(&lo.to_ne_bytes());
        bytes[8..].copy_from_slice(&hi.to_ne_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CACHE_KEY_SIZE] {
        &self.0
    }

    #[inline]
    pub fn words(&self) -> (u64, u64) {
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&self.0[..8]);
        hi.copy_from_slice(&self.0[8..]);
        (u64::from_ne_bytes(lo), u64::from_ne_bytes(hi))
    }

    /// Bucket hash: wrapping sum of the two words.
    #[inline]
    pub fn hash_value(&self) -> u64 {
        let (lo, hi) = self.words();
        lo.wrapping_add(hi)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; CACHE_KEY_SIZE]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseKeyError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected 16 key bytes, got {0}")]
    Length(usize),
}

impl FromStr for CacheKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())?;
        let bytes: [u8; CACHE_KEY_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ParseKeyError::Length(bytes.len()))?;
        Ok(Self(bytes))
    }
}

impl From<[u8; CACHE_KEY_SIZE]> for CacheKey {
    fn from(bytes: [u8; CACHE_KEY_SIZE]) -> Self {
        Self(bytes)
    }
}
