//! Chunked HMAC integrity.
//!
//! Ciphertext is split into runs of `chunk_size` bytes (the last one may be
//! shorter, it is never padded). Each run gets a hash tag. The first run's tag
//! also covers the header bytes, so a modified header fails verification too.

use crate::error::{DriveError, Result};
use crate::header::EncryptionMode;
use crate::transform::BLOCK_SIZE;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// HMAC-SHA256 key length
pub const HASH_KEY_LENGTH: usize = 32;

/// HMAC-SHA256 tag length
pub const HASH_RESULT_LENGTH: usize = 32;

pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

type HmacSha256 = Hmac<Sha256>;

/// Keyed hash used for chunk tags.
pub trait HashProvider: Send + Sync + fmt::Debug {
    /// Hashes the concatenation of `parts`.
    fn calc(&self, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>>;

    fn hash_size(&self) -> usize;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HmacSha256Provider;

impl HashProvider for HmacSha256Provider {
    fn calc(&self, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|e| DriveError::security(format!("invalid hash key: {}", e)))?;
        for part in parts {
            mac.update(part);
        }
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn hash_size(&self) -> usize {
        HASH_RESULT_LENGTH
    }
}

/// Checks a chunk size: 0, or a multiple of the block size up to [`MAX_CHUNK_SIZE`].
pub fn validate_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size > MAX_CHUNK_SIZE || chunk_size % BLOCK_SIZE != 0 {
        return Err(DriveError::config(format!(
            "Invalid chunk size {}, specify zero for default value or a positive multiple of {} up to {} bytes",
            chunk_size, BLOCK_SIZE, MAX_CHUNK_SIZE
        )));
    }
    Ok(())
}

/// Hash of `buffer[offset..offset + count]`, prefixed by `include_data` when given.
pub fn calculate_hash(
    provider: &dyn HashProvider,
    key: &[u8],
    buffer: &[u8],
    offset: usize,
    count: usize,
    include_data: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let data = offset
        .checked_add(count)
        .and_then(|end| buffer.get(offset..end))
        .ok_or_else(|| {
            DriveError::security(format!(
                "hash range {}+{} outside a buffer of {} bytes",
                offset,
                count,
                buffer.len()
            ))
        })?;
    match include_data {
        Some(include) => provider.calc(key, &[include, data]),
        None => provider.calc(key, &[data]),
    }
}

/// Total bytes taken by hash tags for a stream of `length` bytes.
///
/// In `Encrypt` mode `length` counts plaintext bytes; in `Decrypt` mode it
/// counts stored bytes where every chunk is preceded by `hash_offset` bytes.
pub fn total_hash_data_length(
    mode: EncryptionMode,
    length: u64,
    chunk_size: usize,
    hash_offset: usize,
    hash_length: usize,
) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    let stride = match mode {
        EncryptionMode::Decrypt => (chunk_size + hash_offset) as u64,
        EncryptionMode::Encrypt => chunk_size as u64,
    };
    let mut chunks = length / stride;
    if length % stride > hash_offset as u64 {
        chunks += 1;
    }
    chunks * hash_length as u64
}

/// Chunk size, hash key and provider for one stream.
pub struct Integrity {
    enabled: bool,
    key: Option<Zeroizing<Vec<u8>>>,
    chunk_size: usize,
    provider: Arc<dyn HashProvider>,
    hash_size: usize,
}

impl fmt::Debug for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Integrity")
            .field("enabled", &self.enabled)
            .field("chunk_size", &self.chunk_size)
            .field("hash_size", &self.hash_size)
            .finish()
    }
}

impl Integrity {
    /// Builds the engine for one stream.
    ///
    /// With `enabled` and a zero `chunk_size` the default chunk size is used.
    /// A disabled engine with a non-zero chunk size still reserves room for the
    /// tags (the layout of a stream written with integrity) but never verifies.
    pub fn new(
        enabled: bool,
        key: Option<&[u8]>,
        chunk_size: usize,
        provider: Arc<dyn HashProvider>,
    ) -> Result<Self> {
        validate_chunk_size(chunk_size)?;
        if enabled && key.is_none() {
            return Err(DriveError::security("You need a hash key to use with integrity"));
        }
        if let Some(k) = key {
            if k.len() != HASH_KEY_LENGTH {
                return Err(DriveError::security(format!(
                    "hash key must be {} bytes, got {}",
                    HASH_KEY_LENGTH,
                    k.len()
                )));
            }
        }
        let chunk_size = if enabled && chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        let hash_size = provider.hash_size();
        Ok(Self {
            enabled,
            key: key.map(|k| Zeroizing::new(k.to_vec())),
            chunk_size,
            provider,
            hash_size,
        })
    }

    pub fn hmac_sha256(enabled: bool, key: Option<&[u8]>, chunk_size: usize) -> Result<Self> {
        Self::new(enabled, key, chunk_size, Arc::new(HmacSha256Provider))
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn hash_size(&self) -> usize {
        self.hash_size
    }

    pub fn use_integrity(&self) -> bool {
        self.enabled
    }

    /// Hash tag bytes interleaved in `count` stored bytes.
    pub fn hash_data_length(&self, count: u64, hash_offset: usize) -> u64 {
        if self.chunk_size == 0 {
            return 0;
        }
        total_hash_data_length(
            EncryptionMode::Decrypt,
            count,
            self.chunk_size,
            hash_offset,
            self.hash_size,
        )
    }

    fn key(&self) -> Result<&[u8]> {
        self.key
            .as_ref()
            .map(|k| k.as_slice())
            .ok_or_else(|| DriveError::security("hash key missing"))
    }

    /// One tag per chunk of `buffer`, or `None` when integrity is off.
    pub fn generate_hashes(
        &self,
        buffer: &[u8],
        include_header_data: Option<&[u8]>,
    ) -> Result<Option<Vec<Vec<u8>>>> {
        if !self.enabled {
            return Ok(None);
        }
        let key = self.key()?;
        let mut hashes = Vec::with_capacity(buffer.len() / self.chunk_size + 1);
        let mut i = 0;
        while i < buffer.len() {
            let len = self.chunk_size.min(buffer.len() - i);
            let include = if i == 0 { include_header_data } else { None };
            hashes.push(calculate_hash(
                self.provider.as_ref(),
                key,
                buffer,
                i,
                len,
                include,
            )?);
            i += self.chunk_size;
        }
        Ok(Some(hashes))
    }

    /// Extracts the tags from stored bytes laid out as `[tag][chunk][tag][chunk]...`.
    pub fn get_hashes(&self, buffer: &[u8]) -> Option<Vec<Vec<u8>>> {
        if !self.enabled || self.chunk_size == 0 {
            return None;
        }
        let stride = self.hash_size + self.chunk_size;
        let hashes = buffer
            .chunks(stride)
            .filter(|record| record.len() >= self.hash_size)
            .map(|record| record[..self.hash_size].to_vec())
            .collect();
        Some(hashes)
    }

    /// Recomputes each chunk's tag and stops at the first mismatch.
    pub fn verify_hashes(
        &self,
        hashes: &[Vec<u8>],
        buffer: &[u8],
        include_header_data: Option<&[u8]>,
    ) -> Result<()> {
        let key = self.key()?;
        let mut chunk = 0;
        let mut i = 0;
        while i < buffer.len() {
            let len = self.chunk_size.min(buffer.len() - i);
            let include = if i == 0 { include_header_data } else { None };
            let hash = calculate_hash(self.provider.as_ref(), key, buffer, i, len, include)?;
            let expected = hashes
                .get(chunk)
                .ok_or_else(|| DriveError::integrity("Data corrupt or tampered"))?;
            if !bool::from(hash.as_slice().ct_eq(expected.as_slice())) {
                return Err(DriveError::integrity("Data corrupt or tampered"));
            }
            chunk += 1;
            i += self.chunk_size;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH_KEY: [u8; 32] = [0x17; 32];

    fn integrity(chunk_size: usize) -> Integrity {
        Integrity::hmac_sha256(true, Some(&HASH_KEY), chunk_size).unwrap()
    }

    #[test]
    fn test_chunk_size_validation() {
        assert!(Integrity::hmac_sha256(false, None, 0).is_ok());
        assert!(Integrity::hmac_sha256(false, None, 15).is_err());
        assert!(Integrity::hmac_sha256(false, None, 100).is_err());
        assert!(Integrity::hmac_sha256(false, None, MAX_CHUNK_SIZE + 16).is_err());
        assert!(Integrity::hmac_sha256(false, None, MAX_CHUNK_SIZE).is_ok());
    }

    #[test]
    fn test_default_chunk_size_when_enabled() {
        assert_eq!(integrity(0).chunk_size(), DEFAULT_CHUNK_SIZE);
        assert_eq!(Integrity::hmac_sha256(false, None, 0).unwrap().chunk_size(), 0);
    }

    #[test]
    fn test_missing_key_is_security_error() {
        let err = Integrity::hmac_sha256(true, None, 0).unwrap_err();
        assert!(matches!(err, DriveError::Security(_)));
    }

    #[test]
    fn test_generate_one_hash_per_chunk() {
        let integrity = integrity(32);
        let hashes = integrity.generate_hashes(&[7u8; 100], None).unwrap().unwrap();
        assert_eq!(hashes.len(), 4);
        assert!(hashes.iter().all(|h| h.len() == HASH_RESULT_LENGTH));
    }

    #[test]
    fn test_verify_detects_tamper() {
        let integrity = integrity(32);
        let mut data = vec![3u8; 96];
        let hashes = integrity.generate_hashes(&data, None).unwrap().unwrap();
        integrity.verify_hashes(&hashes, &data, None).unwrap();

        data[70] ^= 1;
        let err = integrity.verify_hashes(&hashes, &data, None).unwrap_err();
        assert!(matches!(err, DriveError::Integrity(_)));
        assert_eq!(err.to_string(), "Integrity error: Data corrupt or tampered");
    }

    #[test]
    fn test_header_data_covered_by_first_chunk() {
        let integrity = integrity(32);
        let data = vec![9u8; 64];
        let header = [1u8; 16];
        let hashes = integrity.generate_hashes(&data, Some(&header)).unwrap().unwrap();
        integrity.verify_hashes(&hashes, &data, Some(&header)).unwrap();

        let mut bad_header = header;
        bad_header[2] = 0;
        assert!(integrity.verify_hashes(&hashes, &data, Some(&bad_header)).is_err());
        // header is only mixed into chunk 0
        let without = integrity.generate_hashes(&data, None).unwrap().unwrap();
        assert_ne!(hashes[0], without[0]);
        assert_eq!(hashes[1], without[1]);
    }

    #[test]
    fn test_calculate_hash_rejects_bad_range() {
        let provider = HmacSha256Provider;
        let buffer = [5u8; 10];
        assert!(calculate_hash(&provider, &HASH_KEY, &buffer, 2, 8, None).is_ok());
        for (offset, count) in [(5, 10), (11, 0), (usize::MAX, 2)] {
            let err = calculate_hash(&provider, &HASH_KEY, &buffer, offset, count, None).unwrap_err();
            assert!(matches!(err, DriveError::Security(_)), "{}+{}", offset, count);
        }
    }

    #[test]
    fn test_get_hashes_from_stored_layout() {
        let integrity = integrity(32);
        let mut stored = Vec::new();
        stored.extend_from_slice(&[0xAA; 32]);
        stored.extend_from_slice(&[0u8; 32]);
        stored.extend_from_slice(&[0xBB; 32]);
        stored.extend_from_slice(&[0u8; 5]);
        let hashes = integrity.get_hashes(&stored).unwrap();
        assert_eq!(hashes, vec![vec![0xAA; 32], vec![0xBB; 32]]);
    }

    #[test]
    fn test_total_hash_data_length() {
        // 3 full chunks and a partial one of plaintext
        assert_eq!(total_hash_data_length(EncryptionMode::Encrypt, 100, 32, 0, 32), 4 * 32);
        assert_eq!(total_hash_data_length(EncryptionMode::Encrypt, 96, 32, 0, 32), 3 * 32);
        // stored: 3 * (32 + 32) + (32 + 4)
        assert_eq!(total_hash_data_length(EncryptionMode::Decrypt, 228, 32, 32, 32), 4 * 32);
        assert_eq!(total_hash_data_length(EncryptionMode::Decrypt, 192, 32, 32, 32), 3 * 32);
        assert_eq!(total_hash_data_length(EncryptionMode::Decrypt, 10, 0, 32, 32), 0);
    }

    #[test]
    fn test_disabled_generates_nothing() {
        let integrity = Integrity::hmac_sha256(false, None, 32).unwrap();
        assert!(integrity.generate_hashes(&[1u8; 64], None).unwrap().is_none());
        assert!(integrity.get_hashes(&[1u8; 64]).is_none());
        assert_eq!(integrity.hash_data_length(128, 32), 64);
    }
}
