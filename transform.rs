//! AES-256 CTR block transformer.
//!
//! The 16-byte counter block is `nonce (8 bytes) || block index (8 bytes, BE)`.
//! Block `i` covers plaintext offsets `16*i .. 16*i + 16`, so the keystream at
//! any offset can be computed directly: this is what makes streams seekable and
//! lets parallel workers encrypt disjoint ranges of the same file.
//!
//! Encryption and decryption are the same XOR with the keystream.

use crate::error::{DriveError, Result};
use crate::nonce::{Nonce, NONCE_LENGTH};
use aes::{Aes256, Block};
use cipher::{BlockEncrypt, KeyInit};
use std::fmt;
use std::sync::Arc;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// AES-256 key length in bytes
pub const KEY_LENGTH: usize = 32;

/// Counter blocks encrypted per batch when the data is block aligned
const KEYSTREAM_BATCH_BLOCKS: usize = 256;

/// A CTR keystream transformer bound to one key and nonce.
///
/// Instances are owned by exactly one stream and never shared between threads.
pub trait CtrTransformer: Send {
    /// Sets the key and nonce and resets the counter to block 0.
    fn init(&mut self, key: &[u8], nonce: &[u8]) -> Result<()>;

    /// Moves the counter to the block holding `position`.
    fn sync_counter(&mut self, position: u64) -> Result<()>;

    /// Transforms `count` bytes from `src[src_offset..]` into `dest[dest_offset..]`.
    fn transform(
        &mut self,
        src: &[u8],
        src_offset: usize,
        dest: &mut [u8],
        dest_offset: usize,
        count: usize,
    ) -> Result<usize>;

    /// Block index the next transformed byte falls in.
    fn block(&self) -> u64;

    fn nonce(&self) -> Option<Nonce>;

    fn reset_counter(&mut self) -> Result<()> {
        self.sync_counter(0)
    }

    fn encrypt_data(&mut self, src: &[u8], dest: &mut [u8]) -> Result<usize> {
        let count = src.len().min(dest.len());
        self.transform(src, 0, dest, 0, count)
    }

    fn decrypt_data(&mut self, src: &[u8], dest: &mut [u8]) -> Result<usize> {
        let count = src.len().min(dest.len());
        self.transform(src, 0, dest, 0, count)
    }
}

/// Strategy that builds a fresh transformer for every stream.
///
/// The stream codec receives the provider at construction time, so backends
/// are chosen by the caller rather than by process-wide state.
pub trait TransformerProvider: Send + Sync + fmt::Debug {
    fn create(&self) -> Box<dyn CtrTransformer>;

    fn name(&self) -> &'static str;
}

/// AES-256 from the `aes` crate; uses AES-NI when the CPU supports it and a
/// constant-time software implementation otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesProvider;

impl TransformerProvider for AesProvider {
    fn create(&self) -> Box<dyn CtrTransformer> {
        Box::new(AesCtrTransformer::new())
    }

    fn name(&self) -> &'static str {
        "aes"
    }
}

pub fn default_provider() -> Arc<dyn TransformerProvider> {
    Arc::new(AesProvider)
}

#[derive(Default)]
pub struct AesCtrTransformer {
    cipher: Option<Aes256>,
    nonce: Option<Nonce>,
    block: u64,
    /// Bytes of the current block already consumed, `BLOCK_SIZE` means exhausted
    block_offset: usize,
}

impl fmt::Debug for AesCtrTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesCtrTransformer")
            .field("initialized", &self.cipher.is_some())
            .field("block", &self.block)
            .field("block_offset", &self.block_offset)
            .finish()
    }
}

impl AesCtrTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter_block(nonce: &Nonce, block: u64) -> Block {
        let mut counter = Block::default();
        counter[..NONCE_LENGTH].copy_from_slice(nonce);
        counter[NONCE_LENGTH..].copy_from_slice(&block.to_be_bytes());
        counter
    }

    fn advance_block(&mut self) -> Result<()> {
        self.block = self
            .block
            .checked_add(1)
            .ok_or_else(|| DriveError::range_exceeded("Current CTR max blocks exceeded"))?;
        self.block_offset = 0;
        Ok(())
    }
}

impl CtrTransformer for AesCtrTransformer {
    fn init(&mut self, key: &[u8], nonce: &[u8]) -> Result<()> {
        if key.len() != KEY_LENGTH {
            return Err(DriveError::security(format!(
                "key must be {} bytes, got {}",
                KEY_LENGTH,
                key.len()
            )));
        }
        if nonce.len() != NONCE_LENGTH {
            return Err(DriveError::security(format!(
                "nonce must be {} bytes, got {}",
                NONCE_LENGTH,
                nonce.len()
            )));
        }
        let cipher = Aes256::new_from_slice(key)
            .map_err(|_| DriveError::security("invalid AES-256 key"))?;
        let mut n = [0u8; NONCE_LENGTH];
        n.copy_from_slice(nonce);
        self.cipher = Some(cipher);
        self.nonce = Some(n);
        self.reset_counter()
    }

    fn sync_counter(&mut self, position: u64) -> Result<()> {
        if self.nonce.is_none() {
            return Err(DriveError::security("No counter, run init first"));
        }
        self.block = position / BLOCK_SIZE as u64;
        self.block_offset = (position % BLOCK_SIZE as u64) as usize;
        Ok(())
    }

    fn transform(
        &mut self,
        src: &[u8],
        src_offset: usize,
        dest: &mut [u8],
        dest_offset: usize,
        count: usize,
    ) -> Result<usize> {
        let (cipher, nonce) = match (&self.cipher, self.nonce) {
            (Some(cipher), Some(nonce)) => (cipher.clone(), nonce),
            _ => return Err(DriveError::security("Transformer not initialized, key or nonce missing")),
        };
        if src_offset + count > src.len() || dest_offset + count > dest.len() {
            return Err(DriveError::security("buffer too small for transform"));
        }

        let mut done = 0;
        let mut batch: Vec<Block> = Vec::new();
        while done < count {
            if self.block_offset == BLOCK_SIZE {
                self.advance_block()?;
            }

            let remaining = count - done;
            if self.block_offset == 0 && remaining >= BLOCK_SIZE {
                // whole blocks, encrypt the counters in one batch
                let blocks = (remaining / BLOCK_SIZE).min(KEYSTREAM_BATCH_BLOCKS);
                let last_block = self
                    .block
                    .checked_add(blocks as u64 - 1)
                    .ok_or_else(|| DriveError::range_exceeded("Current CTR max blocks exceeded"))?;
                batch.clear();
                batch.extend((self.block..=last_block).map(|b| Self::counter_block(&nonce, b)));
                cipher.encrypt_blocks(&mut batch);
                for (i, keystream) in batch.iter().enumerate() {
                    let s = src_offset + done + i * BLOCK_SIZE;
                    let d = dest_offset + done + i * BLOCK_SIZE;
                    for k in 0..BLOCK_SIZE {
                        dest[d + k] = src[s + k] ^ keystream[k];
                    }
                }
                done += blocks * BLOCK_SIZE;
                self.block = last_block;
                self.block_offset = BLOCK_SIZE;
                continue;
            }

            let mut keystream = Self::counter_block(&nonce, self.block);
            cipher.encrypt_block(&mut keystream);
            let len = (BLOCK_SIZE - self.block_offset).min(remaining);
            for k in 0..len {
                dest[dest_offset + done + k] =
                    src[src_offset + done + k] ^ keystream[self.block_offset + k];
            }
            done += len;
            self.block_offset += len;
        }
        Ok(done)
    }

    fn block(&self) -> u64 {
        if self.block_offset == BLOCK_SIZE {
            self.block.saturating_add(1)
        } else {
            self.block
        }
    }

    fn nonce(&self) -> Option<Nonce> {
        self.nonce
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];
    const NONCE: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];

    fn transformer() -> AesCtrTransformer {
        let mut t = AesCtrTransformer::new();
        t.init(&KEY, &NONCE).unwrap();
        t
    }

    fn encrypt_all(data: &[u8]) -> Vec<u8> {
        let mut t = transformer();
        let mut out = vec![0u8; data.len()];
        t.encrypt_data(data, &mut out).unwrap();
        out
    }

    #[test]
    fn test_round_trip() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let enc = encrypt_all(&data);
        assert_ne!(enc, data);

        let mut t = transformer();
        let mut dec = vec![0u8; enc.len()];
        t.decrypt_data(&enc, &mut dec).unwrap();
        assert_eq!(dec, data);
    }

    #[test]
    fn test_random_access_matches_sequential() {
        let data = vec![0xA5u8; 200];
        let full = encrypt_all(&data);

        // unaligned offset in the middle of block 3
        let mut t = transformer();
        t.sync_counter(53).unwrap();
        assert_eq!(t.block(), 3);
        let mut part = vec![0u8; 100];
        t.transform(&data, 53, &mut part, 0, 100).unwrap();
        assert_eq!(&part[..], &full[53..153]);
    }

    #[test]
    fn test_split_calls_match_single_call() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i * 7) as u8).collect();
        let full = encrypt_all(&data);

        let mut t = transformer();
        let mut out = vec![0u8; data.len()];
        let mut pos = 0;
        for step in [3usize, 13, 16, 700, 1, 4267] {
            t.transform(&data, pos, &mut out, pos, step).unwrap();
            pos += step;
        }
        assert_eq!(pos, data.len());
        assert_eq!(out, full);
    }

    #[test]
    fn test_counter_layout() {
        let counter = AesCtrTransformer::counter_block(&NONCE, 0x0102);
        assert_eq!(&counter[..8], &NONCE);
        assert_eq!(&counter[8..], &[0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_uninitialized_fails() {
        let mut t = AesCtrTransformer::new();
        let mut out = [0u8; 4];
        let err = t.transform(&[1, 2, 3, 4], 0, &mut out, 0, 4).unwrap_err();
        assert!(matches!(err, DriveError::Security(_)));
        assert!(matches!(t.sync_counter(0), Err(DriveError::Security(_))));
    }

    #[test]
    fn test_bad_key_length() {
        let mut t = AesCtrTransformer::new();
        assert!(matches!(t.init(&[0u8; 16], &NONCE), Err(DriveError::Security(_))));
        assert!(matches!(t.init(&KEY, &[0u8; 12]), Err(DriveError::Security(_))));
    }

    #[test]
    fn test_counter_overflow() {
        let mut t = transformer();
        t.sync_counter(u64::MAX - 15).unwrap();
        assert_eq!(t.block(), u64::MAX / 16);
        let data = [0u8; 32];
        let mut out = [0u8; 32];
        // the block index tops out well before u64::MAX bytes, so this stays in range
        assert!(t.transform(&data, 0, &mut out, 0, 15).is_ok());

        let mut t = transformer();
        t.block = u64::MAX;
        t.block_offset = 0;
        let err = t.transform(&data, 0, &mut out, 0, 32).unwrap_err();
        assert!(matches!(err, DriveError::RangeExceeded(_)));
    }

    #[test]
    fn test_different_nonce_different_keystream() {
        let data = [0u8; 64];
        let a = encrypt_all(&data);
        let mut t = AesCtrTransformer::new();
        t.init(&KEY, &[9u8; 8]).unwrap();
        let mut b = [0u8; 64];
        t.encrypt_data(&data, &mut b).unwrap();
        assert_ne!(&a[..], &b[..]);
    }
}
