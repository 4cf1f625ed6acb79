//! Nonce arithmetic.
//!
//! Nonces are 8-byte big-endian integers. A drive's nonce space starts at
//! [`STARTING_NONCE`] and ends at [`MAX_NONCE`]; authorization splits the
//! remaining space of one device in two.

use crate::error::{DriveError, Result};
use rand_core::{OsRng, RngCore};

/// Nonce length in bytes
pub const NONCE_LENGTH: usize = 8;

pub type Nonce = [u8; NONCE_LENGTH];

/// First nonce of a freshly created drive
pub const STARTING_NONCE: Nonce = [0u8; NONCE_LENGTH];

/// Upper bound of a freshly created drive
pub const MAX_NONCE: Nonce = [0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

pub fn to_u64(nonce: &Nonce) -> u64 {
    u64::from_be_bytes(*nonce)
}

pub fn from_u64(value: u64) -> Nonce {
    value.to_be_bytes()
}

/// Converts a byte slice of exactly [`NONCE_LENGTH`] bytes.
pub fn from_slice(bytes: &[u8]) -> Result<Nonce> {
    bytes.try_into().map_err(|_| {
        DriveError::security(format!(
            "nonce must be {} bytes, got {}",
            NONCE_LENGTH,
            bytes.len()
        ))
    })
}

/// Returns `nonce + 1`, failing if that would pass `max_nonce`.
pub fn increase_nonce(nonce: &Nonce, max_nonce: &Nonce) -> Result<Nonce> {
    let value = to_u64(nonce);
    let max = to_u64(max_nonce);
    match value.checked_add(1) {
        Some(next) if next <= max => Ok(from_u64(next)),
        _ => Err(DriveError::range_exceeded("Cannot increase nonce, maximum nonce exceeded")),
    }
}

/// Midpoint of `[start, max]`.
///
/// The device keeping `[start, pivot]` and the device receiving `[pivot, max]`
/// can never issue the same nonce since a sequence never hands out its max.
pub fn split_nonce_range(start: &Nonce, max: &Nonce) -> Result<Nonce> {
    let low = to_u64(start);
    let high = to_u64(max);
    if high < low || high - low < 2 {
        return Err(DriveError::sequence(
            "Not enough nonces left to split the range",
        ));
    }
    Ok(from_u64(low + (high - low) / 2))
}

/// Random 16-byte identifier for drives and devices.
pub fn random_id() -> [u8; 16] {
    let mut id = [0u8; 16];
    OsRng.fill_bytes(&mut id);
    id
}
