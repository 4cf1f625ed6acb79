//! Stream header: `[magic:3][version:1][nonce:8][chunk_size:4 BE]`.
//!
//! The header is written once at the start of a headered stream. Its bytes are
//! also fed into the first chunk's hash so header tampering is detected.

use crate::error::{DriveError, Result};
use crate::nonce::{Nonce, NONCE_LENGTH};
use std::io::{ErrorKind, Read, Write};

pub const MAGIC: [u8; 3] = *b"AVF";
pub const MAGIC_LENGTH: usize = 3;
pub const VERSION: u8 = 2;
pub const VERSION_LENGTH: usize = 1;
pub const CHUNK_SIZE_LENGTH: usize = 4;
pub const HEADER_LENGTH: usize = MAGIC_LENGTH + VERSION_LENGTH + NONCE_LENGTH + CHUNK_SIZE_LENGTH;

/// Direction of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    Encrypt,
    Decrypt,
}

/// Whether a stream carries a [`Header`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionFormat {
    /// Header present, nonce and chunk size travel with the data
    #[default]
    Headered,
    /// Raw ciphertext, nonce supplied by the caller, never integrity protected
    Generic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; MAGIC_LENGTH],
    pub version: u8,
    pub nonce: Nonce,
    pub chunk_size: u32,
}

impl Header {
    pub fn new(nonce: Nonce, chunk_size: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            nonce,
            chunk_size,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LENGTH] {
        let mut bytes = [0u8; HEADER_LENGTH];
        bytes[..MAGIC_LENGTH].copy_from_slice(&self.magic);
        bytes[MAGIC_LENGTH] = self.version;
        let nonce_start = MAGIC_LENGTH + VERSION_LENGTH;
        bytes[nonce_start..nonce_start + NONCE_LENGTH].copy_from_slice(&self.nonce);
        bytes[nonce_start + NONCE_LENGTH..].copy_from_slice(&self.chunk_size.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LENGTH {
            return Err(DriveError::format(format!(
                "header too short: {} bytes (expected {})",
                bytes.len(),
                HEADER_LENGTH
            )));
        }
        let mut magic = [0u8; MAGIC_LENGTH];
        magic.copy_from_slice(&bytes[..MAGIC_LENGTH]);
        if magic != MAGIC {
            return Err(DriveError::format("bad magic, not an encrypted stream"));
        }
        let version = bytes[MAGIC_LENGTH];
        if version != VERSION {
            return Err(DriveError::format(format!(
                "unsupported stream version: {}",
                version
            )));
        }
        let nonce_start = MAGIC_LENGTH + VERSION_LENGTH;
        let mut nonce = [0u8; NONCE_LENGTH];
        nonce.copy_from_slice(&bytes[nonce_start..nonce_start + NONCE_LENGTH]);
        let mut chunk = [0u8; CHUNK_SIZE_LENGTH];
        chunk.copy_from_slice(&bytes[nonce_start + NONCE_LENGTH..HEADER_LENGTH]);
        Ok(Self {
            magic,
            version,
            nonce,
            chunk_size: u32::from_be_bytes(chunk),
        })
    }

    /// Reads the raw header bytes from the current position of `reader`.
    pub fn read_bytes<R: Read>(reader: &mut R) -> Result<[u8; HEADER_LENGTH]> {
        let mut bytes = [0u8; HEADER_LENGTH];
        reader.read_exact(&mut bytes).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                DriveError::format("stream ended before the header")
            } else {
                DriveError::from(e)
            }
        })?;
        Ok(bytes)
    }

    /// Reads a header from the current position of `reader`.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Self::from_bytes(&Self::read_bytes(reader)?)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_layout() {
        let header = Header::new([1, 2, 3, 4, 5, 6, 7, 8], 0x0004_0000);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..3], b"AVF");
        assert_eq!(bytes[3], VERSION);
        assert_eq!(&bytes[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[12..], &[0, 4, 0, 0]);
        assert_eq!(Header::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = Header::new([0; 8], 0).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(Header::from_bytes(&bytes), Err(DriveError::Format(_))));
    }

    #[test]
    fn test_truncated_stream() {
        let mut reader = Cursor::new(vec![b'A', b'V']);
        assert!(matches!(Header::read_from(&mut reader), Err(DriveError::Format(_))));
    }
}
