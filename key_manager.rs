//! Drive key generation and secure storage.
//!
//! This module provides [`KeyManager`] for generating, loading, and handing out
//! the drive's key material: a 256-bit AES key and a separate 256-bit HMAC key,
//! stored together in one 64-byte key file.
//!
//! ## Security Features
//!
//! - Keys are zeroized on drop (via `Zeroize` trait)
//! - Unix file permissions set to 0600 (owner read/write only)
//! - Cryptographically secure random generation via `OsRng`

use crate::integrity::HASH_KEY_LENGTH;
use crate::transform::KEY_LENGTH;
use anyhow::{bail, Context, Result};
use rand_core::OsRng;
use rand_core::RngCore;
use std::fmt;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};
use zeroize::Zeroize;

/// Size of the key file: encryption key followed by the hash key
pub const KEY_FILE_LENGTH: usize = KEY_LENGTH + HASH_KEY_LENGTH;

/// Encryption key plus integrity key of one drive.
#[derive(Clone)]
pub struct DriveKey {
    key: [u8; KEY_LENGTH],
    hash_key: [u8; HASH_KEY_LENGTH],
}

impl Drop for DriveKey {
    fn drop(&mut self) {
        self.key.zeroize();
        self.hash_key.zeroize();
    }
}

impl fmt::Debug for DriveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DriveKey([REDACTED])")
    }
}

impl DriveKey {
    pub fn new(key: [u8; KEY_LENGTH], hash_key: [u8; HASH_KEY_LENGTH]) -> Self {
        Self { key, hash_key }
    }

    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        let mut hash_key = [0u8; HASH_KEY_LENGTH];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut hash_key);
        Self { key, hash_key }
    }

    /// Splits the raw contents of a key file.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != KEY_FILE_LENGTH {
            return None;
        }
        let mut key = [0u8; KEY_LENGTH];
        let mut hash_key = [0u8; HASH_KEY_LENGTH];
        key.copy_from_slice(&data[..KEY_LENGTH]);
        hash_key.copy_from_slice(&data[KEY_LENGTH..]);
        Some(Self { key, hash_key })
    }

    fn to_bytes(&self) -> [u8; KEY_FILE_LENGTH] {
        let mut out = [0u8; KEY_FILE_LENGTH];
        out[..KEY_LENGTH].copy_from_slice(&self.key);
        out[KEY_LENGTH..].copy_from_slice(&self.hash_key);
        out
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn hash_key(&self) -> &[u8] {
        &self.hash_key
    }
}

/// Handles key generation and persistence.
/// In production: derive the keys from a password or use an OS keyring.
pub struct KeyManager {
    drive_key: DriveKey,
}

impl KeyManager {
    pub async fn new(cfg: &crate::config::Config) -> Result<Self> {
        Self::load_or_generate(Path::new(&cfg.key_path)).await
    }

    pub async fn load_or_generate(path: &Path) -> Result<Self> {
        let drive_key = if fs::try_exists(path)
            .await
            .with_context(|| format!("checking existence of {}", path.display()))?
        {
            info!(path = %path.display(), "loading existing drive key");
            let mut data = fs::read(path)
                .await
                .with_context(|| format!("reading key from {}", path.display()))?;
            let parsed = DriveKey::from_bytes(&data);
            let found_bytes = data.len();
            data.zeroize();
            match parsed {
                Some(key) => key,
                None => {
                    warn!(path = %path.display(), found_bytes, "invalid key size");
                    bail!(
                        "expected {}-byte key file at {} but found {} bytes",
                        KEY_FILE_LENGTH,
                        path.display(),
                        found_bytes
                    );
                }
            }
        } else {
            info!(path = %path.display(), "generating new drive key");
            let key = DriveKey::generate();
            write_key_file(path, &key).await?;
            key
        };

        Ok(Self { drive_key })
    }

    pub fn drive_key(&self) -> DriveKey {
        self.drive_key.clone()
    }
}

async fn write_key_file(path: &Path, key: &DriveKey) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating key directory {}", parent.display()))?;
        }
    }

    // Write with restrictive permissions using spawn_blocking for Unix
    #[cfg(unix)]
    {
        let path_buf = path.to_path_buf();
        let bytes = key.to_bytes();
        tokio::task::spawn_blocking(move || {
            use std::fs::OpenOptions;
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;

            let mut bytes = bytes;
            let mut f = OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path_buf)?;
            let written = f.write_all(&bytes);
            bytes.zeroize();
            written?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
    }
    #[cfg(not(unix))]
    {
        let mut bytes = key.to_bytes();
        let written = fs::write(path, &bytes).await;
        bytes.zeroize();
        written?;
    }
    Ok(())
}
