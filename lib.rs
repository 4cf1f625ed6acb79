//! # aesdrive - Encrypted Drive Storage Library
//!
//! aesdrive stores files in AES-256-CTR with optional per-chunk HMAC-SHA256
//! integrity tags, and coordinates nonces across every device that writes to
//! the same drive so no nonce is ever used twice under one key.
//!
//! ## Features
//!
//! - **AES-256-CTR streams**: Random-access reads and writes over any `Read + Write + Seek`
//! - **Integrity**: HMAC-SHA256 tag per chunk, header bound into the first tag
//! - **Nonce sequencer**: Persistent, lock-protected per-device nonce ranges
//! - **Device authorization**: Split a nonce range and hand half to a new device
//! - **Parallel import/export**: Disjoint parts of one file on a worker pool
//!
//! ## Quick Start
//!
//! ```no_run
//! use aesdrive::{config::Config, storagefile_ops::DriveOps};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cfg = Config::new("./drive.key", "./drive", "./sequences.json");
//!     let ops = DriveOps::create(&cfg).await?;
//!
//!     // Encrypt data
//!     ops.write_encrypted("secret.txt", b"sensitive data".to_vec()).await?;
//!
//!     // Decrypt data
//!     let data = ops.read_encrypted("secret.txt").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## File Format
//!
//! - **Headered**: `"AVF" | version | nonce (8) | chunk size (4, BE)` followed by
//!   `[tag (32)] chunk` records, tags only when the chunk size is non-zero
//! - **Generic**: bare ciphertext, nonce kept by the caller

pub mod auth;
pub mod commander;
pub mod config;
pub mod drive;
pub mod encryptor;
pub mod error;
pub mod file;
pub mod header;
pub mod integrity;
pub mod key_manager;
pub mod nonce;
pub mod sequence;
pub mod storagefile_ops;
pub mod streaming;
pub mod transform;

// Re-export common types for convenience
pub use drive::{AesFile, Drive};
pub use error::DriveError;
pub use streaming::AesStream;
