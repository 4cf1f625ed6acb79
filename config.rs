//! Configuration management with environment variable support.
//!
//! This module provides [`Config`] for loading and validating aesdrive settings
//! from JSON files and environment variables.
//!
//! ## Environment Variables
//!
//! - `AESDRIVE_KEY_PATH`: Override drive key file path
//! - `AESDRIVE_DRIVE_DIR`: Override drive directory path
//! - `AESDRIVE_SEQUENCE_PATH`: Override nonce sequence table path
//! - `AESDRIVE_THREADS`: Override worker thread count
//! - `AESDRIVE_CONFIG`: Override config file path

use crate::encryptor::DEFAULT_BUFFER_SIZE;
use crate::integrity::{validate_chunk_size, DEFAULT_CHUNK_SIZE};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Environment variable names for configuration overrides
pub const ENV_KEY_PATH: &str = "AESDRIVE_KEY_PATH";
pub const ENV_DRIVE_DIR: &str = "AESDRIVE_DRIVE_DIR";
pub const ENV_SEQUENCE_PATH: &str = "AESDRIVE_SEQUENCE_PATH";
pub const ENV_THREADS: &str = "AESDRIVE_THREADS";
pub const ENV_CONFIG_PATH: &str = "AESDRIVE_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub key_path: String,
    pub drive_dir: String,
    pub sequence_path: String,
    pub threads: usize,
    pub buffer_size: usize,
    /// Bytes per integrity chunk; 0 turns integrity off
    pub chunk_size: usize,
    pub integrity: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key_path: "./aesdrive.key".to_string(),
            drive_dir: "./drive".to_string(),
            sequence_path: "./sequences.json".to_string(),
            threads: 1,
            buffer_size: DEFAULT_BUFFER_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            integrity: true,
        }
    }
}

impl Config {
    /// Load config from file path
    pub fn load(path: &str) -> Result<Self> {
        let s =
            fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
        let mut config: Config = serde_json::from_str(&s)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config with environment variable overrides
    /// Priority: ENV vars > config file > defaults
    pub fn load_with_env(path: Option<&str>) -> Result<Self> {
        let config_path = path
            .map(String::from)
            .or_else(|| env::var(ENV_CONFIG_PATH).ok());

        let mut config = match config_path {
            Some(ref p) if Path::new(p).exists() => {
                info!(path = p, "loading config from file");
                let s = fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p))?;
                serde_json::from_str(&s)?
            }
            _ => {
                debug!("using default configuration");
                Config::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(key_path) = env::var(ENV_KEY_PATH) {
            debug!(key_path = %key_path, "overriding key_path from environment");
            self.key_path = key_path;
        }

        if let Ok(drive_dir) = env::var(ENV_DRIVE_DIR) {
            debug!(drive_dir = %drive_dir, "overriding drive_dir from environment");
            self.drive_dir = drive_dir;
        }

        if let Ok(sequence_path) = env::var(ENV_SEQUENCE_PATH) {
            debug!(sequence_path = %sequence_path, "overriding sequence_path from environment");
            self.sequence_path = sequence_path;
        }

        if let Ok(threads) = env::var(ENV_THREADS) {
            self.threads = threads
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number, got {:?}", ENV_THREADS, threads))?;
            debug!(threads = self.threads, "overriding threads from environment");
        }
        Ok(())
    }

    /// Whether new files carry integrity tags.
    pub fn use_integrity(&self) -> bool {
        self.integrity && self.chunk_size > 0
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.key_path.trim().is_empty() {
            anyhow::bail!("key_path cannot be empty");
        }
        if self.drive_dir.trim().is_empty() {
            anyhow::bail!("drive_dir cannot be empty");
        }
        if self.sequence_path.trim().is_empty() {
            anyhow::bail!("sequence_path cannot be empty");
        }
        if self.threads == 0 {
            anyhow::bail!("threads must be at least 1");
        }
        validate_chunk_size(self.chunk_size)?;

        // Warn if key path looks like it might be in a public directory
        let key_path = Path::new(&self.key_path);
        if let Some(parent) = key_path.parent() {
            let parent_str = parent.to_string_lossy().to_lowercase();
            if parent_str.contains("public")
                || parent_str.contains("www")
                || parent_str.contains("htdocs")
            {
                warn!(
                    path = %self.key_path,
                    "key file path appears to be in a public directory - this is a security risk"
                );
            }
        }

        if self.key_path.contains("..") {
            warn!("key_path contains '..' - consider using absolute paths");
        }

        Ok(())
    }

    /// Create a new config with explicit paths and default tuning
    pub fn new(
        key_path: impl Into<String>,
        drive_dir: impl Into<String>,
        sequence_path: impl Into<String>,
    ) -> Self {
        Self {
            key_path: key_path.into(),
            drive_dir: drive_dir.into(),
            sequence_path: sequence_path.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_validate() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.threads, 1);
        assert_eq!(cfg.chunk_size, 256 * 1024);
        assert!(cfg.use_integrity());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"drive_dir": "/tmp/d", "threads": 4}"#).unwrap();
        let cfg = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.drive_dir, "/tmp/d");
        assert_eq!(cfg.threads, 4);
        assert_eq!(cfg.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.threads = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.chunk_size = 1000;
        assert!(cfg.validate().is_err());

        let cfg = Config::new("", "d", "s");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_chunk_disables_integrity() {
        let mut cfg = Config::default();
        cfg.chunk_size = 0;
        cfg.validate().unwrap();
        assert!(!cfg.use_integrity());
    }
}
