//! High-level drive operations.
//!
//! This module provides [`DriveOps`], the async interface used by the CLI.
//! The core is blocking (files, rayon pools, the sequencer lock), so every call
//! runs on tokio's blocking pool.
//!
//! ## Features
//!
//! - Drive creation and opening from a [`Config`]
//! - Parallel batch import and export with progress reporting
//! - Whole-buffer reads and writes for small files
//! - Device authorization export, import and revocation

use crate::auth::{self, AuthConfig};
use crate::commander::{BatchCallbacks, BatchOptions, BatchProgress, FileCommander};
use crate::config::Config;
use crate::drive::{parse_auth_id, Drive};
use crate::error::DriveError;
use crate::file::{LocalFile, RealFile};
use crate::key_manager::KeyManager;
use crate::sequence::{FileSequencer, NonceSequencer, NonceSequence};
use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::task;
use tracing::{debug, error, info, warn};

pub type ProgressCallback = Arc<dyn Fn(&BatchProgress<'_>) + Send + Sync>;

/// Outcome of a batch transfer.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Names of the files written
    pub done: Vec<String>,
    /// Source name and error message of every skipped file
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct DriveStatus {
    pub root: PathBuf,
    pub drive_id: String,
    pub auth_id: String,
    pub sequence: Option<NonceSequence>,
    pub files: usize,
    pub total_size: u64,
}

impl DriveStatus {
    pub fn is_authorized(&self) -> bool {
        self.sequence
            .as_ref()
            .map(|s| s.status == crate::sequence::SequenceStatus::Active)
            .unwrap_or(false)
    }
}

pub struct DriveOps {
    drive: Arc<RwLock<Drive>>,
    commander: Arc<FileCommander>,
}

fn open_sequencer(cfg: &Config) -> Result<Arc<dyn NonceSequencer>> {
    let path = Path::new(&cfg.sequence_path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating sequence directory {}", parent.display()))?;
        }
    }
    let sequencer = FileSequencer::json(path)
        .with_context(|| format!("opening sequence table {}", path.display()))?;
    Ok(Arc::new(sequencer))
}

impl DriveOps {
    fn from_drive(mut drive: Drive, cfg: &Config) -> Result<Self> {
        drive.set_integrity(cfg.use_integrity(), cfg.chunk_size)?;
        Ok(Self {
            drive: Arc::new(RwLock::new(drive)),
            commander: Arc::new(FileCommander::new(cfg.threads, cfg.buffer_size)?),
        })
    }

    /// Creates a new drive, generating the key file when it does not exist.
    pub async fn create(cfg: &Config) -> Result<Self> {
        let km = KeyManager::new(cfg).await?;
        let sequencer = open_sequencer(cfg)?;
        let root = PathBuf::from(&cfg.drive_dir);
        let key = km.drive_key();
        let drive = task::spawn_blocking(move || Drive::create(root, key, sequencer)).await??;
        info!(drive_id = %drive.drive_id_hex(), "drive initialized");
        Self::from_drive(drive, cfg)
    }

    /// Opens an existing drive with an existing key.
    pub async fn open(cfg: &Config) -> Result<Self> {
        if !fs::try_exists(&cfg.key_path).await.unwrap_or(false) {
            anyhow::bail!("key file '{}' not found", cfg.key_path);
        }
        let km = KeyManager::new(cfg).await?;
        let sequencer = open_sequencer(cfg)?;
        let root = PathBuf::from(&cfg.drive_dir);
        let key = km.drive_key();
        let drive = task::spawn_blocking(move || Drive::open(root, key, sequencer))
            .await?
            .with_context(|| format!("opening drive at {}", cfg.drive_dir))?;
        debug!(drive_id = %drive.drive_id_hex(), "drive opened");
        Self::from_drive(drive, cfg)
    }

    /// Runs `f` against the drive on the blocking pool.
    async fn with_drive<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Drive) -> crate::error::Result<T> + Send + 'static,
    {
        let drive = Arc::clone(&self.drive);
        Ok(task::spawn_blocking(move || f(&drive.read())).await??)
    }

    pub async fn drive_id(&self) -> String {
        self.drive.read().drive_id_hex()
    }

    pub async fn auth_id(&self) -> String {
        self.drive.read().auth_id_hex()
    }

    /// Stops the running batch after the current buffer of every worker.
    pub fn cancel(&self) {
        warn!("cancelling running transfer");
        self.commander.cancel();
    }

    pub async fn import_files(
        &self,
        paths: Vec<PathBuf>,
        options: BatchOptions,
        on_progress: Option<ProgressCallback>,
    ) -> Result<BatchReport> {
        let drive = Arc::clone(&self.drive);
        let commander = Arc::clone(&self.commander);
        let report = task::spawn_blocking(move || -> crate::error::Result<BatchReport> {
            let files: Vec<Box<dyn RealFile>> = paths
                .into_iter()
                .map(|p| Box::new(LocalFile::new(p)) as Box<dyn RealFile>)
                .collect();
            let failed = Mutex::new(Vec::new());
            let on_failed =
                |name: &str, e: &DriveError| failed.lock().push((name.to_string(), e.to_string()));
            let progress = |p: &BatchProgress<'_>| {
                if let Some(cb) = &on_progress {
                    cb(p);
                }
            };
            let drive = drive.read();
            let imported = commander.import_files(
                &drive,
                &files,
                options,
                BatchCallbacks {
                    on_progress: Some(&progress),
                    on_failed: Some(&on_failed),
                    rename: None,
                },
            )?;
            Ok(BatchReport {
                done: imported.iter().map(|f| f.name()).collect(),
                failed: failed.into_inner(),
            })
        })
        .await??;

        info!(
            imported = report.done.len(),
            failed = report.failed.len(),
            "import finished"
        );
        Ok(report)
    }

    /// Decrypts the named drive files into `out_dir`.
    pub async fn export_files(
        &self,
        names: Vec<String>,
        out_dir: PathBuf,
        options: BatchOptions,
        on_progress: Option<ProgressCallback>,
    ) -> Result<BatchReport> {
        fs::create_dir_all(&out_dir)
            .await
            .with_context(|| format!("creating output directory {}", out_dir.display()))?;
        let drive = Arc::clone(&self.drive);
        let commander = Arc::clone(&self.commander);
        let report = task::spawn_blocking(move || -> crate::error::Result<BatchReport> {
            let drive = drive.read();
            let mut failed = Vec::new();
            let mut files = Vec::with_capacity(names.len());
            for name in names {
                match drive.file(&name) {
                    Ok(file) if file.exists() => files.push(file),
                    Ok(_) => {
                        error!(file = %name, "file not found in drive");
                        failed.push((name, "not found".to_string()));
                    }
                    Err(e) => {
                        error!(file = %name, error = %e, "rejected file name");
                        failed.push((name, e.to_string()));
                    }
                }
            }

            let failed = Mutex::new(failed);
            let on_failed =
                |name: &str, e: &DriveError| failed.lock().push((name.to_string(), e.to_string()));
            let progress = |p: &BatchProgress<'_>| {
                if let Some(cb) = &on_progress {
                    cb(p);
                }
            };
            let target_dir = LocalFile::new(out_dir);
            let exported = commander.export_files(
                &files,
                &target_dir,
                options,
                BatchCallbacks {
                    on_progress: Some(&progress),
                    on_failed: Some(&on_failed),
                    rename: None,
                },
            )?;
            Ok(BatchReport {
                done: exported.iter().map(|f| f.name()).collect(),
                failed: failed.into_inner(),
            })
        })
        .await??;

        info!(
            exported = report.done.len(),
            failed = report.failed.len(),
            "export finished"
        );
        Ok(report)
    }

    /// Encrypts a whole buffer into a new drive file.
    pub async fn write_encrypted(&self, name: &str, data: Vec<u8>) -> Result<()> {
        debug!(file = name, size = data.len(), "encrypting buffer");
        let file_name = name.to_string();
        self.with_drive(move |drive| {
            let mut stream = drive.file(&file_name)?.output_stream()?;
            stream.write_all(&data)?;
            stream.close()
        })
        .await?;
        info!(file = name, "file encrypted successfully");
        Ok(())
    }

    pub async fn read_encrypted(&self, name: &str) -> Result<Vec<u8>> {
        debug!(file = name, "decrypting file");
        let file_name = name.to_string();
        let result = self
            .with_drive(move |drive| {
                let file = drive.file(&file_name)?;
                let mut stream = file.input_stream()?;
                let mut data = Vec::with_capacity(file.length()? as usize);
                stream.read_to_end(&mut data).map_err(DriveError::from_io)?;
                Ok(data)
            })
            .await;
        match &result {
            Ok(data) => info!(file = name, size = data.len(), "file decrypted successfully"),
            Err(e) => error!(file = name, error = %e, "decryption failed"),
        }
        result
    }

    /// `(name, plaintext size)` of every file, sorted by name.
    pub async fn list_files(&self) -> Result<Vec<(String, u64)>> {
        self.with_drive(|drive| {
            drive
                .list_files()?
                .into_iter()
                .map(|f| Ok((f.name(), f.length()?)))
                .collect()
        })
        .await
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.drive.read().file(name).map(|f| f.exists()).unwrap_or(false)
    }

    pub async fn delete_file(&self, name: &str) -> Result<()> {
        info!(file = name, "deleting encrypted file");
        let file_name = name.to_string();
        self.with_drive(move |drive| drive.file(&file_name)?.delete())
            .await
    }

    /// Writes an auth file granting `target_auth_id` half of this device's range.
    pub async fn export_auth(&self, target_auth_id: &str, path: PathBuf) -> Result<AuthConfig> {
        let target = parse_auth_id(target_auth_id)?;
        self.with_drive(move |drive| {
            auth::export_auth_file(drive, &target, Box::new(LocalFile::new(path)))
        })
        .await
    }

    pub async fn import_auth(&self, path: PathBuf) -> Result<AuthConfig> {
        self.with_drive(move |drive| auth::import_auth_file(drive, Box::new(LocalFile::new(path))))
            .await
    }

    /// Revokes this device and registers a fresh auth id.
    pub async fn revoke(&self) -> Result<String> {
        let drive = Arc::clone(&self.drive);
        let auth_id = task::spawn_blocking(move || -> crate::error::Result<String> {
            let mut drive = drive.write();
            drive.revoke_authorization()?;
            Ok(drive.auth_id_hex())
        })
        .await??;
        Ok(auth_id)
    }

    pub async fn status(&self) -> Result<DriveStatus> {
        self.with_drive(|drive| {
            let files = drive.list_files()?;
            let total_size = files
                .iter()
                .map(|f| f.real_file().length())
                .sum::<crate::error::Result<u64>>()?;
            Ok(DriveStatus {
                root: drive.root().to_path_buf(),
                drive_id: drive.drive_id_hex(),
                auth_id: drive.auth_id_hex(),
                sequence: drive.sequencer().get_sequence(&drive.drive_id_hex())?,
                files: files.len(),
                total_size,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let mut cfg = Config::new(
            dir.path().join("drive.key").to_string_lossy(),
            dir.path().join("drive").to_string_lossy(),
            dir.path().join("sequences.json").to_string_lossy(),
        );
        cfg.chunk_size = 1024;
        cfg.threads = 2;
        cfg
    }

    #[tokio::test]
    async fn test_write_read_list_delete() {
        let dir = TempDir::new().unwrap();
        let ops = DriveOps::create(&config(&dir)).await.unwrap();

        ops.write_encrypted("note.txt", b"sensitive data".to_vec())
            .await
            .unwrap();
        assert!(ops.exists("note.txt").await);
        assert_eq!(ops.read_encrypted("note.txt").await.unwrap(), b"sensitive data");
        assert_eq!(
            ops.list_files().await.unwrap(),
            vec![("note.txt".to_string(), 14)]
        );

        // written once, never overwritten in place
        assert!(ops.write_encrypted("note.txt", b"x".to_vec()).await.is_err());

        ops.delete_file("note.txt").await.unwrap();
        assert!(!ops.exists("note.txt").await);
    }

    #[tokio::test]
    async fn test_reopen_keeps_identity() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let (drive_id, auth_id) = {
            let ops = DriveOps::create(&cfg).await.unwrap();
            (ops.drive_id().await, ops.auth_id().await)
        };
        let ops = DriveOps::open(&cfg).await.unwrap();
        assert_eq!(ops.drive_id().await, drive_id);
        assert_eq!(ops.auth_id().await, auth_id);
        assert!(ops.status().await.unwrap().is_authorized());
    }

    #[tokio::test]
    async fn test_open_without_key_fails() {
        let dir = TempDir::new().unwrap();
        assert!(DriveOps::open(&config(&dir)).await.is_err());
    }

    #[tokio::test]
    async fn test_batch_import_export() {
        let dir = TempDir::new().unwrap();
        let ops = DriveOps::create(&config(&dir)).await.unwrap();
        let src = dir.path().join("a.bin");
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &data).unwrap();

        let report = ops
            .import_files(
                vec![src.clone(), dir.path().join("missing.bin")],
                BatchOptions::default(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(report.done, vec!["a.bin"]);
        assert_eq!(report.failed.len(), 1);

        let out = dir.path().join("out");
        let report = ops
            .export_files(
                vec!["a.bin".to_string(), "nope".to_string()],
                out.clone(),
                BatchOptions::default(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(report.done, vec!["a.bin"]);
        assert_eq!(report.failed, vec![("nope".to_string(), "not found".to_string())]);
        assert_eq!(std::fs::read(out.join("a.bin")).unwrap(), data);
    }

    #[tokio::test]
    async fn test_cancel_mid_import_removes_partial_file() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.threads = 1;
        cfg.buffer_size = 256;
        let ops = Arc::new(DriveOps::create(&cfg).await.unwrap());
        let src = dir.path().join("big.bin");
        std::fs::write(&src, vec![7u8; 50_000]).unwrap();

        let canceller = Arc::clone(&ops);
        let on_progress: ProgressCallback = Arc::new(move |_p: &BatchProgress<'_>| canceller.cancel());
        let err = ops
            .import_files(vec![src.clone()], BatchOptions::default(), Some(on_progress))
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<DriveError>(), Some(DriveError::Cancelled)));
        assert!(!ops.exists("big.bin").await);
        assert!(!dir.path().join("drive").join("data").join("big.bin").exists());
        assert!(src.exists());

        // the next batch starts clean
        let report = ops
            .import_files(vec![src], BatchOptions::default(), None)
            .await
            .unwrap();
        assert_eq!(report.done, vec!["big.bin"]);
    }

    #[tokio::test]
    async fn test_names_outside_data_dir_are_rejected() {
        let dir = TempDir::new().unwrap();
        let ops = DriveOps::create(&config(&dir)).await.unwrap();
        for name in ["../escape.txt", "sub/inner.txt"] {
            assert!(ops.write_encrypted(name, b"x".to_vec()).await.is_err());
            assert!(ops.read_encrypted(name).await.is_err());
            assert!(ops.delete_file(name).await.is_err());
            assert!(!ops.exists(name).await);
        }
        assert!(!dir.path().join("drive").join("escape.txt").exists());

        let report = ops
            .export_files(
                vec!["../drive.json".to_string()],
                dir.path().join("out"),
                BatchOptions::default(),
                None,
            )
            .await
            .unwrap();
        assert!(report.done.is_empty());
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_revoke_changes_auth_id() {
        let dir = TempDir::new().unwrap();
        let ops = DriveOps::create(&config(&dir)).await.unwrap();
        let before = ops.auth_id().await;
        let after = ops.revoke().await.unwrap();
        assert_ne!(before, after);
        assert!(!ops.status().await.unwrap().is_authorized());
        let err = ops.write_encrypted("f", vec![1]).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DriveError>(),
            Some(DriveError::Sequence(_))
        ));
    }
}
