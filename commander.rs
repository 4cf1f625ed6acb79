//! Parallel file import and export.
//!
//! [`FileImporter`] encrypts a plain file into a drive, [`FileExporter`]
//! decrypts a drive file back out. Both split the file into parts (see
//! [`split_parts`]) and run one stream pair per part on a fixed pool.
//! [`FileCommander`] drives batches of files on top of them.

use crate::drive::{AesFile, Drive};
use crate::encryptor::{build_pool, run_parts, split_parts, DEFAULT_BUFFER_SIZE};
use crate::error::{DriveError, Result};
use crate::file::{auto_rename, RealFile};
use crate::transform::BLOCK_SIZE;
use rayon::ThreadPool;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Called with `(processed, total)` bytes of the current file.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Sync);

fn already_exists(name: &str) -> DriveError {
    DriveError::Io(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("{} already exists", name),
    ))
}

/// Deletes a partially written target, logging instead of failing.
fn discard_partial(target: &dyn RealFile) {
    if target.exists() {
        if let Err(e) = target.delete() {
            warn!(file = %target.name(), error = %e, "could not delete partial target");
        }
    }
}

fn report(progress: Option<ProgressFn<'_>>, processed: &AtomicU64, count: u64, total: u64) {
    let done = processed.fetch_add(count, Ordering::SeqCst) + count;
    if let Some(cb) = progress {
        cb(done, total);
    }
}

/// Encrypts plain files into a drive.
pub struct FileImporter {
    pool: ThreadPool,
    threads: usize,
    buffer_size: usize,
    stop: Arc<AtomicBool>,
}

impl FileImporter {
    pub fn new(threads: usize, buffer_size: usize) -> Result<Self> {
        Ok(Self {
            pool: build_pool(threads)?,
            threads,
            buffer_size: if buffer_size == 0 {
                DEFAULT_BUFFER_SIZE
            } else {
                buffer_size.max(BLOCK_SIZE)
            },
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Asks running workers to stop after their current buffer.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Encrypts `source` into the drive as `target_name`.
    ///
    /// The file gets one nonce; every worker writes its own part under it. A
    /// failed or cancelled import deletes the partial target.
    pub fn import_file(
        &self,
        drive: &Drive,
        source: &dyn RealFile,
        target_name: &str,
        delete_source: bool,
        on_progress: Option<ProgressFn<'_>>,
    ) -> Result<AesFile> {
        self.stop.store(false, Ordering::SeqCst);
        let mut target = drive.file(target_name)?;
        if target.exists() {
            return Err(already_exists(target_name));
        }

        let total = source.length()?;
        let nonce = drive.next_nonce()?;
        target.set_requested_nonce(Some(nonce));
        target.set_allow_overwrite(true);
        drop(target.real_file().output_stream(true)?);

        let min_part_size = match target.chunk_size() {
            0 => BLOCK_SIZE,
            chunk_size => chunk_size,
        };
        let parts = split_parts(total, self.threads, min_part_size as u64);
        debug!(
            file = target_name,
            length = total,
            parts = parts.len(),
            "importing file"
        );

        let processed = AtomicU64::new(0);
        let result = run_parts(&self.pool, &parts, &self.stop, |part| {
            let mut input = source.input_stream()?;
            input.seek(SeekFrom::Start(part.start))?;
            let mut output = target.output_stream()?;
            output.set_position(part.start)?;

            let mut buffer = vec![0u8; self.buffer_size];
            let mut remaining = part.length;
            while remaining > 0 {
                if self.is_stopped() {
                    return Err(DriveError::Cancelled);
                }
                let want = remaining.min(buffer.len() as u64) as usize;
                let read = input.read(&mut buffer[..want])?;
                if read == 0 {
                    return Err(DriveError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "source ended early",
                    )));
                }
                output.write_all(&buffer[..read])?;
                remaining -= read as u64;
                report(on_progress, &processed, read as u64, total);
            }
            output.close()
        });

        if let Err(e) = result {
            discard_partial(target.real_file());
            return Err(e);
        }

        target.set_requested_nonce(None);
        target.set_allow_overwrite(false);
        if delete_source {
            source.delete()?;
        }
        info!(file = target_name, bytes = total, "file imported");
        Ok(target)
    }
}

/// Decrypts drive files out to plain files.
pub struct FileExporter {
    pool: ThreadPool,
    threads: usize,
    buffer_size: usize,
    stop: Arc<AtomicBool>,
}

impl FileExporter {
    pub fn new(threads: usize, buffer_size: usize) -> Result<Self> {
        Ok(Self {
            pool: build_pool(threads)?,
            threads,
            buffer_size: if buffer_size == 0 {
                DEFAULT_BUFFER_SIZE
            } else {
                buffer_size.max(BLOCK_SIZE)
            },
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Decrypts `file` into `target_dir/target_name`.
    pub fn export_file(
        &self,
        file: &AesFile,
        target_dir: &dyn RealFile,
        target_name: &str,
        delete_source: bool,
        on_progress: Option<ProgressFn<'_>>,
    ) -> Result<Box<dyn RealFile>> {
        self.stop.store(false, Ordering::SeqCst);
        let target = target_dir.child(target_name);
        if target.exists() {
            return Err(already_exists(target_name));
        }

        let header = file
            .header()?
            .ok_or_else(|| DriveError::format(format!("{} has no header", file.name())))?;
        let total = file.length()?;
        drop(target.output_stream(true)?);

        let min_part_size = match header.chunk_size {
            0 => BLOCK_SIZE,
            chunk_size => chunk_size as usize,
        };
        let parts = split_parts(total, self.threads, min_part_size as u64);
        debug!(
            file = %file.name(),
            length = total,
            parts = parts.len(),
            "exporting file"
        );

        let processed = AtomicU64::new(0);
        let result = run_parts(&self.pool, &parts, &self.stop, |part| {
            let mut input = file.input_stream()?;
            input.set_position(part.start)?;
            let mut output = target.output_stream(false)?;
            output.seek(SeekFrom::Start(part.start))?;

            let mut buffer = vec![0u8; self.buffer_size];
            let mut remaining = part.length;
            while remaining > 0 {
                if self.is_stopped() {
                    return Err(DriveError::Cancelled);
                }
                let want = remaining.min(buffer.len() as u64) as usize;
                let read = input.read(&mut buffer[..want])?;
                if read == 0 {
                    return Err(DriveError::format("encrypted file ended early"));
                }
                output.write_all(&buffer[..read])?;
                remaining -= read as u64;
                report(on_progress, &processed, read as u64, total);
            }
            output.flush()?;
            Ok(())
        });

        if let Err(e) = result {
            discard_partial(target.as_ref());
            return Err(e);
        }

        if delete_source {
            file.delete()?;
        }
        info!(file = %file.name(), bytes = total, "file exported");
        Ok(target)
    }
}

/// Progress of a batch transfer.
#[derive(Debug, Clone)]
pub struct BatchProgress<'a> {
    pub file: &'a str,
    pub processed: u64,
    pub total: u64,
    pub file_index: usize,
    pub file_count: usize,
}

pub type RenameFn<'a> = &'a (dyn Fn(&dyn RealFile, &str) -> Result<String> + Sync);

#[derive(Default, Clone, Copy)]
pub struct BatchCallbacks<'a> {
    pub on_progress: Option<&'a (dyn Fn(&BatchProgress<'_>) + Sync)>,
    /// Gets the file name and error of every file that failed
    pub on_failed: Option<&'a (dyn Fn(&str, &DriveError) + Sync)>,
    /// Picks a new name when the target exists; [`auto_rename`] when unset
    pub rename: Option<RenameFn<'a>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    pub delete_source: bool,
    /// Rename on a name collision instead of failing the file
    pub auto_rename: bool,
}

/// Batch import/export with per-file failure reporting.
///
/// Storage errors fail one file and the batch moves on; structural errors
/// (integrity, security, sequence, range) and cancellation end the batch.
pub struct FileCommander {
    importer: FileImporter,
    exporter: FileExporter,
    cancelled: AtomicBool,
}

impl FileCommander {
    pub fn new(threads: usize, buffer_size: usize) -> Result<Self> {
        Ok(Self {
            importer: FileImporter::new(threads, buffer_size)?,
            exporter: FileExporter::new(threads, buffer_size)?,
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.importer.stop();
        self.exporter.stop();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn pick_name(
        &self,
        dir: &dyn RealFile,
        name: &str,
        options: &BatchOptions,
        callbacks: &BatchCallbacks<'_>,
    ) -> Result<String> {
        if !dir.child(name).exists() {
            return Ok(name.to_string());
        }
        if !options.auto_rename {
            return Err(already_exists(name));
        }
        match callbacks.rename {
            Some(rename) => rename(dir, name),
            None => auto_rename(dir, name),
        }
    }

    /// Decides whether a failed file ends the batch.
    fn handle_failure(
        &self,
        name: &str,
        e: DriveError,
        callbacks: &BatchCallbacks<'_>,
    ) -> Result<()> {
        if matches!(e, DriveError::Cancelled) || self.is_cancelled() {
            return Err(DriveError::Cancelled);
        }
        error!(file = name, error = %e, "file transfer failed");
        if e.is_structural() {
            return Err(e);
        }
        if let Some(on_failed) = callbacks.on_failed {
            on_failed(name, &e);
        }
        Ok(())
    }

    pub fn import_files(
        &self,
        drive: &Drive,
        files: &[Box<dyn RealFile>],
        options: BatchOptions,
        callbacks: BatchCallbacks<'_>,
    ) -> Result<Vec<AesFile>> {
        self.cancelled.store(false, Ordering::SeqCst);
        let data_dir = drive.data_dir();
        let file_count = files.len();
        let mut imported = Vec::with_capacity(file_count);

        for (file_index, source) in files.iter().enumerate() {
            if self.is_cancelled() {
                return Err(DriveError::Cancelled);
            }
            let source_name = source.name();
            if source.is_directory() {
                let e = DriveError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} is a directory", source_name),
                ));
                self.handle_failure(&source_name, e, &callbacks)?;
                continue;
            }

            let outcome = self
                .pick_name(&data_dir, &source_name, &options, &callbacks)
                .and_then(|name| {
                    let progress = |processed: u64, total: u64| {
                        if let Some(cb) = callbacks.on_progress {
                            cb(&BatchProgress {
                                file: &name,
                                processed,
                                total,
                                file_index,
                                file_count,
                            });
                        }
                    };
                    self.importer.import_file(
                        drive,
                        source.as_ref(),
                        &name,
                        options.delete_source,
                        Some(&progress),
                    )
                });
            match outcome {
                Ok(file) => imported.push(file),
                Err(e) => self.handle_failure(&source_name, e, &callbacks)?,
            }
        }
        Ok(imported)
    }

    pub fn export_files(
        &self,
        files: &[AesFile],
        target_dir: &dyn RealFile,
        options: BatchOptions,
        callbacks: BatchCallbacks<'_>,
    ) -> Result<Vec<Box<dyn RealFile>>> {
        self.cancelled.store(false, Ordering::SeqCst);
        let file_count = files.len();
        let mut exported = Vec::with_capacity(file_count);

        for (file_index, file) in files.iter().enumerate() {
            if self.is_cancelled() {
                return Err(DriveError::Cancelled);
            }
            let source_name = file.name();
            let outcome = self
                .pick_name(target_dir, &source_name, &options, &callbacks)
                .and_then(|name| {
                    let progress = |processed: u64, total: u64| {
                        if let Some(cb) = callbacks.on_progress {
                            cb(&BatchProgress {
                                file: &name,
                                processed,
                                total,
                                file_index,
                                file_count,
                            });
                        }
                    };
                    self.exporter.export_file(
                        file,
                        target_dir,
                        &name,
                        options.delete_source,
                        Some(&progress),
                    )
                });
            match outcome {
                Ok(target) => exported.push(target),
                Err(e) => self.handle_failure(&source_name, e, &callbacks)?,
            }
        }
        Ok(exported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::LocalFile;
    use crate::key_manager::DriveKey;
    use crate::sequence::FileSequencer;
    use parking_lot::Mutex;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn new_drive(dir: &Path, chunk_size: usize) -> Drive {
        let sequencer = Arc::new(FileSequencer::json(dir.join("seq.json")).unwrap());
        let mut drive = Drive::create(dir.join("drive"), DriveKey::generate(), sequencer).unwrap();
        drive.set_integrity(true, chunk_size).unwrap();
        drive
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 253) as u8).collect()
    }

    #[test]
    fn test_import_export_round_trip() {
        let dir = TempDir::new().unwrap();
        let drive = new_drive(dir.path(), 1024);
        let data = sample(20_000);
        let src_path = dir.path().join("plain.bin");
        fs::write(&src_path, &data).unwrap();

        let importer = FileImporter::new(4, 700).unwrap();
        let last = Mutex::new((0u64, 0u64));
        let progress = |processed: u64, total: u64| {
            let mut l = last.lock();
            *l = (l.0.max(processed), total);
        };
        let file = importer
            .import_file(&drive, &LocalFile::new(&src_path), "plain.bin", false, Some(&progress))
            .unwrap();
        assert_eq!(*last.lock(), (20_000, 20_000));
        assert_eq!(file.length().unwrap(), 20_000);

        let out_dir = LocalFile::new(dir.path().join("out"));
        fs::create_dir_all(out_dir.path()).unwrap();
        let exporter = FileExporter::new(3, 500).unwrap();
        exporter
            .export_file(&file, &out_dir, "plain.bin", false, None)
            .unwrap();
        assert_eq!(fs::read(out_dir.path().join("plain.bin")).unwrap(), data);
    }

    #[test]
    fn test_parallel_import_matches_single_thread() {
        let dir = TempDir::new().unwrap();
        let drive = new_drive(dir.path(), 512);
        let data = sample(9_999);
        let src_path = dir.path().join("src.bin");
        fs::write(&src_path, &data).unwrap();

        let one = FileImporter::new(1, 0)
            .unwrap()
            .import_file(&drive, &LocalFile::new(&src_path), "one", false, None)
            .unwrap();
        let four = FileImporter::new(4, 64)
            .unwrap()
            .import_file(&drive, &LocalFile::new(&src_path), "four", false, None)
            .unwrap();

        let mut a = Vec::new();
        one.input_stream().unwrap().read_to_end(&mut a).unwrap();
        let mut b = Vec::new();
        four.input_stream().unwrap().read_to_end(&mut b).unwrap();
        assert_eq!(a, data);
        assert_eq!(b, data);
        // different nonces, same layout
        let h1 = one.header().unwrap().unwrap();
        let h4 = four.header().unwrap().unwrap();
        assert_ne!(h1.nonce, h4.nonce);
        assert_eq!(
            fs::metadata(drive.root().join("data/one")).unwrap().len(),
            fs::metadata(drive.root().join("data/four")).unwrap().len()
        );
    }

    #[test]
    fn test_cancel_deletes_partial_target() {
        let dir = TempDir::new().unwrap();
        let drive = new_drive(dir.path(), 256);
        let src_path = dir.path().join("big.bin");
        fs::write(&src_path, sample(50_000)).unwrap();

        let importer = FileImporter::new(1, 256).unwrap();
        let progress = |_processed: u64, _total: u64| importer.stop();
        let err = importer
            .import_file(&drive, &LocalFile::new(&src_path), "big.bin", false, Some(&progress))
            .unwrap_err();
        assert!(matches!(err, DriveError::Cancelled));
        assert!(!drive.file("big.bin").unwrap().exists());
        assert!(src_path.exists());
    }

    #[test]
    fn test_delete_source() {
        let dir = TempDir::new().unwrap();
        let drive = new_drive(dir.path(), 0);
        let src_path = dir.path().join("gone.txt");
        fs::write(&src_path, b"bye").unwrap();
        FileImporter::new(2, 0)
            .unwrap()
            .import_file(&drive, &LocalFile::new(&src_path), "gone.txt", true, None)
            .unwrap();
        assert!(!src_path.exists());
        assert!(drive.file("gone.txt").unwrap().exists());
    }

    #[test]
    fn test_batch_import_renames_and_reports() {
        let dir = TempDir::new().unwrap();
        let drive = new_drive(dir.path(), 256);
        let src_dir = dir.path().join("src");
        fs::create_dir_all(src_dir.join("nested")).unwrap();
        fs::write(src_dir.join("a.txt"), b"first").unwrap();
        fs::write(src_dir.join("b.txt"), sample(3000)).unwrap();

        let commander = FileCommander::new(2, 0).unwrap();
        let files: Vec<Box<dyn RealFile>> = vec![
            Box::new(LocalFile::new(src_dir.join("a.txt"))),
            Box::new(LocalFile::new(src_dir.join("nested"))),
            Box::new(LocalFile::new(src_dir.join("b.txt"))),
            Box::new(LocalFile::new(src_dir.join("a.txt"))),
        ];
        let failed = Mutex::new(Vec::new());
        let on_failed = |name: &str, _e: &DriveError| failed.lock().push(name.to_string());
        let seen = Mutex::new(Vec::new());
        let on_progress = |p: &BatchProgress<'_>| {
            seen.lock().push((p.file.to_string(), p.file_index, p.file_count));
        };
        let imported = commander
            .import_files(
                &drive,
                &files,
                BatchOptions {
                    delete_source: false,
                    auto_rename: true,
                },
                BatchCallbacks {
                    on_progress: Some(&on_progress),
                    on_failed: Some(&on_failed),
                    rename: None,
                },
            )
            .unwrap();

        let names: Vec<String> = imported.iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "a (1).txt"]);
        assert_eq!(*failed.lock(), vec!["nested".to_string()]);
        let seen = seen.lock();
        assert!(seen.contains(&("a (1).txt".to_string(), 3, 4)));
        assert!(seen.iter().all(|(_, _, count)| *count == 4));
    }

    #[test]
    fn test_batch_collision_without_rename_fails_file() {
        let dir = TempDir::new().unwrap();
        let drive = new_drive(dir.path(), 0);
        let src = dir.path().join("x.txt");
        fs::write(&src, b"x").unwrap();

        let commander = FileCommander::new(1, 0).unwrap();
        let files: Vec<Box<dyn RealFile>> = vec![
            Box::new(LocalFile::new(&src)),
            Box::new(LocalFile::new(&src)),
        ];
        let failures = Mutex::new(0);
        let on_failed = |_name: &str, _e: &DriveError| *failures.lock() += 1;
        let imported = commander
            .import_files(
                &drive,
                &files,
                BatchOptions::default(),
                BatchCallbacks {
                    on_failed: Some(&on_failed),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(imported.len(), 1);
        assert_eq!(*failures.lock(), 1);
    }

    #[test]
    fn test_batch_export_aborts_on_integrity_error() {
        let dir = TempDir::new().unwrap();
        let drive = new_drive(dir.path(), 256);
        let src = dir.path().join("s.bin");
        fs::write(&src, sample(1000)).unwrap();
        let importer = FileImporter::new(1, 0).unwrap();
        let good = importer
            .import_file(&drive, &LocalFile::new(&src), "good", false, None)
            .unwrap();
        let bad = importer
            .import_file(&drive, &LocalFile::new(&src), "bad", false, None)
            .unwrap();
        let bad_path = drive.root().join("data/bad");
        let mut bytes = fs::read(&bad_path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x10;
        fs::write(&bad_path, bytes).unwrap();

        let out = LocalFile::new(dir.path().join("out"));
        fs::create_dir_all(out.path()).unwrap();
        let commander = FileCommander::new(2, 0).unwrap();
        let err = commander
            .export_files(
                &[bad, good],
                &out,
                BatchOptions::default(),
                BatchCallbacks::default(),
            )
            .unwrap_err();
        assert!(matches!(err, DriveError::Integrity(_)));
        // the batch stopped at the first file and left nothing behind
        assert!(!out.path().join("bad").exists());
        assert!(!out.path().join("good").exists());
    }
}
