//! Backing store abstraction.
//!
//! The core only needs seekable byte streams plus a little metadata, so
//! [`RealFile`] is all a storage backend has to implement. [`LocalFile`] covers
//! the local disk; [`MemoryStream`] is a shared in-memory buffer used by the
//! buffer encryptor and tests.

use crate::error::{DriveError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Seekable byte stream handed out by a [`RealFile`].
pub trait RealStream: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> RealStream for T {}

pub trait RealFile: Send + Sync + fmt::Debug {
    fn name(&self) -> String;

    fn exists(&self) -> bool;

    fn is_directory(&self) -> bool;

    fn length(&self) -> Result<u64>;

    /// Opens for reading from the start.
    fn input_stream(&self) -> Result<Box<dyn RealStream>>;

    /// Opens for writing, creating the file when missing.
    ///
    /// With `truncate == false` the existing bytes are kept so several writers
    /// can fill disjoint ranges.
    fn output_stream(&self, truncate: bool) -> Result<Box<dyn RealStream>>;

    fn parent(&self) -> Option<Box<dyn RealFile>>;

    /// Handle to a child entry, which may not exist yet.
    fn child(&self, name: &str) -> Box<dyn RealFile>;

    fn create_file(&self, name: &str) -> Result<Box<dyn RealFile>>;

    fn create_directory(&self, name: &str) -> Result<Box<dyn RealFile>>;

    fn list_files(&self) -> Result<Vec<Box<dyn RealFile>>>;

    fn delete(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    path: PathBuf,
}

impl LocalFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RealFile for LocalFile {
    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn is_directory(&self) -> bool {
        self.path.is_dir()
    }

    fn length(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    fn input_stream(&self) -> Result<Box<dyn RealStream>> {
        let file = OpenOptions::new().read(true).open(&self.path)?;
        Ok(Box::new(ReadOnly(file)))
    }

    fn output_stream(&self, truncate: bool) -> Result<Box<dyn RealStream>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(&self.path)?;
        Ok(Box::new(file))
    }

    fn parent(&self) -> Option<Box<dyn RealFile>> {
        self.path
            .parent()
            .map(|p| Box::new(LocalFile::new(p)) as Box<dyn RealFile>)
    }

    fn child(&self, name: &str) -> Box<dyn RealFile> {
        Box::new(LocalFile::new(self.path.join(name)))
    }

    fn create_file(&self, name: &str) -> Result<Box<dyn RealFile>> {
        let path = self.path.join(name);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Box::new(LocalFile::new(path)))
    }

    fn create_directory(&self, name: &str) -> Result<Box<dyn RealFile>> {
        let path = self.path.join(name);
        fs::create_dir_all(&path)?;
        Ok(Box::new(LocalFile::new(path)))
    }

    fn list_files(&self) -> Result<Vec<Box<dyn RealFile>>> {
        let mut files: Vec<Box<dyn RealFile>> = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            files.push(Box::new(LocalFile::new(entry?.path())));
        }
        Ok(files)
    }

    fn delete(&self) -> Result<()> {
        if self.path.is_dir() {
            fs::remove_dir_all(&self.path)?;
        } else {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// File handle that refuses writes.
struct ReadOnly(fs::File);

impl Read for ReadOnly {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for ReadOnly {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "input stream is read only",
        ))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for ReadOnly {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.seek(pos)
    }
}

/// In-memory stream whose clones share one buffer but keep their own position.
#[derive(Debug, Clone, Default)]
pub struct MemoryStream {
    data: Arc<Mutex<Vec<u8>>>,
    position: u64,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
            position: 0,
        }
    }

    /// Pre-sizes the shared buffer, zero filled.
    pub fn set_len(&self, len: usize) {
        self.data.lock().resize(len, 0);
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.lock();
        let start = (self.position as usize).min(data.len());
        let count = (data.len() - start).min(buf.len());
        buf[..count].copy_from_slice(&data[start..start + count]);
        drop(data);
        self.position += count as u64;
        Ok(count)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.data.lock();
        let start = self.position as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        drop(data);
        self.position = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => (self.data.lock().len() as u64).checked_add_signed(delta),
        };
        self.position = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "invalid seek to a negative position")
        })?;
        Ok(self.position)
    }
}

/// Picks a free name in `dir` by appending ` (n)` before the extension.
pub fn auto_rename(dir: &dyn RealFile, name: &str) -> Result<String> {
    if !dir.child(name).exists() {
        return Ok(name.to_string());
    }
    let (stem, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };
    for n in 1..1000 {
        let candidate = format!("{} ({}){}", stem, n, ext);
        if !dir.child(&candidate).exists() {
            return Ok(candidate);
        }
    }
    Err(DriveError::Io(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {}", name),
    )))
}
