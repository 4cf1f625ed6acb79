//! Parallel encryption of in-memory buffers.
//!
//! A buffer is cut into parts whose boundaries fall on chunk (or block)
//! boundaries. Every part gets its own [`AesStream`] over the shared output,
//! all under the same key and nonce; since the CTR keystream at any offset is
//! independent of the others, the result is byte-identical to a single-threaded
//! pass.

use crate::error::{DriveError, Result};
use crate::file::MemoryStream;
use crate::header::{EncryptionFormat, EncryptionMode, Header};
use crate::integrity::DEFAULT_CHUNK_SIZE;
use crate::nonce::Nonce;
use crate::streaming::AesStream;
use crate::transform::{default_provider, TransformerProvider, BLOCK_SIZE};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_BUFFER_SIZE: usize = 512 * 1024;

/// A contiguous plaintext range handled by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Part {
    pub index: usize,
    pub start: u64,
    pub length: u64,
}

/// Message a worker sends when its part is done.
#[derive(Debug)]
pub struct PartResult {
    pub index: usize,
    pub start: u64,
    pub length: u64,
    pub result: Result<()>,
}

/// Splits `length` bytes into at most `threads` parts.
///
/// Every part but the last is a multiple of `min_part_size`; the last one
/// takes the remainder.
pub fn split_parts(length: u64, threads: usize, min_part_size: u64) -> Vec<Part> {
    let threads = threads.max(1) as u64;
    let min_part_size = min_part_size.max(1);
    let mut part_size = length;
    let mut running = 1;
    if length > min_part_size {
        part_size = (length + threads - 1) / threads;
        if part_size > min_part_size {
            part_size -= part_size % min_part_size;
        } else {
            part_size = min_part_size;
        }
        running = (length / part_size).clamp(1, threads);
    }

    (0..running)
        .map(|i| {
            let start = i * part_size;
            let length = if i == running - 1 {
                length - start
            } else {
                part_size
            };
            Part {
                index: i as usize,
                start,
                length,
            }
        })
        .collect()
}

pub(crate) fn build_pool(threads: usize) -> Result<ThreadPool> {
    if threads == 0 {
        return Err(DriveError::config("threads must be at least 1"));
    }
    ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("aesdrive-worker-{}", i))
        .build()
        .map_err(|e| DriveError::config(format!("could not start worker pool: {}", e)))
}

/// Runs `work` for every part on `pool` and waits for all of them.
///
/// The first failure raises `stop` so the remaining workers bail out early,
/// and is returned once every part has reported back.
pub(crate) fn run_parts<F>(pool: &ThreadPool, parts: &[Part], stop: &AtomicBool, work: F) -> Result<()>
where
    F: Fn(Part) -> Result<()> + Sync,
{
    if let [part] = parts {
        return work(*part);
    }

    let (tx, rx) = mpsc::channel::<PartResult>();
    pool.scope(|scope| {
        for &part in parts {
            let tx = tx.clone();
            let work = &work;
            scope.spawn(move |_| {
                let result = work(part);
                if result.is_err() {
                    stop.store(true, Ordering::SeqCst);
                }
                // the receiver outlives the scope
                let _ = tx.send(PartResult {
                    index: part.index,
                    start: part.start,
                    length: part.length,
                    result,
                });
            });
        }
    });
    drop(tx);

    let mut remaining = parts.len();
    let mut first_error: Option<DriveError> = None;
    for message in rx {
        remaining -= 1;
        if let Err(e) = message.result {
            debug!(
                part = message.index,
                start = message.start,
                length = message.length,
                error = %e,
                "part failed"
            );
            // an error that caused the stop beats the cancellations it triggered
            let replace = match &first_error {
                None => true,
                Some(DriveError::Cancelled) => !matches!(e, DriveError::Cancelled),
                Some(_) => false,
            };
            if replace {
                first_error = Some(e);
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    if remaining != 0 {
        return Err(DriveError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("{} parts did not report back", remaining),
        )));
    }
    Ok(())
}

fn integrity_chunk_size(hash_key: Option<&[u8]>, chunk_size: usize) -> usize {
    match (hash_key, chunk_size) {
        (None, _) => 0,
        (Some(_), 0) => DEFAULT_CHUNK_SIZE,
        (Some(_), size) => size,
    }
}

/// Encrypts buffers with a fixed pool of workers.
pub struct Encryptor {
    pool: ThreadPool,
    threads: usize,
    buffer_size: usize,
    provider: Arc<dyn TransformerProvider>,
}

impl Encryptor {
    pub fn new(threads: usize) -> Result<Self> {
        Ok(Self {
            pool: build_pool(threads)?,
            threads,
            buffer_size: DEFAULT_BUFFER_SIZE,
            provider: default_provider(),
        })
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(BLOCK_SIZE);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn TransformerProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Encrypts `data` under `key`/`nonce`; a hash key turns integrity on.
    pub fn encrypt(
        &self,
        data: &[u8],
        key: &[u8],
        nonce: Nonce,
        format: EncryptionFormat,
        hash_key: Option<&[u8]>,
        chunk_size: usize,
    ) -> Result<Vec<u8>> {
        let chunk_size = integrity_chunk_size(hash_key, chunk_size);
        let output_size =
            AesStream::<MemoryStream>::output_size(EncryptionMode::Encrypt, data.len() as u64, format, chunk_size);
        let output = MemoryStream::new();
        output.set_len(output_size as usize);

        let min_part_size = if chunk_size > 0 { chunk_size } else { BLOCK_SIZE };
        let parts = split_parts(data.len() as u64, self.threads, min_part_size as u64);
        debug!(
            length = data.len(),
            parts = parts.len(),
            chunk_size,
            "encrypting buffer"
        );

        let stop = AtomicBool::new(false);
        run_parts(&self.pool, &parts, &stop, |part| {
            let mut stream = AesStream::new(
                output.clone(),
                EncryptionMode::Encrypt,
                format,
                key,
                hash_key,
                chunk_size,
                Arc::clone(&self.provider),
            )?;
            stream.set_nonce(nonce)?;
            stream.set_allow_range_write(true);
            stream.init()?;
            stream.set_position(part.start)?;
            let start = part.start as usize;
            let end = start + part.length as usize;
            for piece in data[start..end].chunks(self.buffer_size) {
                if stop.load(Ordering::SeqCst) {
                    return Err(DriveError::Cancelled);
                }
                stream.write_all(piece)?;
            }
            stream.close()
        })?;

        Ok(output.to_vec())
    }
}

/// Decrypts buffers with a fixed pool of workers.
pub struct Decryptor {
    pool: ThreadPool,
    threads: usize,
    buffer_size: usize,
    provider: Arc<dyn TransformerProvider>,
}

impl Decryptor {
    pub fn new(threads: usize) -> Result<Self> {
        Ok(Self {
            pool: build_pool(threads)?,
            threads,
            buffer_size: DEFAULT_BUFFER_SIZE,
            provider: default_provider(),
        })
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(BLOCK_SIZE);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn TransformerProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Decrypts `data`. The nonce is required for the generic format and
    /// read from the header otherwise.
    pub fn decrypt(
        &self,
        data: &[u8],
        key: &[u8],
        nonce: Option<Nonce>,
        format: EncryptionFormat,
        hash_key: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let chunk_size = match format {
            EncryptionFormat::Headered => Header::from_bytes(data)?.chunk_size as usize,
            EncryptionFormat::Generic => 0,
        };
        if hash_key.is_none() && chunk_size > 0 {
            warn!("decrypting without a hash key, integrity tags are not verified");
        }
        let plain_size =
            AesStream::<MemoryStream>::output_size(EncryptionMode::Decrypt, data.len() as u64, format, chunk_size);
        let input = MemoryStream::from_vec(data.to_vec());
        let output = MemoryStream::new();
        output.set_len(plain_size as usize);

        let min_part_size = if chunk_size > 0 { chunk_size } else { BLOCK_SIZE };
        let parts = split_parts(plain_size, self.threads, min_part_size as u64);
        debug!(length = data.len(), parts = parts.len(), "decrypting buffer");

        let stop = AtomicBool::new(false);
        run_parts(&self.pool, &parts, &stop, |part| {
            let mut stream = AesStream::new(
                input.clone(),
                EncryptionMode::Decrypt,
                format,
                key,
                hash_key,
                0,
                Arc::clone(&self.provider),
            )?;
            if let Some(nonce) = nonce {
                stream.set_nonce(nonce)?;
            }
            stream.init()?;
            stream.set_position(part.start)?;

            let mut target = output.clone();
            target.seek(SeekFrom::Start(part.start))?;
            let mut buffer = vec![0u8; self.buffer_size];
            let mut remaining = part.length;
            while remaining > 0 {
                if stop.load(Ordering::SeqCst) {
                    return Err(DriveError::Cancelled);
                }
                let want = remaining.min(buffer.len() as u64) as usize;
                let read = stream.read(&mut buffer[..want])?;
                if read == 0 {
                    return Err(DriveError::format("stream ended before the expected length"));
                }
                target.write_all(&buffer[..read])?;
                remaining -= read as u64;
            }
            Ok(())
        })?;

        Ok(output.to_vec())
    }
}
