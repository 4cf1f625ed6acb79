//! Seekable AES-CTR encrypt/decrypt stream.
//!
//! [`AesStream`] wraps any `Read + Write + Seek` store and exposes the plaintext
//! view through the std io traits.
//!
//! ## Headered Format
//!
//! ```text
//! [magic:3][version:1][nonce:8][chunk_size:4][record][record]...
//!
//! Each record with integrity:
//! [hash:32][ciphertext:chunk_size]   (the last one may be shorter)
//!
//! Without integrity (chunk_size = 0) the ciphertext follows the header directly.
//! ```
//!
//! The generic format has no header: the nonce is supplied by the caller and
//! integrity is not available.
//!
//! ## Positions
//!
//! All positions are plaintext offsets. With integrity a plaintext offset `v`
//! lives in chunk `v / chunk_size`, whose record starts at
//! `header + chunk * (hash + chunk_size)`; the keystream for the chunk starts
//! at CTR block `chunk * chunk_size / 16`.

use crate::error::{DriveError, Result};
use crate::header::{EncryptionFormat, EncryptionMode, Header, HEADER_LENGTH};
use crate::integrity::{self, HashProvider, HmacSha256Provider, Integrity, HASH_RESULT_LENGTH};
use crate::nonce::Nonce;
use crate::transform::{default_provider, CtrTransformer, TransformerProvider, BLOCK_SIZE, KEY_LENGTH};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::{debug, warn};
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Constructed, header not yet written or read
    Created,
    /// Header handled, transformer keyed
    Initialized,
    /// At least one read or write happened
    Open,
    Closed,
}

fn io_failure(msg: &str) -> DriveError {
    DriveError::Io(io::Error::new(io::ErrorKind::Other, msg.to_string()))
}

fn invalid_input(msg: String) -> DriveError {
    DriveError::Io(io::Error::new(io::ErrorKind::InvalidInput, msg))
}

pub struct AesStream<S: Read + Write + Seek> {
    inner: S,
    mode: EncryptionMode,
    format: EncryptionFormat,
    key: Zeroizing<Vec<u8>>,
    hash_key: Option<Zeroizing<Vec<u8>>>,
    requested_chunk_size: usize,
    nonce: Option<Nonce>,
    header: Option<Header>,
    integrity: Integrity,
    hash_provider: Arc<dyn HashProvider>,
    transformer: Box<dyn CtrTransformer>,
    state: StreamState,
    position: u64,
    /// Plaintext length: bytes written so far when encrypting, stored when decrypting
    length: u64,
    allow_range_write: bool,
    fail_silently: bool,
    /// Plaintext of the chunk being filled, starts on a chunk boundary
    pending: Vec<u8>,
    /// Last verified and decrypted chunk
    cached_chunk: Option<(u64, Vec<u8>)>,
}

impl<S: Read + Write + Seek> AesStream<S> {
    /// Creates a stream in the [`StreamState::Created`] state.
    ///
    /// `chunk_size` only matters when encrypting with a hash key; zero picks the
    /// default. Decrypting streams take the chunk size from the header.
    pub fn new(
        inner: S,
        mode: EncryptionMode,
        format: EncryptionFormat,
        key: &[u8],
        hash_key: Option<&[u8]>,
        chunk_size: usize,
        provider: Arc<dyn TransformerProvider>,
    ) -> Result<Self> {
        if key.len() != KEY_LENGTH {
            return Err(DriveError::security(format!(
                "key must be {} bytes, got {}",
                KEY_LENGTH,
                key.len()
            )));
        }
        integrity::validate_chunk_size(chunk_size)?;
        if format == EncryptionFormat::Generic && hash_key.is_some() {
            return Err(DriveError::config(
                "Generic format does not support integrity, use the headered format",
            ));
        }
        Ok(Self {
            inner,
            mode,
            format,
            key: Zeroizing::new(key.to_vec()),
            hash_key: hash_key.map(|k| Zeroizing::new(k.to_vec())),
            requested_chunk_size: chunk_size,
            nonce: None,
            header: None,
            integrity: Integrity::hmac_sha256(false, None, 0)?,
            hash_provider: Arc::new(HmacSha256Provider),
            transformer: provider.create(),
            state: StreamState::Created,
            position: 0,
            length: 0,
            allow_range_write: false,
            fail_silently: false,
            pending: Vec::new(),
            cached_chunk: None,
        })
    }

    /// Headered encrypting stream, initialized and ready for writes.
    pub fn encryptor(
        inner: S,
        key: &[u8],
        hash_key: Option<&[u8]>,
        nonce: Nonce,
        chunk_size: usize,
    ) -> Result<Self> {
        let mut stream = Self::new(
            inner,
            EncryptionMode::Encrypt,
            EncryptionFormat::Headered,
            key,
            hash_key,
            chunk_size,
            default_provider(),
        )?;
        stream.set_nonce(nonce)?;
        stream.init()?;
        Ok(stream)
    }

    /// Headered decrypting stream, header already read.
    pub fn decryptor(inner: S, key: &[u8], hash_key: Option<&[u8]>) -> Result<Self> {
        let mut stream = Self::new(
            inner,
            EncryptionMode::Decrypt,
            EncryptionFormat::Headered,
            key,
            hash_key,
            0,
            default_provider(),
        )?;
        stream.init()?;
        Ok(stream)
    }

    /// Nonce for encryption, or the out-of-band nonce of a decrypting stream.
    pub fn set_nonce(&mut self, nonce: Nonce) -> Result<()> {
        if self.state != StreamState::Created {
            return Err(io_failure("nonce can only be set before init"));
        }
        self.nonce = Some(nonce);
        Ok(())
    }

    pub fn set_hash_provider(&mut self, provider: Arc<dyn HashProvider>) -> Result<()> {
        if self.state != StreamState::Created {
            return Err(io_failure("hash provider can only be set before init"));
        }
        self.hash_provider = provider;
        Ok(())
    }

    /// Allows an encrypting stream to move away from its current position.
    ///
    /// Only for writers that cover disjoint ranges of the same plaintext, e.g.
    /// parallel workers. Rewriting a range with other data under the same nonce
    /// leaks the XOR of both plaintexts.
    pub fn set_allow_range_write(&mut self, allow: bool) {
        self.allow_range_write = allow;
    }

    /// Report a failed chunk verification as end of stream instead of an error.
    pub fn set_fail_silently(&mut self, fail_silently: bool) {
        self.fail_silently = fail_silently;
    }

    /// Writes or reads the header and keys the transformer.
    pub fn init(&mut self) -> Result<()> {
        if self.state != StreamState::Created {
            return Err(io_failure("stream already initialized"));
        }
        match self.mode {
            EncryptionMode::Encrypt => self.init_encrypt()?,
            EncryptionMode::Decrypt => self.init_decrypt()?,
        }
        let nonce = self
            .nonce
            .ok_or_else(|| DriveError::security("No nonce set, supply one or read it from the header"))?;
        self.transformer.init(&self.key, &nonce)?;
        self.state = StreamState::Initialized;
        debug!(
            mode = ?self.mode,
            format = ?self.format,
            chunk_size = self.integrity.chunk_size(),
            integrity = self.integrity.use_integrity(),
            "stream initialized"
        );
        Ok(())
    }

    fn init_encrypt(&mut self) -> Result<()> {
        let nonce = self
            .nonce
            .ok_or_else(|| DriveError::security("No nonce set for encryption"))?;
        let hash_key = self.hash_key.as_ref().map(|k| k.as_slice());
        let chunk_size = if hash_key.is_some() {
            self.requested_chunk_size
        } else {
            0
        };
        self.integrity = Integrity::new(
            hash_key.is_some(),
            hash_key,
            chunk_size,
            self.hash_provider.clone(),
        )?;
        if self.format == EncryptionFormat::Headered {
            let header = Header::new(nonce, self.integrity.chunk_size() as u32);
            self.inner.seek(SeekFrom::Start(0))?;
            header.write_to(&mut self.inner)?;
            self.header = Some(header);
        }
        Ok(())
    }

    fn init_decrypt(&mut self) -> Result<()> {
        let physical_len = self.inner.seek(SeekFrom::End(0))?;
        if self.format == EncryptionFormat::Headered {
            self.inner.seek(SeekFrom::Start(0))?;
            let bytes = Header::read_bytes(&mut self.inner)?;
            let parsed = Header::from_bytes(&bytes).and_then(|header| {
                let chunk_size = header.chunk_size as usize;
                integrity::validate_chunk_size(chunk_size).map_err(|_| {
                    DriveError::format(format!("invalid chunk size in header: {}", chunk_size))
                })?;
                Ok(header)
            });
            // with a hash key every header byte is covered by chunk 0's tag
            let header = match parsed {
                Ok(header) => header,
                Err(e) if self.hash_key.is_some() => {
                    warn!(error = %e, "header rejected on a verified stream");
                    return Err(DriveError::integrity("Data corrupt or tampered"));
                }
                Err(e) => return Err(e),
            };
            let chunk_size = header.chunk_size as usize;
            let hash_key = self.hash_key.as_ref().map(|k| k.as_slice());
            let verify = hash_key.is_some() && chunk_size > 0;
            if chunk_size > 0 && !verify {
                warn!("stream carries integrity tags but no hash key was given, skipping verification");
            }
            self.integrity = Integrity::new(
                verify,
                if verify { hash_key } else { None },
                chunk_size,
                self.hash_provider.clone(),
            )?;
            if self.nonce.is_none() {
                self.nonce = Some(header.nonce);
            }
            self.header = Some(header);
        }
        let stored = physical_len.saturating_sub(self.header_length());
        self.length = self.stored_to_plain_length(stored);
        Ok(())
    }

    /// Plaintext bytes held in `stored` bytes following the header.
    fn stored_to_plain_length(&self, stored: u64) -> u64 {
        let chunk_size = self.integrity.chunk_size() as u64;
        if chunk_size == 0 {
            return stored;
        }
        let hash_size = self.integrity.hash_size() as u64;
        let stride = chunk_size + hash_size;
        (stored / stride) * chunk_size + (stored % stride).saturating_sub(hash_size)
    }

    /// Size of the data produced from `length` input bytes.
    ///
    /// Encrypt: plaintext length in, stored length out. Decrypt: the reverse.
    pub fn output_size(
        mode: EncryptionMode,
        length: u64,
        format: EncryptionFormat,
        chunk_size: usize,
    ) -> u64 {
        let (header_length, chunk_size) = match format {
            EncryptionFormat::Headered => (HEADER_LENGTH as u64, chunk_size),
            EncryptionFormat::Generic => (0, 0),
        };
        match mode {
            EncryptionMode::Encrypt => {
                length
                    + header_length
                    + integrity::total_hash_data_length(
                        mode,
                        length,
                        chunk_size,
                        0,
                        HASH_RESULT_LENGTH,
                    )
            }
            EncryptionMode::Decrypt => {
                let stored = length.saturating_sub(header_length);
                stored.saturating_sub(integrity::total_hash_data_length(
                    mode,
                    stored,
                    chunk_size,
                    HASH_RESULT_LENGTH,
                    HASH_RESULT_LENGTH,
                ))
            }
        }
    }

    /// Granularity for range writes and part sizes.
    pub fn align_size(&self) -> usize {
        match self.integrity.chunk_size() {
            0 => BLOCK_SIZE,
            chunk_size => chunk_size,
        }
    }

    pub fn header_length(&self) -> u64 {
        if self.header.is_some() {
            HEADER_LENGTH as u64
        } else {
            0
        }
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    pub fn nonce(&self) -> Option<Nonce> {
        self.nonce
    }

    pub fn chunk_size(&self) -> usize {
        self.integrity.chunk_size()
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn begin(&mut self, mode: EncryptionMode) -> Result<()> {
        match self.state {
            StreamState::Created => return Err(io_failure("stream not initialized, call init first")),
            StreamState::Closed => return Err(io_failure("stream is closed")),
            StreamState::Initialized => self.state = StreamState::Open,
            StreamState::Open => {}
        }
        if self.mode != mode {
            return Err(io_failure(match mode {
                EncryptionMode::Encrypt => "stream opened for decryption cannot be written",
                EncryptionMode::Decrypt => "stream opened for encryption cannot be read",
            }));
        }
        Ok(())
    }

    /// Moves to plaintext `position`.
    pub fn set_position(&mut self, position: u64) -> Result<()> {
        match self.state {
            StreamState::Created => return Err(io_failure("stream not initialized, call init first")),
            StreamState::Closed => return Err(io_failure("stream is closed")),
            _ => {}
        }
        if position == self.position {
            return Ok(());
        }
        if self.mode == EncryptionMode::Encrypt {
            if !self.allow_range_write {
                return Err(DriveError::security(
                    "Range writing is not allowed on an encrypting stream",
                ));
            }
            let chunk_size = self.integrity.chunk_size() as u64;
            if chunk_size > 0 && position % chunk_size != 0 {
                return Err(invalid_input(format!(
                    "position {} is not a multiple of the chunk size {}",
                    position, chunk_size
                )));
            }
            self.flush_chunk()?;
        }
        self.position = position;
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.begin(EncryptionMode::Decrypt)?;
        if buf.is_empty() || self.position >= self.length {
            return Ok(0);
        }
        let chunk_size = self.integrity.chunk_size() as u64;
        if chunk_size == 0 {
            let count = (buf.len() as u64).min(self.length - self.position) as usize;
            let mut ciphertext = vec![0u8; count];
            self.inner
                .seek(SeekFrom::Start(self.header_length() + self.position))?;
            self.inner.read_exact(&mut ciphertext)?;
            self.transformer.sync_counter(self.position)?;
            self.transformer.transform(&ciphertext, 0, buf, 0, count)?;
            self.position += count as u64;
            return Ok(count);
        }

        let index = self.position / chunk_size;
        match self.load_chunk(index) {
            Ok(()) => {}
            Err(DriveError::Integrity(_)) if self.fail_silently => return Ok(0),
            Err(e) => return Err(e),
        }
        let plain = match &self.cached_chunk {
            Some((_, plain)) => plain,
            None => return Ok(0),
        };
        let offset = (self.position - index * chunk_size) as usize;
        if offset >= plain.len() {
            return Ok(0);
        }
        let count = (plain.len() - offset).min(buf.len());
        buf[..count].copy_from_slice(&plain[offset..offset + count]);
        self.position += count as u64;
        Ok(count)
    }

    /// Reads, verifies and decrypts one chunk record into the cache.
    fn load_chunk(&mut self, index: u64) -> Result<()> {
        if matches!(&self.cached_chunk, Some((cached, _)) if *cached == index) {
            return Ok(());
        }
        let chunk_size = self.integrity.chunk_size() as u64;
        let hash_size = self.integrity.hash_size();
        let chunk_start = index * chunk_size;
        let data_len = (self.length - chunk_start).min(chunk_size) as usize;
        let record_start = self.header_length() + index * (chunk_size + hash_size as u64);

        let mut record = vec![0u8; hash_size + data_len];
        self.inner.seek(SeekFrom::Start(record_start))?;
        match self.inner.read_exact(&mut record) {
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && self.integrity.use_integrity() => {
                warn!(chunk = index, "chunk record truncated");
                return Err(DriveError::integrity("Data corrupt or tampered"));
            }
            other => other?,
        }
        let (tag, ciphertext) = record.split_at(hash_size);

        if self.integrity.use_integrity() {
            let header_bytes = match (index, &self.header) {
                (0, Some(header)) => Some(header.to_bytes()),
                _ => None,
            };
            let verified = self.integrity.verify_hashes(
                &[tag.to_vec()],
                ciphertext,
                header_bytes.as_ref().map(|b| &b[..]),
            );
            if let Err(e) = verified {
                warn!(chunk = index, "chunk verification failed");
                return Err(e);
            }
        }

        let mut plain = vec![0u8; data_len];
        self.transformer.sync_counter(chunk_start)?;
        self.transformer
            .transform(ciphertext, 0, &mut plain, 0, data_len)?;
        self.cached_chunk = Some((index, plain));
        Ok(())
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<usize> {
        self.begin(EncryptionMode::Encrypt)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let chunk_size = self.integrity.chunk_size();
        if chunk_size == 0 {
            let mut ciphertext = vec![0u8; buf.len()];
            self.transformer.sync_counter(self.position)?;
            self.transformer
                .transform(buf, 0, &mut ciphertext, 0, buf.len())?;
            self.inner
                .seek(SeekFrom::Start(self.header_length() + self.position))?;
            self.inner.write_all(&ciphertext)?;
            self.position += buf.len() as u64;
            self.length = self.length.max(self.position);
            return Ok(buf.len());
        }

        let mut written = 0;
        while written < buf.len() {
            let count = (chunk_size - self.pending.len()).min(buf.len() - written);
            self.pending
                .extend_from_slice(&buf[written..written + count]);
            written += count;
            self.position += count as u64;
            if self.pending.len() == chunk_size {
                self.flush_chunk()?;
            }
        }
        Ok(written)
    }

    /// Encrypts the pending plaintext and writes `[hash][ciphertext]`.
    fn flush_chunk(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let chunk_size = self.integrity.chunk_size() as u64;
        let chunk_start = self.position - self.pending.len() as u64;
        let index = chunk_start / chunk_size;

        let mut ciphertext = vec![0u8; self.pending.len()];
        self.transformer.sync_counter(chunk_start)?;
        self.transformer
            .transform(&self.pending, 0, &mut ciphertext, 0, self.pending.len())?;

        let header_bytes = match (index, &self.header) {
            (0, Some(header)) => Some(header.to_bytes()),
            _ => None,
        };
        let hashes = self
            .integrity
            .generate_hashes(&ciphertext, header_bytes.as_ref().map(|b| &b[..]))?
            .unwrap_or_default();
        let hash = hashes
            .first()
            .ok_or_else(|| DriveError::integrity("no hash generated for chunk"))?;

        let record_start =
            self.header_length() + index * (chunk_size + self.integrity.hash_size() as u64);
        self.inner.seek(SeekFrom::Start(record_start))?;
        self.inner.write_all(hash)?;
        self.inner.write_all(&ciphertext)?;
        self.length = self.length.max(self.position);
        self.pending.clear();
        Ok(())
    }

    /// Writes any partial chunk and flushes the store.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            StreamState::Closed => return Ok(()),
            StreamState::Created => {
                self.state = StreamState::Closed;
                return Ok(());
            }
            _ => {}
        }
        if self.mode == EncryptionMode::Encrypt {
            self.flush_chunk()?;
            self.inner.flush()?;
        }
        self.cached_chunk = None;
        self.state = StreamState::Closed;
        Ok(())
    }
}

impl<S: Read + Write + Seek> Read for AesStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_bytes(buf).map_err(DriveError::into_io)
    }
}

impl<S: Read + Write + Seek> Write for AesStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf).map_err(DriveError::into_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S: Read + Write + Seek> Seek for AesStream<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.length.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "invalid seek to a negative position")
        })?;
        self.set_position(target).map_err(DriveError::into_io)?;
        Ok(self.position)
    }
}

impl<S: Read + Write + Seek> Drop for AesStream<S> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to finish stream on drop");
        }
    }
}
