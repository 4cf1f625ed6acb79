//! Drive identity and encrypted file handles.
//!
//! A drive is a directory holding `drive.json` (the 16-byte drive id and a key
//! check value) and a `data/` directory with the encrypted files. The device
//! side of the drive is its sequence in the local [`NonceSequencer`], which also
//! remembers the device's auth id for that drive.

use crate::error::{DriveError, Result};
use crate::file::{LocalFile, RealFile, RealStream};
use crate::header::{EncryptionFormat, EncryptionMode, Header, HEADER_LENGTH};
use crate::integrity::{self, HashProvider, HmacSha256Provider, DEFAULT_CHUNK_SIZE};
use crate::key_manager::DriveKey;
use crate::nonce::{self, Nonce, MAX_NONCE, STARTING_NONCE};
use crate::sequence::{NonceSequencer, SequenceStatus};
use crate::streaming::AesStream;
use crate::transform::{default_provider, TransformerProvider};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info};

pub const DRIVE_CONFIG_FILE: &str = "drive.json";
pub const DATA_DIR: &str = "data";
pub const DRIVE_ID_LENGTH: usize = 16;
pub const AUTH_ID_LENGTH: usize = 16;

const DRIVE_CONFIG_VERSION: u32 = 1;
const KEY_CHECK_LABEL: &[u8] = b"aesdrive key check";

/// Accepts a plain file name only, so a handle never leaves the data directory.
pub fn validate_file_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || Path::new(name).is_absolute();
    if invalid {
        return Err(DriveError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid file name: {:?}", name),
        )));
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveConfig {
    version: u32,
    drive_id: String,
    key_check: String,
}

fn key_check(key: &DriveKey, drive_id: &[u8]) -> Result<Vec<u8>> {
    HmacSha256Provider.calc(key.hash_key(), &[KEY_CHECK_LABEL, drive_id])
}

fn decode_id(value: &str, what: &str) -> Result<[u8; 16]> {
    let bytes = hex::decode(value).map_err(|e| DriveError::format(format!("bad {}: {}", what, e)))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| DriveError::format(format!("{} must be 16 bytes", what)))
}

/// Parses a hex auth id as printed by [`Drive::auth_id_hex`].
pub fn parse_auth_id(value: &str) -> Result<[u8; AUTH_ID_LENGTH]> {
    decode_id(value.trim(), "auth id")
}

pub struct Drive {
    root: PathBuf,
    drive_id: [u8; DRIVE_ID_LENGTH],
    auth_id: [u8; AUTH_ID_LENGTH],
    key: DriveKey,
    sequencer: Arc<dyn NonceSequencer>,
    provider: Arc<dyn TransformerProvider>,
    integrity: bool,
    chunk_size: usize,
}

impl std::fmt::Debug for Drive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drive")
            .field("root", &self.root)
            .field("drive_id", &hex::encode(self.drive_id))
            .field("auth_id", &hex::encode(self.auth_id))
            .field("integrity", &self.integrity)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl Drive {
    /// Creates a new drive at `root` and gives this device the whole nonce range.
    pub fn create(
        root: impl Into<PathBuf>,
        key: DriveKey,
        sequencer: Arc<dyn NonceSequencer>,
    ) -> Result<Self> {
        let root = root.into();
        let config_path = root.join(DRIVE_CONFIG_FILE);
        if config_path.exists() {
            return Err(DriveError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("a drive already exists at {}", root.display()),
            )));
        }
        fs::create_dir_all(root.join(DATA_DIR))?;

        let drive_id = nonce::random_id();
        let config = DriveConfig {
            version: DRIVE_CONFIG_VERSION,
            drive_id: hex::encode(drive_id),
            key_check: hex::encode(key_check(&key, &drive_id)?),
        };
        let contents = serde_json::to_string_pretty(&config)
            .map_err(|e| DriveError::format(format!("could not encode drive config: {}", e)))?;
        fs::write(&config_path, contents)?;
        info!(root = %root.display(), drive_id = %config.drive_id, "drive created");

        let drive = Self::open(root, key, sequencer)?;
        drive.authorize_new()?;
        Ok(drive)
    }

    /// Opens an existing drive, registering this device with a fresh auth id
    /// when the sequencer has no sequence for it yet.
    pub fn open(
        root: impl Into<PathBuf>,
        key: DriveKey,
        sequencer: Arc<dyn NonceSequencer>,
    ) -> Result<Self> {
        let root = root.into();
        let contents = fs::read_to_string(root.join(DRIVE_CONFIG_FILE))?;
        let config: DriveConfig = serde_json::from_str(&contents)
            .map_err(|e| DriveError::format(format!("could not parse drive config: {}", e)))?;
        if config.version != DRIVE_CONFIG_VERSION {
            return Err(DriveError::format(format!(
                "unsupported drive config version: {}",
                config.version
            )));
        }
        let drive_id = decode_id(&config.drive_id, "drive id")?;
        let expected = hex::decode(&config.key_check)
            .map_err(|e| DriveError::format(format!("bad key check: {}", e)))?;
        let actual = key_check(&key, &drive_id)?;
        if !bool::from(actual.as_slice().ct_eq(expected.as_slice())) {
            return Err(DriveError::security("Key does not match this drive"));
        }

        let drive_id_hex = hex::encode(drive_id);
        let auth_id = match sequencer.get_sequence(&drive_id_hex)? {
            Some(sequence) => decode_id(&sequence.auth_id, "auth id")?,
            None => {
                let auth_id = nonce::random_id();
                sequencer.create_sequence(&drive_id_hex, &hex::encode(auth_id))?;
                auth_id
            }
        };
        fs::create_dir_all(root.join(DATA_DIR))?;
        debug!(root = %root.display(), drive_id = %drive_id_hex, "drive opened");

        Ok(Self {
            root,
            drive_id,
            auth_id,
            key,
            sequencer,
            provider: default_provider(),
            integrity: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    /// Gives this device the full default nonce range.
    ///
    /// Only valid once, right after the drive is created; every other device
    /// gets its range through an auth file.
    pub fn authorize_new(&self) -> Result<()> {
        self.sequencer.initialize_sequence(
            &self.drive_id_hex(),
            &self.auth_id_hex(),
            &STARTING_NONCE,
            &MAX_NONCE,
        )
    }

    /// Revokes this device's sequence and registers a new auth id so the
    /// device can be authorized again.
    pub fn revoke_authorization(&mut self) -> Result<()> {
        let drive_id = self.drive_id_hex();
        self.sequencer.revoke_sequence(&drive_id)?;
        let auth_id = nonce::random_id();
        self.sequencer.create_sequence(&drive_id, &hex::encode(auth_id))?;
        self.auth_id = auth_id;
        info!(drive_id = %drive_id, "device authorization revoked");
        Ok(())
    }

    pub fn is_authorized(&self) -> Result<bool> {
        Ok(self
            .sequencer
            .get_sequence(&self.drive_id_hex())?
            .map(|s| s.status == SequenceStatus::Active)
            .unwrap_or(false))
    }

    pub fn next_nonce(&self) -> Result<Nonce> {
        self.sequencer.next_nonce(&self.drive_id_hex())
    }

    /// Integrity settings for files written from now on.
    pub fn set_integrity(&mut self, enabled: bool, chunk_size: usize) -> Result<()> {
        integrity::validate_chunk_size(chunk_size)?;
        self.integrity = enabled;
        self.chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Ok(())
    }

    pub fn set_provider(&mut self, provider: Arc<dyn TransformerProvider>) {
        self.provider = provider;
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> LocalFile {
        LocalFile::new(self.root.join(DATA_DIR))
    }

    pub fn drive_id(&self) -> [u8; DRIVE_ID_LENGTH] {
        self.drive_id
    }

    pub fn drive_id_hex(&self) -> String {
        hex::encode(self.drive_id)
    }

    pub fn auth_id(&self) -> [u8; AUTH_ID_LENGTH] {
        self.auth_id
    }

    pub fn auth_id_hex(&self) -> String {
        hex::encode(self.auth_id)
    }

    pub fn key(&self) -> &DriveKey {
        &self.key
    }

    pub fn sequencer(&self) -> &Arc<dyn NonceSequencer> {
        &self.sequencer
    }

    pub fn integrity(&self) -> bool {
        self.integrity
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Handle to the encrypted file `name` in the data directory.
    pub fn file(&self, name: &str) -> Result<AesFile> {
        validate_file_name(name)?;
        Ok(AesFile::new(self.data_dir().child(name), self))
    }

    /// Handle to an encrypted file anywhere, e.g. an auth exchange file.
    pub fn file_at(&self, real: Box<dyn RealFile>) -> AesFile {
        AesFile::new(real, self)
    }

    /// Encrypted files in the data directory.
    pub fn list_files(&self) -> Result<Vec<AesFile>> {
        let mut files: Vec<AesFile> = self
            .data_dir()
            .list_files()?
            .into_iter()
            .filter(|f| !f.is_directory())
            .map(|f| AesFile::new(f, self))
            .collect();
        files.sort_by_key(|f| f.name());
        Ok(files)
    }
}

/// One encrypted file of a drive.
///
/// Writers draw a fresh nonce from the drive's sequencer. A caller-chosen
/// nonce is only accepted together with `allow_overwrite`, which is how
/// parallel workers write disjoint parts of one file under its single nonce.
pub struct AesFile {
    real: Box<dyn RealFile>,
    key: DriveKey,
    sequencer: Arc<dyn NonceSequencer>,
    drive_id: String,
    provider: Arc<dyn TransformerProvider>,
    requested_nonce: Option<Nonce>,
    integrity: bool,
    chunk_size: usize,
    allow_overwrite: bool,
}

impl std::fmt::Debug for AesFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesFile")
            .field("real", &self.real)
            .field("integrity", &self.integrity)
            .field("chunk_size", &self.chunk_size)
            .field("allow_overwrite", &self.allow_overwrite)
            .finish()
    }
}

impl AesFile {
    pub fn new(real: Box<dyn RealFile>, drive: &Drive) -> Self {
        Self {
            real,
            key: drive.key.clone(),
            sequencer: Arc::clone(&drive.sequencer),
            drive_id: drive.drive_id_hex(),
            provider: Arc::clone(&drive.provider),
            requested_nonce: None,
            integrity: drive.integrity,
            chunk_size: drive.chunk_size,
            allow_overwrite: false,
        }
    }

    pub fn name(&self) -> String {
        self.real.name()
    }

    pub fn real_file(&self) -> &dyn RealFile {
        self.real.as_ref()
    }

    pub fn exists(&self) -> bool {
        self.real.exists()
    }

    pub fn encryption_key(&self) -> &[u8] {
        self.key.key()
    }

    pub fn hash_key(&self) -> &[u8] {
        self.key.hash_key()
    }

    pub fn requested_nonce(&self) -> Option<Nonce> {
        self.requested_nonce
    }

    pub fn set_requested_nonce(&mut self, nonce: Option<Nonce>) {
        self.requested_nonce = nonce;
    }

    pub fn set_allow_overwrite(&mut self, allow: bool) {
        self.allow_overwrite = allow;
    }

    pub fn allow_overwrite(&self) -> bool {
        self.allow_overwrite
    }

    /// Integrity for writing, and whether reads verify.
    pub fn set_apply_integrity(&mut self, enabled: bool, chunk_size: usize) -> Result<()> {
        integrity::validate_chunk_size(chunk_size)?;
        self.integrity = enabled;
        self.chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Ok(())
    }

    pub fn integrity(&self) -> bool {
        self.integrity
    }

    /// Chunk size that writes will use, 0 without integrity.
    pub fn chunk_size(&self) -> usize {
        if self.integrity {
            self.chunk_size
        } else {
            0
        }
    }

    /// Header of the stored file, `None` when the file is missing or empty.
    pub fn header(&self) -> Result<Option<Header>> {
        if !self.real.exists() || self.real.length()? < HEADER_LENGTH as u64 {
            return Ok(None);
        }
        let mut stream = self.real.input_stream()?;
        let mut bytes = [0u8; HEADER_LENGTH];
        stream.read_exact(&mut bytes)?;
        Ok(Some(Header::from_bytes(&bytes)?))
    }

    /// Plaintext size of the stored file.
    pub fn length(&self) -> Result<u64> {
        match self.header()? {
            Some(header) => Ok(AesStream::<Box<dyn RealStream>>::output_size(
                EncryptionMode::Decrypt,
                self.real.length()?,
                EncryptionFormat::Headered,
                header.chunk_size as usize,
            )),
            None => Ok(0),
        }
    }

    /// Opens an encrypting stream.
    ///
    /// Without a requested nonce the file is truncated and a new nonce is taken
    /// from the sequencer. With one, existing bytes are kept and range writes
    /// are enabled.
    pub fn output_stream(&self) -> Result<AesStream<Box<dyn RealStream>>> {
        let (nonce, truncate) = match self.requested_nonce {
            Some(nonce) => {
                if !self.allow_overwrite {
                    return Err(DriveError::security(
                        "A requested nonce overwrites data under an existing nonce, \
                         enable allow_overwrite only for parallel writers of a new file",
                    ));
                }
                (nonce, false)
            }
            None => {
                if self.real.exists() && !self.allow_overwrite {
                    return Err(DriveError::Io(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} already exists", self.real.name()),
                    )));
                }
                (self.sequencer.next_nonce(&self.drive_id)?, true)
            }
        };
        let inner = self.real.output_stream(truncate)?;
        let hash_key = if self.integrity {
            Some(self.key.hash_key())
        } else {
            None
        };
        let mut stream = AesStream::new(
            inner,
            EncryptionMode::Encrypt,
            EncryptionFormat::Headered,
            self.key.key(),
            hash_key,
            self.chunk_size(),
            Arc::clone(&self.provider),
        )?;
        stream.set_nonce(nonce)?;
        stream.set_allow_range_write(self.requested_nonce.is_some());
        stream.init()?;
        Ok(stream)
    }

    /// Opens a decrypting stream; verifies chunks when integrity is on.
    pub fn input_stream(&self) -> Result<AesStream<Box<dyn RealStream>>> {
        let inner = self.real.input_stream()?;
        let hash_key = if self.integrity {
            Some(self.key.hash_key())
        } else {
            None
        };
        let mut stream = AesStream::new(
            inner,
            EncryptionMode::Decrypt,
            EncryptionFormat::Headered,
            self.key.key(),
            hash_key,
            0,
            Arc::clone(&self.provider),
        )?;
        stream.init()?;
        Ok(stream)
    }

    pub fn delete(&self) -> Result<()> {
        self.real.delete()
    }
}
