//! Persistent nonce sequencer.
//!
//! Every drive a device can write to has one [`NonceSequence`] in the
//! device's sequence table. The table is a JSON map keyed by
//! `"<drive id>:<auth id>"`. Each operation reads the whole table, mutates
//! one record and writes the whole table back while holding a lock, so two
//! callers can never be handed the same nonce. The lock is an in-process mutex
//! plus an exclusive OS lock on `<table>.lock`, which also covers several
//! sequencer instances or processes sharing one table.

use crate::error::{DriveError, Result};
use crate::nonce::{self, Nonce};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use tempfile::NamedTempFile;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceStatus {
    /// Created for a device, no nonce range yet
    New,
    Active,
    /// Terminal
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceSequence {
    pub drive_id: String,
    pub auth_id: String,
    #[serde(default, with = "nonce_base64")]
    pub next_nonce: Option<Nonce>,
    #[serde(default, with = "nonce_base64")]
    pub max_nonce: Option<Nonce>,
    pub status: SequenceStatus,
}

impl NonceSequence {
    pub fn new(drive_id: &str, auth_id: &str) -> Self {
        Self {
            drive_id: drive_id.to_string(),
            auth_id: auth_id.to_string(),
            next_nonce: None,
            max_nonce: None,
            status: SequenceStatus::New,
        }
    }

    fn key(&self) -> String {
        format!("{}:{}", self.drive_id, self.auth_id)
    }
}

/// Nonces are stored as base64 strings.
mod nonce_base64 {
    use crate::nonce::{Nonce, NONCE_LENGTH};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Nonce>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(nonce) => serializer.serialize_some(&STANDARD.encode(nonce)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Nonce>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            None => Ok(None),
            Some(s) => {
                let bytes = STANDARD.decode(s.as_bytes()).map_err(de::Error::custom)?;
                let nonce: Nonce = bytes.as_slice().try_into().map_err(|_| {
                    de::Error::custom(format!("nonce must be {} bytes", NONCE_LENGTH))
                })?;
                Ok(Some(nonce))
            }
        }
    }
}

pub type SequenceTable = BTreeMap<String, NonceSequence>;

/// Encodes the sequence table for storage.
pub trait SequenceSerializer: Send + Sync {
    fn serialize(&self, sequences: &SequenceTable) -> Result<String>;

    fn deserialize(&self, contents: &str) -> Result<SequenceTable>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSequenceSerializer;

impl SequenceSerializer for JsonSequenceSerializer {
    fn serialize(&self, sequences: &SequenceTable) -> Result<String> {
        serde_json::to_string_pretty(sequences)
            .map_err(|e| DriveError::sequence(format!("Could not serialize sequences: {}", e)))
    }

    fn deserialize(&self, contents: &str) -> Result<SequenceTable> {
        if contents.trim().is_empty() {
            return Ok(SequenceTable::new());
        }
        serde_json::from_str(contents)
            .map_err(|e| DriveError::sequence(format!("Could not parse sequence table: {}", e)))
    }
}

/// Allocator of unique, increasing nonces per drive.
pub trait NonceSequencer: Send + Sync {
    /// Adds a `New` sequence for this device; fails if the drive already has a live one.
    fn create_sequence(&self, drive_id: &str, auth_id: &str) -> Result<()>;

    /// Gives a `New` sequence its nonce range and activates it.
    fn initialize_sequence(
        &self,
        drive_id: &str,
        auth_id: &str,
        start_nonce: &Nonce,
        max_nonce: &Nonce,
    ) -> Result<()>;

    /// Lowers the ceiling of a sequence. Raising it is rejected.
    fn set_max_nonce(&self, drive_id: &str, auth_id: &str, max_nonce: &Nonce) -> Result<()>;

    /// Returns the next nonce and commits the advanced counter.
    fn next_nonce(&self, drive_id: &str) -> Result<Nonce>;

    fn revoke_sequence(&self, drive_id: &str) -> Result<()>;

    /// The live (`New` or `Active`) sequence of a drive.
    fn get_sequence(&self, drive_id: &str) -> Result<Option<NonceSequence>>;
}

/// Finds the key of the live sequence for `drive_id`.
///
/// Drive ids compare case-insensitively. More than one live sequence means the
/// table is corrupt.
fn find_live(sequences: &SequenceTable, drive_id: &str) -> Result<Option<String>> {
    let mut found = None;
    for (key, seq) in sequences {
        if seq.drive_id.eq_ignore_ascii_case(drive_id) && seq.status != SequenceStatus::Revoked {
            if found.is_some() {
                return Err(DriveError::sequence("Corrupt sequence config"));
            }
            found = Some(key.clone());
        }
    }
    Ok(found)
}

fn live_mut<'a>(sequences: &'a mut SequenceTable, drive_id: &str) -> Result<Option<&'a mut NonceSequence>> {
    match find_live(sequences, drive_id)? {
        Some(key) => Ok(sequences.get_mut(&key)),
        None => Ok(None),
    }
}

/// Sequencer persisted to a single file.
pub struct FileSequencer {
    path: PathBuf,
    serializer: Box<dyn SequenceSerializer>,
    lock: Mutex<()>,
}

impl std::fmt::Debug for FileSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSequencer").field("path", &self.path).finish()
    }
}

impl FileSequencer {
    /// Opens the table at `path`, creating an empty one when missing.
    pub fn new(path: impl Into<PathBuf>, serializer: Box<dyn SequenceSerializer>) -> Result<Self> {
        let sequencer = Self {
            path: path.into(),
            serializer,
            lock: Mutex::new(()),
        };
        fs::create_dir_all(sequencer.dir())?;
        sequencer.locked(|| {
            if !sequencer.path.exists() {
                sequencer.save(&SequenceTable::new())?;
                debug!(path = %sequencer.path.display(), "created sequence table");
            }
            Ok(())
        })?;
        Ok(sequencer)
    }

    pub fn json(path: impl Into<PathBuf>) -> Result<Self> {
        Self::new(path, Box::new(JsonSequenceSerializer))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Sibling file every instance on this table locks, in any process.
    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Runs `f` holding the in-process mutex and an exclusive OS lock on the
    /// table's lock file.
    fn locked<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock();
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.lock_path())?;
        lock_file.lock_exclusive()?;
        let result = f();
        FileExt::unlock(&lock_file)?;
        result
    }

    fn load(&self) -> Result<SequenceTable> {
        let contents = fs::read_to_string(&self.path)?;
        self.serializer.deserialize(&contents)
    }

    /// Writes a uniquely named temp file next to the table and renames it over.
    fn save(&self, sequences: &SequenceTable) -> Result<()> {
        let contents = self.serializer.serialize(sequences)?;
        let mut tmp = NamedTempFile::new_in(self.dir())?;
        tmp.write_all(contents.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| DriveError::Io(e.error))?;
        Ok(())
    }

    /// One read-modify-write cycle under the lock. The table is only written
    /// back when `f` succeeds.
    fn update<T>(&self, f: impl FnOnce(&mut SequenceTable) -> Result<T>) -> Result<T> {
        self.locked(|| {
            let mut sequences = self.load()?;
            let value = f(&mut sequences)?;
            self.save(&sequences)?;
            Ok(value)
        })
    }
}

impl NonceSequencer for FileSequencer {
    fn create_sequence(&self, drive_id: &str, auth_id: &str) -> Result<()> {
        self.update(|sequences| {
            if find_live(sequences, drive_id)?.is_some() {
                return Err(DriveError::sequence("Sequence already exists"));
            }
            let sequence = NonceSequence::new(drive_id, auth_id);
            sequences.insert(sequence.key(), sequence);
            Ok(())
        })?;
        debug!(drive_id, auth_id, "sequence created");
        Ok(())
    }

    fn initialize_sequence(
        &self,
        drive_id: &str,
        auth_id: &str,
        start_nonce: &Nonce,
        max_nonce: &Nonce,
    ) -> Result<()> {
        if nonce::to_u64(start_nonce) > nonce::to_u64(max_nonce) {
            return Err(DriveError::sequence("Start nonce is past the max nonce"));
        }
        self.update(|sequences| {
            let sequence = live_mut(sequences, drive_id)?
                .ok_or_else(|| DriveError::sequence("Sequence does not exist"))?;
            if sequence.next_nonce.is_some() {
                return Err(DriveError::sequence("Cannot reinitialize sequence"));
            }
            sequence.next_nonce = Some(*start_nonce);
            sequence.max_nonce = Some(*max_nonce);
            sequence.status = SequenceStatus::Active;
            Ok(())
        })?;
        debug!(drive_id, auth_id, "sequence initialized");
        Ok(())
    }

    fn set_max_nonce(&self, drive_id: &str, auth_id: &str, max_nonce: &Nonce) -> Result<()> {
        self.update(|sequences| {
            let sequence = live_mut(sequences, drive_id)?
                .ok_or_else(|| DriveError::sequence("Sequence does not exist"))?;
            let (next, current_max) = match (sequence.next_nonce, sequence.max_nonce) {
                (Some(next), Some(max)) => (next, max),
                _ => return Err(DriveError::sequence("Sequence is not initialized")),
            };
            let new_max = nonce::to_u64(max_nonce);
            if new_max > nonce::to_u64(&current_max) {
                return Err(DriveError::sequence("Max nonce cannot be increased"));
            }
            if new_max < nonce::to_u64(&next) {
                return Err(DriveError::sequence("Max nonce cannot be lower than the next nonce"));
            }
            sequence.max_nonce = Some(*max_nonce);
            Ok(())
        })?;
        debug!(drive_id, auth_id, "max nonce lowered");
        Ok(())
    }

    fn next_nonce(&self, drive_id: &str) -> Result<Nonce> {
        self.update(|sequences| {
            let sequence = live_mut(sequences, drive_id)?
                .ok_or_else(|| DriveError::sequence("Device not Authorized"))?;
            let (next, max) = match (sequence.next_nonce, sequence.max_nonce) {
                (Some(next), Some(max)) => (next, max),
                _ => return Err(DriveError::sequence("Device not Authorized")),
            };
            // fails without touching the table when the range is used up
            sequence.next_nonce = Some(nonce::increase_nonce(&next, &max)?);
            Ok(next)
        })
    }

    fn revoke_sequence(&self, drive_id: &str) -> Result<()> {
        self.update(|sequences| {
            let sequence = live_mut(sequences, drive_id)?
                .ok_or_else(|| DriveError::sequence("Sequence does not exist"))?;
            sequence.status = SequenceStatus::Revoked;
            Ok(())
        })?;
        debug!(drive_id, "sequence revoked");
        Ok(())
    }

    fn get_sequence(&self, drive_id: &str) -> Result<Option<NonceSequence>> {
        let _guard = self.lock.lock();
        let sequences = self.load()?;
        Ok(find_live(&sequences, drive_id)?.and_then(|key| sequences.get(&key).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::nonce::{from_u64, to_u64};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sequencer(dir: &TempDir) -> FileSequencer {
        FileSequencer::json(dir.path().join("config.json")).unwrap()
    }

    #[test]
    fn test_sequence_scenario() {
        let dir = TempDir::new().unwrap();
        let seq = sequencer(&dir);
        seq.create_sequence("AAAA", "AAAA").unwrap();
        seq.initialize_sequence("AAAA", "AAAA", &from_u64(1), &from_u64(4))
            .unwrap();

        assert_eq!(to_u64(&seq.next_nonce("AAAA").unwrap()), 1);
        assert_eq!(to_u64(&seq.next_nonce("AAAA").unwrap()), 2);
        assert_eq!(to_u64(&seq.next_nonce("AAAA").unwrap()), 3);
        let err = seq.next_nonce("AAAA").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RangeExceeded);

        // the failed call left the counter alone
        let stored = seq.get_sequence("AAAA").unwrap().unwrap();
        assert_eq!(stored.next_nonce, Some(from_u64(4)));
    }

    #[test]
    fn test_drive_id_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let seq = sequencer(&dir);
        seq.create_sequence("abcd", "01").unwrap();
        assert!(seq.get_sequence("ABCD").unwrap().is_some());
    }

    #[test]
    fn test_max_nonce_cannot_be_raised() {
        let dir = TempDir::new().unwrap();
        let seq = sequencer(&dir);
        seq.create_sequence("D1", "A1").unwrap();
        seq.initialize_sequence("D1", "A1", &from_u64(10), &from_u64(100))
            .unwrap();

        let err = seq.set_max_nonce("D1", "A1", &from_u64(101)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Sequence);
        let stored = seq.get_sequence("D1").unwrap().unwrap();
        assert_eq!(stored.max_nonce, Some(from_u64(100)));

        seq.set_max_nonce("D1", "A1", &from_u64(50)).unwrap();
        assert!(seq.set_max_nonce("D1", "A1", &from_u64(9)).is_err());
        let stored = seq.get_sequence("D1").unwrap().unwrap();
        assert_eq!(stored.max_nonce, Some(from_u64(50)));
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = TempDir::new().unwrap();
        let seq = sequencer(&dir);
        seq.create_sequence("D1", "A1").unwrap();
        let err = seq.create_sequence("D1", "A2").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Sequence);
    }

    #[test]
    fn test_reinitialize_fails() {
        let dir = TempDir::new().unwrap();
        let seq = sequencer(&dir);
        seq.create_sequence("D1", "A1").unwrap();
        seq.initialize_sequence("D1", "A1", &from_u64(0), &from_u64(10))
            .unwrap();
        let err = seq
            .initialize_sequence("D1", "A1", &from_u64(0), &from_u64(10))
            .unwrap_err();
        assert_eq!(err.to_string(), "Sequence error: Cannot reinitialize sequence");
    }

    #[test]
    fn test_uninitialized_not_authorized() {
        let dir = TempDir::new().unwrap();
        let seq = sequencer(&dir);
        assert!(seq.next_nonce("D1").is_err());
        seq.create_sequence("D1", "A1").unwrap();
        let err = seq.next_nonce("D1").unwrap_err();
        assert_eq!(err.to_string(), "Sequence error: Device not Authorized");
    }

    #[test]
    fn test_revoke_then_recreate() {
        let dir = TempDir::new().unwrap();
        let seq = sequencer(&dir);
        seq.create_sequence("D1", "A1").unwrap();
        seq.initialize_sequence("D1", "A1", &from_u64(0), &from_u64(10))
            .unwrap();
        seq.revoke_sequence("D1").unwrap();
        assert!(seq.get_sequence("D1").unwrap().is_none());
        assert!(seq.next_nonce("D1").is_err());
        assert!(seq.revoke_sequence("D1").is_err());

        // revoked records stay in the table next to the new one
        seq.create_sequence("D1", "A2").unwrap();
        let live = seq.get_sequence("D1").unwrap().unwrap();
        assert_eq!(live.auth_id, "A2");
        assert_eq!(live.status, SequenceStatus::New);
    }

    #[test]
    fn test_duplicate_live_sequences_are_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut table = SequenceTable::new();
        for auth in ["A1", "A2"] {
            let mut s = NonceSequence::new("D1", auth);
            s.status = SequenceStatus::Active;
            s.next_nonce = Some(from_u64(0));
            s.max_nonce = Some(from_u64(10));
            table.insert(s.key(), s);
        }
        fs::write(&path, JsonSequenceSerializer.serialize(&table).unwrap()).unwrap();

        let seq = FileSequencer::json(&path).unwrap();
        let err = seq.get_sequence("D1").unwrap_err();
        assert_eq!(err.to_string(), "Sequence error: Corrupt sequence config");
        assert!(seq.next_nonce("D1").is_err());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let seq = sequencer(&dir);
            seq.create_sequence("D1", "A1").unwrap();
            seq.initialize_sequence("D1", "A1", &from_u64(5), &from_u64(100))
                .unwrap();
            seq.next_nonce("D1").unwrap();
        }
        let seq = sequencer(&dir);
        assert_eq!(to_u64(&seq.next_nonce("D1").unwrap()), 6);

        let raw = fs::read_to_string(dir.path().join("config.json")).unwrap();
        assert!(raw.contains("\"D1:A1\""));
        assert!(raw.contains("\"nextNonce\""));
    }

    #[test]
    fn test_corrupt_table_is_sequence_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let seq = FileSequencer::json(&path).unwrap();
        assert_eq!(seq.get_sequence("D1").unwrap_err().kind(), ErrorKind::Sequence);
    }

    #[test]
    fn test_concurrent_callers_get_unique_nonces() {
        let dir = TempDir::new().unwrap();
        let seq = Arc::new(sequencer(&dir));
        seq.create_sequence("D1", "A1").unwrap();
        seq.initialize_sequence("D1", "A1", &from_u64(0), &from_u64(1000))
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = Arc::clone(&seq);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| to_u64(&seq.next_nonce("D1").unwrap()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 100);
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_two_instances_share_one_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.json");
        let first = Arc::new(FileSequencer::json(&path).unwrap());
        let second = Arc::new(FileSequencer::json(&path).unwrap());
        first.create_sequence("D1", "A1").unwrap();
        first
            .initialize_sequence("D1", "A1", &from_u64(0), &from_u64(10_000))
            .unwrap();

        let handles: Vec<_> = [&first, &first, &second, &second]
            .into_iter()
            .map(|seq| {
                let seq = Arc::clone(seq);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| to_u64(&seq.next_nonce("D1").unwrap()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..200).collect::<Vec<_>>());

        // no temp files left next to the table
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n != "shared.json" && n != "shared.json.lock")
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
    }
}
