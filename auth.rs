//! Device authorization.
//!
//! An authorized device hands half of its remaining nonce range to another
//! device of the same drive. The exporter lowers its own max nonce to the
//! pivot and writes `[drive id][target auth id][pivot][old max]` into an
//! encrypted auth file; the target decrypts it and starts its sequence at the
//! pivot. A sequence never issues its max nonce, so the exporter stops at
//! `pivot - 1` and the two devices can never share a nonce.

use crate::drive::{Drive, AUTH_ID_LENGTH, DRIVE_ID_LENGTH};
use crate::error::{DriveError, Result};
use crate::file::RealFile;
use crate::nonce::{self, Nonce, NONCE_LENGTH};
use crate::sequence::SequenceStatus;
use std::io::{Read, Write};
use tracing::info;

pub const AUTH_CONFIG_LENGTH: usize = DRIVE_ID_LENGTH + AUTH_ID_LENGTH + 2 * NONCE_LENGTH;

/// Decrypted contents of an auth file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub drive_id: [u8; DRIVE_ID_LENGTH],
    pub auth_id: [u8; AUTH_ID_LENGTH],
    pub start_nonce: Nonce,
    pub max_nonce: Nonce,
}

impl AuthConfig {
    pub fn to_bytes(&self) -> [u8; AUTH_CONFIG_LENGTH] {
        let mut bytes = [0u8; AUTH_CONFIG_LENGTH];
        let (drive_id, rest) = bytes.split_at_mut(DRIVE_ID_LENGTH);
        let (auth_id, rest) = rest.split_at_mut(AUTH_ID_LENGTH);
        let (start, max) = rest.split_at_mut(NONCE_LENGTH);
        drive_id.copy_from_slice(&self.drive_id);
        auth_id.copy_from_slice(&self.auth_id);
        start.copy_from_slice(&self.start_nonce);
        max.copy_from_slice(&self.max_nonce);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != AUTH_CONFIG_LENGTH {
            return Err(DriveError::format(format!(
                "auth config must be {} bytes, got {}",
                AUTH_CONFIG_LENGTH,
                bytes.len()
            )));
        }
        let (drive_id, rest) = bytes.split_at(DRIVE_ID_LENGTH);
        let (auth_id, rest) = rest.split_at(AUTH_ID_LENGTH);
        let (start, max) = rest.split_at(NONCE_LENGTH);
        let mut config = Self {
            drive_id: [0u8; DRIVE_ID_LENGTH],
            auth_id: [0u8; AUTH_ID_LENGTH],
            start_nonce: nonce::from_slice(start)?,
            max_nonce: nonce::from_slice(max)?,
        };
        config.drive_id.copy_from_slice(drive_id);
        config.auth_id.copy_from_slice(auth_id);
        Ok(config)
    }
}

/// Splits this device's remaining range and writes the upper half for
/// `target_auth_id` into `file`.
pub fn export_auth_file(
    drive: &Drive,
    target_auth_id: &[u8; AUTH_ID_LENGTH],
    file: Box<dyn RealFile>,
) -> Result<AuthConfig> {
    if *target_auth_id == drive.auth_id() {
        return Err(DriveError::auth("Cannot export an authorization to this same device"));
    }
    let drive_id = drive.drive_id_hex();
    let sequencer = drive.sequencer();

    // the auth file itself is encrypted under a nonce from our own range
    let config_nonce = sequencer.next_nonce(&drive_id)?;
    let sequence = sequencer
        .get_sequence(&drive_id)?
        .filter(|s| s.status == SequenceStatus::Active)
        .ok_or_else(|| DriveError::sequence("Device is not authorized to export"))?;
    let next = sequence
        .next_nonce
        .ok_or_else(|| DriveError::sequence("Could not get next nonce"))?;
    let max = sequence
        .max_nonce
        .ok_or_else(|| DriveError::sequence("Could not get current max nonce"))?;
    let pivot = nonce::split_nonce_range(&next, &max)?;
    sequencer.set_max_nonce(&drive_id, &sequence.auth_id, &pivot)?;

    let config = AuthConfig {
        drive_id: drive.drive_id(),
        auth_id: *target_auth_id,
        start_nonce: pivot,
        max_nonce: max,
    };

    if file.exists() {
        file.delete()?;
    }
    let mut auth_file = drive.file_at(file);
    auth_file.set_requested_nonce(Some(config_nonce));
    auth_file.set_allow_overwrite(true);
    let mut stream = auth_file.output_stream()?;
    stream.write_all(&config.to_bytes())?;
    stream.close()?;

    info!(
        drive_id = %drive_id,
        target_auth_id = %hex::encode(target_auth_id),
        "exported device authorization"
    );
    Ok(config)
}

/// Reads an auth file addressed to this device and activates its sequence.
pub fn import_auth_file(drive: &Drive, file: Box<dyn RealFile>) -> Result<AuthConfig> {
    let drive_id = drive.drive_id_hex();
    let sequencer = drive.sequencer();
    if let Some(sequence) = sequencer.get_sequence(&drive_id)? {
        if sequence.status == SequenceStatus::Active {
            return Err(DriveError::auth("Device is already authorized"));
        }
    }
    if !file.exists() {
        return Err(DriveError::auth(format!(
            "Could not import file, {} not found",
            file.name()
        )));
    }

    let auth_file = drive.file_at(file);
    let mut contents = Vec::with_capacity(AUTH_CONFIG_LENGTH);
    auth_file.input_stream()?.read_to_end(&mut contents)?;
    let config = AuthConfig::from_bytes(&contents)?;

    if config.auth_id != drive.auth_id() {
        return Err(DriveError::security(
            "Could not authorize this device, the authorization id does not match",
        ));
    }
    if config.drive_id != drive.drive_id() {
        return Err(DriveError::security("Auth file does not belong to this drive"));
    }

    sequencer.initialize_sequence(
        &drive_id,
        &drive.auth_id_hex(),
        &config.start_nonce,
        &config.max_nonce,
    )?;
    info!(drive_id = %drive_id, "imported device authorization");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::file::LocalFile;
    use crate::key_manager::DriveKey;
    use crate::nonce::{from_u64, to_u64, MAX_NONCE};
    use crate::sequence::{FileSequencer, NonceSequencer};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Devices {
        dir: TempDir,
        a: Drive,
        b: Drive,
    }

    fn two_devices() -> Devices {
        let dir = TempDir::new().unwrap();
        let key = DriveKey::generate();
        let seq_a = Arc::new(FileSequencer::json(dir.path().join("a.json")).unwrap());
        let seq_b = Arc::new(FileSequencer::json(dir.path().join("b.json")).unwrap());
        let a = Drive::create(dir.path().join("drive"), key.clone(), seq_a).unwrap();
        let b = Drive::open(dir.path().join("drive"), key, seq_b).unwrap();
        Devices { dir, a, b }
    }

    fn auth_file(dir: &TempDir) -> Box<dyn RealFile> {
        Box::new(LocalFile::new(dir.path().join("device.auth")))
    }

    #[test]
    fn test_config_layout() {
        let config = AuthConfig {
            drive_id: [1; 16],
            auth_id: [2; 16],
            start_nonce: from_u64(3),
            max_nonce: from_u64(4),
        };
        let bytes = config.to_bytes();
        assert_eq!(bytes.len(), 48);
        assert_eq!(&bytes[32..40], &from_u64(3));
        assert_eq!(AuthConfig::from_bytes(&bytes).unwrap(), config);
        assert_eq!(
            AuthConfig::from_bytes(&bytes[..47]).unwrap_err().kind(),
            ErrorKind::Format
        );
    }

    #[test]
    fn test_export_import_splits_range() {
        let devices = two_devices();
        let (a, b) = (&devices.a, &devices.b);
        assert!(!b.is_authorized().unwrap());
        assert!(b.next_nonce().is_err());

        let exported = export_auth_file(a, &b.auth_id(), auth_file(&devices.dir)).unwrap();
        let imported = import_auth_file(b, auth_file(&devices.dir)).unwrap();
        assert_eq!(exported, imported);
        assert!(b.is_authorized().unwrap());

        let seq_a = a.sequencer().get_sequence(&a.drive_id_hex()).unwrap().unwrap();
        let seq_b = b.sequencer().get_sequence(&b.drive_id_hex()).unwrap().unwrap();
        // the exporter already spent nonce 0 on the auth file itself
        assert_eq!(seq_a.next_nonce, Some(from_u64(1)));
        assert_eq!(seq_a.max_nonce, Some(imported.start_nonce));
        assert_eq!(seq_b.next_nonce, Some(imported.start_nonce));
        assert_eq!(seq_b.max_nonce, Some(MAX_NONCE));
        assert_eq!(
            to_u64(&imported.start_nonce),
            1 + (to_u64(&MAX_NONCE) - 1) / 2
        );

        assert!(to_u64(&a.next_nonce().unwrap()) < to_u64(&imported.start_nonce));
        assert_eq!(b.next_nonce().unwrap(), imported.start_nonce);
    }

    #[test]
    fn test_small_range_never_overlaps() {
        let devices = two_devices();
        let (b, dir) = (&devices.b, &devices.dir);
        // a third device with a tiny range of its own
        let seq_c: Arc<dyn NonceSequencer> =
            Arc::new(FileSequencer::json(dir.path().join("c.json")).unwrap());
        let c = Drive::open(devices.a.root(), devices.a.key().clone(), Arc::clone(&seq_c)).unwrap();
        seq_c
            .initialize_sequence(&c.drive_id_hex(), &c.auth_id_hex(), &from_u64(0), &from_u64(3))
            .unwrap();

        export_auth_file(&c, &b.auth_id(), auth_file(dir)).unwrap();
        import_auth_file(b, auth_file(dir)).unwrap();

        let mut issued = vec![0u64];
        while let Ok(n) = c.next_nonce() {
            issued.push(to_u64(&n));
        }
        while let Ok(n) = b.next_nonce() {
            issued.push(to_u64(&n));
        }
        assert_eq!(issued, vec![0, 1, 2]);

        // nothing left to split
        assert_eq!(
            export_auth_file(&c, &[9; 16], auth_file(dir)).unwrap_err().kind(),
            ErrorKind::RangeExceeded
        );
    }

    #[test]
    fn test_wrong_device_rejected() {
        let devices = two_devices();
        let (a, b) = (&devices.a, &devices.b);
        export_auth_file(a, &[7; 16], auth_file(&devices.dir)).unwrap();
        let err = import_auth_file(b, auth_file(&devices.dir)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Security);
        assert!(!b.is_authorized().unwrap());
    }

    #[test]
    fn test_already_authorized_rejected() {
        let devices = two_devices();
        let (a, b) = (&devices.a, &devices.b);
        export_auth_file(a, &b.auth_id(), auth_file(&devices.dir)).unwrap();
        let err = import_auth_file(a, auth_file(&devices.dir)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[test]
    fn test_unauthorized_device_cannot_export() {
        let devices = two_devices();
        let (a, b) = (&devices.a, &devices.b);
        let err = export_auth_file(b, &a.auth_id(), auth_file(&devices.dir)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Sequence);
    }

    #[test]
    fn test_tampered_auth_file_rejected() {
        let devices = two_devices();
        let (a, b) = (&devices.a, &devices.b);
        export_auth_file(a, &b.auth_id(), auth_file(&devices.dir)).unwrap();
        let path = devices.dir.path().join("device.auth");
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&path, bytes).unwrap();

        let err = import_auth_file(b, auth_file(&devices.dir)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(!b.is_authorized().unwrap());
    }
}
