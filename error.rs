use std::io;
use thiserror::Error;

/// Error kinds raised by the drive core.
///
/// Callers branch on the variant: sequencing and security failures are never
/// retried, storage failures may be.
#[derive(Debug, Error)]
pub enum DriveError {
    /// Missing or malformed key/nonce, or an authorization id mismatch
    #[error("Security error: {0}")]
    Security(String),

    /// Chunk hash mismatch, the data was corrupted or tampered with
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Sequencer protocol violation (duplicate, reinit, raised max nonce, corrupt table)
    #[error("Sequence error: {0}")]
    Sequence(String),

    /// Nonce space or CTR counter exhausted
    #[error("Range exceeded: {0}")]
    RangeExceeded(String),

    /// Underlying storage failure
    #[error("Storage error: {0}")]
    Io(#[source] io::Error),

    /// Malformed header or auth config payload
    #[error("Format error: {0}")]
    Format(String),

    /// Authorization protocol precondition failures
    #[error("Auth error: {0}")]
    Auth(String),

    /// Batch transfer stopped by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration values
    #[error("Config error: {0}")]
    Config(String),
}

/// Discriminant of [`DriveError`], handy for matching without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Security,
    Integrity,
    Sequence,
    RangeExceeded,
    Io,
    Format,
    Auth,
    Cancelled,
    Config,
}

pub type Result<T> = std::result::Result<T, DriveError>;

impl DriveError {
    pub fn security(msg: impl Into<String>) -> Self {
        Self::Security(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    pub fn sequence(msg: impl Into<String>) -> Self {
        Self::Sequence(msg.into())
    }

    pub fn range_exceeded(msg: impl Into<String>) -> Self {
        Self::RangeExceeded(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Security(_) => ErrorKind::Security,
            Self::Integrity(_) => ErrorKind::Integrity,
            Self::Sequence(_) => ErrorKind::Sequence,
            Self::RangeExceeded(_) => ErrorKind::RangeExceeded,
            Self::Io(_) => ErrorKind::Io,
            Self::Format(_) => ErrorKind::Format,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Structural errors abort a whole batch; everything else only fails one file.
    pub fn is_structural(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Security
                | ErrorKind::Integrity
                | ErrorKind::Sequence
                | ErrorKind::RangeExceeded
                | ErrorKind::Format
        )
    }

    /// Wraps the error so it can travel through `std::io` trait methods.
    pub fn into_io(self) -> io::Error {
        match self {
            Self::Io(err) => err,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }

    /// Recovers a [`DriveError`] that was wrapped by [`DriveError::into_io`].
    pub fn from_io(err: io::Error) -> Self {
        let is_drive_error = err
            .get_ref()
            .map(|inner| inner.is::<DriveError>())
            .unwrap_or(false);
        if is_drive_error {
            if let Some(inner) = err.into_inner() {
                if let Ok(drive_err) = inner.downcast::<DriveError>() {
                    return *drive_err;
                }
            }
            // unreachable in practice, the inner error was checked above
            return Self::Io(io::Error::new(io::ErrorKind::Other, "lost wrapped error"));
        }
        Self::Io(err)
    }
}

impl From<io::Error> for DriveError {
    fn from(err: io::Error) -> Self {
        Self::from_io(err)
    }
}
