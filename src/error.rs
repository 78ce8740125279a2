//! Error taxonomy shared across the crate.

use std::io;
use thiserror::Error as ThisError;

/// Convenience alias used by every fallible function in the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the store.
///
/// Structural failures carry static messages; every mutating call that
/// returns an error leaves the previously committed tree untouched.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Underlying file I/O failed (short read/write, mapping, disk full).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A page or meta slot failed structural validation.
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    /// The caller passed an argument the store cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The requested key is not present.
    #[error("key not found")]
    NotFound,
    /// An insert-only put found the key already present.
    #[error("key already exists")]
    KeyExists,
    /// A mutating call was issued on a read-only handle.
    #[error("database is read-only")]
    ReadOnly,
    /// Another process holds the backing file.
    #[error("database is busy: {0}")]
    Busy(&'static str),
}

impl Error {
    /// True for errors that indicate on-disk damage rather than misuse.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}
