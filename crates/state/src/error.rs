//! State Error Types

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A state error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for state operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// A [`Corrupt`](Self::Corrupt) or [`UnsupportedVersion`](Self::UnsupportedVersion)
/// state file is never silently replaced; the operator has to fix or delete
/// it, or run a forced resync which skips loading it and writes a fresh one.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The state file exists but could not be parsed.
    #[display("state file is corrupt: {}", _0.display())]
    Corrupt(#[error(not(source))] PathBuf),
    /// The state file was written by a newer (or unknown) schema.
    #[display("unsupported state file version: {_0}")]
    UnsupportedVersion(#[error(not(source))] u32),
    /// Reading or writing the state file failed.
    #[display("I/O error on state file: {}", _0.display())]
    Io(#[error(not(source))] PathBuf),
    /// The in-memory state could not be serialized.
    #[display("could not encode state")]
    Encode,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
