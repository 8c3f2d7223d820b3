use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

/// Failures while writing the output tree.
///
/// Paths are relative to the backend root, except for [`ErrorKind::NotADirectory`]
/// which names the root itself.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("no such file in output: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    #[display("permission denied writing {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    #[display("output root is not a directory: {}", _0.display())]
    NotADirectory(#[error(not(source))] PathBuf),
    /// Absolute, empty, or escapes the output root.
    #[display("invalid output path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    #[display("I/O error: {_0}")]
    Io(IoError),
}

impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Transient filesystem errors may clear up on the next run; the rest need
    /// the user to fix paths or permissions first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
