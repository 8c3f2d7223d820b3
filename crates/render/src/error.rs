use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

/// Rendering is pure, so none of these go away by retrying.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A block type the renderer refuses to approximate (strict mode only).
    #[display("unsupported block type: {_0}")]
    Unsupported(#[error(not(source))] String),
    /// Writing to the output buffer failed.
    #[display("could not format document")]
    Format,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
