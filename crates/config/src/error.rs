use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The configuration sources could not be read or merged.
    #[display("could not load configuration: {_0}")]
    Load(#[error(not(source))] String),
    /// Loaded fine, but one or more values are unusable.
    #[display("invalid configuration: {}", _0.join("; "))]
    Invalid(#[error(not(source))] Vec<String>),
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        false
    }
}
