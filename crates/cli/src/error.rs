use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("configuration problem")]
    Config,
    #[display("could not set up the sync")]
    Setup,
    #[display("sync did not complete")]
    Sync,
    #[display("could not read sync state")]
    State,
    #[display("{_0} validation check(s) failed")]
    Validation(#[error(not(source))] usize),
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Sync)
    }
}
