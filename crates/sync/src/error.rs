//! Sync Error Types
//!
//! Per-item kinds (`Fetch`, `Render`, `Write`, `Attachment`) end up in a
//! [`SyncReport`](crate::SyncReport); only `Precondition` and `State` stop a
//! run before it starts.

use derive_more::{Display, Error};
use std::path::PathBuf;

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input detected before any fetching started.
    #[display("cannot start sync: {_0}")]
    Precondition(#[error(not(source))] String),
    /// The state file could not be loaded or saved.
    #[display("could not access sync state")]
    State,
    #[display("could not fetch {_0}")]
    Fetch(#[error(not(source))] String),
    #[display("could not render {_0}")]
    Render(#[error(not(source))] String),
    #[display("could not write {}", _0.display())]
    Write(#[error(not(source))] PathBuf),
    #[display("could not download attachment {_0}")]
    Attachment(#[error(not(source))] String),
    #[display("sync cancelled")]
    Cancelled,
    /// The run finished but some items failed.
    #[display("{_0} item(s) failed to sync")]
    Incomplete(#[error(not(source))] usize),
}

impl ErrorKind {
    /// Returns `true` if running the sync again might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Fetch(_) | Self::Write(_) | Self::Attachment(_) | Self::Cancelled | Self::Incomplete(_)
        )
    }
}
