pub mod error;
mod link;
mod observer;
mod options;
mod report;
mod syncer;

pub use crate::observer::{NoopObserver, Outcome, SyncObserver};
pub use crate::options::{SyncOptions, SyncRoot};
pub use crate::report::SyncReport;
pub use crate::syncer::Syncer;
