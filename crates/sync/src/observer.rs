use pagesync_remote::{ResourceId, ResourceKind};
use std::path::Path;

/// What happened to one page or entry during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Remote timestamp unchanged; nothing fetched.
    Skipped,
    /// Fetched and rendered, but the output was identical.
    Unchanged,
    /// Written (or would be, in a dry run).
    Updated,
    Failed,
}

/// Progress callbacks for a sync run.
///
/// Passed explicitly to the [`Syncer`](crate::Syncer); every method has a
/// no-op default so implementors only pick what they display.
pub trait SyncObserver: Send + Sync {
    fn root_started(&self, _id: &ResourceId, _kind: ResourceKind, _name: &str) {}

    /// A content fetch was admitted by the rate limiter.
    fn fetch_started(&self, _id: &str) {}

    fn resource_finished(&self, _id: &str, _title: &str, _outcome: Outcome) {}

    fn attachment_downloaded(&self, _url: &str, _path: &Path) {}

    fn removed(&self, _path: &Path) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {}
