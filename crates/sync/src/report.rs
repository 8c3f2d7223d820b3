use crate::error::{Error, ErrorKind, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Totals and failures from one run. Never persisted.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Pages and entries considered, whatever the outcome.
    pub processed: usize,
    /// Written, or would be written in a dry run.
    pub updated: usize,
    /// Unchanged remote timestamp or identical rendered output.
    pub skipped: usize,
    pub failed: usize,
    pub collections: usize,
    pub attachments_downloaded: usize,
    /// Output files removed because their source disappeared (or would be,
    /// in a dry run).
    pub removed: Vec<PathBuf>,
    /// Every per-item failure, in the order they happened.
    pub errors: Vec<Error>,
    pub duration: Duration,
    pub cancelled: bool,
    pub dry_run: bool,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.errors.is_empty()
    }

    /// Collapse the report into a single result for callers that only care
    /// whether everything went through.
    pub fn check(&self) -> Result<()> {
        if self.cancelled {
            exn::bail!(ErrorKind::Cancelled);
        }
        if !self.errors.is_empty() {
            exn::bail!(ErrorKind::Incomplete(self.errors.len()));
        }
        Ok(())
    }

    pub(crate) fn record_error(&mut self, err: Error) {
        tracing::error!(error = %err, "Sync item failed");
        self.errors.push(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check() {
        let mut report = SyncReport::default();
        assert!(report.check().is_ok());
        assert!(report.is_success());

        report.errors.push(exn::Exn::from(ErrorKind::Fetch("abc".to_string())));
        assert_eq!(*report.check().unwrap_err(), ErrorKind::Incomplete(1));

        report.cancelled = true;
        assert_eq!(*report.check().unwrap_err(), ErrorKind::Cancelled);
        assert!(!report.is_success());
    }
}
