use crate::error::{ErrorKind, Result};
use pagesync_remote::{FetchPool, ResourceId};
use pagesync_storage::validate_path;
use std::path::PathBuf;

/// A configured page or collection to sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRoot {
    /// Share URL or bare ID.
    pub url: String,
    /// Overrides the remote title as the output file or folder name.
    pub name: Option<String>,
}

impl SyncRoot {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), name: None }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A root whose ID has been parsed.
#[derive(Debug, Clone)]
pub(crate) struct ParsedRoot {
    pub id: ResourceId,
    pub url: String,
    pub name: Option<String>,
}

/// Parse every root up front so a typo fails the run before any request.
pub(crate) fn parse_roots(roots: &[SyncRoot]) -> Result<Vec<ParsedRoot>> {
    if roots.is_empty() {
        exn::bail!(ErrorKind::Precondition("no roots configured".to_string()));
    }
    let mut problems = Vec::new();
    let mut parsed = Vec::with_capacity(roots.len());
    for root in roots {
        match ResourceId::parse(&root.url) {
            Ok(id) => parsed.push(ParsedRoot {
                id,
                url: root.url.clone(),
                name: root.name.clone().filter(|n| !n.trim().is_empty()),
            }),
            Err(_) => problems.push(format!("not a page or collection URL: {:?}", root.url)),
        }
    }
    if !problems.is_empty() {
        exn::bail!(ErrorKind::Precondition(problems.join("; ")));
    }
    Ok(parsed)
}

/// Per-run behaviour of a [`Syncer`](crate::Syncer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Classify and render everything, but write nothing and leave the state
    /// file untouched.
    pub dry_run: bool,
    /// Forget all recorded state first so every resource is treated as new.
    pub force: bool,
    /// Maximum concurrent content fetches, clamped to `1..=20`.
    pub concurrency: usize,
    pub download_attachments: bool,
    /// Relative to the output root.
    pub attachment_folder: PathBuf,
    /// Delete attachments no longer referenced by any synced resource.
    pub cleanup_orphans: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            force: false,
            concurrency: FetchPool::DEFAULT_CONCURRENCY,
            download_attachments: true,
            attachment_folder: PathBuf::from("attachments"),
            cleanup_orphans: true,
        }
    }
}

impl SyncOptions {
    pub(crate) fn validate(mut self) -> Result<Self> {
        if self.attachment_folder.as_os_str().is_empty() {
            exn::bail!(ErrorKind::Precondition("attachment folder must not be empty".to_string()));
        }
        self.attachment_folder = validate_path(&self.attachment_folder).map_err(|_| {
            ErrorKind::Precondition(format!(
                "attachment folder must stay inside the output root: {}",
                self.attachment_folder.display()
            ))
        })?;
        self.concurrency = self.concurrency.clamp(FetchPool::MIN_CONCURRENCY, FetchPool::MAX_CONCURRENCY);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_roots() {
        let roots = vec![
            SyncRoot::new("https://www.notion.so/team/Tasks-0123456789abcdef0123456789abcdef").named("Work"),
            SyncRoot::new("fedcba9876543210fedcba9876543210").named("  "),
        ];
        let parsed = parse_roots(&roots).unwrap();
        assert_eq!(parsed[0].id.as_str(), "01234567-89ab-cdef-0123-456789abcdef");
        assert_eq!(parsed[0].name.as_deref(), Some("Work"));
        assert_eq!(parsed[1].name, None);
    }

    #[test]
    fn test_parse_roots_reports_every_bad_root() {
        let roots = vec![
            SyncRoot::new("nope"),
            SyncRoot::new("0123456789abcdef0123456789abcdef"),
            SyncRoot::new(""),
        ];
        let err = parse_roots(&roots).unwrap_err();
        let ErrorKind::Precondition(message) = &*err else {
            panic!("expected Precondition, got {err:?}");
        };
        assert_eq!(message.matches("not a page or collection URL").count(), 2);
    }

    #[test]
    fn test_parse_roots_requires_one() {
        assert!(matches!(&*parse_roots(&[]).unwrap_err(), ErrorKind::Precondition(_)));
    }

    #[rstest]
    #[case("attachments", true)]
    #[case("media/./files", true)]
    #[case("", false)]
    #[case("../outside", false)]
    fn test_validate_attachment_folder(#[case] folder: &str, #[case] valid: bool) {
        let options = SyncOptions {
            attachment_folder: PathBuf::from(folder),
            ..SyncOptions::default()
        };
        assert_eq!(options.validate().is_ok(), valid);
    }

    #[test]
    fn test_validate_clamps_concurrency() {
        let options = SyncOptions {
            concurrency: 0,
            ..SyncOptions::default()
        };
        assert_eq!(options.validate().unwrap().concurrency, 1);
    }
}
