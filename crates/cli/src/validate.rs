//! Pre-flight checks behind `pagesync validate`.

use pagesync_config::Root;
use pagesync_remote::{RateLimiter, RemoteSource, ResourceId};
use pagesync_state::StateStore;
use pagesync_storage::StorageBackend;
use pagesync_storage::backend::LocalBackend;
use std::fmt;
use std::path::Path;
use tokio_util::sync::CancellationToken;

const WRITE_TEST_FILE: &str = ".pagesync-write-test";

/// Outcome of one check, printed as a single line.
#[derive(Debug)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    pub detail: Option<String>,
}

impl Check {
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            detail: None,
        }
    }

    pub fn fail(name: impl Into<String>, detail: impl fmt::Display) -> Self {
        Self {
            name: name.into(),
            passed: false,
            detail: Some(detail.to_string()),
        }
    }

    pub fn with_detail(mut self, detail: impl fmt::Display) -> Self {
        self.detail = Some(detail.to_string());
        self
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.passed { "PASS" } else { "FAIL" };
        write!(f, "[{status}] {}", self.name)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

/// Resolve every root through the limiter, one check per root.
pub async fn check_roots(
    source: &dyn RemoteSource,
    limiter: &RateLimiter,
    roots: &[Root],
    cancel: &CancellationToken,
) -> Vec<Check> {
    let mut checks = Vec::with_capacity(roots.len());
    for root in roots {
        let label = display_name(root);
        let id = match ResourceId::parse(&root.url) {
            Ok(id) => id,
            Err(err) => {
                checks.push(Check::fail(format!("Root {label:?} URL valid"), &*err));
                continue;
            },
        };
        let name = format!("Root {label:?} accessible");
        tracing::debug!(id = %id, "Resolving root");
        match limiter.execute(cancel, || source.get_resource(&id)).await {
            Ok(resource) => {
                checks.push(Check::pass(name).with_detail(format!("{}: {:?}", resource.kind.as_str(), resource.title)))
            },
            Err(err) => checks.push(Check::fail(name, &*err)),
        }
    }
    checks
}

/// The output root must exist (or be creatable) and accept a write.
pub async fn check_output(root: &Path) -> Check {
    const NAME: &str = "Output directory writable";
    let backend = match LocalBackend::new("output", root) {
        Ok(backend) => backend,
        Err(err) => return Check::fail(NAME, &*err),
    };
    let marker = Path::new(WRITE_TEST_FILE);
    if let Err(err) = backend.write(marker, b"").await {
        return Check::fail(NAME, &*err);
    }
    if let Err(err) = backend.delete(marker).await {
        return Check::fail(NAME, &*err);
    }
    Check::pass(NAME).with_detail(root.display())
}

/// The state file's folder must exist or be creatable; an existing state file
/// must load.
pub fn check_state(state_file: &Path) -> Vec<Check> {
    const DIR: &str = "State directory usable";
    let mut checks = Vec::new();
    match state_file.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        Some(dir) if dir.is_dir() => checks.push(Check::pass(DIR)),
        Some(dir) if dir.exists() => checks.push(Check::fail(DIR, format!("not a directory: {}", dir.display()))),
        Some(dir) => match std::fs::create_dir_all(dir) {
            Ok(()) => checks.push(Check::pass(DIR).with_detail(format!("created {}", dir.display()))),
            Err(err) => checks.push(Check::fail(DIR, format!("cannot create {}: {err}", dir.display()))),
        },
        None => checks.push(Check::pass(DIR)),
    }
    if state_file.is_file() {
        const FILE: &str = "State file readable";
        match StateStore::load(state_file) {
            Ok(state) => checks.push(Check::pass(FILE).with_detail(format!("{} resources", state.resource_count()))),
            Err(err) => checks.push(Check::fail(
                FILE,
                format!("{}; `pagesync sync --force` starts over", &*err),
            )),
        }
    }
    checks
}

/// A root's name, or the tail of its URL.
fn display_name(root: &Root) -> String {
    if let Some(name) = root.name.as_deref().filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    let chars = root.url.chars().count();
    if chars <= 30 {
        return root.url.clone();
    }
    let tail: String = root.url.chars().skip(chars - 27).collect();
    format!("...{tail}")
}
