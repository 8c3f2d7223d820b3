use pagesync_remote::{ResourceId, ResourceKind};
use pagesync_sync::{Outcome, SyncObserver};
use std::path::Path;

/// Prints one line per change. Unchanged pages stay silent.
pub struct ConsoleObserver {
    quiet: bool,
}

impl ConsoleObserver {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl SyncObserver for ConsoleObserver {
    fn root_started(&self, _id: &ResourceId, kind: ResourceKind, name: &str) {
        if !self.quiet {
            println!("==> {name} ({})", kind.as_str());
        }
    }

    fn resource_finished(&self, _id: &str, title: &str, outcome: Outcome) {
        match outcome {
            Outcome::Updated if !self.quiet => println!("  updated  {title}"),
            Outcome::Failed => eprintln!("  failed   {title}"),
            _ => {},
        }
    }

    fn removed(&self, path: &Path) {
        if !self.quiet {
            println!("  removed  {}", path.display());
        }
    }
}
