pub mod error;
mod markdown;

use crate::error::Result;
pub use crate::markdown::MarkdownRenderer;
use pagesync_remote::{Block, Resource};
use std::collections::BTreeMap;

/// Everything a renderer needs to produce one output file.
#[derive(Debug, Clone, Copy)]
pub struct Document<'a> {
    pub resource: &'a Resource,
    pub blocks: &'a [Block],
    /// Remote attachment URL to the link target of its downloaded copy.
    pub attachments: &'a BTreeMap<String, String>,
}

/// Pure transformation from fetched content to final text.
///
/// Implementations must be deterministic and free of side effects: the
/// output is hashed to decide whether anything changed.
pub trait Render: Send + Sync {
    /// File extension (without the dot) of rendered documents.
    fn extension(&self) -> &'static str;

    fn render(&self, doc: &Document<'_>) -> Result<String>;
}
