use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use time::OffsetDateTime;

/// What kind of remote object a fingerprint describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintKind {
    /// A standalone page synced as a configured root.
    Page,
    /// A collection root; its output path is a folder and it has no content hash.
    Collection,
    /// A page inside a collection.
    Entry,
}

/// Per-resource record of what was last synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFingerprint {
    pub id: String,
    pub kind: FingerprintKind,
    pub title: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified_remote: OffsetDateTime,
    /// BLAKE3 hex digest of the rendered output. Empty for collections.
    #[serde(default)]
    pub content_hash: String,
    /// Relative to the output root.
    #[serde(default)]
    pub output_path: PathBuf,
    #[serde(with = "time::serde::rfc3339")]
    pub synced_at: OffsetDateTime,
    /// Owning collection, for entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// Per-attachment record, keyed by [`attachment_key`](crate::attachment_key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentFingerprint {
    pub url_key: String,
    /// The URL the file was last downloaded from. It usually carries an
    /// expiring signature, so it is kept for reference only.
    #[serde(default)]
    pub source_url: String,
    pub content_hash: String,
    pub local_path: PathBuf,
    pub size: u64,
    /// IDs of every resource that links this file. The file is only released
    /// once the last of them lets go. Empty when unknown; such attachments
    /// are never considered orphaned.
    #[serde(default, alias = "owner", deserialize_with = "owner_set")]
    pub owners: BTreeSet<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub downloaded_at: OffsetDateTime,
}

impl AttachmentFingerprint {
    pub fn is_owned_by(&self, id: &str) -> bool {
        self.owners.contains(id)
    }
}

/// Early state files stored a single `owner` string.
fn owner_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Owners {
        One(String),
        Many(BTreeSet<String>),
    }
    Ok(match Owners::deserialize(deserializer)? {
        Owners::One(owner) if owner.is_empty() => BTreeSet::new(),
        Owners::One(owner) => BTreeSet::from([owner]),
        Owners::Many(owners) => owners,
    })
}

/// Totals across all tracked attachments.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentStats {
    pub count: usize,
    pub total_bytes: u64,
}
