use crate::error::{ErrorKind, Result};
use crate::key::attachment_key;
use crate::model::{AttachmentFingerprint, AttachmentStats, FingerprintKind, ResourceFingerprint};
use exn::ResultExt;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::instrument;

/// Current schema version of the state file.
pub const STATE_VERSION: u32 = 1;

/// Everything remembered between runs.
///
/// Mutated in place by a single owner during a run and written back with
/// [`save`](Self::save). Nothing here touches the output tree: methods that
/// drop records return the paths so the caller can clean up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateStore {
    #[serde(default = "legacy_version")]
    version: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    last_sync_time: Option<OffsetDateTime>,
    #[serde(default, deserialize_with = "nullable")]
    resources: BTreeMap<String, ResourceFingerprint>,
    #[serde(default, deserialize_with = "nullable")]
    attachments: BTreeMap<String, AttachmentFingerprint>,
}

/// Files written before the version field existed are version 1.
fn legacy_version() -> u32 {
    1
}

fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Deserialize)]
struct Header {
    #[serde(default = "legacy_version")]
    version: u32,
}

impl Default for StateStore {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            last_sync_time: None,
            resources: BTreeMap::new(),
            attachments: BTreeMap::new(),
        }
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the state file, or start empty if it does not exist yet.
    ///
    /// A file that exists but cannot be parsed fails with
    /// [`ErrorKind::Corrupt`]; one from an unknown schema version fails with
    /// [`ErrorKind::UnsupportedVersion`].
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == IoErrorKind::NotFound => {
                tracing::info!("No state file yet; starting fresh");
                return Ok(Self::new());
            },
            Err(err) => return Err(err).or_raise(|| ErrorKind::Io(path.to_path_buf())),
        };
        let header: Header = serde_json::from_slice(&bytes).or_raise(|| ErrorKind::Corrupt(path.to_path_buf()))?;
        if header.version == 0 || header.version > STATE_VERSION {
            exn::bail!(ErrorKind::UnsupportedVersion(header.version));
        }
        let mut state: Self = serde_json::from_slice(&bytes).or_raise(|| ErrorKind::Corrupt(path.to_path_buf()))?;
        state.version = STATE_VERSION;
        tracing::debug!(
            resources = state.resources.len(),
            attachments = state.attachments.len(),
            "Loaded state"
        );
        Ok(state)
    }

    /// Persist atomically: write a temporary file next to the target, flush
    /// it to disk, then rename it over the target.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let io_error = || ErrorKind::Io(path.to_path_buf());
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).or_raise(io_error)?;

        let encoded = serde_json::to_vec_pretty(self).or_raise(|| ErrorKind::Encode)?;
        let mut temp = tempfile::NamedTempFile::new_in(dir).or_raise(io_error)?;
        temp.write_all(&encoded).or_raise(io_error)?;
        temp.as_file().sync_all().or_raise(io_error)?;
        temp.persist(path).or_raise(io_error)?;
        tracing::debug!(bytes = encoded.len(), "Saved state");
        Ok(())
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn last_sync_time(&self) -> Option<OffsetDateTime> {
        self.last_sync_time
    }

    /// Stamp the end of a completed run.
    pub fn mark_synced(&mut self) {
        self.last_sync_time = Some(OffsetDateTime::now_utc());
    }

    /// Forget everything, for a forced full resync. Output files are left alone.
    pub fn reset(&mut self) {
        self.resources.clear();
        self.attachments.clear();
        self.last_sync_time = None;
    }

    // Resources

    /// `true` if the resource is unknown, or the remote copy was modified
    /// strictly after the recorded timestamp.
    pub fn needs_sync(&self, id: &str, remote_last_modified: OffsetDateTime) -> bool {
        self.resources
            .get(id)
            .is_none_or(|existing| remote_last_modified > existing.last_modified_remote)
    }

    pub fn resource(&self, id: &str) -> Option<&ResourceFingerprint> {
        self.resources.get(id)
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceFingerprint> {
        self.resources.values()
    }

    /// Insert or replace the fingerprint for `fingerprint.id`.
    pub fn record_resource(&mut self, fingerprint: ResourceFingerprint) {
        self.resources.insert(fingerprint.id.clone(), fingerprint);
    }

    /// `true` if a non-empty stored hash equals `hash`.
    pub fn content_unchanged(&self, id: &str, hash: &str) -> bool {
        self.resources
            .get(id)
            .is_some_and(|existing| !existing.content_hash.is_empty() && existing.content_hash == hash)
    }

    /// Advance the remote timestamp and sync time of an unchanged resource,
    /// keeping its hash and path. Returns `false` if the resource is unknown.
    pub fn touch_resource(&mut self, id: &str, remote_last_modified: OffsetDateTime) -> bool {
        match self.resources.get_mut(id) {
            Some(existing) => {
                existing.last_modified_remote = remote_last_modified;
                existing.synced_at = OffsetDateTime::now_utc();
                true
            },
            None => false,
        }
    }

    pub fn remove_resource(&mut self, id: &str) -> Option<ResourceFingerprint> {
        self.resources.remove(id)
    }

    /// Entries recorded under `collection` that are absent from `current`,
    /// sorted by ID.
    pub fn deleted_entries(&self, collection: &str, current: &HashSet<String>) -> Vec<ResourceFingerprint> {
        // BTreeMap iteration is already ordered by ID.
        self.resources
            .values()
            .filter(|r| r.kind == FingerprintKind::Entry && r.parent.as_deref() == Some(collection))
            .filter(|r| !current.contains(&r.id))
            .cloned()
            .collect()
    }

    /// Every recorded output path (pages, entries, collection folders), sorted.
    pub fn all_output_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self
            .resources
            .values()
            .filter(|r| !r.output_path.as_os_str().is_empty())
            .map(|r| r.output_path.clone())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn count_of(&self, kind: FingerprintKind) -> usize {
        self.resources.values().filter(|r| r.kind == kind).count()
    }

    pub fn entry_count(&self) -> usize {
        self.count_of(FingerprintKind::Entry)
    }

    // Attachments

    /// Insert or replace an attachment record under its `url_key`.
    pub fn record_attachment(&mut self, fingerprint: AttachmentFingerprint) {
        self.attachments.insert(fingerprint.url_key.clone(), fingerprint);
    }

    pub fn attachment(&self, key: &str) -> Option<&AttachmentFingerprint> {
        self.attachments.get(key)
    }

    pub fn attachment_by_url(&self, url: &str) -> Option<&AttachmentFingerprint> {
        self.attachments.get(&attachment_key(url))
    }

    /// `true` if the attachment was never downloaded, or both hashes are
    /// known and differ.
    pub fn attachment_needs_download(&self, url: &str, content_hash: Option<&str>) -> bool {
        match self.attachment_by_url(url) {
            None => true,
            Some(existing) => match content_hash {
                Some(hash) if !hash.is_empty() && !existing.content_hash.is_empty() => existing.content_hash != hash,
                _ => false,
            },
        }
    }

    pub fn remove_attachment(&mut self, url: &str) -> Option<AttachmentFingerprint> {
        self.attachments.remove(&attachment_key(url))
    }

    /// Record that `owner` links the attachment stored under `key`. Returns
    /// `false` when no such attachment is known.
    pub fn add_attachment_owner(&mut self, key: &str, owner: &str) -> bool {
        match self.attachments.get_mut(key) {
            Some(attachment) => {
                attachment.owners.insert(owner.to_string());
                true
            },
            None => false,
        }
    }

    /// `owner` no longer links the attachment under `key`. When nobody else
    /// does either, the record is dropped and returned so the caller can
    /// delete the file.
    pub fn release_attachment(&mut self, key: &str, owner: &str) -> Option<AttachmentFingerprint> {
        let attachment = self.attachments.get_mut(key)?;
        attachment.owners.remove(owner);
        if attachment.owners.is_empty() {
            return self.attachments.remove(key);
        }
        None
    }

    /// Attachments linked by `owner`, sorted by key.
    pub fn attachments_for_resource(&self, owner: &str) -> Vec<AttachmentFingerprint> {
        self.attachments.values().filter(|a| a.is_owned_by(owner)).cloned().collect()
    }

    /// Attachments none of whose owners is in `current`, sorted by first
    /// owner and then key. Attachments without an owner are never orphaned.
    pub fn orphaned_attachments(&self, current: &HashSet<String>) -> Vec<AttachmentFingerprint> {
        let mut orphans: Vec<_> = self
            .attachments
            .values()
            .filter(|a| !a.owners.is_empty() && !a.owners.iter().any(|o| current.contains(o)))
            .cloned()
            .collect();
        orphans.sort_by(|a, b| (a.owners.first(), &a.url_key).cmp(&(b.owners.first(), &b.url_key)));
        orphans
    }

    /// Drop orphaned attachments from the state and return their local paths
    /// (in [`orphaned_attachments`](Self::orphaned_attachments) order) for the
    /// caller to delete. Owners outside `current` are forgotten on the
    /// attachments that survive.
    pub fn prune_orphans(&mut self, current: &HashSet<String>) -> Vec<PathBuf> {
        let orphans = self.orphaned_attachments(current);
        for orphan in &orphans {
            self.attachments.remove(&orphan.url_key);
        }
        for attachment in self.attachments.values_mut() {
            attachment.owners.retain(|o| current.contains(o));
        }
        orphans.into_iter().map(|a| a.local_path).collect()
    }

    pub fn attachment_stats(&self) -> AttachmentStats {
        AttachmentStats {
            count: self.attachments.len(),
            total_bytes: self.attachments.values().map(|a| a.size).sum(),
        }
    }
}
