//! The sync run: resolve roots, fetch what changed, write it, clean up.

use crate::error::{Error, ErrorKind, Result};
use crate::link::{attachment_file_name, content_hash, relative_link};
use crate::observer::{NoopObserver, Outcome, SyncObserver};
use crate::options::{ParsedRoot, SyncOptions, SyncRoot, parse_roots};
use crate::report::SyncReport;
use exn::ResultExt;
use pagesync_remote::{
    Block, BlockKind, ErrorKind as RemoteErrorKind, FetchPool, Fetched, RateLimiter, Resource, ResourceId,
    ResourceKind, SourceHandle,
};
use pagesync_render::{Document, MarkdownRenderer, Render};
use pagesync_state::{AttachmentFingerprint, FingerprintKind, ResourceFingerprint, StateStore, attachment_key};
use pagesync_storage::error::ErrorKind as StorageErrorKind;
use pagesync_storage::{BackendHandle, sanitize_filename};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Syncs configured roots from a [`RemoteSource`](pagesync_remote::RemoteSource)
/// into a [`StorageBackend`](pagesync_storage::StorageBackend), remembering
/// what it wrote in a [`StateStore`].
///
/// # Examples
///
/// ```no_run
/// use pagesync_remote::{RateLimiter, SourceHandle};
/// use pagesync_storage::BackendHandle;
/// use pagesync_sync::{SyncOptions, SyncRoot, Syncer};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example(source: SourceHandle, backend: BackendHandle) -> pagesync_sync::error::Result<()> {
/// let limiter = Arc::new(RateLimiter::default());
/// let mut syncer = Syncer::new(source, backend, limiter, "/vault/.pagesync/state.json", SyncOptions::default())?;
/// let roots = [SyncRoot::new("https://www.notion.so/Tasks-0123456789abcdef0123456789abcdef")];
/// let report = syncer.run(&roots, &CancellationToken::new()).await?;
/// println!("{} updated, {} skipped", report.updated, report.skipped);
/// # Ok(())
/// # }
/// ```
pub struct Syncer {
    source: SourceHandle,
    backend: BackendHandle,
    renderer: Arc<dyn Render>,
    limiter: Arc<RateLimiter>,
    pool: FetchPool,
    observer: Arc<dyn SyncObserver>,
    options: SyncOptions,
    state: StateStore,
    state_path: PathBuf,
}

/// A page or entry waiting to be checked.
struct Job {
    resource: Resource,
    folder: PathBuf,
    kind: FingerprintKind,
    /// Output name override; the remote title otherwise.
    name: Option<String>,
    parent: Option<String>,
}

/// Everything a single run mutates. The loaded state is copied in so a dry
/// run can classify against it without touching the original.
struct Run {
    state: StateStore,
    report: SyncReport,
    /// Every resource listed by the remote during this run.
    seen: HashSet<String>,
    /// Cleared when a root or collection could not be listed; `seen` is then
    /// incomplete and orphan cleanup would delete live files.
    complete: bool,
    /// Attachment key to local path, for attachments handled this run.
    resolved: HashMap<String, PathBuf>,
}

impl Syncer {
    /// Load the state file and validate `options`.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::State`] if the state file exists but cannot be read, and
    /// [`ErrorKind::Precondition`] for unusable options. With
    /// [`SyncOptions::force`] the state file is not read at all, so a forced
    /// sync replaces a corrupt one.
    pub fn new(
        source: SourceHandle,
        backend: BackendHandle,
        limiter: Arc<RateLimiter>,
        state_path: impl Into<PathBuf>,
        options: SyncOptions,
    ) -> Result<Self> {
        let options = options.validate()?;
        let state_path = state_path.into();
        let state = if options.force {
            StateStore::new()
        } else {
            StateStore::load(&state_path).or_raise(|| ErrorKind::State)?
        };
        let observer: Arc<dyn SyncObserver> = Arc::new(NoopObserver);
        let pool = build_pool(&limiter, options.concurrency, &observer);
        Ok(Self {
            source,
            backend,
            renderer: Arc::new(MarkdownRenderer::new()),
            limiter,
            pool,
            observer,
            options,
            state,
            state_path,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.pool = build_pool(&self.limiter, self.options.concurrency, &observer);
        self.observer = observer;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Render>) -> Self {
        self.renderer = renderer;
        self
    }

    /// State as of the last completed (non-dry) run, or as loaded.
    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Sync every root once.
    ///
    /// Per-item failures are collected in the report and never stop the run.
    /// Cancellation stops admitting new work and returns what was done so
    /// far with [`SyncReport::cancelled`] set.
    ///
    /// # Errors
    ///
    /// Only [`ErrorKind::Precondition`] when a root cannot be parsed; nothing
    /// has been fetched or written in that case.
    #[instrument(skip_all, fields(roots = roots.len(), dry_run = self.options.dry_run, force = self.options.force))]
    pub async fn run(&mut self, roots: &[SyncRoot], cancel: &CancellationToken) -> Result<SyncReport> {
        let started = Instant::now();
        let roots = parse_roots(roots)?;
        let state = if self.options.force {
            tracing::info!("Forced sync; ignoring recorded state");
            StateStore::new()
        } else {
            self.state.clone()
        };
        let mut run = Run {
            state,
            report: SyncReport {
                dry_run: self.options.dry_run,
                ..SyncReport::default()
            },
            seen: HashSet::new(),
            complete: true,
            resolved: HashMap::new(),
        };

        tracing::info!("Starting sync");
        for root in &roots {
            if cancel.is_cancelled() {
                run.report.cancelled = true;
                break;
            }
            self.sync_root(root, &mut run, cancel).await;
        }

        if cancel.is_cancelled() {
            run.report.cancelled = true;
        }
        if !run.report.cancelled {
            self.cleanup_orphans(&mut run).await;
        }
        if !self.options.dry_run {
            if !run.report.cancelled {
                run.state.mark_synced();
            }
            if let Err(err) = run.state.save(&self.state_path).or_raise(|| ErrorKind::State) {
                run.report.record_error(err);
            }
            self.state = run.state;
        }

        let mut report = run.report;
        report.duration = started.elapsed();
        tracing::info!(
            processed = report.processed,
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failed,
            collections = report.collections,
            attachments = report.attachments_downloaded,
            removed = report.removed.len(),
            errors = report.errors.len(),
            cancelled = report.cancelled,
            duration = ?report.duration,
            "Sync finished"
        );
        Ok(report)
    }

    async fn sync_root(&self, root: &ParsedRoot, run: &mut Run, cancel: &CancellationToken) {
        let source = &self.source;
        let id = &root.id;
        let resource = match self.limiter.execute(cancel, move || source.get_resource(id)).await {
            Ok(resource) => resource,
            Err(err) => {
                run.complete = false;
                self.fetch_failed(run, id.as_str(), &root.url, err);
                return;
            },
        };
        run.seen.insert(resource.id.to_string());
        let name = root.name.clone().unwrap_or_else(|| resource.title.clone());
        self.observer.root_started(&resource.id, resource.kind, &name);
        tracing::info!(id = %resource.id, kind = resource.kind.as_str(), name = %name, "Syncing root");

        match resource.kind {
            ResourceKind::Page => {
                let job = Job {
                    resource,
                    folder: PathBuf::new(),
                    kind: FingerprintKind::Page,
                    name: root.name.clone(),
                    parent: None,
                };
                self.sync_pages(vec![job], run, cancel).await;
            },
            ResourceKind::Collection => self.sync_collection(resource, &name, run, cancel).await,
        }
    }

    async fn sync_collection(&self, collection: Resource, name: &str, run: &mut Run, cancel: &CancellationToken) {
        let folder = PathBuf::from(sanitize_filename(name));
        if !self.options.dry_run
            && let Err(err) = self.backend.ensure_folder(&folder).await
        {
            run.complete = false;
            run.report.failed += 1;
            run.report.record_error(err.raise(ErrorKind::Write(folder)));
            return;
        }

        let source = &self.source;
        let id = &collection.id;
        let entries = match self.limiter.execute(cancel, move || source.query_collection(id)).await {
            Ok(entries) => entries,
            Err(err) => {
                run.complete = false;
                self.fetch_failed(run, id.as_str(), name, err);
                return;
            },
        };
        run.report.collections += 1;
        let current: HashSet<String> = entries.iter().map(|e| e.id.to_string()).collect();
        run.seen.extend(current.iter().cloned());
        tracing::debug!(id = %collection.id, entries = entries.len(), "Listed collection");

        for gone in run.state.deleted_entries(collection.id.as_str(), &current) {
            tracing::info!(id = %gone.id, title = %gone.title, "Entry removed upstream");
            if self.remove_output(&gone.output_path, run).await && !self.options.dry_run {
                run.state.remove_resource(&gone.id);
            }
        }

        let jobs = entries
            .into_iter()
            .map(|resource| Job {
                resource,
                folder: folder.clone(),
                kind: FingerprintKind::Entry,
                name: None,
                parent: Some(collection.id.to_string()),
            })
            .collect();
        self.sync_pages(jobs, run, cancel).await;

        if !self.options.dry_run {
            run.state.record_resource(ResourceFingerprint {
                id: collection.id.to_string(),
                kind: FingerprintKind::Collection,
                title: name.to_string(),
                last_modified_remote: collection.last_modified,
                content_hash: String::new(),
                output_path: folder,
                synced_at: OffsetDateTime::now_utc(),
                parent: None,
            });
        }
    }

    /// Skip what is up to date and fetch the rest through the pool, handling
    /// each page as soon as its blocks arrive.
    async fn sync_pages(&self, jobs: Vec<Job>, run: &mut Run, cancel: &CancellationToken) {
        let mut pending = HashMap::new();
        let mut keys = Vec::new();
        for job in jobs {
            let id = job.resource.id.to_string();
            run.seen.insert(id.clone());
            let relocated = run
                .state
                .resource(&id)
                .is_some_and(|r| r.output_path.parent() != Some(job.folder.as_path()));
            if run.state.needs_sync(&id, job.resource.last_modified) || relocated {
                keys.push(job.resource.id.clone());
                pending.insert(id, job);
            } else {
                tracing::debug!(id = %id, "Up to date");
                run.report.processed += 1;
                run.report.skipped += 1;
                self.observer.resource_finished(&id, &job.resource.title, Outcome::Skipped);
            }
        }
        if keys.is_empty() {
            return;
        }

        let source = Arc::clone(&self.source);
        let mut fetched = self.pool.fetch(keys, cancel, move |id: ResourceId| {
            let source = Arc::clone(&source);
            async move { source.get_children(&id).await }
        });

        while let Some(Fetched { key, result }) = fetched.recv().await {
            let Some(job) = pending.remove(key.as_str()) else {
                continue;
            };
            match result {
                Ok(blocks) => {
                    run.report.processed += 1;
                    self.sync_page(job, blocks, run, cancel).await;
                },
                Err(err) if matches!(&*err, RemoteErrorKind::Cancelled) => run.report.cancelled = true,
                Err(err) => {
                    run.report.processed += 1;
                    self.fetch_failed(run, key.as_str(), &job.resource.title, err);
                },
            }
        }
        if !pending.is_empty() {
            tracing::info!(remaining = pending.len(), "Cancelled before every page was fetched");
            run.report.cancelled = true;
        }
    }

    async fn sync_page(&self, job: Job, blocks: Vec<Block>, run: &mut Run, cancel: &CancellationToken) {
        let id = job.resource.id.to_string();
        let title = job.name.clone().unwrap_or_else(|| job.resource.title.clone());

        let attachments = match self.resolve_attachments(&id, &job.folder, &blocks, run, cancel).await {
            Ok(attachments) => attachments,
            Err(err) => return self.fail(run, &id, &title, err),
        };
        let doc = Document {
            resource: &job.resource,
            blocks: &blocks,
            attachments: &attachments,
        };
        let content = match self.renderer.render(&doc) {
            Ok(content) => content,
            Err(err) => return self.fail(run, &id, &title, err.raise(ErrorKind::Render(id.clone()))),
        };
        let hash = content_hash(&content);
        let file_name = format!("{}.{}", sanitize_filename(&title), self.renderer.extension());
        let path = job.folder.join(&file_name);
        let previous = run.state.resource(&id).cloned();

        if run.state.content_unchanged(&id, &hash) && previous.as_ref().is_some_and(|p| p.output_path == path) {
            tracing::debug!(id = %id, "Rendered output unchanged");
            if !self.options.dry_run {
                run.state.touch_resource(&id, job.resource.last_modified);
            }
            run.report.skipped += 1;
            self.observer.resource_finished(&id, &title, Outcome::Unchanged);
            return;
        }
        if self.options.dry_run {
            tracing::info!(id = %id, path = %path.display(), "Would write page");
            run.report.updated += 1;
            self.observer.resource_finished(&id, &title, Outcome::Updated);
            return;
        }

        let written = match self.backend.write_file(&job.folder, &file_name, &content).await {
            Ok(written) => written,
            Err(err) => return self.fail(run, &id, &title, err.raise(ErrorKind::Write(path))),
        };
        if let Some(previous) = &previous
            && !previous.output_path.as_os_str().is_empty()
            && previous.output_path != written
        {
            tracing::info!(id = %id, from = %previous.output_path.display(), to = %written.display(), "Output moved");
            self.remove_output(&previous.output_path, run).await;
        }
        run.state.record_resource(ResourceFingerprint {
            id: id.clone(),
            kind: job.kind,
            title: title.clone(),
            last_modified_remote: job.resource.last_modified,
            content_hash: hash,
            output_path: written.clone(),
            synced_at: OffsetDateTime::now_utc(),
            parent: job.parent,
        });
        if self.options.download_attachments {
            self.drop_stale_attachments(&id, &blocks, run).await;
        }
        tracing::info!(id = %id, path = %written.display(), "Synced page");
        run.report.updated += 1;
        self.observer.resource_finished(&id, &title, Outcome::Updated);
    }

    /// Map each attachment URL in `blocks` to a link relative to `folder`.
    ///
    /// Any download failure fails the whole page so it is retried next run
    /// instead of being recorded with a remote link.
    async fn resolve_attachments(
        &self,
        owner: &str,
        folder: &Path,
        blocks: &[Block],
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, String>> {
        let mut links = BTreeMap::new();
        if !self.options.download_attachments {
            return Ok(links);
        }
        for block in blocks.iter().flat_map(Block::walk) {
            let Some(url) = block.attachment_url() else {
                continue;
            };
            if links.contains_key(url) {
                continue;
            }
            let path = self.resolve_attachment(url, &block.kind, owner, run, cancel).await?;
            links.insert(url.to_string(), relative_link(folder, &path));
        }
        Ok(links)
    }

    async fn resolve_attachment(
        &self,
        url: &str,
        kind: &BlockKind,
        owner: &str,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let key = attachment_key(url);
        if let Some(path) = run.resolved.get(&key).cloned() {
            run.state.add_attachment_owner(&key, owner);
            return Ok(path);
        }
        let existing = run.state.attachment(&key).cloned();
        if let Some(existing) = &existing
            && !run.state.attachment_needs_download(url, None)
        {
            let present = self.options.dry_run || self.backend.exists(&existing.local_path).await.unwrap_or(false);
            if present {
                run.state.add_attachment_owner(&key, owner);
                run.resolved.insert(key, existing.local_path.clone());
                return Ok(existing.local_path.clone());
            }
            tracing::warn!(path = %existing.local_path.display(), "Attachment missing from output; downloading again");
        }

        let path = self.options.attachment_folder.join(attachment_file_name(url, &key, kind));
        if self.options.dry_run {
            tracing::info!(url, path = %path.display(), "Would download attachment");
            run.report.attachments_downloaded += 1;
            run.resolved.insert(key, path.clone());
            return Ok(path);
        }
        if cancel.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        // File hosts throttle too; back off through the shared limiter.
        let bytes = match self.limiter.execute(cancel, || self.source.download(url)).await {
            Ok(bytes) => bytes,
            Err(err) if matches!(&*err, RemoteErrorKind::Cancelled) => return Err(err.raise(ErrorKind::Cancelled)),
            Err(err) => return Err(err.raise(ErrorKind::Attachment(url.to_string()))),
        };
        let written = self
            .backend
            .write_attachment(&path, &bytes)
            .await
            .or_raise(|| ErrorKind::Attachment(url.to_string()))?;
        run.state.record_attachment(AttachmentFingerprint {
            url_key: key.clone(),
            source_url: url.to_string(),
            content_hash: blake3::hash(&bytes).to_hex().to_string(),
            local_path: written.clone(),
            size: u64::try_from(bytes.len()).unwrap_or(u64::MAX),
            owners: existing
                .map(|e| e.owners)
                .unwrap_or_default()
                .into_iter()
                .chain([owner.to_string()])
                .collect(),
            downloaded_at: OffsetDateTime::now_utc(),
        });
        tracing::debug!(url, path = %written.display(), bytes = bytes.len(), "Downloaded attachment");
        run.report.attachments_downloaded += 1;
        self.observer.attachment_downloaded(url, &written);
        run.resolved.insert(key, written.clone());
        Ok(written)
    }

    /// Release attachments `owner` used to link but no longer does. Files
    /// still linked by another resource stay.
    async fn drop_stale_attachments(&self, owner: &str, blocks: &[Block], run: &mut Run) {
        let referenced: HashSet<String> = blocks
            .iter()
            .flat_map(Block::walk)
            .filter_map(Block::attachment_url)
            .map(attachment_key)
            .collect();
        for stale in run.state.attachments_for_resource(owner) {
            if referenced.contains(&stale.url_key) {
                continue;
            }
            if stale.owners.iter().any(|other| other != owner) {
                tracing::debug!(owner, path = %stale.local_path.display(), "Attachment still linked elsewhere");
                run.state.release_attachment(&stale.url_key, owner);
                continue;
            }
            tracing::info!(owner, path = %stale.local_path.display(), "Attachment no longer referenced");
            if self.remove_output(&stale.local_path, run).await {
                run.state.release_attachment(&stale.url_key, owner);
            }
        }
    }

    async fn cleanup_orphans(&self, run: &mut Run) {
        if !self.options.cleanup_orphans {
            return;
        }
        if !run.complete {
            tracing::warn!("Skipping orphan cleanup; not every root could be listed");
            return;
        }
        let orphans: Vec<PathBuf> = if self.options.dry_run {
            run.state
                .orphaned_attachments(&run.seen)
                .into_iter()
                .map(|a| a.local_path)
                .collect()
        } else {
            run.state.prune_orphans(&run.seen)
        };
        for path in orphans {
            tracing::info!(path = %path.display(), "Removing orphaned attachment");
            self.remove_output(&path, run).await;
        }
    }

    /// Delete a previously written file. Already gone counts as success.
    async fn remove_output(&self, path: &Path, run: &mut Run) -> bool {
        if path.as_os_str().is_empty() {
            return true;
        }
        if !self.options.dry_run {
            match self.backend.delete(path).await {
                Ok(()) => {},
                Err(err) if matches!(&*err, StorageErrorKind::NotFound(_)) => {
                    tracing::debug!(path = %path.display(), "Already removed");
                },
                Err(err) => {
                    run.report.record_error(err.raise(ErrorKind::Write(path.to_path_buf())));
                    return false;
                },
            }
        }
        self.observer.removed(path);
        run.report.removed.push(path.to_path_buf());
        true
    }

    fn fetch_failed(&self, run: &mut Run, id: &str, title: &str, err: pagesync_remote::Error) {
        if matches!(&*err, RemoteErrorKind::Cancelled) {
            run.report.cancelled = true;
            return;
        }
        self.fail(run, id, title, err.raise(ErrorKind::Fetch(id.to_string())));
    }

    fn fail(&self, run: &mut Run, id: &str, title: &str, err: Error) {
        if matches!(&*err, ErrorKind::Cancelled) {
            run.report.cancelled = true;
            return;
        }
        run.report.failed += 1;
        self.observer.resource_finished(id, title, Outcome::Failed);
        run.report.record_error(err);
    }
}

fn build_pool(limiter: &Arc<RateLimiter>, concurrency: usize, observer: &Arc<dyn SyncObserver>) -> FetchPool {
    let observer = Arc::clone(observer);
    FetchPool::new(Arc::clone(limiter), concurrency).with_on_start(Arc::new(move |id: &str| observer.fetch_started(id)))
}
