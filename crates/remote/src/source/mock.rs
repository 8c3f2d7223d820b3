//! In-memory remote source for tests.

use super::RemoteSource;
use crate::error::{ErrorKind, Result};
use crate::id::ResourceId;
use crate::models::{Block, Resource, ResourceKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Number of calls made to each [`MockSource`] method.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MockCalls {
    pub get_resource: usize,
    pub get_children: usize,
    pub query_collection: usize,
    pub download: usize,
}

#[derive(Default)]
struct Content {
    resources: HashMap<ResourceId, Resource>,
    children: HashMap<ResourceId, Vec<Block>>,
    entries: HashMap<ResourceId, Vec<ResourceId>>,
    files: HashMap<String, Vec<u8>>,
    failures: HashMap<ResourceId, ErrorKind>,
}

/// In-memory [`RemoteSource`] with injectable throttles, failures and latency.
///
/// Collection entries are stored like any other page; `query_collection`
/// returns them in insertion order.
#[derive(Default)]
pub struct MockSource {
    content: Mutex<Content>,
    throttles: Mutex<VecDeque<Duration>>,
    download_throttles: Mutex<VecDeque<Duration>>,
    latency: Mutex<Option<Duration>>,
    get_resource_calls: AtomicUsize,
    get_children_calls: AtomicUsize,
    query_collection_calls: AtomicUsize,
    download_calls: AtomicUsize,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a standalone page and its blocks.
    pub fn put_page(&self, page: Resource, blocks: Vec<Block>) {
        let mut content = self.content.lock();
        content.children.insert(page.id.clone(), blocks);
        content.resources.insert(page.id.clone(), page);
    }

    /// Add or replace a collection and all of its entries.
    pub fn put_collection(&self, collection: Resource, entries: Vec<(Resource, Vec<Block>)>) {
        let mut content = self.content.lock();
        let mut ids = Vec::with_capacity(entries.len());
        for (entry, blocks) in entries {
            let entry = entry.with_parent(collection.id.clone());
            ids.push(entry.id.clone());
            content.children.insert(entry.id.clone(), blocks);
            content.resources.insert(entry.id.clone(), entry);
        }
        content.entries.insert(collection.id.clone(), ids);
        content.resources.insert(collection.id.clone(), collection);
    }

    /// Add or replace a single entry of an existing collection.
    pub fn put_entry(&self, collection: &ResourceId, entry: Resource, blocks: Vec<Block>) {
        let mut content = self.content.lock();
        let entry = entry.with_parent(collection.clone());
        let ids = content.entries.entry(collection.clone()).or_default();
        if !ids.contains(&entry.id) {
            ids.push(entry.id.clone());
        }
        content.children.insert(entry.id.clone(), blocks);
        content.resources.insert(entry.id.clone(), entry);
    }

    /// Remove a page, collection or entry.
    pub fn remove(&self, id: &ResourceId) {
        let mut content = self.content.lock();
        content.resources.remove(id);
        content.children.remove(id);
        content.entries.remove(id);
        for ids in content.entries.values_mut() {
            ids.retain(|existing| existing != id);
        }
    }

    pub fn put_file(&self, url: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.content.lock().files.insert(url.into(), bytes.into());
    }

    /// Make `get_children` for this ID fail with `kind` until cleared.
    pub fn fail_children(&self, id: &ResourceId, kind: ErrorKind) {
        self.content.lock().failures.insert(id.clone(), kind);
    }

    pub fn clear_failures(&self) {
        self.content.lock().failures.clear();
    }

    /// The next `count` calls (to any method) report a throttle.
    pub fn throttle_next(&self, count: usize, retry_after: Duration) {
        self.throttles.lock().extend(std::iter::repeat_n(retry_after, count));
    }

    /// The next `count` downloads report a throttle, like a file host
    /// answering 429.
    pub fn throttle_downloads(&self, count: usize, retry_after: Duration) {
        self.download_throttles.lock().extend(std::iter::repeat_n(retry_after, count));
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    pub fn calls(&self) -> MockCalls {
        MockCalls {
            get_resource: self.get_resource_calls.load(Ordering::SeqCst),
            get_children: self.get_children_calls.load(Ordering::SeqCst),
            query_collection: self.query_collection_calls.load(Ordering::SeqCst),
            download: self.download_calls.load(Ordering::SeqCst),
        }
    }

    pub fn reset_calls(&self) {
        for counter in [
            &self.get_resource_calls,
            &self.get_children_calls,
            &self.query_collection_calls,
            &self.download_calls,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
    }

    async fn enter(&self, counter: &AtomicUsize) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let throttle = self.throttles.lock().pop_front();
        if let Some(retry_after) = throttle {
            exn::bail!(ErrorKind::Throttled { retry_after });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSource for MockSource {
    fn name(&self) -> &str {
        "mock"
    }

    async fn get_resource(&self, id: &ResourceId) -> Result<Resource> {
        self.enter(&self.get_resource_calls).await?;
        let content = self.content.lock();
        let resource = content.resources.get(id).cloned();
        resource.ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(id.to_string())))
    }

    async fn get_children(&self, id: &ResourceId) -> Result<Vec<Block>> {
        self.enter(&self.get_children_calls).await?;
        let content = self.content.lock();
        if let Some(kind) = content.failures.get(id) {
            exn::bail!(kind.clone());
        }
        match content.resources.get(id) {
            Some(resource) if resource.kind == ResourceKind::Collection => {
                exn::bail!(ErrorKind::WrongType(id.to_string()))
            },
            Some(_) => Ok(content.children.get(id).cloned().unwrap_or_default()),
            None => exn::bail!(ErrorKind::NotFound(id.to_string())),
        }
    }

    async fn query_collection(&self, id: &ResourceId) -> Result<Vec<Resource>> {
        self.enter(&self.query_collection_calls).await?;
        let content = self.content.lock();
        let Some(ids) = content.entries.get(id) else {
            exn::bail!(ErrorKind::NotFound(id.to_string()));
        };
        Ok(ids.iter().filter_map(|entry| content.resources.get(entry).cloned()).collect())
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        self.enter(&self.download_calls).await?;
        let throttle = self.download_throttles.lock().pop_front();
        if let Some(retry_after) = throttle {
            exn::bail!(ErrorKind::Throttled { retry_after });
        }
        let content = self.content.lock();
        let bytes = content.files.get(url).cloned();
        bytes.ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(url.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BlockKind;
    use time::macros::datetime;

    fn id(n: u8) -> ResourceId {
        ResourceId::parse(format!("{n:032x}")).unwrap()
    }

    #[tokio::test]
    async fn test_page_roundtrip_and_counts() {
        let source = MockSource::new();
        let page = Resource::page(id(1), "Home", datetime!(2024-01-01 00:00 UTC));
        source.put_page(page.clone(), vec![Block::new("b1", BlockKind::Paragraph, "hello")]);

        assert_eq!(source.get_resource(&id(1)).await.unwrap(), page);
        assert_eq!(source.get_children(&id(1)).await.unwrap().len(), 1);
        assert!(source.get_resource(&id(2)).await.unwrap_err().is_not_found());
        assert_eq!(source.calls().get_resource, 2);
        assert_eq!(source.calls().get_children, 1);
    }

    #[tokio::test]
    async fn test_collection_entries_carry_parent() {
        let source = MockSource::new();
        let collection = Resource::collection(id(10), "Tasks", datetime!(2024-01-01 00:00 UTC));
        source.put_collection(
            collection,
            vec![
                (Resource::page(id(11), "One", datetime!(2024-01-02 00:00 UTC)), vec![]),
                (Resource::page(id(12), "Two", datetime!(2024-01-03 00:00 UTC)), vec![]),
            ],
        );
        let entries = source.query_collection(&id(10)).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.parent == Some(id(10))));
        assert!(matches!(
            &*source.get_children(&id(10)).await.unwrap_err(),
            ErrorKind::WrongType(_)
        ));

        source.remove(&id(11));
        assert_eq!(source.query_collection(&id(10)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_throttle_and_failure() {
        let source = MockSource::new();
        source.put_page(Resource::page(id(1), "Home", datetime!(2024-01-01 00:00 UTC)), vec![]);
        source.throttle_next(1, Duration::from_secs(2));
        let err = source.get_resource(&id(1)).await.unwrap_err();
        assert_eq!(*err, ErrorKind::Throttled { retry_after: Duration::from_secs(2) });
        assert!(source.get_resource(&id(1)).await.is_ok());

        source.fail_children(&id(1), ErrorKind::Network("reset".to_string()));
        assert!(source.get_children(&id(1)).await.is_err());
        source.clear_failures();
        assert!(source.get_children(&id(1)).await.is_ok());
    }
}
