//! Remote content sources.
//!
//! [`RemoteSource`] is the seam between the sync engine and the hosted API.
//! Each method maps to one logical call. Callers admit that call through the
//! [`RateLimiter`](crate::RateLimiter) (usually via
//! [`RateLimiter::execute`](crate::RateLimiter::execute) or the
//! [`FetchPool`](crate::FetchPool)); implementations that need follow-up
//! requests (pagination, nested children) gate those themselves.

mod http;
#[cfg(any(test, feature = "mock"))]
mod mock;

pub use self::http::{HttpSource, HttpSourceConfig};
#[cfg(any(test, feature = "mock"))]
pub use self::mock::{MockCalls, MockSource};
use crate::error::Result;
use crate::id::ResourceId;
use crate::models::{Block, Resource};
use async_trait::async_trait;
use std::sync::Arc;

/// Read-only access to pages, collections and their files.
///
/// Errors must keep [`Throttled`](crate::ErrorKind::Throttled) distinct from
/// [`NotFound`](crate::ErrorKind::NotFound) and generic failures so the
/// limiter can back off.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Name used in log output.
    fn name(&self) -> &str;

    /// Fetch metadata and classify the ID as a page or a collection.
    async fn get_resource(&self, id: &ResourceId) -> Result<Resource>;

    /// Fetch the full block tree of a page.
    async fn get_children(&self, id: &ResourceId) -> Result<Vec<Block>>;

    /// List every entry of a collection.
    async fn query_collection(&self, id: &ResourceId) -> Result<Vec<Resource>>;

    /// Download the bytes behind an attachment URL.
    async fn download(&self, url: &str) -> Result<Vec<u8>>;
}

pub type SourceHandle = Arc<dyn RemoteSource + Send + Sync>;
