//! Rate-limited access to the hosted workspace API.
//!
//! A single [`RateLimiter`] is shared by every call; [`FetchPool`] fans many
//! fetches out across a bounded number of concurrent tasks, each gated by
//! that limiter.

pub mod error;
mod id;
mod limiter;
mod models;
mod pool;
pub mod source;

pub use crate::error::{Error, ErrorKind, Result};
pub use crate::id::ResourceId;
pub use crate::limiter::{RateLimiter, RateLimiterConfig, parse_retry_after};
pub use crate::models::{Block, BlockKind, Resource, ResourceKind};
pub use crate::pool::{FetchPool, FetchResults, Fetched, OnStart};
pub use crate::source::{HttpSource, HttpSourceConfig, RemoteSource, SourceHandle};
#[cfg(any(test, feature = "mock"))]
pub use crate::source::{MockCalls, MockSource};
