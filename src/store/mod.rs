//! Feedback Store: the return path from the adaptive stage to the control process.
//!
//! Keys are correlation ids, values are opaque bytes. Writes are
//! last-write-wins with no versioning; there are no multi-key operations.
//!
//! Blocking retrievals take a caller-supplied timeout and resolve with
//! `NotFound` when it elapses. A write that lands after the timeout never
//! satisfies that call. Dropping a pending retrieval abandons it without side
//! effects; in particular an abandoned `take` never consumes a value.

pub mod memory;
pub mod remote;

pub use memory::MemoryFeedbackStore;
pub use remote::RemoteFeedbackStore;

use crate::error::PipelineResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait FeedbackStore: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Bytes) -> PipelineResult<()>;

    /// Wait up to `timeout` for a value under `key` and return a copy of it.
    async fn get(&self, key: &str, timeout: Duration) -> PipelineResult<Bytes>;

    /// Like [`get`](Self::get), but removes the value it returns.
    ///
    /// When several callers wait on one key, each value is handed to exactly one of them.
    async fn take(&self, key: &str, timeout: Duration) -> PipelineResult<Bytes>;

    /// Delete the value under `key`; returns whether one was present.
    async fn remove(&self, key: &str) -> PipelineResult<bool>;
}

#[async_trait]
impl<T: FeedbackStore + ?Sized> FeedbackStore for Arc<T> {
    async fn put(&self, key: &str, value: Bytes) -> PipelineResult<()> {
        (**self).put(key, value).await
    }

    async fn get(&self, key: &str, timeout: Duration) -> PipelineResult<Bytes> {
        (**self).get(key, timeout).await
    }

    async fn take(&self, key: &str, timeout: Duration) -> PipelineResult<Bytes> {
        (**self).take(key, timeout).await
    }

    async fn remove(&self, key: &str) -> PipelineResult<bool> {
        (**self).remove(key).await
    }
}
