//! Store contracts driven by the batching engine.
//!
//! The engine never talks to a document store directly. It calls three
//! collaborators, each defined as an async trait so HTTP backends, the
//! in-memory cluster, and test doubles can be swapped freely:
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`TopologySource`] | List the partitions of a collection |
//! | [`BulkWriter`] | Write one batch of items to one partition |
//! | [`KeyPager`] | Fetch the next page of matching keys from one partition |
//!
//! Implementations return `anyhow::Result`. Errors that the engine must
//! classify (retry vs. give up) should be raised as a [`StoreError`]; any
//! other error is treated as a retryable transport failure.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Item, Partition, PartitionId, QueryDescriptor, ServerTransform};

/// Classified failure raised by a store backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Timeouts, connection resets, server errors. Retried by the engine.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("partition {0} is unavailable")]
    PartitionUnavailable(PartitionId),
    #[error("collection '{0}' does not exist")]
    CollectionNotFound(String),
    /// The store refused the request (bad query, unknown transform, ...).
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transport(_))
    }
}

/// One bulk-write call: an ordered batch bound for a single partition.
#[derive(Debug, Clone, Copy)]
pub struct WriteRequest<'a> {
    pub collection: &'a str,
    pub partition: &'a Partition,
    pub items: &'a [Item],
    pub transform: Option<&'a ServerTransform>,
}

/// Acknowledgement of a bulk write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteAck {
    pub bytes_moved: u64,
}

/// One paginated key query against a single partition.
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    pub collection: &'a str,
    pub query: &'a QueryDescriptor,
    pub partition: &'a Partition,
    /// Zero-based result offset within the partition.
    pub start: u64,
    pub page_size: usize,
}

/// A page of keys returned by [`KeyPager::next_page`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub keys: Vec<String>,
    pub has_more: bool,
    pub bytes_moved: u64,
}

/// Discovers the current partitions of a collection.
#[async_trait]
pub trait TopologySource: Send + Sync {
    /// Return every partition currently attached to `collection`, with
    /// its writable/delete-only flags.
    ///
    /// Fails with [`StoreError::CollectionNotFound`] when the collection
    /// does not exist.
    async fn partitions(&self, collection: &str) -> Result<Vec<Partition>>;
}

/// Writes a batch of items to a partition in one call.
///
/// A call either succeeds or fails as a whole; the engine never assumes
/// partial success.
#[async_trait]
pub trait BulkWriter: Send + Sync {
    async fn write_batch(&self, request: WriteRequest<'_>) -> Result<WriteAck>;
}

/// Pages through the keys matching a query on one partition.
#[async_trait]
pub trait KeyPager: Send + Sync {
    async fn next_page(&self, request: PageRequest<'_>) -> Result<Page>;
}

/// A backend providing all three collaborators.
pub trait DocumentStore: TopologySource + BulkWriter + KeyPager {}

impl<T> DocumentStore for T where T: TopologySource + BulkWriter + KeyPager {}
