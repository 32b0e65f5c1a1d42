//! Core data models used throughout docmover.
//!
//! These types represent the documents, partitions, and batches that flow
//! through the write and query pipelines. Items are immutable once queued;
//! batches are created by the engine and handed to listeners exactly once.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a storage partition within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// An independently addressable shard of the document store.
///
/// Partitions are read-only snapshots: a topology refresh produces new
/// values rather than mutating the ones held by in-flight batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub id: PartitionId,
    pub host: String,
    pub database_name: String,
    pub writable: bool,
    #[serde(default)]
    pub delete_only: bool,
}

impl Partition {
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        database_name: impl Into<String>,
    ) -> Self {
        Self {
            id: PartitionId::new(id),
            host: host.into(),
            database_name: database_name.into(),
            writable: true,
            delete_only: false,
        }
    }

    /// Whether new documents may be routed to this partition.
    pub fn accepts_writes(&self) -> bool {
        self.writable && !self.delete_only
    }
}

/// A document queued for writing.
///
/// The payload is treated as an opaque blob tagged with a content type;
/// encoding to and from native object models happens before an item is
/// queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub payload: Bytes,
    pub content_type: String,
    /// When set, the batch carrying this item is routed to this partition.
    pub target_partition: Option<PartitionId>,
}

impl Item {
    pub fn new(
        key: impl Into<String>,
        payload: impl Into<Bytes>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            content_type: content_type.into(),
            target_partition: None,
        }
    }

    /// Pin this item (and therefore its batch) to a specific partition.
    pub fn pinned_to(mut self, partition: PartitionId) -> Self {
        self.target_partition = Some(partition);
        self
    }

    pub fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// A named server-side rewrite applied to every item of a write batch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerTransform {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl ServerTransform {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// A written batch, as delivered to write listeners.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    /// Ordinal of this batch within the job (1-based).
    pub job_batch_number: u64,
    /// Ordinal of this batch within its partition's stream (1-based).
    pub partition_batch_number: u64,
    pub items: Vec<Item>,
    /// Partition captured when the batch was cut.
    pub partition: Arc<Partition>,
    pub bytes_moved: u64,
    /// Items written by the job so far, including this batch.
    pub results_so_far: u64,
    pub timestamp: DateTime<Utc>,
}

impl WriteBatch {
    pub fn first_key(&self) -> Option<&str> {
        self.items.first().map(|item| item.key.as_str())
    }

    pub fn last_key(&self) -> Option<&str> {
        self.items.last().map(|item| item.key.as_str())
    }
}

/// One page of matching document keys, as delivered to query listeners.
#[derive(Debug, Clone)]
pub struct KeyBatch {
    /// Ordinal of this batch within the job (1-based).
    pub job_batch_number: u64,
    /// Ordinal of this page within its partition's stream (1-based).
    pub partition_batch_number: u64,
    pub keys: Vec<String>,
    pub partition: Arc<Partition>,
    /// Result offset within the partition where this page starts.
    pub start_offset: u64,
    /// Transfer size as reported by the store; zero when unreported.
    pub bytes_moved: u64,
    /// Keys returned by the job so far, including this page.
    pub results_so_far: u64,
    pub timestamp: DateTime<Utc>,
}

/// A pre-built query. The engine passes it through to the store untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryDescriptor(pub serde_json::Value);

impl QueryDescriptor {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// A descriptor matching every document in the collection.
    pub fn all() -> Self {
        Self(serde_json::json!({}))
    }

    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }
}
