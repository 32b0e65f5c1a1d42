//! In-memory partitioned cluster for testing and local runs.
//!
//! Implements all three store contracts over `HashMap`/`BTreeMap` behind
//! `std::sync::RwLock`. Keys within a partition are kept sorted, so
//! paginated queries are stable across calls.
//!
//! Besides plain storage the cluster can emulate the cluster events the
//! engine has to survive: partitions being detached or made read-only,
//! transient transport failures, and named server-side transforms.
//!
//! Query descriptors understood by the cluster are JSON objects whose
//! terms are all ANDed together:
//!
//! | Term | Matches when |
//! |------|--------------|
//! | `"prefix": "/a/"` | the key starts with the value |
//! | `"contains": "foo"` | the payload (as UTF-8) contains the value |
//! | `"content_type": "application/json"` | the content type is equal |
//!
//! `{}` or `null` match every document. Any other term is rejected.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::models::{Item, Partition, PartitionId, QueryDescriptor};

use super::{
    BulkWriter, KeyPager, Page, PageRequest, StoreError, TopologySource, WriteAck, WriteRequest,
};

/// A server-side rewrite: receives one item plus the transform parameters
/// and returns the payload to store.
pub type TransformFn =
    Arc<dyn Fn(&Item, &BTreeMap<String, String>) -> Result<Bytes> + Send + Sync>;

/// A document as persisted by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDoc {
    pub key: String,
    pub payload: Bytes,
    pub content_type: String,
    pub partition: PartitionId,
}

struct PartitionState {
    meta: Partition,
    attached: bool,
    docs: BTreeMap<String, StoredDoc>,
}

#[derive(Default)]
struct Faults {
    write_failures: HashMap<PartitionId, u32>,
    page_failures: HashMap<PartitionId, u32>,
}

/// In-memory document store with multiple partitions per collection.
pub struct InMemoryCluster {
    collections: RwLock<HashMap<String, Vec<PartitionState>>>,
    transforms: RwLock<HashMap<String, TransformFn>>,
    faults: Mutex<Faults>,
    write_calls: AtomicU64,
    page_calls: AtomicU64,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            transforms: RwLock::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            write_calls: AtomicU64::new(0),
            page_calls: AtomicU64::new(0),
        }
    }

    /// Create `collection` with `count` writable partitions named
    /// `{collection}-1` .. `{collection}-{count}`.
    pub fn with_collection(self, collection: &str, count: usize) -> Self {
        let partitions = (1..=count)
            .map(|i| {
                Partition::new(
                    format!("{}-{}", collection, i),
                    format!("host-{}", i),
                    collection,
                )
            })
            .collect();
        self.create_collection(collection, partitions);
        self
    }

    /// Create (or replace) a collection with the given partitions.
    pub fn create_collection(&self, collection: &str, partitions: Vec<Partition>) {
        let states = partitions
            .into_iter()
            .map(|meta| PartitionState {
                meta,
                attached: true,
                docs: BTreeMap::new(),
            })
            .collect();
        self.collections
            .write()
            .unwrap()
            .insert(collection.to_string(), states);
    }

    /// Attach a new partition to an existing collection.
    pub fn add_partition(&self, collection: &str, partition: Partition) -> bool {
        let mut collections = self.collections.write().unwrap();
        match collections.get_mut(collection) {
            Some(partitions) => {
                partitions.push(PartitionState {
                    meta: partition,
                    attached: true,
                    docs: BTreeMap::new(),
                });
                true
            }
            None => false,
        }
    }

    /// Detach a partition. Its documents become invisible and every call
    /// routed to it fails with [`StoreError::PartitionUnavailable`].
    pub fn detach_partition(&self, collection: &str, id: &PartitionId) -> bool {
        self.with_partition(collection, id, |state| state.attached = false)
    }

    pub fn set_writable(&self, collection: &str, id: &PartitionId, writable: bool) -> bool {
        self.with_partition(collection, id, |state| state.meta.writable = writable)
    }

    pub fn set_delete_only(&self, collection: &str, id: &PartitionId, delete_only: bool) -> bool {
        self.with_partition(collection, id, |state| state.meta.delete_only = delete_only)
    }

    fn with_partition(
        &self,
        collection: &str,
        id: &PartitionId,
        f: impl FnOnce(&mut PartitionState),
    ) -> bool {
        let mut collections = self.collections.write().unwrap();
        let state = collections
            .get_mut(collection)
            .and_then(|partitions| partitions.iter_mut().find(|p| &p.meta.id == id));
        match state {
            Some(state) => {
                f(state);
                true
            }
            None => false,
        }
    }

    /// Seed a document directly into a partition, bypassing the engine.
    pub fn insert(&self, collection: &str, partition: &PartitionId, item: Item) -> Result<()> {
        let mut collections = self.collections.write().unwrap();
        let partitions = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))?;
        let state = partitions
            .iter_mut()
            .find(|p| &p.meta.id == partition)
            .ok_or_else(|| StoreError::PartitionUnavailable(partition.clone()))?;
        state.docs.insert(
            item.key.clone(),
            StoredDoc {
                key: item.key,
                payload: item.payload,
                content_type: item.content_type,
                partition: partition.clone(),
            },
        );
        Ok(())
    }

    /// Install a named transform usable by bulk writes.
    pub fn register_transform<F>(&self, name: &str, transform: F)
    where
        F: Fn(&Item, &BTreeMap<String, String>) -> Result<Bytes> + Send + Sync + 'static,
    {
        self.transforms
            .write()
            .unwrap()
            .insert(name.to_string(), Arc::new(transform));
    }

    /// Make the next `count` bulk writes to `partition` fail with a
    /// transport error.
    pub fn fail_next_writes(&self, partition: &PartitionId, count: u32) {
        let mut faults = self.faults.lock().unwrap();
        *faults.write_failures.entry(partition.clone()).or_insert(0) += count;
    }

    /// Make the next `count` page fetches from `partition` fail with a
    /// transport error.
    pub fn fail_next_pages(&self, partition: &PartitionId, count: u32) {
        let mut faults = self.faults.lock().unwrap();
        *faults.page_failures.entry(partition.clone()).or_insert(0) += count;
    }

    /// Look a document up across the attached partitions of a collection.
    pub fn get(&self, collection: &str, key: &str) -> Option<StoredDoc> {
        let collections = self.collections.read().unwrap();
        collections.get(collection).and_then(|partitions| {
            partitions
                .iter()
                .filter(|p| p.attached)
                .find_map(|p| p.docs.get(key).cloned())
        })
    }

    /// Number of visible documents in a collection.
    pub fn document_count(&self, collection: &str) -> usize {
        let collections = self.collections.read().unwrap();
        collections
            .get(collection)
            .map(|partitions| {
                partitions
                    .iter()
                    .filter(|p| p.attached)
                    .map(|p| p.docs.len())
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Number of documents stored in one partition (attached or not).
    pub fn partition_document_count(&self, collection: &str, id: &PartitionId) -> usize {
        let collections = self.collections.read().unwrap();
        collections
            .get(collection)
            .and_then(|partitions| partitions.iter().find(|p| &p.meta.id == id))
            .map(|p| p.docs.len())
            .unwrap_or(0)
    }

    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn page_calls(&self) -> u64 {
        self.page_calls.load(Ordering::SeqCst)
    }

    fn take_fault(&self, writes: bool, partition: &PartitionId) -> Result<(), StoreError> {
        let mut faults = self.faults.lock().unwrap();
        let table = if writes {
            &mut faults.write_failures
        } else {
            &mut faults.page_failures
        };
        match table.get_mut(partition) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::Transport(format!(
                    "injected failure on partition {}",
                    partition
                )))
            }
            _ => Ok(()),
        }
    }

    fn transform_for(&self, name: &str) -> Result<TransformFn, StoreError> {
        self.transforms
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::Rejected(format!("transform '{}' is not installed", name)))
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn matches(query: &QueryDescriptor, doc: &StoredDoc) -> Result<bool, StoreError> {
    match query.as_json() {
        serde_json::Value::Null => Ok(true),
        serde_json::Value::Object(terms) => {
            for (term, value) in terms {
                let value = value.as_str().ok_or_else(|| {
                    StoreError::Rejected(format!("query term '{}' must be a string", term))
                })?;
                let hit = match term.as_str() {
                    "prefix" => doc.key.starts_with(value),
                    "contains" => String::from_utf8_lossy(&doc.payload).contains(value),
                    "content_type" => doc.content_type == value,
                    other => {
                        return Err(StoreError::Rejected(format!(
                            "unsupported query term '{}'",
                            other
                        )))
                    }
                };
                if !hit {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        _ => Err(StoreError::Rejected(
            "query must be a JSON object".to_string(),
        )),
    }
}

#[async_trait]
impl TopologySource for InMemoryCluster {
    async fn partitions(&self, collection: &str) -> Result<Vec<Partition>> {
        let collections = self.collections.read().unwrap();
        let partitions = collections
            .get(collection)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))?;
        Ok(partitions
            .iter()
            .filter(|p| p.attached)
            .map(|p| p.meta.clone())
            .collect())
    }
}

#[async_trait]
impl BulkWriter for InMemoryCluster {
    async fn write_batch(&self, request: WriteRequest<'_>) -> Result<WriteAck> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let target = &request.partition.id;
        self.take_fault(true, target)?;

        // The whole batch is rewritten before anything is stored, so a
        // failing transform leaves the partition untouched.
        let transform = match request.transform {
            Some(t) => Some((t, self.transform_for(&t.name)?)),
            None => None,
        };
        let mut staged = Vec::with_capacity(request.items.len());
        let mut bytes_moved = 0u64;
        for item in request.items {
            let payload = match &transform {
                Some((t, f)) => f(item, &t.params).map_err(|e| {
                    StoreError::Rejected(format!("transform '{}' failed: {:#}", t.name, e))
                })?,
                None => item.payload.clone(),
            };
            bytes_moved += payload.len() as u64;
            staged.push(StoredDoc {
                key: item.key.clone(),
                payload,
                content_type: item.content_type.clone(),
                partition: target.clone(),
            });
        }

        let mut collections = self.collections.write().unwrap();
        let partitions = collections
            .get_mut(request.collection)
            .ok_or_else(|| StoreError::CollectionNotFound(request.collection.to_string()))?;
        let idx = partitions
            .iter()
            .position(|p| &p.meta.id == target && p.attached)
            .ok_or_else(|| StoreError::PartitionUnavailable(target.clone()))?;
        if !partitions[idx].meta.accepts_writes() {
            return Err(
                StoreError::Rejected(format!("partition {} does not accept writes", target))
                    .into(),
            );
        }

        for doc in staged {
            // A key lives in exactly one partition.
            for (i, other) in partitions.iter_mut().enumerate() {
                if i != idx {
                    other.docs.remove(&doc.key);
                }
            }
            partitions[idx].docs.insert(doc.key.clone(), doc);
        }
        Ok(WriteAck { bytes_moved })
    }
}

#[async_trait]
impl KeyPager for InMemoryCluster {
    async fn next_page(&self, request: PageRequest<'_>) -> Result<Page> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        let source = &request.partition.id;
        self.take_fault(false, source)?;

        let collections = self.collections.read().unwrap();
        let partitions = collections
            .get(request.collection)
            .ok_or_else(|| StoreError::CollectionNotFound(request.collection.to_string()))?;
        let state = partitions
            .iter()
            .find(|p| &p.meta.id == source && p.attached)
            .ok_or_else(|| StoreError::PartitionUnavailable(source.clone()))?;

        let mut skipped = 0u64;
        let mut keys = Vec::with_capacity(request.page_size.min(1024));
        let mut has_more = false;
        for doc in state.docs.values() {
            if !matches(request.query, doc)? {
                continue;
            }
            if skipped < request.start {
                skipped += 1;
                continue;
            }
            if keys.len() == request.page_size {
                has_more = true;
                break;
            }
            keys.push(doc.key.clone());
        }

        Ok(Page {
            keys,
            has_more,
            bytes_moved: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ServerTransform;

    fn seeded(count: usize) -> InMemoryCluster {
        let cluster = InMemoryCluster::new().with_collection("docs", 1);
        let p1 = PartitionId::from("docs-1");
        for i in 0..count {
            cluster
                .insert(
                    "docs",
                    &p1,
                    Item::new(format!("/doc/{:03}.json", i), "{}", "application/json"),
                )
                .unwrap();
        }
        cluster
    }

    async fn page(
        cluster: &InMemoryCluster,
        query: &QueryDescriptor,
        start: u64,
        size: usize,
    ) -> Page {
        let partition = Partition::new("docs-1", "host-1", "docs");
        cluster
            .next_page(PageRequest {
                collection: "docs",
                query,
                partition: &partition,
                start,
                page_size: size,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn pages_walk_sorted_keys() {
        let cluster = seeded(5);
        let all = QueryDescriptor::all();

        let first = page(&cluster, &all, 0, 2).await;
        assert_eq!(first.keys, vec!["/doc/000.json", "/doc/001.json"]);
        assert!(first.has_more);

        let last = page(&cluster, &all, 4, 2).await;
        assert_eq!(last.keys, vec!["/doc/004.json"]);
        assert!(!last.has_more);

        let exact = page(&cluster, &all, 3, 2).await;
        assert_eq!(exact.keys.len(), 2);
        assert!(!exact.has_more);
    }

    #[tokio::test]
    async fn prefix_query_filters_keys() {
        let cluster = seeded(12);
        let query = QueryDescriptor::new(serde_json::json!({ "prefix": "/doc/01" }));
        let result = page(&cluster, &query, 0, 100).await;
        assert_eq!(result.keys, vec!["/doc/010.json", "/doc/011.json"]);
    }

    #[tokio::test]
    async fn unsupported_query_term_is_rejected() {
        let cluster = seeded(1);
        let partition = Partition::new("docs-1", "host-1", "docs");
        let query = QueryDescriptor::new(serde_json::json!({ "near": "x" }));
        let err = cluster.next_page(PageRequest {
            collection: "docs",
            query: &query,
            partition: &partition,
            start: 0,
            page_size: 10,
        }).await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn write_moves_key_between_partitions() {
        let cluster = InMemoryCluster::new().with_collection("docs", 2);
        let p1 = Partition::new("docs-1", "host-1", "docs");
        let p2 = Partition::new("docs-2", "host-2", "docs");
        let items = vec![Item::new("/a", "one", "text/plain")];

        cluster.write_batch(WriteRequest {
            collection: "docs",
            partition: &p1,
            items: &items,
            transform: None,
        }).await
        .unwrap();
        let ack = cluster.write_batch(WriteRequest {
            collection: "docs",
            partition: &p2,
            items: &items,
            transform: None,
        }).await
        .unwrap();

        assert_eq!(ack.bytes_moved, 3);
        assert_eq!(cluster.document_count("docs"), 1);
        assert_eq!(cluster.get("docs", "/a").unwrap().partition, p2.id);
    }

    #[tokio::test]
    async fn transform_rewrites_payload() {
        let cluster = InMemoryCluster::new().with_collection("docs", 1);
        cluster.register_transform("upper", |item, params| {
            let suffix = params.get("suffix").cloned().unwrap_or_default();
            let text = String::from_utf8_lossy(&item.payload).to_uppercase();
            Ok(Bytes::from(format!("{}{}", text, suffix)))
        });
        let partition = Partition::new("docs-1", "host-1", "docs");
        let transform = ServerTransform::new("upper").with_param("suffix", "!");
        let items = vec![Item::new("/a", "hello", "text/plain")];

        cluster.write_batch(WriteRequest {
            collection: "docs",
            partition: &partition,
            items: &items,
            transform: Some(&transform),
        }).await
        .unwrap();

        assert_eq!(cluster.get("docs", "/a").unwrap().payload, Bytes::from("HELLO!"));
    }

    #[tokio::test]
    async fn unknown_transform_fails_whole_batch() {
        let cluster = InMemoryCluster::new().with_collection("docs", 1);
        let partition = Partition::new("docs-1", "host-1", "docs");
        let transform = ServerTransform::new("missing");
        let items = vec![Item::new("/a", "x", "text/plain")];

        let err = cluster.write_batch(WriteRequest {
            collection: "docs",
            partition: &partition,
            items: &items,
            transform: Some(&transform),
        }).await
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Rejected(_))
        ));
        assert_eq!(cluster.document_count("docs"), 0);
    }

    #[tokio::test]
    async fn detached_partition_is_unavailable() {
        let cluster = InMemoryCluster::new().with_collection("docs", 2);
        let p2 = PartitionId::from("docs-2");
        assert!(cluster.detach_partition("docs", &p2));

        let listed = cluster.partitions("docs").await.unwrap();
        assert_eq!(listed.len(), 1);

        let partition = Partition::new("docs-2", "host-2", "docs");
        let items = vec![Item::new("/a", "x", "text/plain")];
        let err = cluster.write_batch(WriteRequest {
            collection: "docs",
            partition: &partition,
            items: &items,
            transform: None,
        }).await
        .unwrap_err();
        assert_eq!(
            err.downcast_ref::<StoreError>(),
            Some(&StoreError::PartitionUnavailable(p2))
        );
    }

    #[tokio::test]
    async fn injected_faults_are_consumed() {
        let cluster = InMemoryCluster::new().with_collection("docs", 1);
        let partition = Partition::new("docs-1", "host-1", "docs");
        cluster.fail_next_writes(&partition.id, 1);
        let items = vec![Item::new("/a", "x", "text/plain")];
        let request = WriteRequest {
            collection: "docs",
            partition: &partition,
            items: &items,
            transform: None,
        };

        let first = cluster.write_batch(request).await.unwrap_err();
        assert!(first
            .downcast_ref::<StoreError>()
            .map(StoreError::is_retryable)
            .unwrap_or(false));
        assert!(cluster.write_batch(request).await.is_ok());
        assert_eq!(cluster.write_calls(), 2);
    }

    #[tokio::test]
    async fn missing_collection_is_reported() {
        let cluster = InMemoryCluster::new();
        let err = cluster.partitions("nope").await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<StoreError>(),
            Some(&StoreError::CollectionNotFound("nope".to_string()))
        );
    }
}
