//! The on-disk storage facade.
//!
//! The real backend lives outside this crate; the core only needs "flush a
//! batch of queued items" and "load the last persisted snapshot". The
//! in-memory implementation backs the test suite and mirrors last-writer-
//! wins semantics keyed by bySeqno.

use async_trait::async_trait;
use bytes::Bytes;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::item::{DocKey, PartitionId, QueueOp, QueuedItem};

/// Storage backend failures.
#[derive(Debug, Error, Diagnostic)]
pub enum KvStoreError {
    #[error("backend error: {message}")]
    #[diagnostic(code(tidemark::kvstore::backend))]
    Backend { message: String },
}

/// One persisted document in a snapshot.
#[derive(Clone, Debug)]
pub struct SnapshotDoc {
    pub key: DocKey,
    pub value: Bytes,
    pub cas: u64,
    pub rev_seqno: u64,
    pub by_seqno: u64,
}

/// The last durable state of a partition, used to rebuild the in-memory
/// table and checkpoint manager on startup.
#[derive(Clone, Debug, Default)]
pub struct PartitionSnapshot {
    pub high_seqno: u64,
    pub documents: Vec<SnapshotDoc>,
}

/// Facade over the disk backend.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Persist a batch of queued items for one partition. Items arrive in
    /// bySeqno order; meta items have already been filtered out.
    async fn flush_batch(
        &self,
        partition: PartitionId,
        items: &[QueuedItem],
    ) -> Result<(), KvStoreError>;

    /// Load the last persisted snapshot for a partition, or `None` for a
    /// partition never flushed.
    async fn load_snapshot(
        &self,
        partition: PartitionId,
    ) -> Result<Option<PartitionSnapshot>, KvStoreError>;
}

#[derive(Clone, Debug)]
struct PersistedDoc {
    value: Bytes,
    cas: u64,
    rev_seqno: u64,
    by_seqno: u64,
    deleted: bool,
}

/// In-memory [`KvStore`] used by tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    partitions: Mutex<FxHashMap<PartitionId, FxHashMap<DocKey, PersistedDoc>>>,
}

impl MemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last-writer-wins projection of a partition's persisted documents
    /// (tombstones excluded).
    #[must_use]
    pub fn live_documents(&self, partition: PartitionId) -> FxHashMap<DocKey, Bytes> {
        self.partitions
            .lock()
            .get(&partition)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, doc)| !doc.deleted)
                    .map(|(key, doc)| (key.clone(), doc.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn persisted_count(&self, partition: PartitionId) -> usize {
        self.partitions
            .lock()
            .get(&partition)
            .map_or(0, |docs| docs.len())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn flush_batch(
        &self,
        partition: PartitionId,
        items: &[QueuedItem],
    ) -> Result<(), KvStoreError> {
        let mut partitions = self.partitions.lock();
        let docs = partitions.entry(partition).or_default();
        for item in items {
            match item.op() {
                QueueOp::Mutation | QueueOp::Deletion => {
                    let entry = docs.entry(item.key().clone());
                    let doc = PersistedDoc {
                        value: item.value().clone(),
                        cas: item.cas(),
                        rev_seqno: item.rev_seqno(),
                        by_seqno: item.by_seqno(),
                        deleted: item.is_deleted(),
                    };
                    // Replay safety: never let an older seqno overwrite a
                    // newer persisted version.
                    match entry {
                        std::collections::hash_map::Entry::Occupied(mut existing) => {
                            if existing.get().by_seqno < item.by_seqno() {
                                existing.insert(doc);
                            }
                        }
                        std::collections::hash_map::Entry::Vacant(slot) => {
                            slot.insert(doc);
                        }
                    }
                }
                QueueOp::Flush => docs.clear(),
                _ => {}
            }
        }
        Ok(())
    }

    async fn load_snapshot(
        &self,
        partition: PartitionId,
    ) -> Result<Option<PartitionSnapshot>, KvStoreError> {
        let partitions = self.partitions.lock();
        let Some(docs) = partitions.get(&partition) else {
            return Ok(None);
        };
        let high_seqno = docs.values().map(|d| d.by_seqno).max().unwrap_or(0);
        let documents = docs
            .iter()
            .filter(|(_, doc)| !doc.deleted)
            .map(|(key, doc)| SnapshotDoc {
                key: key.clone(),
                value: doc.value.clone(),
                cas: doc.cas,
                rev_seqno: doc.rev_seqno,
                by_seqno: doc.by_seqno,
            })
            .collect();
        Ok(Some(PartitionSnapshot {
            high_seqno,
            documents,
        }))
    }
}
