//! Core item model for the checkpointed mutation log.
//!
//! This module defines the fundamental types that flow through a partition's
//! checkpoint log: document keys with their namespace tagging, the queue
//! operation vocabulary, and the immutable [`Item`] record itself.
//!
//! # Key Types
//!
//! - [`DocKey`]: namespace-tagged document key; ordering compares the
//!   namespace first, then the raw bytes
//! - [`QueueOp`]: the operation an item represents, including the meta
//!   markers that delimit checkpoints inside the log
//! - [`Item`]: a single immutable log record with its sequencing metadata
//!
//! # Meta items
//!
//! Checkpoint delimiters (`Empty`, `CheckpointStart`, `CheckpointEnd`,
//! `SetPartitionState`) live inline with data items so a single ordered
//! sequence describes the whole log. Readers must treat them as delimiters,
//! not payload: they never dedupe and never consume a sequence number.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifier of a logical partition (vBucket) of the keyspace.
pub type PartitionId = u16;

/// Maximum permitted key length in bytes, matching the wire protocol limit.
pub const MAX_KEY_LEN: usize = 250;

/// Namespace a document key belongs to.
///
/// Equality and ordering of [`DocKey`] compare the namespace before the raw
/// key bytes, so keys in different namespaces never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DocNamespace {
    /// The default collection visible to legacy clients.
    DefaultCollection,
    /// Keys scoped by a collection prefix.
    Collections,
    /// Internal system documents.
    System,
}

/// A namespace-tagged document key.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocKey {
    namespace: DocNamespace,
    bytes: Bytes,
}

impl DocKey {
    /// Create a key in the given namespace.
    pub fn new(namespace: DocNamespace, bytes: impl Into<Bytes>) -> Self {
        Self {
            namespace,
            bytes: bytes.into(),
        }
    }

    /// Create a key in the default collection.
    ///
    /// # Examples
    ///
    /// ```
    /// use tidemark::item::DocKey;
    ///
    /// let key = DocKey::default_collection("customer-42");
    /// assert_eq!(key.as_bytes(), b"customer-42");
    /// ```
    pub fn default_collection(bytes: impl Into<Bytes>) -> Self {
        Self::new(DocNamespace::DefaultCollection, bytes)
    }

    /// Create a system-namespace key.
    pub fn system(bytes: impl Into<Bytes>) -> Self {
        Self::new(DocNamespace::System, bytes)
    }

    /// The namespace this key belongs to.
    #[must_use]
    pub fn namespace(&self) -> DocNamespace {
        self.namespace
    }

    /// The raw key bytes, without the namespace tag.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Key length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the key is empty. Empty keys are rejected at the enqueue
    /// boundary; this exists for validation, not as a legal state.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl PartialOrd for DocKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DocKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.namespace
            .cmp(&other.namespace)
            .then_with(|| self.bytes.cmp(&other.bytes))
    }
}

impl fmt::Debug for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}:{}",
            self.namespace,
            String::from_utf8_lossy(&self.bytes)
        )
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.bytes))
    }
}

/// Operation carried by an item in the checkpoint log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueOp {
    /// A document write.
    Mutation,
    /// A document removal.
    Deletion,
    /// Flush marker draining the partition.
    Flush,
    /// Meta: first real item of every checkpoint.
    CheckpointStart,
    /// Meta: final item of a closed checkpoint.
    CheckpointEnd,
    /// Meta: records a partition state change inline with the data.
    SetPartitionState,
    /// Meta: the sentinel at position zero of every checkpoint, and the
    /// value returned by a cursor read that has caught up with the tail.
    Empty,
}

impl QueueOp {
    /// Whether this operation is a checkpoint meta marker.
    ///
    /// Meta items never dedupe, never consume a bySeqno, and are delivered
    /// to cursors as delimiters rather than payload.
    #[must_use]
    pub fn is_meta(self) -> bool {
        matches!(
            self,
            QueueOp::CheckpointStart
                | QueueOp::CheckpointEnd
                | QueueOp::SetPartitionState
                | QueueOp::Empty
        )
    }

    /// Whether this operation contributes to queue-size accounting
    /// (mutations, deletions and flush markers).
    #[must_use]
    pub fn is_queued_data(self) -> bool {
        matches!(self, QueueOp::Mutation | QueueOp::Deletion | QueueOp::Flush)
    }
}

impl fmt::Display for QueueOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueOp::Mutation => "mutation",
            QueueOp::Deletion => "deletion",
            QueueOp::Flush => "flush",
            QueueOp::CheckpointStart => "checkpoint_start",
            QueueOp::CheckpointEnd => "checkpoint_end",
            QueueOp::SetPartitionState => "set_partition_state",
            QueueOp::Empty => "empty",
        };
        write!(f, "{s}")
    }
}

/// Value datatype bits negotiated on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datatype(pub u8);

impl Datatype {
    pub const RAW: Datatype = Datatype(0x00);
    pub const JSON: Datatype = Datatype(0x01);
    pub const SNAPPY: Datatype = Datatype(0x02);
    pub const XATTR: Datatype = Datatype(0x04);
}

/// A single record in a partition's mutation log.
///
/// Items are immutable once enqueued: the checkpoint manager assigns the
/// `by_seqno` and `cas` fields at enqueue time and hands shared references
/// to every reader. Two items never share a `by_seqno` within a partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    key: DocKey,
    partition: PartitionId,
    op: QueueOp,
    rev_seqno: u64,
    by_seqno: u64,
    cas: u64,
    value: Bytes,
    deleted: bool,
    datatype: Datatype,
}

/// Shared handle to an enqueued item. Checkpoints, cursors and the flusher
/// all observe the same allocation.
pub type QueuedItem = Arc<Item>;

impl Item {
    /// Create a mutation item awaiting sequencing.
    ///
    /// `by_seqno` and `cas` are left at zero; the checkpoint manager fills
    /// them in (or validates caller-supplied values on replica partitions).
    pub fn mutation(
        key: DocKey,
        partition: PartitionId,
        rev_seqno: u64,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            key,
            partition,
            op: QueueOp::Mutation,
            rev_seqno,
            by_seqno: 0,
            cas: 0,
            value: value.into(),
            deleted: false,
            datatype: Datatype::RAW,
        }
    }

    /// Create a deletion item awaiting sequencing.
    pub fn deletion(key: DocKey, partition: PartitionId, rev_seqno: u64) -> Self {
        Self {
            key,
            partition,
            op: QueueOp::Deletion,
            rev_seqno,
            by_seqno: 0,
            cas: 0,
            value: Bytes::new(),
            deleted: true,
            datatype: Datatype::RAW,
        }
    }

    /// Create a flush marker for the partition.
    pub fn flush_marker(partition: PartitionId) -> Self {
        Self {
            key: DocKey::system("flush"),
            partition,
            op: QueueOp::Flush,
            rev_seqno: 0,
            by_seqno: 0,
            cas: 0,
            value: Bytes::new(),
            deleted: false,
            datatype: Datatype::RAW,
        }
    }

    /// Create a checkpoint meta item with the given operation and seqno.
    pub(crate) fn meta(op: QueueOp, partition: PartitionId, by_seqno: u64) -> Self {
        debug_assert!(op.is_meta());
        let name = match op {
            QueueOp::CheckpointStart => "checkpoint_start",
            QueueOp::CheckpointEnd => "checkpoint_end",
            QueueOp::SetPartitionState => "set_partition_state",
            _ => "dummy_key",
        };
        Self {
            key: DocKey::system(name),
            partition,
            op,
            rev_seqno: 0,
            by_seqno,
            cas: 0,
            value: Bytes::new(),
            deleted: false,
            datatype: Datatype::RAW,
        }
    }

    /// The sentinel item handed out by cursor reads that have reached the
    /// tail of the log.
    pub(crate) fn empty_sentinel(partition: PartitionId, by_seqno: u64) -> Self {
        Self::meta(QueueOp::Empty, partition, by_seqno)
    }

    pub(crate) fn with_sequencing(mut self, by_seqno: u64, cas: u64) -> Self {
        self.by_seqno = by_seqno;
        self.cas = cas;
        self
    }

    /// Caller-assigned sequencing for replica partitions that mirror an
    /// active peer.
    #[must_use]
    pub fn with_caller_seqno(mut self, by_seqno: u64, cas: u64) -> Self {
        self.by_seqno = by_seqno;
        self.cas = cas;
        self
    }

    #[must_use]
    pub fn with_datatype(mut self, datatype: Datatype) -> Self {
        self.datatype = datatype;
        self
    }

    #[must_use]
    pub fn key(&self) -> &DocKey {
        &self.key
    }

    #[must_use]
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    #[must_use]
    pub fn op(&self) -> QueueOp {
        self.op
    }

    #[must_use]
    pub fn rev_seqno(&self) -> u64 {
        self.rev_seqno
    }

    #[must_use]
    pub fn by_seqno(&self) -> u64 {
        self.by_seqno
    }

    #[must_use]
    pub fn cas(&self) -> u64 {
        self.cas
    }

    #[must_use]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    #[must_use]
    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    /// Whether this item is a checkpoint meta marker.
    #[must_use]
    pub fn is_meta(&self) -> bool {
        self.op.is_meta()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ordering_compares_namespace_first() {
        let sys = DocKey::system("aaa");
        let default = DocKey::default_collection("zzz");
        assert!(default < sys, "system namespace sorts after default");

        let a = DocKey::default_collection("alpha");
        let b = DocKey::default_collection("beta");
        assert!(a < b);
    }

    #[test]
    fn meta_classification() {
        assert!(QueueOp::CheckpointStart.is_meta());
        assert!(QueueOp::Empty.is_meta());
        assert!(!QueueOp::Mutation.is_meta());
        assert!(QueueOp::Flush.is_queued_data());
        assert!(!QueueOp::CheckpointEnd.is_queued_data());
    }

    #[test]
    fn deletion_sets_deleted_flag() {
        let item = Item::deletion(DocKey::default_collection("k"), 0, 3);
        assert!(item.is_deleted());
        assert_eq!(item.op(), QueueOp::Deletion);
    }
}
