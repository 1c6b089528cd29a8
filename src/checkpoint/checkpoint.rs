//! A single checkpoint: one bounded, ordered segment of a partition's
//! mutation log.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::item::{DocKey, Item, PartitionId, QueueOp, QueuedItem};

/// Lifecycle state of a checkpoint. The only legal transitions are
/// `Open → Closed` (rotation) and `Closed → removed` (collapse).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointState {
    Open,
    Closed,
}

/// One ordered segment of the mutation log.
///
/// Invariants (checked by debug assertions and the test suite):
///
/// 1. `items[0]` is always the `Empty` sentinel.
/// 2. `items[1]` is the single `CheckpointStart`; a single `CheckpointEnd`
///    exists at the tail iff the checkpoint is closed.
/// 3. The key index maps each live key to the single surviving data item.
/// 4. bySeqno values of data items are strictly increasing.
#[derive(Debug)]
pub(crate) struct Checkpoint {
    id: u64,
    state: CheckpointState,
    items: Vec<QueuedItem>,
    key_index: FxHashMap<DocKey, usize>,
    /// Number of data items (mutations, deletions, flush markers).
    num_queued: usize,
    snapshot_start: u64,
    snapshot_end: u64,
}

impl Checkpoint {
    /// Open a new checkpoint. The item list starts with the `Empty`
    /// sentinel followed by the `CheckpointStart` marker, which carries the
    /// seqno the first data item will receive.
    pub(crate) fn open(
        id: u64,
        partition: PartitionId,
        high_seqno: u64,
        snapshot_start: u64,
        snapshot_end: u64,
    ) -> Self {
        let items = vec![
            Arc::new(Item::meta(QueueOp::Empty, partition, high_seqno + 1)),
            Arc::new(Item::meta(QueueOp::CheckpointStart, partition, high_seqno + 1)),
        ];
        Self {
            id,
            state: CheckpointState::Open,
            items,
            key_index: FxHashMap::default(),
            num_queued: 0,
            snapshot_start,
            snapshot_end,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state == CheckpointState::Open
    }

    pub(crate) fn items(&self) -> &[QueuedItem] {
        &self.items
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    /// Index of the last slot; a cursor parked here has consumed the whole
    /// checkpoint.
    pub(crate) fn tail_pos(&self) -> usize {
        self.items.len() - 1
    }

    /// Number of data items currently held (de-duplicated).
    pub(crate) fn num_queued_items(&self) -> usize {
        self.num_queued
    }

    /// Number of items excluding the `Empty` sentinel.
    pub(crate) fn num_items(&self) -> usize {
        self.items.len() - 1
    }

    pub(crate) fn snapshot_start(&self) -> u64 {
        self.snapshot_start
    }

    pub(crate) fn snapshot_end(&self) -> u64 {
        self.snapshot_end
    }

    pub(crate) fn position_of(&self, key: &DocKey) -> Option<usize> {
        self.key_index.get(key).copied()
    }

    /// Append a freshly sequenced data item for a key not present in the
    /// index.
    pub(crate) fn append(&mut self, item: QueuedItem) {
        debug_assert!(self.is_open());
        debug_assert!(item.op().is_queued_data());
        if item.op() != QueueOp::Flush {
            self.key_index.insert(item.key().clone(), self.items.len());
        }
        self.snapshot_end = self.snapshot_end.max(item.by_seqno());
        self.items.push(item);
        self.num_queued += 1;
    }

    /// De-duplicate: drop the surviving occurrence of `key` at `old_pos`
    /// and append the replacement at the tail. Returns the position the
    /// old item was removed from so the manager can adjust cursors.
    pub(crate) fn dedup_replace(&mut self, old_pos: usize, item: QueuedItem) {
        debug_assert!(self.is_open());
        debug_assert_eq!(self.items[old_pos].key(), item.key());
        self.items.remove(old_pos);
        // Every index entry after the removed slot shifts down by one.
        for pos in self.key_index.values_mut() {
            if *pos > old_pos {
                *pos -= 1;
            }
        }
        self.key_index.insert(item.key().clone(), self.items.len());
        self.snapshot_end = self.snapshot_end.max(item.by_seqno());
        self.items.push(item);
    }

    /// Append a meta item (`SetPartitionState`). Meta items bypass the key
    /// index and queue accounting.
    pub(crate) fn append_meta(&mut self, item: QueuedItem) {
        debug_assert!(self.is_open());
        debug_assert!(item.is_meta());
        self.items.push(item);
    }

    /// Close the checkpoint, appending the `CheckpointEnd` marker carrying
    /// the seqno of the flanking data item.
    pub(crate) fn close(&mut self, partition: PartitionId, high_seqno: u64) {
        debug_assert!(self.is_open());
        self.items
            .push(Arc::new(Item::meta(QueueOp::CheckpointEnd, partition, high_seqno)));
        self.state = CheckpointState::Closed;
    }

    /// Whether any data item exists at a position strictly greater than
    /// `pos`. Used to compute `is_last_mutation_item` for cursor reads.
    pub(crate) fn has_data_after(&self, pos: usize) -> bool {
        self.items
            .iter()
            .skip(pos + 1)
            .any(|item| item.op().is_queued_data())
    }

    /// Count data items at positions strictly greater than `pos`.
    pub(crate) fn data_items_after(&self, pos: usize) -> usize {
        self.items
            .iter()
            .skip(pos + 1)
            .filter(|item| item.op().is_queued_data())
            .count()
    }
}
