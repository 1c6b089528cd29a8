//! The per-partition checkpoint manager.
//!
//! A [`CheckpointManager`] owns the ordered list of checkpoints for one
//! partition, assigns bySeqno/CAS pairs at enqueue, enforces the rotation
//! policy, serves cursor reads, and collapses closed checkpoints nobody
//! references any more.
//!
//! # Locking
//!
//! A single `parking_lot::Mutex` guards the checkpoint list, the cursor
//! map and HLC advancement together. Workers queue under it, the flusher
//! and replication readers drain under it, and the cleanup path collapses
//! under it. The lock is never held across I/O.
//!
//! # Ordering
//!
//! For items enqueued in program order on the same partition both bySeqno
//! and CAS are strictly increasing, and the committed sequence of
//! concurrent enqueues is a linearization preserving that pairwise order.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checkpoint::checkpoint::Checkpoint;
use crate::checkpoint::config::CheckpointConfig;
use crate::checkpoint::cursor::{
    CursorKind, CursorRegistration, CursorState, SnapshotRange, PERSISTENCE_CURSOR,
};
use crate::checkpoint::errors::{CheckpointError, Result};
use crate::hlc::HybridClock;
use crate::item::{Item, PartitionId, QueueOp, QueuedItem, MAX_KEY_LEN};

/// Replication role of a partition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionState {
    #[default]
    Active,
    Replica,
    Pending,
    Dead,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartitionState::Active => "active",
            PartitionState::Replica => "replica",
            PartitionState::Pending => "pending",
            PartitionState::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

/// Whether the manager assigns the bySeqno or accepts the caller's value
/// (replica partitions mirror the active's sequencing).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerateBySeqno {
    Yes,
    No,
}

/// Whether the manager draws a CAS from the hybrid clock or accepts the
/// caller's value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerateCas {
    Yes,
    No,
}

/// Outcome of [`CheckpointManager::queue_dirty`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueDirtyResult {
    /// True iff the queue size logically increased: a new key in the open
    /// checkpoint rather than a de-duplicated overwrite.
    pub queue_expanded: bool,
    /// The bySeqno assigned to (or accepted for) the item.
    pub by_seqno: u64,
    /// The CAS assigned to (or accepted for) the item.
    pub cas: u64,
}

struct Inner {
    checkpoints: Vec<Checkpoint>,
    cursors: FxHashMap<String, CursorState>,
    /// Highest bySeqno ever assigned; the next assignment is `high + 1`.
    high_seqno: u64,
    last_closed_id: u64,
    /// Highest checkpoint id whose items are known durable; closed
    /// checkpoints up to this id are eligible for collapse.
    persistence_pre_checkpoint_id: u64,
    partition_state: PartitionState,
}

impl Inner {
    fn open_index(&self) -> usize {
        self.checkpoints.len() - 1
    }

    fn open(&self) -> &Checkpoint {
        self.checkpoints
            .last()
            .expect("a partition always holds an open checkpoint")
    }

    fn checkpoint_index(&self, id: u64) -> Option<usize> {
        self.checkpoints.iter().position(|c| c.id() == id)
    }

    fn close_and_open(&mut self, partition: PartitionId, new_id: u64) {
        let high = self.high_seqno;
        let old_id = self.open().id();
        let idx = self.open_index();
        self.checkpoints[idx].close(partition, high);
        self.last_closed_id = old_id;
        self.checkpoints
            .push(Checkpoint::open(new_id, partition, high, high + 1, high));
    }

    fn rotation_allowed(&self, max_checkpoints: usize) -> bool {
        if self.checkpoints.len() < max_checkpoints {
            return true;
        }
        let oldest = self.checkpoints[0].id();
        !self.cursors.values().any(|c| c.checkpoint_id == oldest)
    }
}

/// Bounded, ordered, de-duplicating in-memory mutation log for one
/// partition.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tidemark::checkpoint::{CheckpointConfig, CheckpointManager, GenerateBySeqno, GenerateCas};
/// use tidemark::hlc::HybridClock;
/// use tidemark::item::{DocKey, Item};
///
/// let manager = CheckpointManager::new(
///     0,
///     CheckpointConfig::default(),
///     Arc::new(HybridClock::new()),
///     1000,
///     0,
///     0,
/// );
/// let item = Item::mutation(DocKey::default_collection("key"), 0, 1, "value");
/// let queued = manager
///     .queue_dirty(item, GenerateBySeqno::Yes, GenerateCas::Yes)
///     .unwrap();
/// assert!(queued.queue_expanded);
/// assert_eq!(queued.by_seqno, 1001);
/// ```
pub struct CheckpointManager {
    partition: PartitionId,
    config: CheckpointConfig,
    clock: Arc<HybridClock>,
    inner: Mutex<Inner>,
}

impl CheckpointManager {
    /// Create a manager whose first checkpoint (id 1) covers the given
    /// snapshot range and continues sequencing from `last_seqno`.
    pub fn new(
        partition: PartitionId,
        config: CheckpointConfig,
        clock: Arc<HybridClock>,
        last_seqno: u64,
        snapshot_start: u64,
        snapshot_end: u64,
    ) -> Self {
        let mut cursors = FxHashMap::default();
        if config.persistence_enabled {
            cursors.insert(
                PERSISTENCE_CURSOR.to_string(),
                CursorState::new(PERSISTENCE_CURSOR, CursorKind::Persistence, 1, 0, true),
            );
        }
        Self {
            partition,
            config,
            clock,
            inner: Mutex::new(Inner {
                checkpoints: vec![Checkpoint::open(
                    1,
                    partition,
                    last_seqno,
                    snapshot_start,
                    snapshot_end,
                )],
                cursors,
                high_seqno: last_seqno,
                last_closed_id: 0,
                persistence_pre_checkpoint_id: 0,
                partition_state: PartitionState::Active,
            }),
        }
    }

    /// The partition this manager belongs to.
    #[must_use]
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Set the partition's replication role. Affects the de-duplication
    /// rules; queue a marker with [`queue_set_partition_state`] to record
    /// the change inline in the log.
    ///
    /// [`queue_set_partition_state`]: Self::queue_set_partition_state
    pub fn set_state(&self, state: PartitionState) {
        self.inner.lock().partition_state = state;
    }

    #[must_use]
    pub fn state(&self) -> PartitionState {
        self.inner.lock().partition_state
    }

    /// Queue a dirty item into the open checkpoint.
    ///
    /// Returns whether the queue logically grew, plus the sequencing the
    /// item received. The bySeqno advances on every accepted call even when
    /// the item de-duplicates an earlier write of the same key.
    ///
    /// De-duplication drops the earlier occurrence and places the new item
    /// at the queue tail, except when:
    /// - a cursor is positioned exactly on the earlier occurrence (both
    ///   items are kept so the cursor does not lose its slot),
    /// - the partition is a replica and merging is disabled,
    /// - the earlier occurrence is a meta item (meta never dedupes).
    pub fn queue_dirty(
        &self,
        item: Item,
        generate_by_seqno: GenerateBySeqno,
        generate_cas: GenerateCas,
    ) -> Result<QueueDirtyResult> {
        if !item.op().is_queued_data() {
            return Err(CheckpointError::InvalidArgument {
                reason: format!("operation {} cannot be queued as data", item.op()),
            });
        }
        if item.key().is_empty() {
            return Err(CheckpointError::InvalidArgument {
                reason: "empty key".into(),
            });
        }
        if item.key().len() > MAX_KEY_LEN {
            return Err(CheckpointError::InvalidArgument {
                reason: format!("key length {} exceeds {MAX_KEY_LEN}", item.key().len()),
            });
        }
        if item.partition() != self.partition {
            return Err(CheckpointError::PartitionMismatch {
                item: item.partition(),
                manager: self.partition,
            });
        }

        let mut inner = self.inner.lock();

        // Item-based rotation runs on entry so the new item lands in the
        // fresh checkpoint. At the checkpoint cap, rotation waits until
        // every cursor has left the oldest checkpoint.
        if self.config.item_based
            && inner.open().num_queued_items() >= self.config.min_items_per_checkpoint
            && inner.rotation_allowed(self.config.max_checkpoints)
        {
            let new_id = inner.open().id() + 1;
            inner.close_and_open(self.partition, new_id);
            debug!(
                partition = self.partition,
                checkpoint = new_id,
                "rotated open checkpoint"
            );
        }

        let by_seqno = match generate_by_seqno {
            GenerateBySeqno::Yes => {
                inner.high_seqno += 1;
                inner.high_seqno
            }
            GenerateBySeqno::No => {
                let seqno = item.by_seqno();
                inner.high_seqno = inner.high_seqno.max(seqno);
                seqno
            }
        };
        let cas = match generate_cas {
            GenerateCas::Yes => self.clock.next(),
            GenerateCas::No => {
                self.clock.observe(item.cas());
                item.cas()
            }
        };
        let op = item.op();
        let sequenced: QueuedItem = Arc::new(item.with_sequencing(by_seqno, cas));

        let open_idx = inner.open_index();
        let open_id = inner.checkpoints[open_idx].id();
        let existing = if op == QueueOp::Flush {
            None
        } else {
            inner.checkpoints[open_idx].position_of(sequenced.key())
        };

        let queue_expanded = match existing {
            Some(old_pos) => {
                let merge_denied = inner.partition_state == PartitionState::Replica
                    && !self.config.enable_merge;
                let cursor_on_slot = inner
                    .cursors
                    .values()
                    .any(|c| c.checkpoint_id == open_id && c.pos == old_pos);
                if merge_denied || cursor_on_slot {
                    // Keep both: the earlier occurrence survives, the new
                    // item is appended and the index now refers to it.
                    inner.checkpoints[open_idx].append(sequenced);
                    true
                } else {
                    inner.checkpoints[open_idx].dedup_replace(old_pos, sequenced);
                    for cursor in inner.cursors.values_mut() {
                        if cursor.checkpoint_id == open_id && cursor.pos > old_pos {
                            cursor.pos -= 1;
                        }
                    }
                    false
                }
            }
            None => {
                inner.checkpoints[open_idx].append(sequenced);
                true
            }
        };

        Ok(QueueDirtyResult {
            queue_expanded,
            by_seqno,
            cas,
        })
    }

    /// Queue a `SetPartitionState` meta marker recording the current role
    /// inline with the data. Meta markers never dedupe and do not consume
    /// a bySeqno.
    pub fn queue_set_partition_state(&self) {
        let mut inner = self.inner.lock();
        let seqno = inner.high_seqno;
        let idx = inner.open_index();
        inner.checkpoints[idx].append_meta(Arc::new(Item::meta(
            QueueOp::SetPartitionState,
            self.partition,
            seqno,
        )));
    }

    /// Close the open checkpoint (if it holds any data) and open a new
    /// one. Returns the id of the open checkpoint afterwards; a no-op on
    /// an empty open checkpoint returns the existing id.
    pub fn create_new_checkpoint(&self) -> u64 {
        let mut inner = self.inner.lock();
        if inner.open().num_queued_items() == 0 {
            return inner.open().id();
        }
        let new_id = inner.open().id() + 1;
        inner.close_and_open(self.partition, new_id);
        new_id
    }

    /// Replica path: if the active peer has announced a checkpoint id this
    /// partition has not opened yet, close the current open checkpoint and
    /// open one with the announced id so ids stay aligned across peers.
    /// Announcements at or below the current open id are ignored.
    ///
    /// Returns the open checkpoint id afterwards.
    pub fn check_and_add_new_checkpoint(&self, id: u64) -> u64 {
        let mut inner = self.inner.lock();
        let open_id = inner.open().id();
        if id <= open_id {
            return open_id;
        }
        inner.close_and_open(self.partition, id);
        id
    }

    /// Register (or re-register) a named replication cursor at the first
    /// retained item after `start_seqno`.
    ///
    /// Backfill is required only when the requested position has been
    /// collapsed out of the log; gaps produced by de-duplication resume at
    /// the surviving successor without backfill.
    pub fn register_cursor(
        &self,
        name: &str,
        start_seqno: u64,
        must_send_checkpoint_end: bool,
    ) -> Result<CursorRegistration> {
        if name == PERSISTENCE_CURSOR {
            return Err(CheckpointError::InvalidArgument {
                reason: "the persistence cursor name is reserved".into(),
            });
        }
        let mut inner = self.inner.lock();

        let backfill_required = start_seqno + 1 < inner.checkpoints[0].snapshot_start();

        // Meta items carry the seqno of their flanking data item, so they
        // participate in the scan; the Empty sentinel at position zero is
        // never a landing slot.
        let mut placed: Option<(u64, usize, u64)> = None;
        'search: for ckpt in &inner.checkpoints {
            for (pos, item) in ckpt.items().iter().enumerate().skip(1) {
                if item.by_seqno() > start_seqno {
                    placed = Some((ckpt.id(), pos - 1, item.by_seqno()));
                    break 'search;
                }
            }
        }
        let (checkpoint_id, pos, seqno) = placed.unwrap_or_else(|| {
            let open = inner.open();
            (open.id(), open.tail_pos(), inner.high_seqno + 1)
        });

        inner.cursors.insert(
            name.to_string(),
            CursorState::new(
                name,
                CursorKind::Replication,
                checkpoint_id,
                pos,
                must_send_checkpoint_end,
            ),
        );
        debug!(
            partition = self.partition,
            cursor = name,
            seqno,
            backfill_required,
            "registered cursor"
        );

        Ok(CursorRegistration {
            seqno,
            backfill_required,
        })
    }

    /// Remove a named cursor. Returns whether it existed. The persistence
    /// cursor is reserved and cannot be removed.
    pub fn remove_cursor(&self, name: &str) -> Result<bool> {
        if name == PERSISTENCE_CURSOR {
            return Err(CheckpointError::ReservedCursor);
        }
        Ok(self.inner.lock().cursors.remove(name).is_some())
    }

    /// Advance a cursor one slot and return the item there, along with
    /// whether no further data items follow it in its checkpoint.
    ///
    /// Meta items are returned like any other slot. A cursor that has
    /// caught up with the tail receives an `Empty`-operation sentinel and
    /// does not advance.
    pub fn next_item(&self, name: &str) -> Result<(QueuedItem, bool)> {
        let mut inner = self.inner.lock();
        let cursor = inner
            .cursors
            .get(name)
            .ok_or_else(|| CheckpointError::UnknownCursor {
                name: name.to_string(),
            })?
            .clone();

        let ci = inner
            .checkpoint_index(cursor.checkpoint_id)
            .ok_or_else(|| CheckpointError::UnknownCursor {
                name: name.to_string(),
            })?;

        let (new_ci, new_pos) = if cursor.pos + 1 < inner.checkpoints[ci].len() {
            (ci, cursor.pos + 1)
        } else if ci + 1 < inner.checkpoints.len() {
            // Cross into the next checkpoint, skipping its Empty sentinel.
            (ci + 1, 1)
        } else {
            let sentinel = Arc::new(Item::empty_sentinel(self.partition, inner.high_seqno + 1));
            return Ok((sentinel, false));
        };

        let item = inner.checkpoints[new_ci].items()[new_pos].clone();
        let is_last = !inner.checkpoints[new_ci].has_data_after(new_pos);
        let new_id = inner.checkpoints[new_ci].id();
        if let Some(c) = inner.cursors.get_mut(name) {
            c.checkpoint_id = new_id;
            c.pos = new_pos;
        }
        Ok((item, is_last))
    }

    /// Drain a cursor to the end of the open checkpoint.
    pub fn get_all_items_for_cursor(
        &self,
        name: &str,
    ) -> Result<(SnapshotRange, Vec<QueuedItem>)> {
        self.get_items_for_cursor(name, None)
    }

    /// Drain a cursor, stopping after `limit` closed checkpoints have been
    /// consumed (the cursor then rests at the start of the following
    /// checkpoint). With no limit, drains through the open checkpoint.
    pub fn get_items_for_cursor(
        &self,
        name: &str,
        limit: Option<usize>,
    ) -> Result<(SnapshotRange, Vec<QueuedItem>)> {
        let mut inner = self.inner.lock();
        let cursor = inner
            .cursors
            .get(name)
            .ok_or_else(|| CheckpointError::UnknownCursor {
                name: name.to_string(),
            })?
            .clone();
        let mut ci = inner
            .checkpoint_index(cursor.checkpoint_id)
            .ok_or_else(|| CheckpointError::UnknownCursor {
                name: name.to_string(),
            })?;
        let mut pos = cursor.pos;

        let range_start = inner.checkpoints[ci].snapshot_start();
        let mut range_end = inner.checkpoints[ci].snapshot_end();
        let mut items = Vec::new();
        let mut consumed_closed = 0usize;

        loop {
            let ckpt = &inner.checkpoints[ci];
            while pos + 1 < ckpt.len() {
                pos += 1;
                items.push(ckpt.items()[pos].clone());
            }
            range_end = ckpt.snapshot_end();
            if ci + 1 >= inner.checkpoints.len() {
                break;
            }
            consumed_closed += 1;
            ci += 1;
            pos = 0;
            if limit.is_some_and(|l| consumed_closed >= l) {
                break;
            }
        }

        let range = SnapshotRange {
            start: range_start,
            end: range_end,
        };
        let new_id = inner.checkpoints[ci].id();
        if let Some(c) = inner.cursors.get_mut(name) {
            c.checkpoint_id = new_id;
            c.pos = pos;
        }
        Ok((range, items))
    }

    /// Remaining data items (mutations, deletions, flush markers — meta
    /// excluded) between the cursor's position and the end of the log.
    pub fn num_items_for_cursor(&self, name: &str) -> Result<usize> {
        let inner = self.inner.lock();
        let cursor = inner
            .cursors
            .get(name)
            .ok_or_else(|| CheckpointError::UnknownCursor {
                name: name.to_string(),
            })?;
        let ci = inner
            .checkpoint_index(cursor.checkpoint_id)
            .ok_or_else(|| CheckpointError::UnknownCursor {
                name: name.to_string(),
            })?;
        let mut remaining = inner.checkpoints[ci].data_items_after(cursor.pos);
        for ckpt in &inner.checkpoints[ci + 1..] {
            remaining += ckpt.num_queued_items();
        }
        Ok(remaining)
    }

    /// Record that the flusher has persisted everything it has read.
    /// Advances the durable high-water mark to just before the persistence
    /// cursor's current checkpoint, making earlier closed checkpoints
    /// eligible for collapse.
    pub fn items_persisted(&self) {
        let mut inner = self.inner.lock();
        let durable = inner
            .cursors
            .get(PERSISTENCE_CURSOR)
            .map(|p| p.checkpoint_id.saturating_sub(1));
        if let Some(durable) = durable {
            inner.persistence_pre_checkpoint_id = durable;
        }
    }

    /// Collapse closed checkpoints that no cursor needs any more.
    ///
    /// Two phases:
    /// 1. If every cursor has fully consumed the open checkpoint (and it
    ///    holds data), it is closed and a fresh one opened, migrating those
    ///    cursors forward — this lets a fully-drained log shed its tail.
    /// 2. Closed checkpoints are dropped from the front while they are
    ///    covered by the durable high-water mark and no cursor still has
    ///    unread slots inside them. Cursors parked at the very end of a
    ///    dropped checkpoint migrate to the start of its successor;
    ///    remaining-item counts are derived from positions, so they are
    ///    consistent by construction.
    ///
    /// Returns the number of data items dropped and whether a new open
    /// checkpoint was created.
    pub fn remove_closed_unref_checkpoints(&self) -> (usize, bool) {
        let mut inner = self.inner.lock();
        let mut created_new_open = false;

        let open_id = inner.open().id();
        let open_tail = inner.open().tail_pos();
        if inner.open().num_queued_items() > 0
            && !inner.cursors.is_empty()
            && inner
                .cursors
                .values()
                .all(|c| c.checkpoint_id == open_id && c.pos == open_tail)
        {
            let new_id = open_id + 1;
            inner.close_and_open(self.partition, new_id);
            for cursor in inner.cursors.values_mut() {
                cursor.checkpoint_id = new_id;
                cursor.pos = 0;
            }
            created_new_open = true;
        }

        let mut removed = 0usize;
        while inner.checkpoints.len() > 1 {
            let front = &inner.checkpoints[0];
            if front.is_open() {
                break;
            }
            if self.config.persistence_enabled
                && front.id() > inner.persistence_pre_checkpoint_id
            {
                break;
            }
            let front_id = front.id();
            let front_tail = front.tail_pos();
            if inner
                .cursors
                .values()
                .any(|c| c.checkpoint_id == front_id && c.pos < front_tail)
            {
                break;
            }
            let next_id = inner.checkpoints[1].id();
            for cursor in inner.cursors.values_mut() {
                if cursor.checkpoint_id == front_id {
                    cursor.checkpoint_id = next_id;
                    cursor.pos = 0;
                }
            }
            removed += inner.checkpoints[0].num_queued_items();
            inner.checkpoints.remove(0);
        }
        if removed > 0 {
            debug!(
                partition = self.partition,
                removed, "collapsed closed checkpoints"
            );
        }
        (removed, created_new_open)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    #[must_use]
    pub fn num_checkpoints(&self) -> usize {
        self.inner.lock().checkpoints.len()
    }

    /// Data items (de-duplicated) in the open checkpoint.
    #[must_use]
    pub fn num_open_items(&self) -> usize {
        self.inner.lock().open().num_queued_items()
    }

    /// Total items across all checkpoints, excluding `Empty` sentinels.
    #[must_use]
    pub fn num_items(&self) -> usize {
        self.inner
            .lock()
            .checkpoints
            .iter()
            .map(Checkpoint::num_items)
            .sum()
    }

    #[must_use]
    pub fn high_seqno(&self) -> u64 {
        self.inner.lock().high_seqno
    }

    #[must_use]
    pub fn open_checkpoint_id(&self) -> u64 {
        self.inner.lock().open().id()
    }

    #[must_use]
    pub fn last_closed_checkpoint_id(&self) -> u64 {
        self.inner.lock().last_closed_id
    }

    #[must_use]
    pub fn num_cursors(&self) -> usize {
        self.inner.lock().cursors.len()
    }

    #[must_use]
    pub fn cursor_names(&self) -> Vec<String> {
        self.inner.lock().cursors.keys().cloned().collect()
    }

    /// Id of the checkpoint a cursor is currently positioned in.
    pub fn cursor_checkpoint_id(&self, name: &str) -> Result<u64> {
        self.inner
            .lock()
            .cursors
            .get(name)
            .map(|c| c.checkpoint_id)
            .ok_or_else(|| CheckpointError::UnknownCursor {
                name: name.to_string(),
            })
    }

    #[must_use]
    pub fn persistence_pre_checkpoint_id(&self) -> u64 {
        self.inner.lock().persistence_pre_checkpoint_id
    }
}

impl fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CheckpointManager")
            .field("partition", &self.partition)
            .field("checkpoints", &inner.checkpoints.len())
            .field("cursors", &inner.cursors.len())
            .field("high_seqno", &inner.high_seqno)
            .finish()
    }
}
