//! Cursors: named reader positions over a partition's checkpoint list.

use serde::{Deserialize, Serialize};

/// Name of the reserved persistence cursor that always exists on a
/// persistence-enabled partition.
pub const PERSISTENCE_CURSOR: &str = "persistence";

/// Classifies a cursor by its consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorKind {
    /// The singular flusher cursor feeding the disk backend.
    Persistence,
    /// A named replication / streaming consumer.
    Replication,
}

/// Internal cursor state tracked by the manager.
///
/// A cursor points *at* the slot it last consumed; the next read delivers
/// the following slot. Freshly placed cursors sit on the `Empty` sentinel
/// at position zero so their first read yields the checkpoint-start marker.
#[derive(Clone, Debug)]
pub(crate) struct CursorState {
    pub name: String,
    pub kind: CursorKind,
    /// Id of the checkpoint the cursor is currently inside.
    pub checkpoint_id: u64,
    /// Index (into that checkpoint's item list) of the last consumed slot.
    pub pos: usize,
    /// Whether the consumer requires checkpoint-end markers on the wire.
    pub must_send_checkpoint_end: bool,
}

impl CursorState {
    pub(crate) fn new(
        name: impl Into<String>,
        kind: CursorKind,
        checkpoint_id: u64,
        pos: usize,
        must_send_checkpoint_end: bool,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            checkpoint_id,
            pos,
            must_send_checkpoint_end,
        }
    }
}

/// Result of [`register_cursor`](crate::checkpoint::CheckpointManager::register_cursor).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CursorRegistration {
    /// The bySeqno the consumer will resume from: the first retained item
    /// after the requested start.
    pub seqno: u64,
    /// True when the requested start has been evicted from the log and the
    /// consumer must backfill from disk. A gap produced purely by
    /// de-duplication does not require backfill.
    pub backfill_required: bool,
}

/// Snapshot range covered by a cursor drain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotRange {
    pub start: u64,
    pub end: u64,
}
