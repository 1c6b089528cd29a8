//! The checkpoint subsystem: bounded, ordered, de-duplicating in-memory
//! mutation logs, one per partition.
//!
//! A partition's log is a list of checkpoint segments read concurrently
//! by the disk flusher (through the reserved `"persistence"` cursor) and by
//! named replication consumers. The [`CheckpointManager`] assigns strictly
//! increasing bySeqno/CAS pairs, rotates checkpoints under the configured
//! item policy, de-duplicates repeated writes of a key within the open
//! checkpoint, and collapses closed checkpoints once every cursor has moved
//! past them and their items are known durable.
//!
//! # Architecture
//!
//! - [`CheckpointConfig`] — rotation and merge policy
//! - [`CheckpointManager`] — the per-partition log and cursor registry
//! - [`CursorRegistration`] / [`SnapshotRange`] — cursor read contract
//! - [`CheckpointError`] — malformed-input failures (de-dup never errors)

pub(crate) mod checkpoint;
mod config;
mod cursor;
mod errors;
mod manager;

pub use config::{
    CheckpointConfig, CheckpointConfigBuilder, DEFAULT_MAX_CHECKPOINTS,
    DEFAULT_MIN_ITEMS_PER_CHECKPOINT,
};
pub use cursor::{CursorKind, CursorRegistration, SnapshotRange, PERSISTENCE_CURSOR};
pub use errors::CheckpointError;
pub use manager::{
    CheckpointManager, GenerateBySeqno, GenerateCas, PartitionState, QueueDirtyResult,
};
