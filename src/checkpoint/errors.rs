//! Error types for the checkpoint subsystem.

use miette::Diagnostic;
use thiserror::Error;

use crate::item::PartitionId;

/// Errors surfaced by [`CheckpointManager`](crate::checkpoint::CheckpointManager)
/// operations.
///
/// De-duplication is never an error; the manager fails only on genuinely
/// malformed input or unknown cursor names.
#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointError {
    /// The enqueued item is malformed (empty or oversized key, wrong
    /// partition).
    #[error("invalid argument: {reason}")]
    #[diagnostic(
        code(tidemark::checkpoint::invalid_argument),
        help("The item was rejected before touching the log; the queue is unchanged.")
    )]
    InvalidArgument { reason: String },

    /// The item was queued against the wrong partition's manager.
    #[error("partition mismatch: item is for {item} but this manager owns {manager}")]
    #[diagnostic(code(tidemark::checkpoint::partition_mismatch))]
    PartitionMismatch {
        item: PartitionId,
        manager: PartitionId,
    },

    /// No cursor is registered under the given name.
    #[error("unknown cursor: {name}")]
    #[diagnostic(
        code(tidemark::checkpoint::unknown_cursor),
        help("Register the cursor with `register_cursor` before reading through it.")
    )]
    UnknownCursor { name: String },

    /// The reserved persistence cursor cannot be removed.
    #[error("the persistence cursor is reserved and cannot be removed")]
    #[diagnostic(code(tidemark::checkpoint::reserved_cursor))]
    ReservedCursor,
}

pub type Result<T> = std::result::Result<T, CheckpointError>;
