//! The bucket engine boundary.
//!
//! The connection engine dispatches data commands through the
//! [`BucketEngine`] trait and receives either a finished response or a
//! cooperative `EWouldBlock` suspension (the cookie is parked and the
//! engine signals completion later). The in-tree [`Bucket`] implementation
//! is an in-memory hash table that feeds every accepted mutation into the
//! partition's checkpoint manager.

mod bucket;
mod flusher;
mod kvstore;

use bytes::Bytes;

pub use bucket::{Bucket, StoredValue};
pub use flusher::Flusher;
pub use kvstore::{KvStore, KvStoreError, MemoryKvStore, PartitionSnapshot, SnapshotDoc};

use crate::item::{DocKey, PartitionId};
use crate::server::CookieHandle;

/// Engine-level result vocabulary, remapped onto wire statuses by the
/// connection (the remapping depends on the client's negotiated features).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineCode {
    Success,
    KeyEnoent,
    KeyEexists,
    Enomem,
    NotStored,
    Einval,
    NotSupported,
    EWouldBlock,
    E2big,
    Disconnect,
    NotMyPartition,
    Tmpfail,
    Erange,
    Ebusy,
    Locked,
    LockedTmpfail,
    UnknownCollection,
    Eaccess,
    NoBucket,
    AuthStale,
    Failed,
}

/// A finished engine call.
#[derive(Clone, Debug)]
pub struct EngineResponse {
    pub code: EngineCode,
    pub cas: u64,
    /// bySeqno assigned to an accepted mutation; zero for reads.
    pub seqno: u64,
    pub value: Bytes,
}

impl EngineResponse {
    #[must_use]
    pub fn code(code: EngineCode) -> Self {
        Self {
            code,
            cas: 0,
            seqno: 0,
            value: Bytes::new(),
        }
    }

    #[must_use]
    pub fn success(cas: u64, value: impl Into<Bytes>) -> Self {
        Self {
            code: EngineCode::Success,
            cas,
            seqno: 0,
            value: value.into(),
        }
    }

    #[must_use]
    pub fn mutated(cas: u64, seqno: u64) -> Self {
        Self {
            code: EngineCode::Success,
            cas,
            seqno,
            value: Bytes::new(),
        }
    }
}

/// Outcome of a dispatched engine call.
#[derive(Clone, Debug)]
pub enum EngineOutcome {
    /// The call completed; transmit the response.
    Done(EngineResponse),
    /// The engine suspended the call; the cookie is parked until the
    /// engine notifies completion.
    EWouldBlock,
}

/// Store-family sub-operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOp {
    Set,
    Add,
    Replace,
}

/// Per-call context handed to the engine: the parked-completion handle for
/// asynchronous engines.
#[derive(Clone)]
pub struct EngineContext {
    pub cookie: CookieHandle,
}

/// Data-path surface of a bucket.
pub trait BucketEngine: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, ctx: &EngineContext, partition: PartitionId, key: &DocKey) -> EngineOutcome;

    fn store(
        &self,
        ctx: &EngineContext,
        op: StoreOp,
        partition: PartitionId,
        key: DocKey,
        value: Bytes,
        cas: u64,
    ) -> EngineOutcome;

    fn remove(
        &self,
        ctx: &EngineContext,
        partition: PartitionId,
        key: &DocKey,
        cas: u64,
    ) -> EngineOutcome;
}
