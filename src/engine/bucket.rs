//! The in-memory bucket: a partitioned hash table whose accepted writes
//! feed the partition checkpoint managers.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::info;

use crate::checkpoint::{CheckpointConfig, CheckpointManager, GenerateBySeqno, GenerateCas};
use crate::engine::kvstore::{KvStore, KvStoreError};
use crate::engine::{BucketEngine, EngineCode, EngineContext, EngineOutcome, EngineResponse, StoreOp};
use crate::hlc::HybridClock;
use crate::item::{DocKey, Item, PartitionId, MAX_KEY_LEN};

/// A document resident in the bucket's hash table.
#[derive(Clone, Debug)]
pub struct StoredValue {
    pub value: Bytes,
    pub cas: u64,
    pub rev_seqno: u64,
    pub by_seqno: u64,
}

struct Partition {
    manager: Arc<CheckpointManager>,
    table: Mutex<FxHashMap<DocKey, StoredValue>>,
}

/// An in-memory bucket with one checkpoint manager per partition.
///
/// Reads are served from the hash table; every accepted mutation is queued
/// into the owning partition's checkpoint log under that partition's write
/// lock, so flusher and replication cursors observe a single ordered
/// history.
pub struct Bucket {
    name: String,
    clock: Arc<HybridClock>,
    partitions: Vec<Partition>,
}

impl Bucket {
    /// Create a bucket with `num_partitions` empty partitions.
    #[must_use]
    pub fn new(name: impl Into<String>, num_partitions: u16, config: CheckpointConfig) -> Self {
        let clock = Arc::new(HybridClock::new());
        let partitions = (0..num_partitions)
            .map(|p| Partition {
                manager: Arc::new(CheckpointManager::new(
                    p,
                    config.clone(),
                    Arc::clone(&clock),
                    0,
                    0,
                    0,
                )),
                table: Mutex::new(FxHashMap::default()),
            })
            .collect();
        Self {
            name: name.into(),
            clock,
            partitions,
        }
    }

    /// Rebuild a bucket from the last persisted snapshots: the hash table
    /// is replayed and each partition reopens a fresh checkpoint
    /// continuing from its durable high seqno.
    pub async fn warmup(
        name: impl Into<String>,
        num_partitions: u16,
        config: CheckpointConfig,
        store: &dyn KvStore,
    ) -> Result<Self, KvStoreError> {
        let name = name.into();
        let clock = Arc::new(HybridClock::new());
        let mut partitions = Vec::with_capacity(num_partitions as usize);
        let mut restored = 0usize;
        for p in 0..num_partitions {
            let snapshot = store.load_snapshot(p).await?.unwrap_or_default();
            let mut table = FxHashMap::default();
            for doc in snapshot.documents {
                clock.observe(doc.cas);
                restored += 1;
                table.insert(
                    doc.key,
                    StoredValue {
                        value: doc.value,
                        cas: doc.cas,
                        rev_seqno: doc.rev_seqno,
                        by_seqno: doc.by_seqno,
                    },
                );
            }
            partitions.push(Partition {
                manager: Arc::new(CheckpointManager::new(
                    p,
                    config.clone(),
                    Arc::clone(&clock),
                    snapshot.high_seqno,
                    snapshot.high_seqno,
                    snapshot.high_seqno,
                )),
                table: Mutex::new(table),
            });
        }
        info!(bucket = %name, restored, "bucket warmed up from snapshot");
        Ok(Self {
            name,
            clock,
            partitions,
        })
    }

    #[must_use]
    pub fn num_partitions(&self) -> u16 {
        self.partitions.len() as u16
    }

    /// The checkpoint manager for a partition, if it exists.
    #[must_use]
    pub fn manager(&self, partition: PartitionId) -> Option<&Arc<CheckpointManager>> {
        self.partitions.get(partition as usize).map(|p| &p.manager)
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<HybridClock> {
        &self.clock
    }

    fn partition(&self, partition: PartitionId) -> Option<&Partition> {
        self.partitions.get(partition as usize)
    }
}

impl BucketEngine for Bucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, _ctx: &EngineContext, partition: PartitionId, key: &DocKey) -> EngineOutcome {
        let Some(part) = self.partition(partition) else {
            return EngineOutcome::Done(EngineResponse::code(EngineCode::NotMyPartition));
        };
        let table = part.table.lock();
        match table.get(key) {
            Some(doc) => {
                EngineOutcome::Done(EngineResponse::success(doc.cas, doc.value.clone()))
            }
            None => EngineOutcome::Done(EngineResponse::code(EngineCode::KeyEnoent)),
        }
    }

    fn store(
        &self,
        _ctx: &EngineContext,
        op: StoreOp,
        partition: PartitionId,
        key: DocKey,
        value: Bytes,
        cas: u64,
    ) -> EngineOutcome {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return EngineOutcome::Done(EngineResponse::code(EngineCode::Einval));
        }
        let Some(part) = self.partition(partition) else {
            return EngineOutcome::Done(EngineResponse::code(EngineCode::NotMyPartition));
        };
        // The table lock is held across queue_dirty so the table and the
        // checkpoint log agree on mutation order for the key.
        let mut table = part.table.lock();
        let existing = table.get(&key);
        match op {
            StoreOp::Add if existing.is_some() => {
                return EngineOutcome::Done(EngineResponse::code(EngineCode::KeyEexists));
            }
            StoreOp::Replace if existing.is_none() => {
                return EngineOutcome::Done(EngineResponse::code(EngineCode::KeyEnoent));
            }
            _ => {}
        }
        if cas != 0 {
            match existing {
                Some(doc) if doc.cas == cas => {}
                Some(_) => {
                    return EngineOutcome::Done(EngineResponse::code(EngineCode::KeyEexists));
                }
                None => {
                    return EngineOutcome::Done(EngineResponse::code(EngineCode::KeyEnoent));
                }
            }
        }
        let rev_seqno = existing.map_or(1, |doc| doc.rev_seqno + 1);
        let item = Item::mutation(key.clone(), partition, rev_seqno, value.clone());
        let queued = match part
            .manager
            .queue_dirty(item, GenerateBySeqno::Yes, GenerateCas::Yes)
        {
            Ok(queued) => queued,
            Err(_) => {
                return EngineOutcome::Done(EngineResponse::code(EngineCode::Einval));
            }
        };
        table.insert(
            key,
            StoredValue {
                value,
                cas: queued.cas,
                rev_seqno,
                by_seqno: queued.by_seqno,
            },
        );
        EngineOutcome::Done(EngineResponse::mutated(queued.cas, queued.by_seqno))
    }

    fn remove(
        &self,
        _ctx: &EngineContext,
        partition: PartitionId,
        key: &DocKey,
        cas: u64,
    ) -> EngineOutcome {
        let Some(part) = self.partition(partition) else {
            return EngineOutcome::Done(EngineResponse::code(EngineCode::NotMyPartition));
        };
        let mut table = part.table.lock();
        let Some(doc) = table.get(key) else {
            return EngineOutcome::Done(EngineResponse::code(EngineCode::KeyEnoent));
        };
        if cas != 0 && doc.cas != cas {
            return EngineOutcome::Done(EngineResponse::code(EngineCode::KeyEexists));
        }
        let rev_seqno = doc.rev_seqno + 1;
        let item = Item::deletion(key.clone(), partition, rev_seqno);
        let queued = match part
            .manager
            .queue_dirty(item, GenerateBySeqno::Yes, GenerateCas::Yes)
        {
            Ok(queued) => queued,
            Err(_) => {
                return EngineOutcome::Done(EngineResponse::code(EngineCode::Einval));
            }
        };
        table.remove(key);
        EngineOutcome::Done(EngineResponse::mutated(queued.cas, queued.by_seqno))
    }
}
