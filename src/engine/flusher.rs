//! The flusher: drains each partition's persistence cursor into the
//! storage backend and acknowledges durability back to the checkpoint
//! manager so closed checkpoints can be collapsed.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::bucket::Bucket;
use crate::engine::kvstore::{KvStore, KvStoreError};
use crate::checkpoint::PERSISTENCE_CURSOR;

/// Drives persistence for one bucket.
pub struct Flusher {
    bucket: Arc<Bucket>,
    store: Arc<dyn KvStore>,
    interval: Duration,
}

impl Flusher {
    #[must_use]
    pub fn new(bucket: Arc<Bucket>, store: Arc<dyn KvStore>, interval: Duration) -> Self {
        Self {
            bucket,
            store,
            interval,
        }
    }

    /// One full pass over every partition: drain, flush, ack, collapse.
    /// Returns the number of items written.
    pub async fn flush_once(&self) -> Result<usize, KvStoreError> {
        let mut flushed = 0usize;
        for partition in 0..self.bucket.num_partitions() {
            let Some(manager) = self.bucket.manager(partition) else {
                continue;
            };
            let Ok((_, items)) = manager.get_all_items_for_cursor(PERSISTENCE_CURSOR) else {
                // Ephemeral partitions have no persistence cursor.
                continue;
            };
            let batch: Vec<_> = items
                .into_iter()
                .filter(|item| item.op().is_queued_data())
                .collect();
            if batch.is_empty() {
                continue;
            }
            self.store.flush_batch(partition, &batch).await?;
            flushed += batch.len();
            manager.items_persisted();
            let (removed, _) = manager.remove_closed_unref_checkpoints();
            debug!(
                partition,
                flushed = batch.len(),
                collapsed = removed,
                "flushed partition"
            );
        }
        Ok(flushed)
    }

    /// Run until the returned future is dropped, flushing on the
    /// configured interval.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            if let Err(err) = self.flush_once().await {
                warn!(error = %err, "flush pass failed; will retry");
            }
        }
    }
}
