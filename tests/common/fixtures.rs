//! Shared fixtures for checkpoint and connection tests.

use std::sync::Arc;

use tidemark::auth::{PasswordDatabase, RbacDatabase};
use tidemark::checkpoint::{
    CheckpointConfig, CheckpointManager, GenerateBySeqno, GenerateCas,
};
use tidemark::hlc::HybridClock;
use tidemark::item::{DocKey, Item, QueuedItem};
use tidemark::server::ServerContext;
use tidemark::settings::Settings;

/// Rotation threshold used by the sized-down test managers.
pub const MIN_CHECKPOINT_ITEMS: usize = 10;

/// Starting sequence number used by most manager fixtures.
pub const START_SEQNO: u64 = 1000;

/// A manager on partition 0 continuing from seqno 1000 with the default
/// (large) rotation policy, mirroring a warmed-up partition.
pub fn manager() -> CheckpointManager {
    manager_with_config(CheckpointConfig::default(), START_SEQNO)
}

/// A manager with item-based rotation sized down to
/// [`MIN_CHECKPOINT_ITEMS`] and at most two checkpoints.
pub fn small_manager() -> CheckpointManager {
    manager_with_config(small_config(), START_SEQNO)
}

pub fn small_config() -> CheckpointConfig {
    CheckpointConfig::builder()
        .min_items_per_checkpoint(MIN_CHECKPOINT_ITEMS)
        .max_checkpoints(2)
        .build()
}

pub fn manager_with_config(config: CheckpointConfig, last_seqno: u64) -> CheckpointManager {
    CheckpointManager::new(0, config, Arc::new(HybridClock::new()), last_seqno, 0, 0)
}

/// Queue a mutation for `key` with generated seqno/CAS; returns whether
/// the queue logically grew.
pub fn queue_new_item(manager: &CheckpointManager, key: &str) -> bool {
    let item = Item::mutation(DocKey::default_collection(key.to_string()), 0, 0, "value");
    manager
        .queue_dirty(item, GenerateBySeqno::Yes, GenerateCas::Yes)
        .expect("queue_dirty should accept a well-formed item")
        .queue_expanded
}

/// Operations of the drained items, as display strings.
pub fn ops_of(items: &[QueuedItem]) -> Vec<String> {
    items.iter().map(|i| i.op().to_string()).collect()
}

/// The user catalog used by connection tests.
pub fn test_rbac() -> Arc<RbacDatabase> {
    Arc::new(
        RbacDatabase::from_json(
            r#"{
                "users": {
                    "app": {
                        "domain": "local",
                        "buckets": {"default": ["Read", "Upsert", "Remove"]}
                    },
                    "reader": {
                        "domain": "local",
                        "buckets": {"default": ["Read"]}
                    },
                    "flusher": {
                        "domain": "local",
                        "internal": true,
                        "buckets": {"*": ["Read", "Upsert", "Remove", "Stats"]}
                    }
                }
            }"#,
        )
        .expect("test catalog parses"),
    )
}

/// The password file matching [`test_rbac`].
pub fn test_passwords() -> Arc<PasswordDatabase> {
    let db = PasswordDatabase::new();
    db.insert("app", "app-secret");
    db.insert("reader", "reader-secret");
    db.insert("flusher", "internal-secret");
    Arc::new(db)
}

/// A server context over the test catalogs with default settings.
pub fn test_context() -> Arc<ServerContext> {
    Arc::new(ServerContext::new(
        Arc::new(Settings::default()),
        test_rbac(),
        test_passwords(),
    ))
}
