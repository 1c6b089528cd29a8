mod common;

use common::*;
use tidemark::checkpoint::{CheckpointConfig, PERSISTENCE_CURSOR};
use tidemark::item::QueueOp;

// S3 / P4: item-count based rotation, capped by max_checkpoints until the
// persistence cursor leaves the oldest checkpoint.
#[test]
fn item_based_checkpoint_creation() {
    let manager = small_manager();

    for i in 0..MIN_CHECKPOINT_ITEMS {
        assert_eq!(manager.num_open_items(), i);
        assert!(queue_new_item(&manager, &format!("key{i}")));
        assert_eq!(manager.num_checkpoints(), 1);
    }

    // The next enqueue rotates: new checkpoint holding only the new item.
    assert!(queue_new_item(&manager, "key_epoch"));
    assert_eq!(manager.num_checkpoints(), 2);
    assert_eq!(manager.num_open_items(), 1);

    // Fill the new checkpoint to the threshold.
    for i in 0..MIN_CHECKPOINT_ITEMS - 1 {
        assert_eq!(manager.num_open_items(), i + 1);
        assert!(queue_new_item(&manager, &format!("key{i}")));
        assert_eq!(manager.num_checkpoints(), 2);
    }

    // At max_checkpoints with the cursor still in the oldest checkpoint:
    // no rotation, the open checkpoint keeps growing.
    assert!(queue_new_item(&manager, "key_epoch2"));
    assert_eq!(manager.num_checkpoints(), 2);
    assert_eq!(manager.num_open_items(), MIN_CHECKPOINT_ITEMS + 1);

    // Drain persistence out of the first checkpoint.
    let (range, items) = manager.get_all_items_for_cursor(PERSISTENCE_CURSOR).unwrap();
    assert_eq!(range.start, 0);
    assert_eq!(range.end, 1000 + 2 * MIN_CHECKPOINT_ITEMS as u64 + 1);
    assert_eq!(items.len(), 2 * MIN_CHECKPOINT_ITEMS + 1 + 3);
    assert_eq!(manager.num_checkpoints(), 2);
    assert_eq!(manager.num_open_items(), MIN_CHECKPOINT_ITEMS + 1);

    // Now rotation is permitted again.
    assert!(queue_new_item(&manager, "key_epoch3"));
    assert_eq!(manager.num_checkpoints(), 3);
    assert_eq!(manager.num_open_items(), 1);
}

// S4: the same keys land in both checkpoints; de-dup never crosses a
// checkpoint boundary.
#[test]
fn dedup_is_denied_across_checkpoints() {
    let manager = manager();
    assert!(queue_new_item(&manager, "key1"));
    assert!(queue_new_item(&manager, "key2"));

    let first_id = manager.open_checkpoint_id();
    let second_id = manager.create_new_checkpoint();
    assert_ne!(first_id, second_id);
    assert_eq!(manager.last_closed_checkpoint_id(), first_id);
    assert_eq!(manager.num_open_items(), 0);

    assert!(queue_new_item(&manager, "key1"));
    assert!(queue_new_item(&manager, "key2"));
    assert_eq!(manager.num_checkpoints(), 2);
    assert_eq!(manager.num_open_items(), 2);
    assert_eq!(manager.num_items_for_cursor(PERSISTENCE_CURSOR).unwrap(), 4);

    let (range, items) = manager.get_all_items_for_cursor(PERSISTENCE_CURSOR).unwrap();
    assert_eq!(range.start, 0);
    assert_eq!(range.end, 1004);
    assert_eq!(
        ops_of(&items),
        vec![
            "checkpoint_start",
            "mutation",
            "mutation",
            "checkpoint_end",
            "checkpoint_start",
            "mutation",
            "mutation",
        ]
    );
}

#[test]
fn create_new_checkpoint_is_a_noop_on_an_empty_checkpoint() {
    let manager = manager();
    let id = manager.open_checkpoint_id();
    assert_eq!(manager.create_new_checkpoint(), id);
    assert_eq!(manager.num_checkpoints(), 1);
}

#[test]
fn closed_checkpoint_ends_with_the_flanking_seqno() {
    let manager = manager();
    for i in 0..3 {
        queue_new_item(&manager, &format!("key{i}"));
    }
    manager.create_new_checkpoint();

    let (_, items) = manager.get_all_items_for_cursor(PERSISTENCE_CURSOR).unwrap();
    let end = items
        .iter()
        .find(|i| i.op() == QueueOp::CheckpointEnd)
        .expect("closed checkpoint carries an end marker");
    assert_eq!(end.by_seqno(), 1003);
    let start = items
        .iter()
        .rev()
        .find(|i| i.op() == QueueOp::CheckpointStart)
        .expect("new open checkpoint carries a start marker");
    assert_eq!(start.by_seqno(), 1004);
}

// Replica id alignment: stale announcements are ignored, fresh ones close
// the open checkpoint and adopt the announced id.
#[test]
fn replica_checkpoint_id_alignment() {
    let manager = manager();
    queue_new_item(&manager, "key");

    assert_eq!(manager.check_and_add_new_checkpoint(1), 1);
    assert_eq!(manager.num_checkpoints(), 1);

    assert_eq!(manager.check_and_add_new_checkpoint(7), 7);
    assert_eq!(manager.num_checkpoints(), 2);
    assert_eq!(manager.open_checkpoint_id(), 7);
    assert_eq!(manager.last_closed_checkpoint_id(), 1);

    // Already seen: no-op.
    assert_eq!(manager.check_and_add_new_checkpoint(3), 7);
    assert_eq!(manager.num_checkpoints(), 2);
}

#[test]
fn time_independent_rotation_disabled_without_item_policy() {
    let config = CheckpointConfig::builder()
        .min_items_per_checkpoint(2)
        .item_based(false)
        .build();
    let manager = manager_with_config(config, 0);
    for i in 0..50 {
        queue_new_item(&manager, &format!("key{i}"));
    }
    assert_eq!(manager.num_checkpoints(), 1);
}
