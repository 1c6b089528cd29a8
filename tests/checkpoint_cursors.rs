mod common;

use common::*;
use tidemark::checkpoint::{CheckpointError, PERSISTENCE_CURSOR};
use tidemark::item::{DocKey, QueueOp};

const DCP_CURSOR: &str = "dcp-client-1";

#[test]
fn register_cursor_resolves_to_the_next_item() {
    let manager = small_manager();
    for i in 0..4 {
        queue_new_item(&manager, &format!("key{i}"));
    }
    let registration = manager.register_cursor(DCP_CURSOR, 1002, false).unwrap();
    assert_eq!(registration.seqno, 1003);
    assert!(!registration.backfill_required);

    let (_, items) = manager.get_all_items_for_cursor(DCP_CURSOR).unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].by_seqno(), 1003);
    assert_eq!(items[1].by_seqno(), 1004);
}

// S5 / MB-25056: a start seqno that was de-dup-elided resumes at the
// surviving successor without backfill.
#[test]
fn dedup_gap_does_not_require_backfill() {
    let manager = small_manager();
    assert!(queue_new_item(&manager, "key0"));
    for _ in 0..MIN_CHECKPOINT_ITEMS {
        assert!(!queue_new_item(&manager, "key0"));
    }
    for i in 1..MIN_CHECKPOINT_ITEMS {
        assert!(queue_new_item(&manager, &format!("key{i}")));
    }

    let registration = manager.register_cursor(DCP_CURSOR, 1005, false).unwrap();
    assert_eq!(registration.seqno, 1011);
    assert!(!registration.backfill_required);
}

#[test]
fn cursors_see_identical_streams() {
    let manager = small_manager();
    for i in 0..2 * MIN_CHECKPOINT_ITEMS {
        queue_new_item(&manager, &format!("key{i}"));
    }
    assert_eq!(manager.num_checkpoints(), 2);
    manager.register_cursor(DCP_CURSOR, 0, false).unwrap();

    let (p_range, p_items) = manager.get_all_items_for_cursor(PERSISTENCE_CURSOR).unwrap();
    let (d_range, d_items) = manager.get_all_items_for_cursor(DCP_CURSOR).unwrap();
    assert_eq!(p_items.len(), 2 * MIN_CHECKPOINT_ITEMS + 3);
    assert_eq!(p_range, d_range);
    assert_eq!(ops_of(&p_items), ops_of(&d_items));
}

#[test]
fn limited_drain_stops_at_the_checkpoint_boundary() {
    let manager = small_manager();
    for i in 0..2 * MIN_CHECKPOINT_ITEMS {
        queue_new_item(&manager, &format!("key{i}"));
    }
    let first_id = 1;

    let (range, items) = manager
        .get_items_for_cursor(PERSISTENCE_CURSOR, Some(1))
        .unwrap();
    assert_eq!(range.start, 0);
    assert_eq!(range.end, 1000 + MIN_CHECKPOINT_ITEMS as u64);
    assert_eq!(items.len(), MIN_CHECKPOINT_ITEMS + 2, "start + items + end");
    assert_eq!(
        manager.cursor_checkpoint_id(PERSISTENCE_CURSOR).unwrap(),
        first_id + 1,
        "cursor should have moved into the second checkpoint"
    );
}

// Cursor stepping across a checkpoint boundary, with the last-mutation
// flag observed at each step.
#[test]
fn next_item_walks_across_checkpoints() {
    let manager = manager();
    queue_new_item(&manager, "key1");
    queue_new_item(&manager, "key2");
    manager.create_new_checkpoint();
    assert_eq!(manager.num_items_for_cursor(PERSISTENCE_CURSOR).unwrap(), 2);

    let (item, last) = manager.next_item(PERSISTENCE_CURSOR).unwrap();
    assert_eq!(item.op(), QueueOp::CheckpointStart);
    assert!(!last);
    assert_eq!(manager.num_items_for_cursor(PERSISTENCE_CURSOR).unwrap(), 2);

    let (item, last) = manager.next_item(PERSISTENCE_CURSOR).unwrap();
    assert_eq!(item.op(), QueueOp::Mutation);
    assert!(!last);
    assert_eq!(manager.num_items_for_cursor(PERSISTENCE_CURSOR).unwrap(), 1);

    // Two more into the new open checkpoint.
    queue_new_item(&manager, "key1");
    queue_new_item(&manager, "key2");
    assert_eq!(manager.num_items_for_cursor(PERSISTENCE_CURSOR).unwrap(), 3);

    let (item, last) = manager.next_item(PERSISTENCE_CURSOR).unwrap();
    assert_eq!(item.op(), QueueOp::Mutation);
    assert!(last, "last mutation of the closed checkpoint");

    let (item, last) = manager.next_item(PERSISTENCE_CURSOR).unwrap();
    assert_eq!(item.op(), QueueOp::CheckpointEnd);
    assert!(last);

    let (item, last) = manager.next_item(PERSISTENCE_CURSOR).unwrap();
    assert_eq!(item.op(), QueueOp::CheckpointStart);
    assert!(!last);

    // Collapse the fully-consumed closed checkpoint once durable.
    manager.items_persisted();
    let (removed, created_new_open) = manager.remove_closed_unref_checkpoints();
    assert_eq!(removed, 2);
    assert!(!created_new_open);
    assert_eq!(manager.num_checkpoints(), 1);
    assert_eq!(manager.num_items_for_cursor(PERSISTENCE_CURSOR).unwrap(), 2);

    let (item, last) = manager.next_item(PERSISTENCE_CURSOR).unwrap();
    assert_eq!(item.op(), QueueOp::Mutation);
    assert!(!last);
    let (item, last) = manager.next_item(PERSISTENCE_CURSOR).unwrap();
    assert_eq!(item.op(), QueueOp::Mutation);
    assert!(last);
    assert_eq!(manager.num_items_for_cursor(PERSISTENCE_CURSOR).unwrap(), 0);

    // Caught up: the sentinel is returned and the cursor stays put.
    let (item, last) = manager.next_item(PERSISTENCE_CURSOR).unwrap();
    assert_eq!(item.op(), QueueOp::Empty);
    assert!(!last);
}

// P5: collapse recomputes every other cursor's remaining count.
#[test]
fn collapse_recounts_remaining_items_for_lagging_cursors() {
    let manager = small_manager();
    manager.register_cursor(DCP_CURSOR, 0, false).unwrap();

    for i in 0..MIN_CHECKPOINT_ITEMS {
        queue_new_item(&manager, &format!("key{i}"));
    }
    // Move the replication cursor through half the first checkpoint.
    for _ in 0..MIN_CHECKPOINT_ITEMS / 2 {
        manager.next_item(DCP_CURSOR).unwrap();
    }
    // Rotate and add a second batch.
    manager.create_new_checkpoint();
    for i in 0..MIN_CHECKPOINT_ITEMS {
        queue_new_item(&manager, &format!("keyB_{i}"));
    }

    // Persistence drains everything and acknowledges durability.
    manager.get_all_items_for_cursor(PERSISTENCE_CURSOR).unwrap();
    manager.items_persisted();

    // The replication cursor still pins the first checkpoint.
    let (removed, _) = manager.remove_closed_unref_checkpoints();
    assert_eq!(removed, 0);
    assert_eq!(manager.num_checkpoints(), 2);

    let before = manager.num_items_for_cursor(DCP_CURSOR).unwrap();
    // 10 - 4 mutations consumed (first nexts hit the start marker) plus
    // the second batch.
    assert_eq!(before, 6 + MIN_CHECKPOINT_ITEMS);

    // Drain the replication cursor past the first checkpoint; collapse
    // then drops it and the count is recomputed from the new position.
    let (_, items) = manager
        .get_items_for_cursor(DCP_CURSOR, Some(1))
        .unwrap();
    assert!(!items.is_empty());
    let (removed, _) = manager.remove_closed_unref_checkpoints();
    assert_eq!(removed, MIN_CHECKPOINT_ITEMS);
    assert_eq!(manager.num_checkpoints(), 1);
    assert_eq!(
        manager.num_items_for_cursor(DCP_CURSOR).unwrap(),
        MIN_CHECKPOINT_ITEMS
    );
}

// When every cursor has consumed the open checkpoint, collapse first
// rotates so the drained tail can be shed.
#[test]
fn collapse_rotates_a_fully_consumed_open_checkpoint() {
    let manager = small_manager();
    for i in 0..MIN_CHECKPOINT_ITEMS {
        queue_new_item(&manager, &format!("key{i}"));
    }
    manager.get_all_items_for_cursor(PERSISTENCE_CURSOR).unwrap();

    let open_before = manager.open_checkpoint_id();
    let (_, created_new_open) = manager.remove_closed_unref_checkpoints();
    assert!(created_new_open);
    assert_eq!(manager.open_checkpoint_id(), open_before + 1);
    assert_eq!(manager.num_items_for_cursor(PERSISTENCE_CURSOR).unwrap(), 0);

    let (_, items) = manager.get_all_items_for_cursor(PERSISTENCE_CURSOR).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].op(), QueueOp::CheckpointStart);
}

// De-dup when a cursor sits exactly on the earlier occurrence: both items
// survive so the cursor keeps its slot.
#[test]
fn dedup_keeps_both_when_a_cursor_is_on_the_old_item() {
    let manager = manager();
    queue_new_item(&manager, "key");
    // Advance onto the mutation itself.
    manager.next_item(PERSISTENCE_CURSOR).unwrap();
    let (item, _) = manager.next_item(PERSISTENCE_CURSOR).unwrap();
    assert_eq!(item.op(), QueueOp::Mutation);

    let expanded = queue_new_item(&manager, "key");
    assert!(expanded, "cursor-pinned items are kept, so the queue grows");
    assert_eq!(manager.num_items_for_cursor(PERSISTENCE_CURSOR).unwrap(), 1);

    let (_, items) = manager.get_all_items_for_cursor(PERSISTENCE_CURSOR).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].by_seqno(), 1002);
}

// De-dup with the cursor past the old slot: the survivor is re-observed
// exactly once.
#[test]
fn dedup_behind_a_cursor_redelivers_the_survivor() {
    let manager = manager();
    queue_new_item(&manager, "key");
    manager.queue_set_partition_state();
    let (_, items) = manager.get_all_items_for_cursor(PERSISTENCE_CURSOR).unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(manager.num_items_for_cursor(PERSISTENCE_CURSOR).unwrap(), 0);

    assert!(!queue_new_item(&manager, "key"));
    assert_eq!(manager.num_items_for_cursor(PERSISTENCE_CURSOR).unwrap(), 1);

    let (_, items) = manager.get_all_items_for_cursor(PERSISTENCE_CURSOR).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].key(), &DocKey::default_collection("key"));
    assert_eq!(items[0].by_seqno(), 1002);
}

// A duplicate queued while the persistence cursor still sits on the
// initial sentinel de-dupes normally.
#[test]
fn duplicate_with_cursor_on_initial_meta_item() {
    let manager = manager_with_config(Default::default(), 0);
    assert_eq!(manager.high_seqno(), 0);
    assert_eq!(manager.num_items(), 1);

    assert!(queue_new_item(&manager, "key"));
    assert!(!queue_new_item(&manager, "key"));
}

#[test]
fn replica_without_merge_keeps_every_version() {
    use tidemark::checkpoint::PartitionState;
    let manager = manager(); // enable_merge defaults to false
    manager.set_state(PartitionState::Replica);

    assert!(queue_new_item(&manager, "key"));
    assert!(queue_new_item(&manager, "key"), "merge denied on replicas");
    assert_eq!(manager.num_open_items(), 2);

    let (_, items) = manager.get_all_items_for_cursor(PERSISTENCE_CURSOR).unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items[1].by_seqno(), 1001);
    assert_eq!(items[2].by_seqno(), 1002);
}

#[test]
fn replica_with_merge_dedupes() {
    use tidemark::checkpoint::{CheckpointConfig, PartitionState};
    let config = CheckpointConfig::builder().enable_merge(true).build();
    let manager = manager_with_config(config, 1000);
    manager.set_state(PartitionState::Replica);

    assert!(queue_new_item(&manager, "key"));
    assert!(!queue_new_item(&manager, "key"));
    assert_eq!(manager.num_open_items(), 1);
}

#[test]
fn cursor_management_errors() {
    let manager = manager();
    assert!(matches!(
        manager.remove_cursor(PERSISTENCE_CURSOR),
        Err(CheckpointError::ReservedCursor)
    ));
    assert!(matches!(
        manager.register_cursor(PERSISTENCE_CURSOR, 0, true),
        Err(CheckpointError::InvalidArgument { .. })
    ));
    assert!(matches!(
        manager.next_item("missing"),
        Err(CheckpointError::UnknownCursor { .. })
    ));

    manager.register_cursor(DCP_CURSOR, 0, false).unwrap();
    assert_eq!(manager.num_cursors(), 2);
    assert!(manager.remove_cursor(DCP_CURSOR).unwrap());
    assert!(!manager.remove_cursor(DCP_CURSOR).unwrap());
    assert_eq!(manager.num_cursors(), 1);
}
