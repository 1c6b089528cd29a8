mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use tidemark::engine::{
    Bucket, BucketEngine, EngineCode, EngineContext, EngineOutcome, KvStore, MemoryKvStore,
    StoreOp,
};
use tidemark::item::DocKey;
use tidemark::engine::Flusher;
use tidemark::server::CookieHandle;

fn ctx() -> EngineContext {
    EngineContext {
        cookie: CookieHandle::default(),
    }
}

fn store_ok(bucket: &Bucket, op: StoreOp, key: &str, value: &str) -> (u64, u64) {
    match bucket.store(
        &ctx(),
        op,
        0,
        DocKey::default_collection(key.to_string()),
        Bytes::from(value.to_string()),
        0,
    ) {
        EngineOutcome::Done(response) => {
            assert_eq!(response.code, EngineCode::Success);
            (response.cas, response.seqno)
        }
        EngineOutcome::EWouldBlock => panic!("memory bucket never suspends"),
    }
}

#[tokio::test]
async fn flusher_projects_last_writer_wins() {
    let bucket = Arc::new(Bucket::new("default", 1, small_config()));
    let store = Arc::new(MemoryKvStore::new());
    let flusher = Flusher::new(
        Arc::clone(&bucket),
        Arc::clone(&store) as Arc<dyn KvStore>,
        Duration::from_millis(10),
    );

    store_ok(&bucket, StoreOp::Set, "a", "1");
    store_ok(&bucket, StoreOp::Set, "b", "1");
    store_ok(&bucket, StoreOp::Set, "a", "2"); // dedupes in the open checkpoint
    assert!(matches!(
        bucket.remove(&ctx(), 0, &DocKey::default_collection("b"), 0),
        EngineOutcome::Done(r) if r.code == EngineCode::Success
    ));

    let flushed = flusher.flush_once().await.unwrap();
    assert_eq!(flushed, 2, "a (deduped) and the tombstone for b");

    let live = store.live_documents(0);
    assert_eq!(live.len(), 1);
    assert_eq!(live[&DocKey::default_collection("a")], Bytes::from("2"));

    // A second pass with nothing new flushes nothing.
    assert_eq!(flusher.flush_once().await.unwrap(), 0);
}

// P6 over a longer interleaving: the persisted projection equals the
// bucket's logical state.
#[tokio::test]
async fn persisted_projection_matches_bucket_state() {
    let bucket = Arc::new(Bucket::new("default", 1, small_config()));
    let store = Arc::new(MemoryKvStore::new());
    let flusher = Flusher::new(
        Arc::clone(&bucket),
        Arc::clone(&store) as Arc<dyn KvStore>,
        Duration::from_millis(10),
    );

    for round in 0..5 {
        for key in 0..8 {
            store_ok(
                &bucket,
                StoreOp::Set,
                &format!("key{key}"),
                &format!("round{round}"),
            );
        }
        // Interleave flushes with writes so items cross checkpoints.
        flusher.flush_once().await.unwrap();
    }
    bucket.remove(&ctx(), 0, &DocKey::default_collection("key3"), 0);
    flusher.flush_once().await.unwrap();

    let live = store.live_documents(0);
    assert_eq!(live.len(), 7);
    for key in (0..8).filter(|k| *k != 3) {
        assert_eq!(
            live[&DocKey::default_collection(format!("key{key}"))],
            Bytes::from("round4"),
        );
    }
}

#[tokio::test]
async fn warmup_restores_table_and_sequencing() {
    let store = Arc::new(MemoryKvStore::new());
    let high_seqno = {
        let bucket = Arc::new(Bucket::new("default", 1, small_config()));
        let flusher = Flusher::new(
            Arc::clone(&bucket),
            Arc::clone(&store) as Arc<dyn KvStore>,
            Duration::from_millis(10),
        );
        store_ok(&bucket, StoreOp::Set, "persistent", "before-restart");
        let (_, seqno) = store_ok(&bucket, StoreOp::Set, "other", "x");
        flusher.flush_once().await.unwrap();
        seqno
    };

    let revived = Bucket::warmup("default", 1, small_config(), store.as_ref())
        .await
        .unwrap();

    // Reads come straight back from the replayed table.
    match revived.get(&ctx(), 0, &DocKey::default_collection("persistent")) {
        EngineOutcome::Done(response) => {
            assert_eq!(response.code, EngineCode::Success);
            assert_eq!(response.value, Bytes::from("before-restart"));
        }
        EngineOutcome::EWouldBlock => panic!("memory bucket never suspends"),
    }

    // New mutations continue the sequence past the persisted high seqno.
    let (_, seqno) = store_ok(&revived, StoreOp::Set, "fresh", "after-restart");
    assert!(seqno > high_seqno);
    let manager = revived.manager(0).unwrap();
    assert_eq!(manager.high_seqno(), seqno);
}

#[tokio::test]
async fn flush_marker_clears_the_persisted_partition() {
    use tidemark::checkpoint::{GenerateBySeqno, GenerateCas};
    use tidemark::item::Item;

    let bucket = Arc::new(Bucket::new("default", 1, small_config()));
    let store = Arc::new(MemoryKvStore::new());
    let flusher = Flusher::new(
        Arc::clone(&bucket),
        Arc::clone(&store) as Arc<dyn KvStore>,
        Duration::from_millis(10),
    );

    store_ok(&bucket, StoreOp::Set, "doomed", "x");
    flusher.flush_once().await.unwrap();
    assert_eq!(store.persisted_count(0), 1);

    let manager = bucket.manager(0).unwrap();
    manager
        .queue_dirty(
            Item::flush_marker(0),
            GenerateBySeqno::Yes,
            GenerateCas::Yes,
        )
        .unwrap();
    flusher.flush_once().await.unwrap();
    assert_eq!(store.persisted_count(0), 0);
    assert!(store.live_documents(0).is_empty());
}

#[test]
fn store_semantics_follow_the_operation_family() {
    let bucket = Bucket::new("default", 1, small_config());

    // ADD on a fresh key succeeds, on an existing key conflicts.
    store_ok(&bucket, StoreOp::Add, "doc", "v1");
    assert!(matches!(
        bucket.store(&ctx(), StoreOp::Add, 0, DocKey::default_collection("doc"), Bytes::from("v2"), 0),
        EngineOutcome::Done(r) if r.code == EngineCode::KeyEexists
    ));

    // REPLACE requires an existing key.
    assert!(matches!(
        bucket.store(&ctx(), StoreOp::Replace, 0, DocKey::default_collection("ghost"), Bytes::from("v"), 0),
        EngineOutcome::Done(r) if r.code == EngineCode::KeyEnoent
    ));

    // CAS mismatch is KeyEexists; matching CAS succeeds.
    let (cas, _) = store_ok(&bucket, StoreOp::Set, "doc", "v2");
    assert!(matches!(
        bucket.store(&ctx(), StoreOp::Set, 0, DocKey::default_collection("doc"), Bytes::from("v3"), cas + 1),
        EngineOutcome::Done(r) if r.code == EngineCode::KeyEexists
    ));
    match bucket.store(
        &ctx(),
        StoreOp::Set,
        0,
        DocKey::default_collection("doc"),
        Bytes::from("v3"),
        cas,
    ) {
        EngineOutcome::Done(response) => assert_eq!(response.code, EngineCode::Success),
        EngineOutcome::EWouldBlock => panic!("memory bucket never suspends"),
    }

    // Unknown partitions are rejected.
    assert!(matches!(
        bucket.get(&ctx(), 9, &DocKey::default_collection("doc")),
        EngineOutcome::Done(r) if r.code == EngineCode::NotMyPartition
    ));
}
