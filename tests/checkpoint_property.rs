mod common;

use common::*;
use proptest::prelude::*;
use rustc_hash::FxHashMap;
use tidemark::checkpoint::{GenerateBySeqno, GenerateCas, PERSISTENCE_CURSOR};
use tidemark::item::{DocKey, Item, QueueOp};

#[derive(Clone, Debug)]
enum Op {
    Set { key: u8, value: u16 },
    Delete { key: u8 },
    NewCheckpoint,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..16, any::<u16>()).prop_map(|(key, value)| Op::Set { key, value }),
        1 => (0u8..16).prop_map(|key| Op::Delete { key }),
        1 => Just(Op::NewCheckpoint),
    ]
}

proptest! {
    // P3/P6: for any operation sequence, draining the persistence cursor
    // and projecting last-writer-wins reproduces the model state, and the
    // emitted stream is strictly ordered (P1).
    #[test]
    fn drained_stream_projects_to_model_state(ops in proptest::collection::vec(op_strategy(), 1..120)) {
        let manager = manager();
        let mut model: FxHashMap<String, Option<u16>> = FxHashMap::default();

        for op in &ops {
            match op {
                Op::Set { key, value } => {
                    let name = format!("key{key}");
                    let item = Item::mutation(
                        DocKey::default_collection(name.clone()),
                        0,
                        0,
                        value.to_be_bytes().to_vec(),
                    );
                    manager.queue_dirty(item, GenerateBySeqno::Yes, GenerateCas::Yes).unwrap();
                    model.insert(name, Some(*value));
                }
                Op::Delete { key } => {
                    let name = format!("key{key}");
                    let item = Item::deletion(DocKey::default_collection(name.clone()), 0, 0);
                    manager.queue_dirty(item, GenerateBySeqno::Yes, GenerateCas::Yes).unwrap();
                    model.insert(name, None);
                }
                Op::NewCheckpoint => {
                    manager.create_new_checkpoint();
                }
            }
        }

        let (_, items) = manager.get_all_items_for_cursor(PERSISTENCE_CURSOR).unwrap();

        let mut last_seqno = 0u64;
        let mut last_cas = 0u64;
        let mut projected: FxHashMap<String, Option<u16>> = FxHashMap::default();
        for item in &items {
            match item.op() {
                QueueOp::Mutation => {
                    prop_assert!(item.by_seqno() > last_seqno);
                    prop_assert!(item.cas() > last_cas);
                    last_seqno = item.by_seqno();
                    last_cas = item.cas();
                    let value = u16::from_be_bytes([item.value()[0], item.value()[1]]);
                    projected.insert(item.key().to_string(), Some(value));
                }
                QueueOp::Deletion => {
                    prop_assert!(item.by_seqno() > last_seqno);
                    last_seqno = item.by_seqno();
                    projected.insert(item.key().to_string(), None);
                }
                _ => {}
            }
        }
        prop_assert_eq!(projected, model);
    }
}
