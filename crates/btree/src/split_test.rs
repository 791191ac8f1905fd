//! Split-engine tests, including the root-split race required by the
//! "two splitters contend on the same root" scenario.
use ids::{
    get_cid_table,
    Timestamp,
};

use crate::{
    node::{
        self,
        NodeExt,
    },
    ops,
    split::{
        needs_split,
        split_cascade,
        SplitOutcome,
    },
    store::TreeStore,
    test_store::TestStore,
    thresholds::SplitThresholds,
};

fn small_thresholds() -> SplitThresholds {
    SplitThresholds {
        split_size: 4,
        split_size_bytes: 1 << 20,
        split_minsize: 2,
        max_levels: 16,
    }
}

async fn fill_root(store: &TestStore, table_cid: u64, n: u8) {
    let tid = store.new_tid();
    let ts = Timestamp::set_new();
    for i in 0..n {
        ops::insert(store, tid, table_cid, vec![b'a' + i], i as i64, ts, 16).await.unwrap();
    }
    store.commit_for_test(tid, ts).await.unwrap();
}

#[tokio::test]
async fn root_split_grows_tree_height_by_one() {
    let store = TestStore::new();
    let table_cid = get_cid_table(1, 1);
    let thresholds = small_thresholds();

    fill_root(&store, table_cid, 6).await;

    let read_tid = store.new_tid();
    let read_ts = Timestamp::set_new();
    let root = store
        .read_supervalue(read_tid, ids::Coid::new(table_cid, node::ROOT_OID), read_ts)
        .await
        .unwrap()
        .unwrap();
    assert!(needs_split(&root, &thresholds));

    let split_tid = store.new_tid();
    let split_ts = Timestamp::set_new();
    let outcome = split_cascade(&store, split_tid, table_cid, node::ROOT_OID, split_ts, &thresholds).await.unwrap();
    store.commit_for_test(split_tid, split_ts).await.unwrap();
    assert_eq!(outcome, SplitOutcome::Root);

    let after_ts = Timestamp::set_new();
    let new_root = store
        .read_supervalue(read_tid, ids::Coid::new(table_cid, node::ROOT_OID), after_ts)
        .await
        .unwrap()
        .unwrap();
    assert!(!new_root.is_leaf());
    assert_eq!(new_root.height(), 1);

    // Every inserted key is still reachable after the split.
    for i in 0..6u8 {
        let found = ops::lookup(&store, read_tid, table_cid, &[b'a' + i], after_ts, 16).await.unwrap();
        assert_eq!(found, Some(i as i64));
    }
}

/// Two concurrent splitters both observe the same oversized root and
/// race to split it. Only one should succeed; the loser's prepare must
/// be voted no by the conflict check over the shared write to oid 0, and
/// the tree must end up with exactly one extra level, not two.
#[tokio::test]
async fn two_concurrent_root_splitters_do_not_double_split() {
    let store = TestStore::new();
    let table_cid = get_cid_table(1, 2);
    let thresholds = small_thresholds();

    fill_root(&store, table_cid, 6).await;

    let read_tid = store.new_tid();
    let snapshot_ts = Timestamp::set_new();
    let root = store
        .read_supervalue(read_tid, ids::Coid::new(table_cid, node::ROOT_OID), snapshot_ts)
        .await
        .unwrap()
        .unwrap();

    let tid_a = store.new_tid();
    let tid_b = store.new_tid();
    crate::split::split_root(&store, tid_a, table_cid, root.clone(), &thresholds).await.unwrap();
    crate::split::split_root(&store, tid_b, table_cid, root, &thresholds).await.unwrap();

    let prepare_a = store.prepare(tid_a, snapshot_ts, true).await.unwrap();
    assert_eq!(prepare_a.vote, crate::store::Vote::Yes);
    store.commit(tid_a, prepare_a.mincommitts.add_epsilon(), crate::store::Outcome::Commit).await.unwrap();

    let prepare_b = store.prepare(tid_b, snapshot_ts, true).await.unwrap();
    assert_eq!(prepare_b.vote, crate::store::Vote::No, "loser must be rejected by the conflict check on the shared root write");

    let after_ts = Timestamp::set_new();
    let new_root = store
        .read_supervalue(read_tid, ids::Coid::new(table_cid, node::ROOT_OID), after_ts)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(new_root.height(), 1, "exactly one split, not two, should have taken effect");
}
