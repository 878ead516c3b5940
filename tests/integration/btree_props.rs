#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::ops::ControlFlow;

use arbol::db::{Store, StoreConfig};
use arbol::storage::btree::{BTree, IndexQuery};
use arbol::types::Result;
use proptest::prelude::*;
use tempfile::tempdir;

#[derive(Clone, Debug)]
enum Op {
    Insert(u16, Vec<u8>),
    Remove(u16),
}

#[derive(Clone, Debug)]
struct Batch {
    ops: Vec<Op>,
    commit: bool,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u16..600, prop::collection::vec(any::<u8>(), 0..120))
            .prop_map(|(k, v)| Op::Insert(k, v)),
        1 => (0u16..600).prop_map(Op::Remove),
    ]
}

fn batch_strategy() -> impl Strategy<Value = Batch> {
    (prop::collection::vec(op_strategy(), 1..80), any::<bool>())
        .prop_map(|(ops, commit)| Batch { ops, commit })
}

fn key(k: u16) -> Vec<u8> {
    // Shared prefix pushes separators past the first byte.
    let mut out = b"node/".to_vec();
    out.extend_from_slice(&k.to_be_bytes());
    out
}

fn contents(tree: &BTree) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    let mut out = BTreeMap::new();
    tree.query(&IndexQuery::All, |k, v| {
        out.insert(k.to_vec(), v.to_vec());
        ControlFlow::Continue(())
    })?;
    Ok(out)
}

fn run_batches(batches: &[Batch]) -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), &StoreConfig::testing())?;
    let mut txn = store.begin()?;
    let tree = BTree::create(store.pages().clone(), &mut txn, "props")?;
    txn.commit()?;
    let root = tree.root();

    let mut model = BTreeMap::new();
    for batch in batches {
        let mut txn = store.begin()?;
        let mut pending = model.clone();
        for op in &batch.ops {
            match op {
                Op::Insert(k, v) => {
                    tree.insert(&mut txn, &key(*k), v)?;
                    pending.insert(key(*k), v.clone());
                }
                Op::Remove(k) => {
                    let removed = tree.remove(&mut txn, &key(*k))?;
                    assert_eq!(removed, pending.remove(&key(*k)));
                }
            }
        }
        if batch.commit {
            txn.commit()?;
            model = pending;
        } else {
            txn.abort()?;
        }
        assert_eq!(contents(&tree)?, model);
        tree.verify()?;
    }
    drop(tree);
    store.close(false)?;
    drop(store);

    let store = Store::open(dir.path(), &StoreConfig::testing())?;
    let tree = BTree::open(store.pages().clone(), root, "props");
    assert_eq!(contents(&tree)?, model);
    let stats = tree.verify()?;
    assert_eq!(stats.entries, model.len() as u64);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 24, ..ProptestConfig::default() })]

    #[test]
    fn committed_batches_match_model(batches in prop::collection::vec(batch_strategy(), 1..8)) {
        run_batches(&batches).map_err(|err| TestCaseError::fail(err.to_string()))?;
    }
}

#[test]
fn range_queries_agree_with_model() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), &StoreConfig::testing())?;
    let mut txn = store.begin()?;
    let tree = BTree::create(store.pages().clone(), &mut txn, "ranges")?;
    for k in (0..1500u16).step_by(3) {
        tree.insert(&mut txn, &key(k), &k.to_le_bytes())?;
    }
    txn.commit()?;

    let lo = key(300);
    let hi = key(900);
    let mut seen = Vec::new();
    tree.query(&IndexQuery::Range(lo.clone(), hi.clone()), |k, _| {
        seen.push(k.to_vec());
        ControlFlow::Continue(())
    })?;
    let expected: Vec<Vec<u8>> = (300..900u16).step_by(3).map(key).collect();
    assert_eq!(seen, expected);

    let last = tree.last_in(&IndexQuery::Lt(hi))?;
    assert_eq!(last.map(|(k, _)| k), Some(key(897)));
    let first = tree.first_in(&IndexQuery::Gt(lo))?;
    assert_eq!(first.map(|(k, _)| k), Some(key(303)));

    let mut txn = store.begin()?;
    let removed = tree.remove_range(&mut txn, &IndexQuery::TruncRight(b"node/".to_vec()), |_, _| {})?;
    assert_eq!(removed, 500);
    txn.abort()?;
    assert_eq!(tree.verify()?.entries, 500);
    Ok(())
}
