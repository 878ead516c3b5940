#![allow(missing_docs)]

use std::time::Duration;

use arbol::db::{Broker, BrokerPool, Identity, StoreConfig};
use arbol::storage::txn::Txn;
use arbol::types::{ArbolError, NodeId, Result};
use tempfile::{tempdir, TempDir};

const WAIT: Duration = Duration::from_secs(2);

struct Fixture {
    pool: BrokerPool,
    _dir: TempDir,
}

impl Fixture {
    fn new() -> Result<Self> {
        let dir = tempdir()?;
        let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
        Ok(Self { pool, _dir: dir })
    }

    fn broker(&self) -> Result<Broker> {
        self.pool.get(Identity::system(), WAIT)
    }
}

fn committed<T>(broker: &Broker, f: impl FnOnce(&Broker, &mut Txn) -> Result<T>) -> Result<T> {
    let mut txn = broker.begin_transaction()?;
    match f(broker, &mut txn) {
        Ok(value) => {
            txn.commit()?;
            Ok(value)
        }
        Err(err) => {
            txn.abort()?;
            Err(err)
        }
    }
}

fn node(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

#[test]
fn nested_collections_are_listed_by_parent() -> Result<()> {
    let fx = Fixture::new()?;
    let broker = fx.broker()?;
    committed(&broker, |b, txn| {
        b.create_collection(txn, "/db/a/b/c")?;
        b.create_collection(txn, "/db/a/x")?;
        b.create_collection(txn, "/db/z")
    })?;
    let (root, a, nested) = committed(&broker, |b, txn| {
        Ok((
            b.list_collections(txn, "/db")?,
            b.list_collections(txn, "/db/a")?,
            b.get_collection(txn, "/db/a/b")?,
        ))
    })?;
    assert_eq!(root, vec!["/db/a".to_string(), "/db/z".to_string()]);
    assert_eq!(a, vec!["/db/a/b".to_string(), "/db/a/x".to_string()]);
    assert!(nested.is_some());

    let err = committed(&broker, |b, txn| b.create_collection(txn, "/db/a/b")).unwrap_err();
    assert!(matches!(err, ArbolError::AlreadyExists(_)), "{err}");
    Ok(())
}

#[test]
fn documents_store_read_and_replace() -> Result<()> {
    let fx = Fixture::new()?;
    let broker = fx.broker()?;
    let stored = committed(&broker, |b, txn| {
        b.create_collection(txn, "/db/books")?;
        b.store_document(txn, "/db/books/a.xml", &[node("<book>"), node("<title/>")])
    })?;
    assert_eq!(stored.path(), "/db/books/a.xml");
    assert_eq!(stored.record.nodes, 2);

    let replaced = committed(&broker, |b, txn| {
        b.store_document(txn, "/db/books/a.xml", &[node("<book2/>")])
    })?;
    assert_eq!(replaced.record.id, stored.record.id);
    let nodes = committed(&broker, |b, txn| b.read_document(txn, "/db/books/a.xml"))?;
    assert_eq!(nodes, Some(vec![(NodeId(1), node("<book2/>"))]));

    let missing = committed(&broker, |b, txn| b.store_document(txn, "/db/nope/a.xml", &[]))
        .unwrap_err();
    assert!(matches!(missing, ArbolError::NotFound(_)), "{missing}");
    Ok(())
}

#[test]
fn node_level_edits() -> Result<()> {
    let fx = Fixture::new()?;
    let broker = fx.broker()?;
    committed(&broker, |b, txn| {
        b.store_document(txn, "/db/n.xml", &[node("<r>"), node("text")])
            .map(|_| ())
    })?;
    let appended = committed(&broker, |b, txn| b.append_node(txn, "/db/n.xml", b"</r>"))?;
    assert_eq!(appended, NodeId(3));
    committed(&broker, |b, txn| b.extend_node(txn, "/db/n.xml", NodeId(2), b" more"))?;
    assert!(committed(&broker, |b, txn| b.remove_node(txn, "/db/n.xml", NodeId(1)))?);
    assert!(!committed(&broker, |b, txn| b.remove_node(txn, "/db/n.xml", NodeId(1)))?);

    let (two, doc) = committed(&broker, |b, txn| {
        Ok((
            b.read_node(txn, "/db/n.xml", NodeId(2))?,
            b.get_document(txn, "/db/n.xml")?,
        ))
    })?;
    assert_eq!(two, Some(node("text more")));
    let record = doc.map(|d| d.record);
    assert_eq!(record.as_ref().map(|r| r.nodes), Some(2));
    assert_eq!(record.map(|r| r.next_node), Some(4));
    Ok(())
}

#[test]
fn oversized_node_round_trips() -> Result<()> {
    let fx = Fixture::new()?;
    let broker = fx.broker()?;
    let big: Vec<u8> = (0..20_000u32).map(|i| (i * 7 % 256) as u8).collect();
    committed(&broker, |b, txn| {
        b.store_document(txn, "/db/big.xml", &[node("<a>"), big.clone(), node("</a>")])
            .map(|_| ())
    })?;
    let read = committed(&broker, |b, txn| b.read_node(txn, "/db/big.xml", NodeId(2)))?;
    assert_eq!(read.as_deref(), Some(big.as_slice()));
    committed(&broker, |b, txn| b.remove_document(txn, "/db/big.xml").map(|_| ()))?;
    let gone = committed(&broker, |b, txn| b.read_node(txn, "/db/big.xml", NodeId(2)))?;
    assert_eq!(gone, None);
    fx.pool.store().catalog().nodes().index().verify()?;
    Ok(())
}

#[test]
fn move_and_copy_documents() -> Result<()> {
    let fx = Fixture::new()?;
    let broker = fx.broker()?;
    committed(&broker, |b, txn| {
        b.create_collection(txn, "/db/src")?;
        b.create_collection(txn, "/db/dst")?;
        b.store_document(txn, "/db/src/d.xml", &[node("<d/>"), node("<e/>")])
            .map(|_| ())
    })?;
    let copy = committed(&broker, |b, txn| b.copy_document(txn, "/db/src/d.xml", "/db/dst/c.xml"))?;
    let moved = committed(&broker, |b, txn| b.move_document(txn, "/db/src/d.xml", "/db/dst/d.xml"))?;
    assert_ne!(copy.record.id, moved.record.id);

    let (src, dst, copied) = committed(&broker, |b, txn| {
        Ok((
            b.list_documents(txn, "/db/src")?,
            b.list_documents(txn, "/db/dst")?,
            b.read_document(txn, "/db/dst/c.xml")?,
        ))
    })?;
    assert!(src.is_empty());
    assert_eq!(dst, vec!["c.xml".to_string(), "d.xml".to_string()]);
    assert_eq!(
        copied,
        Some(vec![(NodeId(1), node("<d/>")), (NodeId(2), node("<e/>"))])
    );

    let clash = committed(&broker, |b, txn| b.move_document(txn, "/db/dst/c.xml", "/db/dst/d.xml"))
        .unwrap_err();
    assert!(matches!(clash, ArbolError::AlreadyExists(_)), "{clash}");
    Ok(())
}

#[test]
fn move_and_remove_collections() -> Result<()> {
    let fx = Fixture::new()?;
    let broker = fx.broker()?;
    committed(&broker, |b, txn| {
        b.create_collection(txn, "/db/old/inner")?;
        b.store_document(txn, "/db/old/top.xml", &[node("<t/>")])?;
        b.store_document(txn, "/db/old/inner/deep.xml", &[node("<d/>")])
            .map(|_| ())
    })?;
    committed(&broker, |b, txn| b.move_collection(txn, "/db/old", "/db/new").map(|_| ()))?;
    let (old, deep) = committed(&broker, |b, txn| {
        Ok((
            b.get_collection(txn, "/db/old")?,
            b.read_document(txn, "/db/new/inner/deep.xml")?,
        ))
    })?;
    assert!(old.is_none());
    assert_eq!(deep, Some(vec![(NodeId(1), node("<d/>"))]));

    let into_self = committed(&broker, |b, txn| b.move_collection(txn, "/db/new", "/db/new/inner/x"))
        .unwrap_err();
    assert!(matches!(into_self, ArbolError::Invalid(_) | ArbolError::InvalidOwned(_)));

    let removed = committed(&broker, |b, txn| b.remove_collection(txn, "/db/new"))?;
    assert_eq!(removed, 2);
    let root = committed(&broker, |b, txn| b.list_collections(txn, "/db"))?;
    assert!(root.is_empty());

    let err = committed(&broker, |b, txn| b.remove_collection(txn, "/db")).unwrap_err();
    assert!(matches!(err, ArbolError::Invalid(_) | ArbolError::InvalidOwned(_)), "{err}");
    Ok(())
}

#[test]
fn copy_collection_duplicates_nested_subtree() -> Result<()> {
    let fx = Fixture::new()?;
    let broker = fx.broker()?;
    let original = committed(&broker, |b, txn| {
        b.create_collection(txn, "/db/src/inner/leaf")?;
        b.store_document(txn, "/db/src/top.xml", &[node("<t>"), node("</t>")])?;
        b.store_document(txn, "/db/src/inner/leaf/deep.xml", &[node("<d/>")])
    })?;
    let copy = committed(&broker, |b, txn| b.copy_collection(txn, "/db/src", "/db/dst"))?;
    assert_eq!(copy.path, "/db/dst");

    let (source, nested, deep, top) = committed(&broker, |b, txn| {
        Ok((
            b.get_collection(txn, "/db/src")?,
            b.list_collections(txn, "/db/dst/inner")?,
            b.get_document(txn, "/db/dst/inner/leaf/deep.xml")?,
            b.read_document(txn, "/db/dst/top.xml")?,
        ))
    })?;
    assert_ne!(source.map(|c| c.record.id), Some(copy.record.id));
    assert_eq!(nested, vec!["/db/dst/inner/leaf".to_string()]);
    assert_ne!(deep.map(|d| d.record.id), Some(original.record.id));
    assert_eq!(top, Some(vec![(NodeId(1), node("<t>")), (NodeId(2), node("</t>"))]));

    committed(&broker, |b, txn| b.remove_collection(txn, "/db/dst").map(|_| ()))?;
    let kept = committed(&broker, |b, txn| b.read_document(txn, "/db/src/inner/leaf/deep.xml"))?;
    assert_eq!(kept, Some(vec![(NodeId(1), node("<d/>"))]));
    Ok(())
}

#[test]
fn copy_collection_rejects_own_subtree_and_collisions() -> Result<()> {
    let fx = Fixture::new()?;
    let broker = fx.broker()?;
    committed(&broker, |b, txn| {
        b.create_collection(txn, "/db/a/b")?;
        b.create_collection(txn, "/db/taken")
    })?;
    let into_self = committed(&broker, |b, txn| b.copy_collection(txn, "/db/a", "/db/a/b/c"))
        .unwrap_err();
    assert!(
        matches!(into_self, ArbolError::Invalid(_) | ArbolError::InvalidOwned(_)),
        "{into_self}"
    );
    let onto_self = committed(&broker, |b, txn| b.copy_collection(txn, "/db/a", "/db/a"))
        .unwrap_err();
    assert!(matches!(onto_self, ArbolError::Invalid(_) | ArbolError::InvalidOwned(_)));
    let clash = committed(&broker, |b, txn| b.copy_collection(txn, "/db/a", "/db/taken"))
        .unwrap_err();
    assert!(matches!(clash, ArbolError::AlreadyExists(_)), "{clash}");
    let root = committed(&broker, |b, txn| b.copy_collection(txn, "/db", "/db/rootcopy"))
        .unwrap_err();
    assert!(matches!(root, ArbolError::Invalid(_) | ArbolError::InvalidOwned(_)));

    // Failed copies leave nothing behind.
    let children = committed(&broker, |b, txn| b.list_collections(txn, "/db/a/b"))?;
    assert!(children.is_empty());
    Ok(())
}

#[test]
fn copied_collection_survives_a_crash() -> Result<()> {
    let dir = tempdir()?;
    let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
    {
        let broker = pool.get(Identity::system(), WAIT)?;
        committed(&broker, |b, txn| {
            b.create_collection(txn, "/db/orig/sub")?;
            b.store_document(txn, "/db/orig/sub/x.xml", &[node("<x>"), node("</x>")])
                .map(|_| ())
        })?;
        committed(&broker, |b, txn| b.copy_collection(txn, "/db/orig", "/db/twin").map(|_| ()))?;
    }
    pool.set_force_corruption(true);
    pool.shutdown()?;

    let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
    assert!(pool.store().recovery_report().is_some());
    let broker = pool.get(Identity::system(), WAIT)?;
    let (twin, orig) = committed(&broker, |b, txn| {
        Ok((
            b.read_document(txn, "/db/twin/sub/x.xml")?,
            b.read_document(txn, "/db/orig/sub/x.xml")?,
        ))
    })?;
    assert_eq!(twin, orig);
    assert_eq!(twin.map(|n| n.len()), Some(2));
    drop(broker);
    pool.shutdown()
}

#[test]
fn abort_undoes_catalog_changes() -> Result<()> {
    let fx = Fixture::new()?;
    let broker = fx.broker()?;
    committed(&broker, |b, txn| {
        b.store_document(txn, "/db/kept.xml", &[node("<k/>")]).map(|_| ())
    })?;
    let mut txn = broker.begin_transaction()?;
    broker.create_collection(&mut txn, "/db/tmp")?;
    broker.store_document(&mut txn, "/db/tmp/t.xml", &[node("<t/>")])?;
    broker.remove_document(&mut txn, "/db/kept.xml")?;
    txn.abort()?;

    let (tmp, kept) = committed(&broker, |b, txn| {
        Ok((
            b.get_collection(txn, "/db/tmp")?,
            b.read_document(txn, "/db/kept.xml")?,
        ))
    })?;
    assert!(tmp.is_none());
    assert_eq!(kept, Some(vec![(NodeId(1), node("<k/>"))]));
    let catalog = fx.pool.store().catalog();
    catalog.collections_tree().verify()?;
    catalog.documents_tree().verify()?;
    Ok(())
}

#[test]
fn bad_paths_are_rejected() -> Result<()> {
    let fx = Fixture::new()?;
    let broker = fx.broker()?;
    for path in ["relative", "/other/x", "/db/a/../b"] {
        let err = committed(&broker, |b, txn| b.create_collection(txn, path)).unwrap_err();
        assert!(
            matches!(err, ArbolError::Invalid(_) | ArbolError::InvalidOwned(_)),
            "{path}: {err}"
        );
    }
    Ok(())
}
