#![allow(missing_docs)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arbol::db::{BrokerPool, Identity, StoreConfig};
use arbol::primitives::concurrency::{LockEventKind, LockManager, ResourceId};
use arbol::types::{ArbolError, LockMode, Result};
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(2);

fn join<T>(handle: thread::JoinHandle<Result<T>>) -> Result<T> {
    handle
        .join()
        .map_err(|_| ArbolError::Invalid("worker thread panicked"))?
}

#[test]
fn reader_times_out_behind_writer_and_retries() -> Result<()> {
    let dir = tempdir()?;
    let pool = Arc::new(BrokerPool::open(dir.path(), StoreConfig::testing())?);
    let (stored_tx, stored_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let writer = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || -> Result<()> {
            let broker = pool.get(Identity::system(), WAIT)?;
            let mut txn = broker.begin_transaction()?;
            broker.store_document(&mut txn, "/db/contended.xml", &[b"<a/>".to_vec()])?;
            let _ = stored_tx.send(());
            let _ = go_rx.recv_timeout(Duration::from_secs(5));
            txn.commit()
        })
    };
    let _ = stored_rx.recv_timeout(WAIT);

    let broker = pool.get(Identity::guest(), WAIT)?;
    let mut txn = broker.begin_transaction()?;
    let err = match broker.read_document(&mut txn, "/db/contended.xml") {
        Err(err) => err,
        Ok(found) => panic!("read should wait for the writer, got {found:?}"),
    };
    assert!(matches!(err, ArbolError::LockTimeout { .. }), "{err}");
    assert!(err.is_retryable());
    txn.abort()?;

    let _ = go_tx.send(());
    join(writer)?;

    let mut txn = broker.begin_transaction()?;
    let nodes = broker.read_document(&mut txn, "/db/contended.xml")?;
    txn.commit()?;
    assert_eq!(nodes.map(|n| n.len()), Some(1));
    Ok(())
}

#[test]
fn concurrent_writers_serialize() -> Result<()> {
    let dir = tempdir()?;
    let pool = Arc::new(BrokerPool::open(dir.path(), StoreConfig::testing())?);
    {
        let broker = pool.get(Identity::system(), WAIT)?;
        let mut txn = broker.begin_transaction()?;
        broker.create_collection(&mut txn, "/db/w")?;
        txn.commit()?;
    }
    let mut handles = Vec::new();
    for worker in 0..4 {
        let pool = Arc::clone(&pool);
        handles.push(thread::spawn(move || -> Result<()> {
            let broker = pool.get(Identity(format!("writer-{worker}")), WAIT)?;
            for i in 0..10 {
                let path = format!("/db/w/{worker}-{i}.xml");
                let body = format!("<doc w=\"{worker}\" i=\"{i}\"/>").into_bytes();
                let mut txn = broker.begin_transaction()?;
                broker.store_document(&mut txn, &path, &[body])?;
                txn.commit()?;
            }
            Ok(())
        }));
    }
    for handle in handles {
        join(handle)?;
    }
    let broker = pool.get(Identity::system(), WAIT)?;
    let mut txn = broker.begin_transaction()?;
    let names = broker.list_documents(&mut txn, "/db/w")?;
    txn.commit()?;
    assert_eq!(names.len(), 40);
    pool.store().catalog().documents_tree().verify()?;
    assert_eq!(pool.store().locks().table().outstanding(), 0);
    Ok(())
}

#[test]
fn pair_locks_in_opposite_order_never_deadlock() -> Result<()> {
    let locks = LockManager::new(Duration::from_millis(500), true);
    let a = ResourceId::Document("/db/a.xml".into());
    let b = ResourceId::Document("/db/b.xml".into());
    let mut handles = Vec::new();
    for flip in [false, true] {
        let locks = locks.clone();
        let (first, second) = if flip { (b.clone(), a.clone()) } else { (a.clone(), b.clone()) };
        handles.push(thread::spawn(move || -> Result<()> {
            for _ in 0..200 {
                let owner = locks.anonymous_owner();
                let guards = locks.lock_pair(
                    owner,
                    first.clone(),
                    second.clone(),
                    LockMode::Write,
                    locks.default_timeout(),
                )?;
                assert_eq!(guards.len(), 2);
            }
            Ok(())
        }));
    }
    for handle in handles {
        join(handle)?;
    }
    assert_eq!(locks.table().outstanding(), 0);
    assert_eq!(locks.table().snapshot().failed, 0);
    Ok(())
}

#[test]
fn transaction_holds_locks_until_it_ends() -> Result<()> {
    let dir = tempdir()?;
    let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
    let acquired = Arc::new(AtomicU64::new(0));
    {
        let acquired = Arc::clone(&acquired);
        pool.store().locks().table().add_listener(move |event| {
            if event.kind == LockEventKind::Acquired {
                acquired.fetch_add(1, Ordering::Relaxed);
            }
        });
    }
    let broker = pool.get(Identity::system(), WAIT)?;
    let mut txn = broker.begin_transaction()?;
    broker.create_collection(&mut txn, "/db/held")?;
    broker.store_document(&mut txn, "/db/held/doc.xml", &[b"<x/>".to_vec()])?;
    let locks = pool.store().locks();
    assert!(locks.table().outstanding() > 0);
    assert_eq!(
        locks.held_mode(txn.owner(), &ResourceId::Document("/db/held/doc.xml".into())),
        Some(LockMode::Write)
    );
    assert_eq!(
        locks.held_mode(txn.owner(), &ResourceId::Collection("/db".into())),
        Some(LockMode::Write)
    );
    txn.commit()?;
    assert_eq!(locks.table().outstanding(), 0);
    assert!(locks.locked_resources().is_empty());
    assert!(acquired.load(Ordering::Relaxed) >= 4);
    Ok(())
}

#[test]
fn move_locks_both_collections() -> Result<()> {
    let dir = tempdir()?;
    let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
    let broker = pool.get(Identity::system(), WAIT)?;
    let mut txn = broker.begin_transaction()?;
    broker.create_collection(&mut txn, "/db/from")?;
    broker.create_collection(&mut txn, "/db/to")?;
    broker.store_document(&mut txn, "/db/from/d.xml", &[b"<d/>".to_vec()])?;
    txn.commit()?;

    let mut txn = broker.begin_transaction()?;
    broker.move_document(&mut txn, "/db/from/d.xml", "/db/to/d.xml")?;
    let locks = pool.store().locks();
    for path in ["/db/from", "/db/to"] {
        assert_eq!(
            locks.held_mode(txn.owner(), &ResourceId::Collection(path.into())),
            Some(LockMode::Write),
            "{path}"
        );
    }
    for path in ["/db/from/d.xml", "/db/to/d.xml"] {
        assert_eq!(
            locks.held_mode(txn.owner(), &ResourceId::Document(path.into())),
            Some(LockMode::Write),
            "{path}"
        );
    }
    txn.commit()?;
    assert!(locks.locked_resources().is_empty());
    Ok(())
}
