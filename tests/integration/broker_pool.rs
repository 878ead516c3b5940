#![allow(missing_docs)]

use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use arbol::db::{BrokerPool, Identity, StoreConfig};
use arbol::types::{ArbolError, Result};
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(2);

fn pool_with(max_brokers: usize) -> Result<(tempfile::TempDir, Arc<BrokerPool>)> {
    let dir = tempdir()?;
    let mut config = StoreConfig::testing();
    config.pool.max_brokers = max_brokers;
    let pool = Arc::new(BrokerPool::open(dir.path(), config)?);
    Ok((dir, pool))
}

fn join<T>(handle: thread::JoinHandle<Result<T>>) -> Result<T> {
    handle
        .join()
        .map_err(|_| ArbolError::Invalid("worker thread panicked"))?
}

#[test]
fn threads_get_their_own_slot_and_identity() -> Result<()> {
    let (_dir, pool) = pool_with(4)?;
    let barrier = Arc::new(Barrier::new(3));
    let mut handles = Vec::new();
    for name in ["alice", "bob", "carol"] {
        let pool = Arc::clone(&pool);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<(usize, Option<Identity>)> {
            let broker = pool.get(Identity(name.to_string()), WAIT)?;
            // All three hold a broker at this point.
            barrier.wait();
            Ok((broker.slot(), broker.identity()))
        }));
    }
    let mut slots = Vec::new();
    for (handle, name) in handles.into_iter().zip(["alice", "bob", "carol"]) {
        let (slot, identity) = join(handle)?;
        assert_eq!(identity, Some(Identity(name.to_string())));
        slots.push(slot);
    }
    slots.sort_unstable();
    slots.dedup();
    assert_eq!(slots.len(), 3, "concurrent holders never share a slot");
    assert_eq!(pool.active(), 0);
    Ok(())
}

#[test]
fn nested_checkout_pushes_and_pops_identity() -> Result<()> {
    let (_dir, pool) = pool_with(2)?;
    let outer = pool.get(Identity("dba".into()), WAIT)?;
    {
        let inner = pool.get(Identity::system(), WAIT)?;
        assert_eq!(inner.slot(), outer.slot());
        assert_eq!(outer.identity(), Some(Identity::system()));
        assert_eq!(pool.active(), 1);
    }
    assert_eq!(outer.identity(), Some(Identity("dba".into())));
    drop(outer);
    assert_eq!(pool.active(), 0);
    Ok(())
}

#[test]
fn out_of_order_release_keeps_live_identities() -> Result<()> {
    let (_dir, pool) = pool_with(2)?;
    let outer = pool.get(Identity("outer".into()), WAIT)?;
    let middle = pool.get(Identity("middle".into()), WAIT)?;
    let inner = pool.get(Identity("inner".into()), WAIT)?;
    assert_eq!(inner.identity(), Some(Identity("inner".into())));

    // Dropping the middle checkout leaves the newest one in charge.
    drop(middle);
    assert_eq!(outer.identity(), Some(Identity("inner".into())));

    // Dropping the innermost one exposes the outer identity again.
    drop(inner);
    assert_eq!(outer.identity(), Some(Identity("outer".into())));

    let nested = pool.get(Identity("nested".into()), WAIT)?;
    drop(outer);
    assert_eq!(nested.identity(), Some(Identity("nested".into())));
    assert_eq!(pool.active(), 1);
    drop(nested);
    assert_eq!(pool.active(), 0);

    let fresh = pool.get(Identity::guest(), WAIT)?;
    assert_eq!(fresh.identity(), Some(Identity::guest()));
    Ok(())
}

#[test]
fn waiter_gets_slot_when_holder_releases() -> Result<()> {
    let (_dir, pool) = pool_with(1)?;
    let (taken_tx, taken_rx) = mpsc::channel();
    let holder = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || -> Result<()> {
            let broker = pool.get(Identity::guest(), WAIT)?;
            let _ = taken_tx.send(());
            thread::sleep(Duration::from_millis(150));
            broker.release();
            Ok(())
        })
    };
    let _ = taken_rx.recv_timeout(WAIT);
    let started = Instant::now();
    let broker = pool.get(Identity::system(), WAIT)?;
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(broker.identity(), Some(Identity::system()));
    drop(broker);
    join(holder)?;
    assert!(pool.stats().waits >= 1);
    Ok(())
}

#[test]
fn exhausted_pool_is_retryable() -> Result<()> {
    let (_dir, pool) = pool_with(1)?;
    let _held = pool.get(Identity::guest(), WAIT)?;
    let other = Arc::clone(&pool);
    let result = join(thread::spawn(move || -> Result<()> {
        other.get(Identity::guest(), Duration::from_millis(60))?;
        Ok(())
    }));
    match result {
        Err(err @ ArbolError::PoolExhausted(_)) => assert!(err.is_retryable()),
        other => panic!("expected PoolExhausted, got {other:?}"),
    }
    Ok(())
}

#[test]
fn shutdown_reclaims_leaked_brokers_after_timeout() -> Result<()> {
    let (dir, pool) = pool_with(2)?;
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let worker = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || -> Result<()> {
            let broker = pool.get(Identity::guest(), WAIT)?;
            // Holds the broker until the main thread is done.
            let _ = done_rx.recv_timeout(Duration::from_secs(5));
            drop(broker);
            Ok(())
        })
    };
    while pool.active() == 0 {
        thread::sleep(Duration::from_millis(5));
    }
    let started = Instant::now();
    pool.shutdown()?;
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert_eq!(pool.active(), 0);
    assert!(matches!(pool.get(Identity::guest(), WAIT), Err(ArbolError::ShutDown)));
    let _ = done_tx.send(());
    join(worker)?;
    assert!(dir.path().join(arbol::db::CLEAN_SHUTDOWN_MARKER).exists());
    Ok(())
}

#[test]
fn brokers_share_one_store() -> Result<()> {
    let (_dir, pool) = pool_with(4)?;
    let writer = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || -> Result<()> {
            let broker = pool.get(Identity::system(), WAIT)?;
            let mut txn = broker.begin_transaction()?;
            broker.store_document(&mut txn, "/db/shared.xml", &[b"<shared/>".to_vec()])?;
            txn.commit()
        })
    };
    join(writer)?;
    let broker = pool.get(Identity::guest(), WAIT)?;
    let mut txn = broker.begin_transaction()?;
    let nodes = broker.read_document(&mut txn, "/db/shared.xml")?;
    txn.commit()?;
    assert_eq!(nodes.map(|n| n.len()), Some(1));
    Ok(())
}
