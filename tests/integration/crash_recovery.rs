#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::process::{abort, Command};
use std::time::Duration;

use arbol::db::{BrokerPool, Identity, StoreConfig, CLEAN_SHUTDOWN_MARKER};
use arbol::types::{NodeId, Result};
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(2);

fn payloads(doc: &str, count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| format!("<{doc} n=\"{i}\"/>").into_bytes())
        .collect()
}

fn read_all(pool: &BrokerPool, path: &str) -> Result<Option<Vec<Vec<u8>>>> {
    let broker = pool.get(Identity::system(), WAIT)?;
    let mut txn = broker.begin_transaction()?;
    let nodes = broker.read_document(&mut txn, path)?;
    txn.commit()?;
    Ok(nodes.map(|nodes| nodes.into_iter().map(|(_, data)| data).collect()))
}

fn store(pool: &BrokerPool, path: &str, nodes: &[Vec<u8>]) -> Result<()> {
    let broker = pool.get(Identity::system(), WAIT)?;
    let mut txn = broker.begin_transaction()?;
    broker.store_document(&mut txn, path, nodes)?;
    txn.commit()
}

fn crash(pool: BrokerPool) -> Result<()> {
    pool.set_force_corruption(true);
    pool.shutdown()
}

#[test]
fn committed_documents_survive_a_crash() -> Result<()> {
    let dir = tempdir()?;
    let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
    {
        let broker = pool.get(Identity::system(), WAIT)?;
        let mut txn = broker.begin_transaction()?;
        broker.create_collection(&mut txn, "/db/library/books")?;
        txn.commit()?;
    }
    store(&pool, "/db/library/books/a.xml", &payloads("a", 40))?;
    store(&pool, "/db/library/books/b.xml", &payloads("b", 3))?;
    crash(pool)?;
    assert!(!dir.path().join(CLEAN_SHUTDOWN_MARKER).exists());

    let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
    let report = pool.store().recovery_report().cloned();
    assert!(report.is_some(), "crash must trigger recovery");
    assert!(report.map(|r| r.losers.is_empty()).unwrap_or(false));
    assert_eq!(read_all(&pool, "/db/library/books/a.xml")?, Some(payloads("a", 40)));
    assert_eq!(read_all(&pool, "/db/library/books/b.xml")?, Some(payloads("b", 3)));
    pool.shutdown()?;
    assert!(dir.path().join(CLEAN_SHUTDOWN_MARKER).exists());
    Ok(())
}

#[test]
fn unfinished_transaction_is_rolled_back() -> Result<()> {
    let dir = tempdir()?;
    let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
    store(&pool, "/db/keep.xml", &payloads("keep", 5))?;
    {
        let broker = pool.get(Identity::system(), WAIT)?;
        let mut txn = broker.begin_transaction()?;
        broker.store_document(&mut txn, "/db/keep.xml", &payloads("changed", 9))?;
        broker.store_document(&mut txn, "/db/lost.xml", &payloads("lost", 2))?;
        // Make the loser's writes reach the journal, then stop before commit.
        pool.journal().flush(true, true)?;
        std::mem::forget(txn);
    }
    crash(pool)?;

    let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
    let losers = pool
        .store()
        .recovery_report()
        .map(|r| r.losers.len())
        .unwrap_or(0);
    assert_eq!(losers, 1);
    assert_eq!(read_all(&pool, "/db/keep.xml")?, Some(payloads("keep", 5)));
    assert_eq!(read_all(&pool, "/db/lost.xml")?, None);
    Ok(())
}

#[test]
fn replaced_document_keeps_last_committed_version() -> Result<()> {
    let dir = tempdir()?;
    let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
    store(&pool, "/db/doc.xml", &payloads("v1", 4))?;
    store(&pool, "/db/doc.xml", &payloads("v2", 7))?;
    {
        let broker = pool.get(Identity::system(), WAIT)?;
        let mut txn = broker.begin_transaction()?;
        broker.store_document(&mut txn, "/db/doc.xml", &payloads("v3", 2))?;
        pool.journal().flush(true, true)?;
        std::mem::forget(txn);
    }
    crash(pool)?;

    let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
    assert_eq!(read_all(&pool, "/db/doc.xml")?, Some(payloads("v2", 7)));
    let broker = pool.get(Identity::system(), WAIT)?;
    let mut txn = broker.begin_transaction()?;
    let doc = broker.get_document(&mut txn, "/db/doc.xml")?;
    assert_eq!(doc.map(|d| d.record.next_node), Some(8));
    txn.commit()?;
    Ok(())
}

#[test]
fn recovery_survives_a_second_crash() -> Result<()> {
    let dir = tempdir()?;
    let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
    store(&pool, "/db/x.xml", &payloads("x", 12))?;
    crash(pool)?;

    // Crash again right after recovery.
    let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
    assert!(pool.store().recovery_report().is_some());
    crash(pool)?;

    let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
    assert_eq!(read_all(&pool, "/db/x.xml")?, Some(payloads("x", 12)));
    store(&pool, "/db/y.xml", &payloads("y", 1))?;
    pool.shutdown()?;

    let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
    assert!(pool.store().recovery_report().is_none());
    assert_eq!(read_all(&pool, "/db/y.xml")?, Some(payloads("y", 1)));
    Ok(())
}

#[test]
fn large_nodes_survive_a_crash() -> Result<()> {
    let dir = tempdir()?;
    let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
    let big: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    store(&pool, "/db/big.xml", &[big.clone(), b"<tail/>".to_vec()])?;
    {
        let broker = pool.get(Identity::system(), WAIT)?;
        let mut txn = broker.begin_transaction()?;
        broker.extend_node(&mut txn, "/db/big.xml", NodeId(2), b"<more/>")?;
        txn.commit()?;
    }
    crash(pool)?;

    let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
    assert_eq!(
        read_all(&pool, "/db/big.xml")?,
        Some(vec![big, b"<tail/><more/>".to_vec()])
    );
    Ok(())
}

const CRASH_DIR_ENV: &str = "ARBOL_CRASH_DIR";

#[test]
fn killed_process_keeps_committed_work() -> Result<()> {
    let dir = tempdir()?;
    let data: PathBuf = dir.path().join("data");

    // Re-run this binary in a mode that commits once and then aborts.
    let status = Command::new(std::env::current_exe()?)
        .env(CRASH_DIR_ENV, &data)
        .arg("--ignored")
        .arg("--exact")
        .arg("crash_child_abort_after_commit")
        .status()?;
    assert!(!status.success(), "child should abort");

    let pool = BrokerPool::open(&data, StoreConfig::testing())?;
    assert!(pool.store().recovery_report().is_some());
    assert_eq!(read_all(&pool, "/db/kill/a.xml")?, Some(payloads("kill", 6)));
    Ok(())
}

#[test]
#[ignore]
fn crash_child_abort_after_commit() -> Result<()> {
    let Ok(path) = std::env::var(CRASH_DIR_ENV) else {
        return Ok(());
    };
    child(Path::new(&path))
}

fn child(dir: &Path) -> Result<()> {
    let pool = BrokerPool::open(dir, StoreConfig::testing())?;
    let broker = pool.get(Identity::system(), WAIT)?;
    let mut txn = broker.begin_transaction()?;
    broker.create_collection(&mut txn, "/db/kill")?;
    broker.store_document(&mut txn, "/db/kill/a.xml", &payloads("kill", 6))?;
    txn.commit()?;
    abort();
}
