#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use arbol::db::{BrokerPool, Identity, Store, StoreConfig, JOURNAL_DIR_NAME};
use arbol::primitives::journal::{list_journal_files, JournalReader, LogRecord};
use arbol::types::{ArbolError, Result};
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(2);

fn last_journal_file(dir: &Path) -> Result<PathBuf> {
    list_journal_files(&dir.join(JOURNAL_DIR_NAME))?
        .pop()
        .map(|(_, path)| path)
        .ok_or(ArbolError::Invalid("no journal files"))
}

fn store_doc(pool: &BrokerPool, path: &str, body: &[u8]) -> Result<()> {
    let broker = pool.get(Identity::system(), WAIT)?;
    let mut txn = broker.begin_transaction()?;
    broker.store_document(&mut txn, path, &[body.to_vec()])?;
    txn.commit()
}

fn read_doc(pool: &BrokerPool, path: &str) -> Result<Option<Vec<u8>>> {
    let broker = pool.get(Identity::system(), WAIT)?;
    let mut txn = broker.begin_transaction()?;
    let nodes = broker.read_document(&mut txn, path)?;
    txn.commit()?;
    Ok(nodes.and_then(|nodes| nodes.into_iter().next().map(|(_, data)| data)))
}

fn crash_with(dir: &Path, docs: &[(&str, &[u8])]) -> Result<()> {
    let pool = BrokerPool::open(dir, StoreConfig::testing())?;
    for (path, body) in docs {
        store_doc(&pool, path, body)?;
    }
    pool.set_force_corruption(true);
    pool.shutdown()
}

#[test]
fn torn_tail_loses_only_the_last_commit() -> Result<()> {
    let dir = tempdir()?;
    crash_with(dir.path(), &[("/db/first.xml", b"<first/>"), ("/db/second.xml", b"<second/>")])?;

    // Cut into the last entry: the commit record of the second document.
    let path = last_journal_file(dir.path())?;
    let len = fs::metadata(&path)?.len();
    OpenOptions::new().write(true).open(&path)?.set_len(len - 3)?;

    let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
    let report = pool.store().recovery_report().cloned().unwrap_or_default();
    assert_eq!(report.losers.len(), 1);
    assert_eq!(read_doc(&pool, "/db/first.xml")?, Some(b"<first/>".to_vec()));
    assert_eq!(read_doc(&pool, "/db/second.xml")?, None);
    Ok(())
}

#[test]
fn damage_before_the_tail_is_fatal() -> Result<()> {
    let dir = tempdir()?;
    crash_with(dir.path(), &[("/db/a.xml", b"<a/>"), ("/db/b.xml", b"<b/>")])?;

    let path = last_journal_file(dir.path())?;
    let mut bytes = fs::read(&path)?;
    // Inside the first entry, well before the end of the file.
    let target = 40;
    assert!(bytes.len() > target * 4);
    bytes[target] ^= 0xFF;
    fs::write(&path, &bytes)?;

    match Store::open(dir.path(), &StoreConfig::testing()) {
        Err(err) => assert!(err.is_corruption(), "{err}"),
        Ok(_) => panic!("damaged journal must not open"),
    }
    Ok(())
}

#[test]
fn journal_lists_every_transaction_in_order() -> Result<()> {
    let dir = tempdir()?;
    crash_with(dir.path(), &[("/db/one.xml", b"<one/>"), ("/db/two.xml", b"<two/>")])?;

    let reader = JournalReader::open(&dir.path().join(JOURNAL_DIR_NAME))?;
    let mut commits = 0;
    let mut writes = 0;
    let mut previous = None;
    let summary = reader.scan(|entry| {
        if let Some(prev) = previous {
            assert!(entry.lsn > prev);
        }
        previous = Some(entry.lsn);
        match entry.record {
            LogRecord::Commit => commits += 1,
            LogRecord::PageWrite(_) => writes += 1,
            _ => {}
        }
        Ok(())
    })?;
    assert!(!summary.torn_tail);
    // Catalog creation plus the two stores.
    assert!(commits >= 3, "{commits}");
    assert!(writes > 0);
    Ok(())
}

#[test]
fn clean_shutdown_checkpoints_and_skips_recovery() -> Result<()> {
    let dir = tempdir()?;
    {
        let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
        store_doc(&pool, "/db/c.xml", b"<c/>")?;
        pool.shutdown()?;
    }
    let reader = JournalReader::open(&dir.path().join(JOURNAL_DIR_NAME))?;
    let mut last = None;
    reader.scan(|entry| {
        last = Some(entry.record.clone());
        Ok(())
    })?;
    assert!(matches!(last, Some(LogRecord::Checkpoint(_))));

    let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
    assert!(pool.store().recovery_report().is_none());
    assert_eq!(read_doc(&pool, "/db/c.xml")?, Some(b"<c/>".to_vec()));
    Ok(())
}
