#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use arbol::db::{BrokerPool, Identity, JournalConfig, StoreConfig};
use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

/// Keeps the whole history in one journal file, so the listing starts at
/// the first transaction.
fn config() -> StoreConfig {
    let testing = StoreConfig::testing();
    StoreConfig {
        journal: JournalConfig {
            min_file_bytes: testing.journal.max_file_bytes,
            ..testing.journal.clone()
        },
        ..testing
    }
}

fn setup_store() -> (TempDir, PathBuf, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let data = dir.path().join("data");
    seed(&data).expect("seed store");
    let config = dir.path().join("arbol.toml");
    let text = self::config().to_toml_string().expect("render config");
    fs::write(&config, text).expect("write config");
    (dir, data, config)
}

fn seed(dir: &Path) -> arbol::types::Result<()> {
    let pool = BrokerPool::open(dir, config())?;
    let broker = pool.get(Identity::system(), Duration::from_secs(2))?;
    let mut txn = broker.begin_transaction()?;
    broker.create_collection(&mut txn, "/db/shelf")?;
    for i in 0..5 {
        let body = format!("<item n=\"{i}\"/>").into_bytes();
        broker.store_document(&mut txn, &format!("/db/shelf/{i}.xml"), &[body])?;
    }
    txn.commit()?;
    drop(broker);
    pool.shutdown()
}

fn stdout_json(args: &[&str], dir: &Path) -> Value {
    let output = cargo_bin_cmd!("arbol-inspect")
        .args(["--format", "json"])
        .args(args)
        .arg(dir)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn meta_reports_roots_and_counters() {
    let (_dir, data, _config) = setup_store();
    let json = stdout_json(&["meta"], &data);
    assert_eq!(json["page_size"], 1024);
    assert!(json["collections_root"].as_u64().unwrap_or(0) > 0);
    assert_eq!(json["next_collection_id"], 3);
    assert_eq!(json["next_doc_id"], 6);
    assert_eq!(json["salt"].as_str().map(str::len), Some(16));
}

#[test]
fn meta_text_output() {
    let (_dir, data, _config) = setup_store();
    let output = cargo_bin_cmd!("arbol-inspect")
        .arg("meta")
        .arg(&data)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&output);
    assert!(text.contains("page_size=1024"), "{text}");
}

#[test]
fn journal_summary_ends_at_a_checkpoint() {
    let (_dir, data, _config) = setup_store();
    let json = stdout_json(&["journal", "--summary"], &data);
    assert_eq!(json["torn_tail"], false);
    assert!(json["entries"].as_u64().unwrap_or(0) > 0);
    assert_eq!(json["checkpoint_lsn"], json["last_lsn"]);
    assert!(json["listed"].as_array().map(Vec::is_empty).unwrap_or(false));
}

#[test]
fn journal_listing_respects_limit() {
    let (_dir, data, _config) = setup_store();
    let json = stdout_json(&["journal", "--limit", "3"], &data);
    let listed = json["listed"].as_array().cloned().unwrap_or_default();
    assert_eq!(listed.len(), 3);
    assert!(listed[0].as_str().unwrap_or("").contains("START"));
}

#[test]
fn verify_checks_every_tree() {
    let (_dir, data, config) = setup_store();
    let output = cargo_bin_cmd!("arbol-inspect")
        .args(["--format", "json", "verify", "--config"])
        .arg(&config)
        .arg(&data)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["success"], true);
    assert_eq!(json["recovered"], false);
    let trees = json["trees"].as_array().cloned().unwrap_or_default();
    assert_eq!(trees.len(), 3);
    assert_eq!(trees[0]["name"], "collections");
    assert_eq!(trees[0]["entries"], 2);
    assert_eq!(trees[1]["entries"], 5);
}

#[test]
fn missing_store_fails() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("arbol-inspect")
        .arg("meta")
        .arg(dir.path().join("absent"))
        .assert()
        .failure();
}
