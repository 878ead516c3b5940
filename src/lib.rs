//! Transactional storage core for a native XML database.
//!
//! Pages live in a single page file behind a checksummed cache; every page
//! change is journaled before it can reach disk. On top sit a paged B-tree,
//! per-document node storage, the collection catalog, strict two-phase
//! locking and a broker pool that hands threads access to one open store.
//!
//! ```no_run
//! use std::time::Duration;
//! use arbol::db::{BrokerPool, Identity, StoreConfig};
//!
//! # fn main() -> arbol::types::Result<()> {
//! let pool = BrokerPool::open("/tmp/arbol-data", StoreConfig::default())?;
//! let broker = pool.get(Identity::guest(), Duration::from_secs(5))?;
//! let mut txn = broker.begin_transaction()?;
//! broker.create_collection(&mut txn, "/db/books")?;
//! broker.store_document(&mut txn, "/db/books/a.xml", &[b"<book/>".to_vec()])?;
//! txn.commit()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod db;
pub mod primitives;
pub mod storage;
pub mod types;

pub use db::{Broker, BrokerPool, Identity, StoreConfig};
pub use types::{ArbolError, Result};
