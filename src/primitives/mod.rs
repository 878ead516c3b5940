//! Low-level building blocks of the storage core.
//!
//! Byte encodings, positioned file I/O, the page store, the write-ahead
//! journal and the locking primitives shared by the higher layers.

/// Byte-level encodings and buffer helpers.
pub mod bytes;

/// Lock manager, writer latch and data directory lock.
pub mod concurrency;

/// Positioned file I/O.
pub mod io;

/// Write-ahead journal.
pub mod journal;

/// Page store over the data file.
pub mod pager;
