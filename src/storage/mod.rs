//! Storage structures layered on the page store.
//!
//! Everything here mutates pages through a [`WriteLog`](crate::primitives::pager::WriteLog),
//! so each change is journaled on behalf of the calling transaction.

/// Paged B-tree over opaque byte keys.
///
/// Backs the collection and document catalog and the node index.
pub mod btree;

/// Collection and document catalog.
pub mod catalog;

/// Per-document node payload storage with overflow chains.
pub mod dom;

/// Transactions, checkpoints and restart recovery.
pub mod txn;

#[cfg(test)]
pub(crate) mod test_support;
