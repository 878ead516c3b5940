#![forbid(unsafe_code)]

//! Paged B-tree with a fixed root page, used for the catalog and the node
//! index.

/// On-page node layout.
pub mod node;
mod query;
mod tree;

pub use query::IndexQuery;
pub use tree::{BTree, BTreeStats};
