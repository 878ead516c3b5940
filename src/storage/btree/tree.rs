use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::node::{
    internal_sizes, leaf_entry_len, leaf_sizes, max_entry_len, split_point, Internal, Leaf, Node,
};
use super::query::IndexQuery;
use crate::primitives::journal::PageOp;
use crate::primitives::pager::{PageStore, WriteLog};
use crate::types::{ArbolError, PageId, Result};

/// Deepest tree accepted before a descent is treated as a cycle.
const MAX_DEPTH: usize = 64;

/// Shape and activity of one tree.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BTreeStats {
    /// Levels from the root to the leaves, root included.
    pub depth: usize,
    /// Leaf pages reachable from the root.
    pub leaf_pages: u64,
    /// Internal pages reachable from the root.
    pub internal_pages: u64,
    /// Entries in all leaves.
    pub entries: u64,
    /// Node splits since the tree was opened.
    pub splits: u64,
    /// Node merges since the tree was opened.
    pub merges: u64,
}

struct PathStep {
    id: PageId,
    node: Internal,
    idx: usize,
}

/// Paged B-tree with a fixed root page.
///
/// Keys and values are opaque bytes ordered bytewise. Every page change is
/// journaled through the [`WriteLog`] passed to the mutating calls.
pub struct BTree {
    store: Arc<PageStore>,
    root: PageId,
    name: &'static str,
    latch: RwLock<()>,
    splits: AtomicU64,
    merges: AtomicU64,
}

impl BTree {
    /// Allocates a root page holding an empty leaf.
    pub fn create(store: Arc<PageStore>, log: &mut dyn WriteLog, name: &'static str) -> Result<Self> {
        let root = store.allocate_page(log)?;
        let image = Node::empty_leaf().encode(root, store.page_size())?;
        store.write_page(log, root, PageOp::BTree, &image)?;
        debug!(tree = name, root = root.0, "btree.create");
        Ok(Self::open(store, root, name))
    }

    /// Opens the tree rooted at `root`.
    pub fn open(store: Arc<PageStore>, root: PageId, name: &'static str) -> Self {
        Self {
            store,
            root,
            name,
            latch: RwLock::new(()),
            splits: AtomicU64::new(0),
            merges: AtomicU64::new(0),
        }
    }

    /// Root page; never changes over the life of the tree.
    pub fn root(&self) -> PageId {
        self.root
    }

    /// Name used in diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let _latch = self.latch.read();
        let (_, _, leaf) = self.descend(key)?;
        Ok(leaf.search(key).ok().map(|idx| leaf.entries[idx].1.clone()))
    }

    /// Inserts `key`, overwriting an existing value.
    pub fn insert(&self, log: &mut dyn WriteLog, key: &[u8], value: &[u8]) -> Result<()> {
        let limit = max_entry_len(self.store.page_size());
        if leaf_entry_len(key, value) > limit {
            return Err(ArbolError::InvalidOwned(format!(
                "entry of {} bytes exceeds the {limit} byte limit of tree {}",
                key.len() + value.len(),
                self.name
            )));
        }
        log.prepare_write()?;
        let _latch = self.latch.write();
        let (path, leaf_id, mut leaf) = self.descend(key)?;
        match leaf.search(key) {
            Ok(idx) if leaf.entries[idx].1 == value => return Ok(()),
            Ok(idx) => leaf.entries[idx].1 = value.to_vec(),
            Err(idx) => leaf.entries.insert(idx, (key.to_vec(), value.to_vec())),
        }
        self.store_node(log, leaf_id, Node::Leaf(leaf), path)
    }

    /// Removes `key`, returning its value.
    pub fn remove(&self, log: &mut dyn WriteLog, key: &[u8]) -> Result<Option<Vec<u8>>> {
        log.prepare_write()?;
        let _latch = self.latch.write();
        self.remove_locked(log, key)
    }

    /// Removes every entry matching `query`, reporting each to `f`. Returns
    /// how many were removed.
    pub fn remove_range(
        &self,
        log: &mut dyn WriteLog,
        query: &IndexQuery,
        mut f: impl FnMut(&[u8], &[u8]),
    ) -> Result<usize> {
        log.prepare_write()?;
        let _latch = self.latch.write();
        let mut keys = Vec::new();
        self.query_locked(query, |key, _| {
            keys.push(key.to_vec());
            ControlFlow::Continue(())
        })?;
        for key in &keys {
            if let Some(value) = self.remove_locked(log, key)? {
                f(key, &value);
            }
        }
        trace!(tree = self.name, removed = keys.len(), "btree.remove_range");
        Ok(keys.len())
    }

    /// Visits matching entries in ascending key order until `f` breaks.
    pub fn query(
        &self,
        query: &IndexQuery,
        f: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        let _latch = self.latch.read();
        self.query_locked(query, f)
    }

    /// Smallest matching entry.
    pub fn first_in(&self, query: &IndexQuery) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut found = None;
        self.query(query, |key, value| {
            found = Some((key.to_vec(), value.to_vec()));
            ControlFlow::Break(())
        })?;
        Ok(found)
    }

    /// Largest matching entry, found by walking the leaf chain backwards.
    pub fn last_in(&self, query: &IndexQuery) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let _latch = self.latch.read();
        let mut leaf = match query.end_key() {
            Some(key) => self.descend(&key)?.2,
            None => self.descend_edge(false)?.1,
        };
        let mut hops = 0u64;
        loop {
            for (key, value) in leaf.entries.iter().rev() {
                if query.before_start(key) {
                    return Ok(None);
                }
                if query.matches(key) {
                    return Ok(Some((key.clone(), value.clone())));
                }
            }
            if leaf.prev.is_none() {
                return Ok(None);
            }
            hops += 1;
            self.check_hops(hops)?;
            leaf = self.read_leaf(leaf.prev)?;
        }
    }

    /// Walks the whole tree and reports its shape.
    pub fn stats(&self) -> Result<BTreeStats> {
        self.verify()
    }

    /// Checks key order, separator bounds, uniform leaf depth and the
    /// symmetry of the leaf chain.
    pub fn verify(&self) -> Result<BTreeStats> {
        let _latch = self.latch.read();
        let mut walk = Walk::default();
        self.verify_node(self.root, None, None, 1, &mut walk)?;
        for (pos, (id, prev, next)) in walk.leaves.iter().enumerate() {
            let want_prev = if pos == 0 { PageId::NONE } else { walk.leaves[pos - 1].0 };
            let want_next = walk
                .leaves
                .get(pos + 1)
                .map(|(id, _, _)| *id)
                .unwrap_or(PageId::NONE);
            if *prev != want_prev || *next != want_next {
                return Err(ArbolError::CorruptionOwned(format!(
                    "tree {}: leaf {} chain links ({}, {}) expected ({}, {})",
                    self.name, id, prev, next, want_prev, want_next
                )));
            }
        }
        Ok(BTreeStats {
            depth: walk.leaf_depth.unwrap_or(1),
            leaf_pages: walk.leaves.len() as u64,
            internal_pages: walk.internal_pages,
            entries: walk.entries,
            splits: self.splits.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
        })
    }

    fn remove_locked(&self, log: &mut dyn WriteLog, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (path, leaf_id, mut leaf) = self.descend(key)?;
        let Ok(idx) = leaf.search(key) else {
            return Ok(None);
        };
        let (_, old) = leaf.entries.remove(idx);
        self.rebalance(log, leaf_id, Node::Leaf(leaf), path)?;
        Ok(Some(old))
    }

    fn query_locked(
        &self,
        query: &IndexQuery,
        mut f: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        let mut leaf = match query.start_key() {
            Some(key) => self.descend(key)?.2,
            None => self.descend_edge(true)?.1,
        };
        let mut hops = 0u64;
        loop {
            for (key, value) in &leaf.entries {
                if query.past_end(key) {
                    return Ok(());
                }
                if query.matches(key) && f(key, value).is_break() {
                    return Ok(());
                }
            }
            if leaf.next.is_none() {
                return Ok(());
            }
            hops += 1;
            self.check_hops(hops)?;
            leaf = self.read_leaf(leaf.next)?;
        }
    }

    fn descend(&self, key: &[u8]) -> Result<(Vec<PathStep>, PageId, Leaf)> {
        let mut path = Vec::new();
        let mut id = self.root;
        loop {
            match self.read_node(id)? {
                Node::Leaf(leaf) => return Ok((path, id, leaf)),
                Node::Internal(node) => {
                    let idx = node.child_index(key);
                    let child = node.children[idx];
                    path.push(PathStep { id, node, idx });
                    if path.len() > MAX_DEPTH {
                        return Err(ArbolError::Corruption("btree deeper than any valid tree"));
                    }
                    id = child;
                }
            }
        }
    }

    fn descend_edge(&self, leftmost: bool) -> Result<(PageId, Leaf)> {
        let mut id = self.root;
        for _ in 0..=MAX_DEPTH {
            match self.read_node(id)? {
                Node::Leaf(leaf) => return Ok((id, leaf)),
                Node::Internal(node) => {
                    id = if leftmost {
                        node.children[0]
                    } else {
                        node.children[node.children.len() - 1]
                    };
                }
            }
        }
        Err(ArbolError::Corruption("btree deeper than any valid tree"))
    }

    fn check_hops(&self, hops: u64) -> Result<()> {
        if hops > self.store.page_count()? {
            return Err(ArbolError::Corruption("btree leaf chain has a cycle"));
        }
        Ok(())
    }

    fn read_node(&self, id: PageId) -> Result<Node> {
        self.store.with_page(id, Node::decode)?
    }

    fn read_leaf(&self, id: PageId) -> Result<Leaf> {
        match self.read_node(id)? {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Internal(_) => Err(ArbolError::Corruption("btree leaf chain reaches an internal page")),
        }
    }

    fn write_node(&self, log: &mut dyn WriteLog, id: PageId, node: &Node) -> Result<()> {
        let image = node.encode(id, self.store.page_size())?;
        self.store.write_page(log, id, PageOp::BTree, &image)
    }

    fn set_prev(&self, log: &mut dyn WriteLog, id: PageId, prev: PageId) -> Result<()> {
        let mut leaf = self.read_leaf(id)?;
        leaf.prev = prev;
        self.write_node(log, id, &Node::Leaf(leaf))
    }

    /// Writes `node` at `id`, splitting upward while it does not fit.
    fn store_node(
        &self,
        log: &mut dyn WriteLog,
        id: PageId,
        node: Node,
        mut path: Vec<PathStep>,
    ) -> Result<()> {
        if node.fits(self.store.page_size()) {
            return self.write_node(log, id, &node);
        }
        let Some(parent) = path.pop() else {
            return self.split_root(log, node);
        };
        let (mut left, sep, mut right) = split(node);
        let right_id = self.store.allocate_page(log)?;
        if let (Node::Leaf(l), Node::Leaf(r)) = (&mut left, &mut right) {
            r.prev = id;
            r.next = l.next;
            l.next = right_id;
            if !r.next.is_none() {
                self.set_prev(log, r.next, right_id)?;
            }
        }
        self.write_node(log, id, &left)?;
        self.write_node(log, right_id, &right)?;
        self.splits.fetch_add(1, Ordering::Relaxed);
        debug!(tree = self.name, page = id.0, sibling = right_id.0, "btree.split");
        let PathStep {
            id: parent_id,
            node: mut parent_node,
            idx,
        } = parent;
        parent_node.keys.insert(idx, sep);
        parent_node.children.insert(idx + 1, right_id);
        self.store_node(log, parent_id, Node::Internal(parent_node), path)
    }

    /// Moves the root's content into two new children, keeping the root page.
    fn split_root(&self, log: &mut dyn WriteLog, node: Node) -> Result<()> {
        let (mut left, sep, mut right) = split(node);
        let left_id = self.store.allocate_page(log)?;
        let right_id = self.store.allocate_page(log)?;
        if let (Node::Leaf(l), Node::Leaf(r)) = (&mut left, &mut right) {
            l.prev = PageId::NONE;
            l.next = right_id;
            r.prev = left_id;
            r.next = PageId::NONE;
        }
        self.write_node(log, left_id, &left)?;
        self.write_node(log, right_id, &right)?;
        let root = Node::Internal(Internal {
            keys: vec![sep],
            children: vec![left_id, right_id],
        });
        self.write_node(log, self.root, &root)?;
        self.splits.fetch_add(1, Ordering::Relaxed);
        debug!(tree = self.name, left = left_id.0, right = right_id.0, "btree.split_root");
        Ok(())
    }

    /// Writes `node` after a removal, merging it into a sibling when it falls
    /// below a quarter fill.
    fn rebalance(
        &self,
        log: &mut dyn WriteLog,
        id: PageId,
        node: Node,
        mut path: Vec<PathStep>,
    ) -> Result<()> {
        let page_size = self.store.page_size();
        let Some(parent) = path.pop() else {
            self.write_node(log, id, &node)?;
            return self.collapse_root(log);
        };
        if !node.underfull(page_size) {
            return self.write_node(log, id, &node);
        }
        let PathStep {
            id: parent_id,
            node: mut parent_node,
            idx,
        } = parent;
        if idx > 0 {
            let left_id = parent_node.children[idx - 1];
            let left = self.read_node(left_id)?;
            let merged = merge(left, node.clone(), parent_node.keys[idx - 1].clone())?;
            if merged.fits(page_size) {
                self.relink_after_merge(log, &merged, left_id)?;
                self.write_node(log, left_id, &merged)?;
                self.store.free_page(log, id)?;
                parent_node.keys.remove(idx - 1);
                parent_node.children.remove(idx);
                self.merges.fetch_add(1, Ordering::Relaxed);
                trace!(tree = self.name, page = id.0, into = left_id.0, "btree.merge_left");
                return self.rebalance(log, parent_id, Node::Internal(parent_node), path);
            }
        }
        if idx + 1 < parent_node.children.len() {
            let right_id = parent_node.children[idx + 1];
            let right = self.read_node(right_id)?;
            let merged = merge(node.clone(), right, parent_node.keys[idx].clone())?;
            if merged.fits(page_size) {
                self.relink_after_merge(log, &merged, id)?;
                self.write_node(log, id, &merged)?;
                self.store.free_page(log, right_id)?;
                parent_node.keys.remove(idx);
                parent_node.children.remove(idx + 1);
                self.merges.fetch_add(1, Ordering::Relaxed);
                trace!(tree = self.name, page = right_id.0, into = id.0, "btree.merge_right");
                return self.rebalance(log, parent_id, Node::Internal(parent_node), path);
            }
        }
        self.write_node(log, id, &node)
    }

    fn relink_after_merge(&self, log: &mut dyn WriteLog, merged: &Node, id: PageId) -> Result<()> {
        if let Node::Leaf(leaf) = merged {
            if !leaf.next.is_none() {
                self.set_prev(log, leaf.next, id)?;
            }
        }
        Ok(())
    }

    /// Pulls the single child of a key-less root into the root page.
    fn collapse_root(&self, log: &mut dyn WriteLog) -> Result<()> {
        loop {
            let child_id = match self.read_node(self.root)? {
                Node::Internal(root) if root.keys.is_empty() => root.children[0],
                _ => return Ok(()),
            };
            let mut child = self.read_node(child_id)?;
            if let Node::Leaf(leaf) = &mut child {
                leaf.prev = PageId::NONE;
                leaf.next = PageId::NONE;
            }
            self.write_node(log, self.root, &child)?;
            self.store.free_page(log, child_id)?;
            debug!(tree = self.name, child = child_id.0, "btree.collapse_root");
        }
    }

    fn verify_node(
        &self,
        id: PageId,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        depth: usize,
        walk: &mut Walk,
    ) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(ArbolError::Corruption("btree deeper than any valid tree"));
        }
        let node = self.read_node(id)?;
        let keys: Vec<&[u8]> = match &node {
            Node::Leaf(leaf) => leaf.entries.iter().map(|(k, _)| k.as_slice()).collect(),
            Node::Internal(internal) => internal.keys.iter().map(Vec::as_slice).collect(),
        };
        for pair in keys.windows(2) {
            if pair[0] >= pair[1] {
                return Err(ArbolError::CorruptionOwned(format!(
                    "tree {}: page {} keys out of order",
                    self.name, id
                )));
            }
        }
        for key in &keys {
            let below = lo.is_some_and(|lo| *key < lo);
            let above = hi.is_some_and(|hi| *key >= hi);
            if below || above {
                return Err(ArbolError::CorruptionOwned(format!(
                    "tree {}: page {} key outside separator bounds",
                    self.name, id
                )));
            }
        }
        match node {
            Node::Leaf(leaf) => {
                match walk.leaf_depth {
                    None => walk.leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        return Err(ArbolError::CorruptionOwned(format!(
                            "tree {}: leaf {} at depth {depth}, expected {expected}",
                            self.name, id
                        )));
                    }
                    Some(_) => {}
                }
                walk.entries += leaf.entries.len() as u64;
                walk.leaves.push((id, leaf.prev, leaf.next));
            }
            Node::Internal(internal) => {
                if internal.children.len() != internal.keys.len() + 1 {
                    return Err(ArbolError::Corruption("btree internal child count mismatch"));
                }
                walk.internal_pages += 1;
                for (idx, child) in internal.children.iter().enumerate() {
                    let child_lo = if idx == 0 { lo } else { Some(internal.keys[idx - 1].as_slice()) };
                    let child_hi = internal.keys.get(idx).map(Vec::as_slice).or(hi);
                    self.verify_node(*child, child_lo, child_hi, depth + 1, walk)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct Walk {
    leaves: Vec<(PageId, PageId, PageId)>,
    leaf_depth: Option<usize>,
    internal_pages: u64,
    entries: u64,
}

/// Splits an overfull node into a left half, a separator and a right half.
fn split(node: Node) -> (Node, Vec<u8>, Node) {
    match node {
        Node::Leaf(mut leaf) => {
            let at = split_point(leaf_sizes(&leaf));
            let right_entries = leaf.entries.split_off(at);
            let sep = right_entries[0].0.clone();
            let right = Leaf {
                prev: PageId::NONE,
                next: PageId::NONE,
                entries: right_entries,
            };
            (Node::Leaf(leaf), sep, Node::Leaf(right))
        }
        Node::Internal(mut internal) => {
            let upper = internal.keys.len().saturating_sub(2).max(1);
            let at = split_point(internal_sizes(&internal)).clamp(1, upper);
            let right_keys = internal.keys.split_off(at + 1);
            let right_children = internal.children.split_off(at + 1);
            let sep = internal.keys.pop().unwrap_or_default();
            let right = Internal {
                keys: right_keys,
                children: right_children,
            };
            (Node::Internal(internal), sep, Node::Internal(right))
        }
    }
}

/// Concatenates two adjacent siblings around their parent separator.
fn merge(left: Node, right: Node, sep: Vec<u8>) -> Result<Node> {
    match (left, right) {
        (Node::Leaf(mut left), Node::Leaf(right)) => {
            left.entries.extend(right.entries);
            left.next = right.next;
            Ok(Node::Leaf(left))
        }
        (Node::Internal(mut left), Node::Internal(right)) => {
            left.keys.push(sep);
            left.keys.extend(right.keys);
            left.children.extend(right.children);
            Ok(Node::Internal(left))
        }
        _ => Err(ArbolError::Corruption("btree siblings at different levels")),
    }
}
