use std::ops::Range;

use crate::primitives::bytes::buf::{get_u16, get_u64, set_u16, set_u64};
use crate::types::{
    page::{self, PageKind, PAGE_HDR_LEN},
    ArbolError, PageId, Result,
};

const NSLOTS: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 2;
const FREE_START: Range<usize> = PAGE_HDR_LEN + 2..PAGE_HDR_LEN + 4;
const PREV: Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 16;
const NEXT: Range<usize> = PAGE_HDR_LEN + 16..PAGE_HDR_LEN + 24;
const LEFTMOST: Range<usize> = PAGE_HDR_LEN + 24..PAGE_HDR_LEN + 32;

/// End of the node header; records start here.
pub const NODE_HDR_END: usize = PAGE_HDR_LEN + 32;

/// Slot directory entry: record offset and length.
pub const SLOT_ENTRY_LEN: usize = 4;

const LEAF_RECORD_HEADER_LEN: usize = 4;
const INTERNAL_RECORD_HEADER_LEN: usize = 10;

/// Bytes available for records and slots.
pub fn usable_space(page_size: usize) -> usize {
    page_size - NODE_HDR_END
}

/// Largest leaf entry (key, value and slot) a page of this size accepts.
pub fn max_entry_len(page_size: usize) -> usize {
    usable_space(page_size) / 4
}

/// Space one leaf entry occupies, slot included.
pub fn leaf_entry_len(key: &[u8], value: &[u8]) -> usize {
    LEAF_RECORD_HEADER_LEN + key.len() + value.len() + SLOT_ENTRY_LEN
}

fn internal_entry_len(key: &[u8]) -> usize {
    INTERNAL_RECORD_HEADER_LEN + key.len() + SLOT_ENTRY_LEN
}

/// Decoded B-tree page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Node {
    /// Ordered key/value pairs plus leaf chain links.
    Leaf(Leaf),
    /// Separators and children; `children.len() == keys.len() + 1`.
    Internal(Internal),
}

/// Leaf page contents.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Leaf {
    /// Previous leaf in key order.
    pub prev: PageId,
    /// Next leaf in key order.
    pub next: PageId,
    /// Entries in strictly increasing key order.
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Internal page contents.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Internal {
    /// Separator keys; `keys[i]` is the smallest key under `children[i + 1]`.
    pub keys: Vec<Vec<u8>>,
    /// Child pages.
    pub children: Vec<PageId>,
}

impl Leaf {
    /// Position of `key`, or where it would be inserted.
    pub fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.as_slice().cmp(key))
    }

    fn used(&self) -> usize {
        self.entries.iter().map(|(k, v)| leaf_entry_len(k, v)).sum()
    }
}

impl Internal {
    /// Index of the child whose subtree covers `key`.
    pub fn child_index(&self, key: &[u8]) -> usize {
        self.keys.partition_point(|sep| sep.as_slice() <= key)
    }

    fn used(&self) -> usize {
        self.keys.iter().map(|k| internal_entry_len(k)).sum()
    }
}

impl Node {
    /// Empty leaf with no siblings.
    pub fn empty_leaf() -> Self {
        Node::Leaf(Leaf::default())
    }

    /// Record and slot bytes in use.
    pub fn used(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.used(),
            Node::Internal(internal) => internal.used(),
        }
    }

    /// Whether the node fits a page of `page_size` bytes.
    pub fn fits(&self, page_size: usize) -> bool {
        self.used() <= usable_space(page_size)
    }

    /// Whether the node dropped below a quarter of the usable space.
    pub fn underfull(&self, page_size: usize) -> bool {
        self.used() < usable_space(page_size) / 4
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.entries.len(),
            Node::Internal(internal) => internal.keys.len(),
        }
    }

    /// Whether the node has no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parses a B-tree page.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let kind = page::page_kind(data)?;
        let nslots = get_u16(data, NSLOTS.start) as usize;
        let slot_base = data
            .len()
            .checked_sub(nslots * SLOT_ENTRY_LEN)
            .filter(|base| *base >= NODE_HDR_END)
            .ok_or(ArbolError::Corruption("btree slot directory overlaps header"))?;
        let record = |idx: usize| -> Result<&[u8]> {
            let slot = slot_base + idx * SLOT_ENTRY_LEN;
            let off = get_u16(data, slot) as usize;
            let len = get_u16(data, slot + 2) as usize;
            if off < NODE_HDR_END || off + len > slot_base {
                return Err(ArbolError::Corruption("btree record outside page"));
            }
            Ok(&data[off..off + len])
        };
        match kind {
            PageKind::BTreeLeaf => {
                let mut entries = Vec::with_capacity(nslots);
                for idx in 0..nslots {
                    let rec = record(idx)?;
                    if rec.len() < LEAF_RECORD_HEADER_LEN {
                        return Err(ArbolError::Corruption("btree leaf record truncated"));
                    }
                    let klen = get_u16(rec, 0) as usize;
                    let vlen = get_u16(rec, 2) as usize;
                    if LEAF_RECORD_HEADER_LEN + klen + vlen != rec.len() {
                        return Err(ArbolError::Corruption("btree leaf record length mismatch"));
                    }
                    let key = rec[LEAF_RECORD_HEADER_LEN..LEAF_RECORD_HEADER_LEN + klen].to_vec();
                    let value = rec[LEAF_RECORD_HEADER_LEN + klen..].to_vec();
                    entries.push((key, value));
                }
                Ok(Node::Leaf(Leaf {
                    prev: PageId(get_u64(data, PREV.start)),
                    next: PageId(get_u64(data, NEXT.start)),
                    entries,
                }))
            }
            PageKind::BTreeInternal => {
                let mut keys = Vec::with_capacity(nslots);
                let mut children = Vec::with_capacity(nslots + 1);
                children.push(PageId(get_u64(data, LEFTMOST.start)));
                for idx in 0..nslots {
                    let rec = record(idx)?;
                    if rec.len() < INTERNAL_RECORD_HEADER_LEN {
                        return Err(ArbolError::Corruption("btree internal record truncated"));
                    }
                    let klen = get_u16(rec, 0) as usize;
                    if INTERNAL_RECORD_HEADER_LEN + klen != rec.len() {
                        return Err(ArbolError::Corruption("btree internal record length mismatch"));
                    }
                    children.push(PageId(get_u64(rec, 2)));
                    keys.push(rec[INTERNAL_RECORD_HEADER_LEN..].to_vec());
                }
                Ok(Node::Internal(Internal { keys, children }))
            }
            _ => Err(ArbolError::Corruption("page is not a btree node")),
        }
    }

    /// Lays the node out as a full page image for page `id`.
    ///
    /// Records are packed from the header upward in key order and the slot
    /// directory sits at the end of the page.
    pub fn encode(&self, id: PageId, page_size: usize) -> Result<Vec<u8>> {
        if !self.fits(page_size) {
            return Err(ArbolError::Corruption("btree node overflows its page"));
        }
        let mut data = vec![0u8; page_size];
        let nslots = self.len();
        let slot_base = page_size - nslots * SLOT_ENTRY_LEN;
        let mut off = NODE_HDR_END;
        let mut put_record = |data: &mut [u8], idx: usize, parts: &[&[u8]]| {
            let start = off;
            for part in parts {
                data[off..off + part.len()].copy_from_slice(part);
                off += part.len();
            }
            let slot = slot_base + idx * SLOT_ENTRY_LEN;
            set_u16(data, slot, start as u16);
            set_u16(data, slot + 2, (off - start) as u16);
        };
        match self {
            Node::Leaf(leaf) => {
                page::format_page(&mut data, id, PageKind::BTreeLeaf)?;
                set_u64(&mut data, PREV.start, leaf.prev.0);
                set_u64(&mut data, NEXT.start, leaf.next.0);
                for (idx, (key, value)) in leaf.entries.iter().enumerate() {
                    let lens = [
                        (key.len() as u16).to_be_bytes(),
                        (value.len() as u16).to_be_bytes(),
                    ]
                    .concat();
                    put_record(&mut data, idx, &[&lens, key, value]);
                }
            }
            Node::Internal(internal) => {
                page::format_page(&mut data, id, PageKind::BTreeInternal)?;
                set_u64(&mut data, LEFTMOST.start, internal.children[0].0);
                for (idx, key) in internal.keys.iter().enumerate() {
                    let klen = (key.len() as u16).to_be_bytes();
                    let child = internal.children[idx + 1].0.to_be_bytes();
                    put_record(&mut data, idx, &[&klen, &child, key]);
                }
            }
        }
        let free_start = off as u16;
        set_u16(&mut data, NSLOTS.start, nslots as u16);
        set_u16(&mut data, FREE_START.start, free_start);
        Ok(data)
    }
}

/// Index at which to split `sizes` so both halves carry about half the bytes.
/// Both halves are non-empty when there are at least two items.
pub fn split_point(sizes: impl Iterator<Item = usize> + Clone) -> usize {
    let total: usize = sizes.clone().sum();
    let count = sizes.clone().count();
    let mut acc = 0;
    for (idx, size) in sizes.enumerate() {
        if acc + size > total / 2 && idx > 0 {
            return idx.min(count - 1);
        }
        acc += size;
    }
    count / 2
}

/// Leaf entry sizes, for [`split_point`].
pub fn leaf_sizes(leaf: &Leaf) -> impl Iterator<Item = usize> + Clone + '_ {
    leaf.entries.iter().map(|(k, v)| leaf_entry_len(k, v))
}

/// Separator sizes, for [`split_point`].
pub fn internal_sizes(internal: &Internal) -> impl Iterator<Item = usize> + Clone + '_ {
    internal.keys.iter().map(|k| internal_entry_len(k))
}
