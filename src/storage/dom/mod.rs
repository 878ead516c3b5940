#![forbid(unsafe_code)]

//! Paged node file: document node payloads stored in per-document chains of
//! data pages, located through a B-tree keyed by `(document, node)`.

mod page;

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::primitives::bytes::ord;
use crate::primitives::journal::PageOp;
use crate::primitives::pager::{PageStore, WriteLog};
use crate::storage::btree::{BTree, IndexQuery};
use crate::types::{ArbolError, DocId, NodeId, PageId, Result};

pub use page::{inline_threshold, overflow_capacity, DataPage, OverflowPage, Record, RecordBody};

/// Location of a node record: `page << 16 | tid`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Address(pub u64);

impl Address {
    /// Packs a page number and tuple id.
    pub fn new(page: PageId, tid: u16) -> Self {
        Address(page.0 << 16 | tid as u64)
    }

    /// Data page holding the record.
    pub fn page(self) -> PageId {
        PageId(self.0 >> 16)
    }

    /// Tuple id within the page.
    pub fn tid(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page().0, self.tid())
    }
}

/// Index key of a node.
pub fn node_key(doc: DocId, node: NodeId) -> Vec<u8> {
    ord::compound_u32_u64(doc.0, node.0)
}

/// Index key recording a document's first data page. Sorts before every node
/// key of the document.
fn anchor_key(doc: DocId) -> Vec<u8> {
    doc.0.to_be_bytes().to_vec()
}

fn decode_address(value: &[u8]) -> Result<Address> {
    let bytes: [u8; 8] = value
        .try_into()
        .map_err(|_| ArbolError::Corruption("node index value is not an address"))?;
    Ok(Address(u64::from_be_bytes(bytes)))
}

/// Node payload storage for all documents.
pub struct NodeFile {
    store: Arc<PageStore>,
    index: BTree,
}

impl NodeFile {
    /// Wraps the node index tree.
    pub fn new(store: Arc<PageStore>, index: BTree) -> Self {
        Self { store, index }
    }

    /// The `(document, node) -> address` index.
    pub fn index(&self) -> &BTree {
        &self.index
    }

    /// First data page of a document's chain.
    pub fn first_page(&self, doc: DocId) -> Result<Option<PageId>> {
        self.index
            .get(&anchor_key(doc))?
            .map(|value| decode_address(&value).map(|addr| PageId(addr.0)))
            .transpose()
    }

    /// Address of a node.
    pub fn address_of(&self, doc: DocId, node: NodeId) -> Result<Option<Address>> {
        self.index
            .get(&node_key(doc, node))?
            .map(|value| decode_address(&value))
            .transpose()
    }

    /// Stores a node payload, replacing any previous payload under the key.
    ///
    /// The record goes into the page holding the nearest preceding node of the
    /// same document when it has room; otherwise a page is linked into the
    /// chain right after it.
    pub fn put(&self, log: &mut dyn WriteLog, doc: DocId, node: NodeId, data: &[u8]) -> Result<Address> {
        log.prepare_write()?;
        let key = node_key(doc, node);
        if self.index.get(&key)?.is_some() {
            self.remove(log, doc, node)?;
        }
        let body = self.make_body(log, data)?;
        let near = self.placement_page(doc, &key)?;
        let addr = self.place(log, doc, near, body)?;
        self.index.insert(log, &key, &addr.0.to_be_bytes())?;
        trace!(doc = doc.0, node = node.0, addr = %addr, len = data.len(), "dom.put");
        Ok(addr)
    }

    /// Appends bytes to an existing payload.
    pub fn append(&self, log: &mut dyn WriteLog, doc: DocId, node: NodeId, more: &[u8]) -> Result<Address> {
        log.prepare_write()?;
        let addr = self
            .address_of(doc, node)?
            .ok_or_else(|| ArbolError::NotFound(format!("node {node} of document {doc}")))?;
        let page_size = self.store.page_size();
        let mut data_page = self.read_data_page(addr.page())?;
        let pos = self.record_position(&data_page, addr)?;
        match data_page.records[pos].body.clone() {
            RecordBody::Overflow { head, len } => {
                self.extend_chain(log, head, more)?;
                data_page.records[pos].body = RecordBody::Overflow {
                    head,
                    len: len + more.len() as u64,
                };
                self.write_data_page(log, addr.page(), &data_page)?;
                Ok(addr)
            }
            RecordBody::Inline(mut bytes) => {
                bytes.extend_from_slice(more);
                let body = self.make_body(log, &bytes)?;
                data_page.records[pos].body = body.clone();
                if data_page.encoded_len() <= page_size {
                    self.write_data_page(log, addr.page(), &data_page)?;
                    return Ok(addr);
                }
                // Grown record no longer fits here; move it behind its page.
                data_page.records.remove(pos);
                self.write_data_page(log, addr.page(), &data_page)?;
                let moved = self.place(log, doc, Some(addr.page()), body)?;
                self.index
                    .insert(log, &node_key(doc, node), &moved.0.to_be_bytes())?;
                trace!(doc = doc.0, node = node.0, from = %addr, to = %moved, "dom.append.relocated");
                Ok(moved)
            }
        }
    }

    /// Removes a node payload. Returns whether it existed.
    pub fn remove(&self, log: &mut dyn WriteLog, doc: DocId, node: NodeId) -> Result<bool> {
        log.prepare_write()?;
        let Some(value) = self.index.remove(log, &node_key(doc, node))? else {
            return Ok(false);
        };
        let addr = decode_address(&value)?;
        let mut data_page = self.read_data_page(addr.page())?;
        let pos = self.record_position(&data_page, addr)?;
        let record = data_page.records.remove(pos);
        if let RecordBody::Overflow { head, .. } = record.body {
            self.free_chain(log, head)?;
        }
        if data_page.records.is_empty() && !data_page.prev.is_none() {
            self.unlink(log, addr.page(), &data_page)?;
        } else {
            self.write_data_page(log, addr.page(), &data_page)?;
        }
        Ok(true)
    }

    /// Frees every page of a document and purges its index entries.
    pub fn remove_all(&self, log: &mut dyn WriteLog, doc: DocId) -> Result<usize> {
        log.prepare_write()?;
        let mut freed = 0usize;
        if let Some(first) = self.first_page(doc)? {
            let mut current = first;
            let mut hops = 0u64;
            let limit = self.store.page_count()?;
            while !current.is_none() {
                hops += 1;
                if hops > limit {
                    return Err(ArbolError::Corruption("document page chain has a cycle"));
                }
                let data_page = self.read_data_page(current)?;
                if data_page.doc != doc {
                    return Err(ArbolError::Corruption("document page chain crosses documents"));
                }
                for record in &data_page.records {
                    if let RecordBody::Overflow { head, .. } = record.body {
                        freed += self.free_chain(log, head)?;
                    }
                }
                self.store.free_page(log, current)?;
                freed += 1;
                current = data_page.next;
            }
        }
        let removed = self
            .index
            .remove_range(log, &IndexQuery::TruncRight(anchor_key(doc)), |_, _| {})?;
        debug!(doc = doc.0, pages = freed, keys = removed, "dom.remove_all");
        Ok(freed)
    }

    /// Payload of a node.
    pub fn get(&self, doc: DocId, node: NodeId) -> Result<Option<Vec<u8>>> {
        match self.address_of(doc, node)? {
            Some(addr) => self.get_at(addr).map(Some),
            None => Ok(None),
        }
    }

    /// Payload stored at `addr`.
    pub fn get_at(&self, addr: Address) -> Result<Vec<u8>> {
        let data_page = self.read_data_page(addr.page())?;
        let pos = self.record_position(&data_page, addr)?;
        match &data_page.records[pos].body {
            RecordBody::Inline(bytes) => Ok(bytes.clone()),
            RecordBody::Overflow { head, len } => self.read_chain(*head, *len),
        }
    }

    /// Visits a document's nodes in node id order until `f` breaks.
    pub fn scan_document(
        &self,
        doc: DocId,
        mut f: impl FnMut(NodeId, &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        let mut addrs = Vec::new();
        self.index
            .query(&IndexQuery::TruncRight(anchor_key(doc)), |key, value| {
                if let Some((_, node)) = ord::split_u32_u64(key) {
                    addrs.push((NodeId(node), value.to_vec()));
                }
                ControlFlow::Continue(())
            })?;
        for (node, value) in addrs {
            let data = self.get_at(decode_address(&value)?)?;
            if f(node, &data).is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Node ids stored for a document, ascending.
    pub fn node_ids(&self, doc: DocId) -> Result<Vec<NodeId>> {
        let mut ids = Vec::new();
        self.index
            .query(&IndexQuery::TruncRight(anchor_key(doc)), |key, _| {
                if let Some((_, node)) = ord::split_u32_u64(key) {
                    ids.push(NodeId(node));
                }
                ControlFlow::Continue(())
            })?;
        Ok(ids)
    }

    fn placement_page(&self, doc: DocId, key: &[u8]) -> Result<Option<PageId>> {
        let lo = node_key(doc, NodeId(0));
        if let Some((_, value)) = self
            .index
            .last_in(&IndexQuery::Range(lo, key.to_vec()))?
        {
            return Ok(Some(decode_address(&value)?.page()));
        }
        self.first_page(doc)
    }

    /// Adds `body` to `near` when it has room, else to a new page linked after
    /// `near` (or to a new chain when the document has no pages yet).
    fn place(&self, log: &mut dyn WriteLog, doc: DocId, near: Option<PageId>, body: RecordBody) -> Result<Address> {
        let page_size = self.store.page_size();
        let Some(near) = near else {
            let id = self.store.allocate_page(log)?;
            let mut fresh = DataPage::new(doc);
            let tid = fresh.push(body);
            self.write_data_page(log, id, &fresh)?;
            self.index
                .insert(log, &anchor_key(doc), &id.0.to_be_bytes())?;
            debug!(doc = doc.0, page = id.0, "dom.chain.create");
            return Ok(Address::new(id, tid));
        };
        let mut current = self.read_data_page(near)?;
        if current.has_room_for(&body, page_size) {
            let tid = current.push(body);
            self.write_data_page(log, near, &current)?;
            return Ok(Address::new(near, tid));
        }
        let id = self.store.allocate_page(log)?;
        let mut fresh = DataPage::new(doc);
        fresh.prev = near;
        fresh.next = current.next;
        let tid = fresh.push(body);
        if !current.next.is_none() {
            let mut after = self.read_data_page(current.next)?;
            after.prev = id;
            self.write_data_page(log, current.next, &after)?;
        }
        current.next = id;
        self.write_data_page(log, near, &current)?;
        self.write_data_page(log, id, &fresh)?;
        trace!(doc = doc.0, after = near.0, page = id.0, "dom.chain.extend");
        Ok(Address::new(id, tid))
    }

    fn unlink(&self, log: &mut dyn WriteLog, id: PageId, data_page: &DataPage) -> Result<()> {
        let mut before = self.read_data_page(data_page.prev)?;
        before.next = data_page.next;
        self.write_data_page(log, data_page.prev, &before)?;
        if !data_page.next.is_none() {
            let mut after = self.read_data_page(data_page.next)?;
            after.prev = data_page.prev;
            self.write_data_page(log, data_page.next, &after)?;
        }
        self.store.free_page(log, id)?;
        trace!(page = id.0, "dom.chain.unlink");
        Ok(())
    }

    fn make_body(&self, log: &mut dyn WriteLog, data: &[u8]) -> Result<RecordBody> {
        if data.len() <= inline_threshold(self.store.page_size()) {
            return Ok(RecordBody::Inline(data.to_vec()));
        }
        let head = self.store.allocate_page(log)?;
        self.write_overflow(
            log,
            head,
            &OverflowPage {
                next: PageId::NONE,
                data: Vec::new(),
            },
        )?;
        self.extend_chain(log, head, data)?;
        Ok(RecordBody::Overflow {
            head,
            len: data.len() as u64,
        })
    }

    /// Appends to an overflow chain: fills the last page, then links new ones.
    fn extend_chain(&self, log: &mut dyn WriteLog, head: PageId, mut more: &[u8]) -> Result<()> {
        let capacity = overflow_capacity(self.store.page_size());
        let mut tail_id = head;
        let mut tail = self.read_overflow(head)?;
        let mut hops = 0u64;
        let limit = self.store.page_count()?;
        while !tail.next.is_none() {
            hops += 1;
            if hops > limit {
                return Err(ArbolError::Corruption("overflow chain has a cycle"));
            }
            tail_id = tail.next;
            tail = self.read_overflow(tail_id)?;
        }
        loop {
            let room = capacity - tail.data.len();
            let take = room.min(more.len());
            tail.data.extend_from_slice(&more[..take]);
            more = &more[take..];
            if more.is_empty() {
                return self.write_overflow(log, tail_id, &tail);
            }
            let next_id = self.store.allocate_page(log)?;
            tail.next = next_id;
            self.write_overflow(log, tail_id, &tail)?;
            tail_id = next_id;
            tail = OverflowPage {
                next: PageId::NONE,
                data: Vec::new(),
            };
        }
    }

    fn read_chain(&self, head: PageId, len: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len as usize);
        let mut current = head;
        while !current.is_none() && (out.len() as u64) < len {
            let page = self.read_overflow(current)?;
            out.extend_from_slice(&page.data);
            current = page.next;
        }
        if out.len() as u64 != len {
            return Err(ArbolError::Corruption("overflow chain length mismatch"));
        }
        Ok(out)
    }

    fn free_chain(&self, log: &mut dyn WriteLog, head: PageId) -> Result<usize> {
        let mut freed = 0;
        let mut current = head;
        let limit = self.store.page_count()?;
        while !current.is_none() {
            if freed as u64 > limit {
                return Err(ArbolError::Corruption("overflow chain has a cycle"));
            }
            let page = self.read_overflow(current)?;
            self.store.free_page(log, current)?;
            freed += 1;
            current = page.next;
        }
        Ok(freed)
    }

    fn record_position(&self, data_page: &DataPage, addr: Address) -> Result<usize> {
        data_page
            .position(addr.tid())
            .ok_or_else(|| ArbolError::CorruptionOwned(format!("no record at address {addr}")))
    }

    fn read_data_page(&self, id: PageId) -> Result<DataPage> {
        self.store.with_page(id, DataPage::decode)?
    }

    fn write_data_page(&self, log: &mut dyn WriteLog, id: PageId, data_page: &DataPage) -> Result<()> {
        let image = data_page.encode(id, self.store.page_size())?;
        self.store.write_page(log, id, PageOp::NodeData, &image)
    }

    fn read_overflow(&self, id: PageId) -> Result<OverflowPage> {
        self.store.with_page(id, OverflowPage::decode)?
    }

    fn write_overflow(&self, log: &mut dyn WriteLog, id: PageId, page: &OverflowPage) -> Result<()> {
        let image = page.encode(id, self.store.page_size())?;
        self.store.write_page(log, id, PageOp::Overflow, &image)
    }
}
