use std::ops::Range;

use crate::primitives::bytes::buf::{get_u16, get_u32, get_u64, set_u16, set_u32, set_u64, Reader};
use crate::types::{
    page::{self, PageKind, PAGE_HDR_LEN},
    ArbolError, DocId, PageId, Result,
};

const DOC_ID: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 4;
const NRECORDS: Range<usize> = PAGE_HDR_LEN + 4..PAGE_HDR_LEN + 6;
const NEXT_TID: Range<usize> = PAGE_HDR_LEN + 6..PAGE_HDR_LEN + 8;
const PREV: Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 16;
const NEXT: Range<usize> = PAGE_HDR_LEN + 16..PAGE_HDR_LEN + 24;
const DATA_HDR_END: usize = PAGE_HDR_LEN + 32;

const OVERFLOW_NEXT: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 8;
const OVERFLOW_USED: Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 12;
const OVERFLOW_DATA: usize = PAGE_HDR_LEN + 16;

const BODY_INLINE: u8 = 0;
const BODY_OVERFLOW: u8 = 1;
const RECORD_HEADER_LEN: usize = 3;

/// Last tuple id a page hands out.
pub const MAX_TID: u16 = u16::MAX;

/// Payloads longer than this live in an overflow chain.
pub fn inline_threshold(page_size: usize) -> usize {
    (page_size - DATA_HDR_END) / 4
}

/// Payload bytes one overflow page holds.
pub fn overflow_capacity(page_size: usize) -> usize {
    page_size - OVERFLOW_DATA
}

/// Stored form of a node payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecordBody {
    /// Payload kept in the data page.
    Inline(Vec<u8>),
    /// Payload kept in an overflow chain.
    Overflow {
        /// First overflow page.
        head: PageId,
        /// Total payload length.
        len: u64,
    },
}

impl RecordBody {
    fn encoded_len(&self) -> usize {
        RECORD_HEADER_LEN
            + match self {
                RecordBody::Inline(data) => 2 + data.len(),
                RecordBody::Overflow { .. } => 16,
            }
    }
}

/// One slot of a data page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    /// Tuple id, unique within the page.
    pub tid: u16,
    /// Payload or overflow reference.
    pub body: RecordBody,
}

/// Decoded DomData page: one link of a document's page chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataPage {
    /// Owning document.
    pub doc: DocId,
    /// Previous page of the document chain.
    pub prev: PageId,
    /// Next page of the document chain.
    pub next: PageId,
    /// Tuple id the next record receives.
    pub next_tid: u16,
    /// Records in insertion order.
    pub records: Vec<Record>,
}

impl DataPage {
    /// Empty page for `doc`.
    pub fn new(doc: DocId) -> Self {
        Self {
            doc,
            prev: PageId::NONE,
            next: PageId::NONE,
            next_tid: 1,
            records: Vec::new(),
        }
    }

    /// Bytes the encoded page needs.
    pub fn encoded_len(&self) -> usize {
        DATA_HDR_END + self.records.iter().map(|r| r.body.encoded_len()).sum::<usize>()
    }

    /// Whether `body` can be added without overflowing the page.
    pub fn has_room_for(&self, body: &RecordBody, page_size: usize) -> bool {
        self.next_tid < MAX_TID && self.encoded_len() + body.encoded_len() <= page_size
    }

    /// Adds a record and returns its tuple id.
    pub fn push(&mut self, body: RecordBody) -> u16 {
        let tid = self.next_tid;
        self.next_tid += 1;
        self.records.push(Record { tid, body });
        tid
    }

    /// Position of tuple `tid`.
    pub fn position(&self, tid: u16) -> Option<usize> {
        self.records.iter().position(|r| r.tid == tid)
    }

    /// Parses a DomData page.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if page::page_kind(data)? != PageKind::DomData {
            return Err(ArbolError::Corruption("page is not a node data page"));
        }
        let count = get_u16(data, NRECORDS.start) as usize;
        let mut reader = Reader::new(&data[DATA_HDR_END..], "node data page");
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let tid = reader.u16()?;
            let body = match reader.u8()? {
                BODY_INLINE => RecordBody::Inline(reader.bytes16()?.to_vec()),
                BODY_OVERFLOW => {
                    let len = reader.u64()?;
                    let head = PageId(reader.u64()?);
                    RecordBody::Overflow { head, len }
                }
                _ => return Err(ArbolError::Corruption("unknown node record kind")),
            };
            records.push(Record { tid, body });
        }
        Ok(Self {
            doc: DocId(get_u32(data, DOC_ID.start)),
            prev: PageId(get_u64(data, PREV.start)),
            next: PageId(get_u64(data, NEXT.start)),
            next_tid: get_u16(data, NEXT_TID.start),
            records,
        })
    }

    /// Full page image for page `id`.
    pub fn encode(&self, id: PageId, page_size: usize) -> Result<Vec<u8>> {
        if self.encoded_len() > page_size {
            return Err(ArbolError::Corruption("node data page overflows"));
        }
        let mut data = vec![0u8; page_size];
        page::format_page(&mut data, id, PageKind::DomData)?;
        set_u32(&mut data, DOC_ID.start, self.doc.0);
        set_u16(&mut data, NRECORDS.start, self.records.len() as u16);
        set_u16(&mut data, NEXT_TID.start, self.next_tid);
        set_u64(&mut data, PREV.start, self.prev.0);
        set_u64(&mut data, NEXT.start, self.next.0);
        let mut off = DATA_HDR_END;
        for record in &self.records {
            set_u16(&mut data, off, record.tid);
            off += 2;
            match &record.body {
                RecordBody::Inline(bytes) => {
                    data[off] = BODY_INLINE;
                    set_u16(&mut data, off + 1, bytes.len() as u16);
                    data[off + 3..off + 3 + bytes.len()].copy_from_slice(bytes);
                    off += 3 + bytes.len();
                }
                RecordBody::Overflow { head, len } => {
                    data[off] = BODY_OVERFLOW;
                    set_u64(&mut data, off + 1, *len);
                    set_u64(&mut data, off + 9, head.0);
                    off += 17;
                }
            }
        }
        Ok(data)
    }
}

/// Decoded overflow page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OverflowPage {
    /// Next page of the chain.
    pub next: PageId,
    /// Payload bytes held by this page.
    pub data: Vec<u8>,
}

impl OverflowPage {
    /// Parses an overflow page.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if page::page_kind(data)? != PageKind::Overflow {
            return Err(ArbolError::Corruption("page is not an overflow page"));
        }
        let used = get_u32(data, OVERFLOW_USED.start) as usize;
        if OVERFLOW_DATA + used > data.len() {
            return Err(ArbolError::Corruption("overflow page length out of range"));
        }
        Ok(Self {
            next: PageId(get_u64(data, OVERFLOW_NEXT.start)),
            data: data[OVERFLOW_DATA..OVERFLOW_DATA + used].to_vec(),
        })
    }

    /// Full page image for page `id`.
    pub fn encode(&self, id: PageId, page_size: usize) -> Result<Vec<u8>> {
        if self.data.len() > overflow_capacity(page_size) {
            return Err(ArbolError::Corruption("overflow page overfilled"));
        }
        let mut out = vec![0u8; page_size];
        page::format_page(&mut out, id, PageKind::Overflow)?;
        set_u64(&mut out, OVERFLOW_NEXT.start, self.next.0);
        set_u32(&mut out, OVERFLOW_USED.start, self.data.len() as u32);
        out[OVERFLOW_DATA..OVERFLOW_DATA + self.data.len()].copy_from_slice(&self.data);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_page_layout() -> Result<()> {
        let mut page = DataPage::new(DocId(7));
        page.prev = PageId(3);
        let a = page.push(RecordBody::Inline(b"<a/>".to_vec()));
        let b = page.push(RecordBody::Overflow {
            head: PageId(12),
            len: 90_000,
        });
        assert_eq!((a, b), (1, 2));
        let image = page.encode(PageId(4), 1024)?;
        let back = DataPage::decode(&image)?;
        assert_eq!(back, page);
        assert_eq!(back.position(2), Some(1));
        Ok(())
    }

    #[test]
    fn room_accounts_for_headers() {
        let page = DataPage::new(DocId(1));
        let body = RecordBody::Inline(vec![0; 1024 - DATA_HDR_END - RECORD_HEADER_LEN - 2]);
        assert!(page.has_room_for(&body, 1024));
        let body = RecordBody::Inline(vec![0; 1024 - DATA_HDR_END - RECORD_HEADER_LEN - 1]);
        assert!(!page.has_room_for(&body, 1024));
    }

    #[test]
    fn overflow_page_layout() -> Result<()> {
        let page = OverflowPage {
            next: PageId(9),
            data: vec![5; overflow_capacity(1024)],
        };
        assert_eq!(OverflowPage::decode(&page.encode(PageId(8), 1024)?)?, page);
        let too_big = OverflowPage {
            next: PageId::NONE,
            data: vec![0; overflow_capacity(1024) + 1],
        };
        assert!(too_big.encode(PageId(8), 1024).is_err());
        Ok(())
    }
}
