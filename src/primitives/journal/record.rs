#![forbid(unsafe_code)]

use std::convert::TryFrom;
use std::fmt;

use xxhash_rust::xxh64::xxh64;

use crate::primitives::bytes::buf::{put_bytes32, Reader};
use crate::types::{ArbolError, Lsn, PageId, Result, TxnId};

pub(crate) const ENTRY_HEADER_LEN: usize = 21;
pub(crate) const ENTRY_TRAILER_LEN: usize = 12;
pub(crate) const CHECKSUM_SEED: u64 = 0x9747_b28c;

/// Largest payload a single entry may carry.
pub const MAX_ENTRY_PAYLOAD: usize = 1 << 20;

/// Tag of a journal entry.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecordKind {
    /// Transaction began.
    Start = 1,
    /// Transaction committed.
    Commit = 2,
    /// Transaction rolled back; all its writes have been compensated.
    Abort = 3,
    /// Pages synced up to here.
    Checkpoint = 4,
    /// Physical page mutation with undo and redo bytes.
    PageWrite = 5,
    /// Redo-only record written while undoing a `PageWrite`.
    Compensation = 6,
}

impl TryFrom<u8> for RecordKind {
    type Error = ArbolError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => RecordKind::Start,
            2 => RecordKind::Commit,
            3 => RecordKind::Abort,
            4 => RecordKind::Checkpoint,
            5 => RecordKind::PageWrite,
            6 => RecordKind::Compensation,
            _ => return Err(ArbolError::Corruption("unknown journal record kind")),
        })
    }
}

/// Structure a page mutation belongs to. Recorded for diagnostics only;
/// redo and undo are purely physical.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageOp {
    /// Meta page field update.
    Meta = 1,
    /// Free-list push or pop.
    FreeList = 2,
    /// Page formatted for a new owner.
    Format = 3,
    /// B-tree node rewrite.
    BTree = 4,
    /// Node data page change.
    NodeData = 5,
    /// Overflow chain change.
    Overflow = 6,
}

impl TryFrom<u8> for PageOp {
    type Error = ArbolError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => PageOp::Meta,
            2 => PageOp::FreeList,
            3 => PageOp::Format,
            4 => PageOp::BTree,
            5 => PageOp::NodeData,
            6 => PageOp::Overflow,
            _ => return Err(ArbolError::Corruption("unknown page op")),
        })
    }
}

/// Byte-range mutation of one page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageWrite {
    /// Target page.
    pub page: PageId,
    /// Owning structure.
    pub op: PageOp,
    /// Offset of the changed range inside the page.
    pub offset: u32,
    /// Bytes before the change (undo image).
    pub before: Vec<u8>,
    /// Bytes after the change (redo image).
    pub after: Vec<u8>,
}

/// Compensation for a previously logged [`PageWrite`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Compensation {
    /// Target page.
    pub page: PageId,
    /// Offset of the restored range.
    pub offset: u32,
    /// Restored bytes.
    pub after: Vec<u8>,
    /// LSN of the write being undone.
    pub undoes: Lsn,
}

/// Checkpoint marker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CheckpointRecord {
    /// Smallest LSN recovery still has to read.
    pub min_lsn: Lsn,
    /// Next transaction id to hand out.
    pub next_txn: TxnId,
    /// Transactions active when the checkpoint was taken.
    pub active: Vec<TxnId>,
}

/// Typed journal record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogRecord {
    /// See [`RecordKind::Start`].
    Start,
    /// See [`RecordKind::Commit`].
    Commit,
    /// See [`RecordKind::Abort`].
    Abort,
    /// See [`RecordKind::Checkpoint`].
    Checkpoint(CheckpointRecord),
    /// See [`RecordKind::PageWrite`].
    PageWrite(PageWrite),
    /// See [`RecordKind::Compensation`].
    Compensation(Compensation),
}

impl LogRecord {
    /// Record tag.
    pub fn kind(&self) -> RecordKind {
        match self {
            LogRecord::Start => RecordKind::Start,
            LogRecord::Commit => RecordKind::Commit,
            LogRecord::Abort => RecordKind::Abort,
            LogRecord::Checkpoint(_) => RecordKind::Checkpoint,
            LogRecord::PageWrite(_) => RecordKind::PageWrite,
            LogRecord::Compensation(_) => RecordKind::Compensation,
        }
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            LogRecord::Start | LogRecord::Commit | LogRecord::Abort => {}
            LogRecord::Checkpoint(cp) => {
                out.extend_from_slice(&cp.min_lsn.0.to_be_bytes());
                out.extend_from_slice(&cp.next_txn.0.to_be_bytes());
                out.extend_from_slice(&(cp.active.len() as u32).to_be_bytes());
                for txn in &cp.active {
                    out.extend_from_slice(&txn.0.to_be_bytes());
                }
            }
            LogRecord::PageWrite(w) => {
                out.extend_from_slice(&w.page.0.to_be_bytes());
                out.push(w.op as u8);
                out.extend_from_slice(&w.offset.to_be_bytes());
                put_bytes32(out, &w.before);
                put_bytes32(out, &w.after);
            }
            LogRecord::Compensation(c) => {
                out.extend_from_slice(&c.page.0.to_be_bytes());
                out.extend_from_slice(&c.offset.to_be_bytes());
                out.extend_from_slice(&c.undoes.0.to_be_bytes());
                put_bytes32(out, &c.after);
            }
        }
    }

    fn decode_payload(kind: RecordKind, payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload, "journal record payload truncated");
        let record = match kind {
            RecordKind::Start => LogRecord::Start,
            RecordKind::Commit => LogRecord::Commit,
            RecordKind::Abort => LogRecord::Abort,
            RecordKind::Checkpoint => {
                let min_lsn = Lsn(r.u64()?);
                let next_txn = TxnId(r.u64()?);
                let count = r.u32()? as usize;
                let mut active = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    active.push(TxnId(r.u64()?));
                }
                LogRecord::Checkpoint(CheckpointRecord {
                    min_lsn,
                    next_txn,
                    active,
                })
            }
            RecordKind::PageWrite => {
                let page = PageId(r.u64()?);
                let op = PageOp::try_from(r.u8()?)?;
                let offset = r.u32()?;
                let before = r.bytes32()?.to_vec();
                let after = r.bytes32()?.to_vec();
                if before.len() != after.len() {
                    return Err(ArbolError::Corruption("page write images differ in length"));
                }
                LogRecord::PageWrite(PageWrite {
                    page,
                    op,
                    offset,
                    before,
                    after,
                })
            }
            RecordKind::Compensation => {
                let page = PageId(r.u64()?);
                let offset = r.u32()?;
                let undoes = Lsn(r.u64()?);
                let after = r.bytes32()?.to_vec();
                LogRecord::Compensation(Compensation {
                    page,
                    offset,
                    after,
                    undoes,
                })
            }
        };
        if r.remaining() != 0 {
            return Err(ArbolError::Corruption("journal record has trailing bytes"));
        }
        Ok(record)
    }
}

/// A decoded journal entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JournalEntry {
    /// Position in the log.
    pub lsn: Lsn,
    /// Owning transaction, `TxnId(0)` for checkpoints.
    pub txn: TxnId,
    /// Record body.
    pub record: LogRecord,
}

impl fmt::Display for JournalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsn={} txn={} ", self.lsn, self.txn)?;
        match &self.record {
            LogRecord::Start => write!(f, "START"),
            LogRecord::Commit => write!(f, "COMMIT"),
            LogRecord::Abort => write!(f, "ABORT"),
            LogRecord::Checkpoint(cp) => write!(
                f,
                "CHECKPOINT min_lsn={} next_txn={} active={}",
                cp.min_lsn,
                cp.next_txn,
                cp.active.len()
            ),
            LogRecord::PageWrite(w) => write!(
                f,
                "PAGE_WRITE page={} op={:?} offset={} len={}",
                w.page,
                w.op,
                w.offset,
                w.after.len()
            ),
            LogRecord::Compensation(c) => write!(
                f,
                "CLR page={} offset={} len={} undoes={}",
                c.page,
                c.offset,
                c.after.len(),
                c.undoes
            ),
        }
    }
}

/// Encodes `kind | txn | lsn | len | payload | back_link | xxh64`.
pub(crate) fn encode_entry(lsn: Lsn, txn: TxnId, record: &LogRecord, out: &mut Vec<u8>) -> Result<()> {
    let start = out.len();
    out.push(record.kind() as u8);
    out.extend_from_slice(&txn.0.to_be_bytes());
    out.extend_from_slice(&lsn.0.to_be_bytes());
    out.extend_from_slice(&[0u8; 4]);
    let payload_start = out.len();
    record.encode_payload(out);
    let payload_len = out.len() - payload_start;
    if payload_len > MAX_ENTRY_PAYLOAD {
        out.truncate(start);
        return Err(ArbolError::Invalid("journal entry too large"));
    }
    out[payload_start - 4..payload_start].copy_from_slice(&(payload_len as u32).to_be_bytes());
    let total = ENTRY_HEADER_LEN + payload_len + ENTRY_TRAILER_LEN;
    out.extend_from_slice(&(total as u32).to_be_bytes());
    let checksum = xxh64(&out[start..], CHECKSUM_SEED);
    out.extend_from_slice(&checksum.to_be_bytes());
    Ok(())
}

/// Outcome of decoding one entry from a byte stream.
#[derive(Debug)]
pub(crate) enum EntryParse {
    /// Entry decoded; the second field is its encoded length.
    Complete(JournalEntry, usize),
    /// The stream ends inside the entry.
    Truncated,
    /// The entry is fully present but fails validation; the field is its
    /// declared length.
    Damaged(usize),
}

pub(crate) fn decode_entry(src: &[u8]) -> EntryParse {
    if src.len() < ENTRY_HEADER_LEN {
        return EntryParse::Truncated;
    }
    let payload_len = u32::from_be_bytes([src[17], src[18], src[19], src[20]]) as usize;
    if payload_len > MAX_ENTRY_PAYLOAD {
        return EntryParse::Damaged(src.len());
    }
    let total = ENTRY_HEADER_LEN + payload_len + ENTRY_TRAILER_LEN;
    if src.len() < total {
        return EntryParse::Truncated;
    }
    let body_end = total - 8;
    let stored = u64::from_be_bytes(src[body_end..total].try_into().unwrap_or([0; 8]));
    if xxh64(&src[..body_end], CHECKSUM_SEED) != stored {
        return EntryParse::Damaged(total);
    }
    let back_link = u32::from_be_bytes(src[body_end - 4..body_end].try_into().unwrap_or([0; 4]));
    if back_link as usize != total {
        return EntryParse::Damaged(total);
    }
    let parsed = (|| -> Result<JournalEntry> {
        let kind = RecordKind::try_from(src[0])?;
        let txn = TxnId(u64::from_be_bytes(src[1..9].try_into().unwrap()));
        let lsn = Lsn(u64::from_be_bytes(src[9..17].try_into().unwrap()));
        let payload = &src[ENTRY_HEADER_LEN..ENTRY_HEADER_LEN + payload_len];
        let record = LogRecord::decode_payload(kind, payload)?;
        Ok(JournalEntry { lsn, txn, record })
    })();
    match parsed {
        Ok(entry) => EntryParse::Complete(entry, total),
        Err(_) => EntryParse::Damaged(total),
    }
}
