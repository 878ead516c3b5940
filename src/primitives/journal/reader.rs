#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::record::{decode_entry, EntryParse, JournalEntry};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{ArbolError, Checksum, Crc32Fast, Lsn, Result, TxnId};

const JOURNAL_MAGIC: [u8; 4] = *b"ARBJ";
const JOURNAL_VERSION: u16 = 1;
pub(crate) const FILE_HEADER_LEN: usize = 28;
const FILE_SUFFIX: &str = "log";

/// Header at the start of every journal file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileHeader {
    /// Sequence number of the file, also encoded in its name.
    pub file_no: u32,
    /// LSN of the first entry the file may hold.
    pub start_lsn: Lsn,
}

impl FileHeader {
    pub(crate) fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&JOURNAL_MAGIC);
        buf[4..6].copy_from_slice(&JOURNAL_VERSION.to_be_bytes());
        buf[8..12].copy_from_slice(&self.file_no.to_be_bytes());
        buf[12..20].copy_from_slice(&self.start_lsn.0.to_be_bytes());
        let crc = header_crc(&buf);
        buf[20..24].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    pub(crate) fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FILE_HEADER_LEN {
            return Err(ArbolError::Corruption("journal file header truncated"));
        }
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf.copy_from_slice(&src[..FILE_HEADER_LEN]);
        if buf[0..4] != JOURNAL_MAGIC {
            return Err(ArbolError::Corruption("journal magic mismatch"));
        }
        if u16::from_be_bytes([buf[4], buf[5]]) != JOURNAL_VERSION {
            return Err(ArbolError::Corruption("journal version mismatch"));
        }
        let stored = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]);
        buf[20..24].fill(0);
        if header_crc(&buf) != stored {
            return Err(ArbolError::Corruption("journal header crc mismatch"));
        }
        Ok(Self {
            file_no: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            start_lsn: Lsn(u64::from_be_bytes(buf[12..20].try_into().unwrap())),
        })
    }
}

fn header_crc(buf: &[u8; FILE_HEADER_LEN]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&buf[..20]);
    hasher.update(&buf[24..]);
    hasher.finalize()
}

/// Path of journal file `file_no` inside `dir`.
pub fn journal_file_path(dir: &Path, file_no: u32) -> PathBuf {
    dir.join(format!("{file_no:010x}.{FILE_SUFFIX}"))
}

/// Lists journal files in ascending file number.
pub fn list_journal_files(dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(FILE_SUFFIX) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Ok(no) = u32::from_str_radix(stem, 16) {
            files.push((no, path));
        }
    }
    files.sort_by_key(|(no, _)| *no);
    Ok(files)
}

/// Result of a full journal scan.
#[derive(Clone, Debug, Default)]
pub struct ScanSummary {
    /// Highest LSN read, zero for an empty journal.
    pub last_lsn: Lsn,
    /// Highest file number present.
    pub last_file: Option<u32>,
    /// Entries visited (including those below the requested start).
    pub entries: u64,
    /// Highest transaction id seen in any entry.
    pub max_txn: TxnId,
    /// Whether a torn entry was dropped from the end of the last file.
    pub torn_tail: bool,
    /// Length of the valid prefix of the last file.
    pub valid_end: u64,
}

/// Sequential reader over every journal file of a directory.
pub struct JournalReader {
    files: Vec<(u32, PathBuf)>,
}

impl JournalReader {
    /// Collects the journal files in `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self {
            files: list_journal_files(dir)?,
        })
    }

    /// File numbers in scan order.
    pub fn file_numbers(&self) -> Vec<u32> {
        self.files.iter().map(|(no, _)| *no).collect()
    }

    /// Visits every entry in LSN order.
    ///
    /// A truncated or damaged entry that ends the last file is treated as the
    /// end of the log. Damage anywhere else, a bad file header, or a gap in the
    /// LSN sequence is corruption.
    pub fn scan<F>(&self, mut visit: F) -> Result<ScanSummary>
    where
        F: FnMut(&JournalEntry) -> Result<()>,
    {
        let mut summary = ScanSummary::default();
        let mut expected: Option<Lsn> = None;
        let count = self.files.len();
        for (idx, (file_no, path)) in self.files.iter().enumerate() {
            let is_last = idx + 1 == count;
            let io = StdFileIo::open_read(path)?;
            let len = io.len()? as usize;
            let mut data = vec![0u8; len];
            io.read_at(0, &mut data)?;
            let header = match FileHeader::decode(&data) {
                Ok(header) => header,
                Err(_) if is_last && len < FILE_HEADER_LEN => {
                    warn!(file = *file_no, "journal.scan.partial_header");
                    summary.torn_tail = true;
                    summary.valid_end = 0;
                    break;
                }
                Err(err) => return Err(err),
            };
            if header.file_no != *file_no {
                return Err(ArbolError::Corruption("journal file number mismatch"));
            }
            match expected {
                Some(next) if header.start_lsn != next => {
                    return Err(ArbolError::CorruptionOwned(format!(
                        "journal gap: file {file_no:x} starts at lsn {} but {} was expected",
                        header.start_lsn, next
                    )));
                }
                _ => {}
            }
            expected = Some(header.start_lsn);
            summary.last_file = Some(*file_no);
            let mut off = FILE_HEADER_LEN;
            summary.valid_end = len as u64;
            while off < len {
                match decode_entry(&data[off..]) {
                    EntryParse::Complete(entry, used) => {
                        if Some(entry.lsn) != expected {
                            return Err(ArbolError::CorruptionOwned(format!(
                                "journal lsn {} out of sequence in file {file_no:x}",
                                entry.lsn
                            )));
                        }
                        expected = Some(entry.lsn.next());
                        summary.last_lsn = entry.lsn;
                        summary.entries += 1;
                        if entry.txn > summary.max_txn {
                            summary.max_txn = entry.txn;
                        }
                        visit(&entry)?;
                        off += used;
                    }
                    EntryParse::Truncated if is_last => {
                        warn!(file = *file_no, offset = off, "journal.scan.torn_tail");
                        summary.torn_tail = true;
                        summary.valid_end = off as u64;
                        break;
                    }
                    EntryParse::Damaged(used) if is_last && off + used >= len => {
                        warn!(file = *file_no, offset = off, "journal.scan.damaged_tail");
                        summary.torn_tail = true;
                        summary.valid_end = off as u64;
                        break;
                    }
                    EntryParse::Truncated | EntryParse::Damaged(_) => {
                        return Err(ArbolError::CorruptionOwned(format!(
                            "damaged journal entry at offset {off} of file {file_no:x}"
                        )));
                    }
                }
            }
            if let Some(next) = expected {
                summary.last_lsn = Lsn(next.0.saturating_sub(1));
            }
        }
        debug!(
            files = count,
            entries = summary.entries,
            last_lsn = summary.last_lsn.0,
            "journal.scan.complete"
        );
        Ok(summary)
    }

    /// Visits the entries at or after `from` in LSN order. Earlier entries
    /// are still read and checked.
    pub fn replay<F>(&self, from: Lsn, mut visit: F) -> Result<ScanSummary>
    where
        F: FnMut(&JournalEntry) -> Result<()>,
    {
        self.scan(|entry| if entry.lsn < from { Ok(()) } else { visit(entry) })
    }
}

/// Reads the header of one journal file.
pub(crate) fn read_file_header(path: &Path) -> Result<FileHeader> {
    let io = StdFileIo::open_read(path)?;
    let mut buf = [0u8; FILE_HEADER_LEN];
    io.read_at(0, &mut buf)?;
    FileHeader::decode(&buf)
}
