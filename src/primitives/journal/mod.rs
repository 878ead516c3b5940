#![forbid(unsafe_code)]
//! Write-ahead journal: typed records appended to rotated, checksummed files.
//!
//! Entries are buffered in memory and written on demand. Commit durability
//! goes through [`Journal::flush_durable`], which elects one caller to write
//! and sync on behalf of everyone waiting (group commit).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{ArbolError, Lsn, Result, TxnId};

mod reader;
mod record;

pub use reader::{
    journal_file_path, list_journal_files, FileHeader, JournalReader, ScanSummary,
};
pub use record::{
    CheckpointRecord, Compensation, JournalEntry, LogRecord, PageOp, PageWrite, RecordKind,
    MAX_ENTRY_PAYLOAD,
};

use reader::{read_file_header, FILE_HEADER_LEN};
use record::encode_entry;

/// Journal tuning knobs.
#[derive(Clone, Debug)]
pub struct JournalOptions {
    /// In-memory buffer size before entries are written out.
    pub buffer_size: usize,
    /// A checkpoint only switches to a new file once the current one exceeds this.
    pub min_size: u64,
    /// Crossing this size raises a checkpoint request.
    pub max_size: u64,
    /// Whether commits fsync the journal.
    pub sync_on_commit: bool,
}

impl Default for JournalOptions {
    fn default() -> Self {
        Self {
            buffer_size: 1 << 20,
            min_size: 1 << 20,
            max_size: 64 << 20,
            sync_on_commit: true,
        }
    }
}

/// Journal counters.
#[derive(Clone, Debug, Default)]
pub struct JournalStats {
    /// Entries appended.
    pub entries: u64,
    /// Encoded bytes appended.
    pub bytes: u64,
    /// Buffer writes to the file.
    pub writes: u64,
    /// fsync calls.
    pub syncs: u64,
    /// Commits satisfied by another caller's sync.
    pub piggybacked: u64,
    /// Files created.
    pub files_created: u64,
    /// Files deleted after checkpoints.
    pub files_deleted: u64,
}

struct ActiveFile {
    io: Arc<dyn FileIo>,
    file_no: u32,
    append_offset: u64,
}

struct JournalState {
    file: ActiveFile,
    buffer: Vec<u8>,
    /// LSN the next entry receives.
    next_lsn: Lsn,
    /// Highest LSN written to the file.
    written_lsn: Lsn,
    /// Highest LSN known to be on stable storage.
    durable_lsn: Lsn,
    flushing: bool,
    closed: bool,
    stats: JournalStats,
}

/// The write-ahead journal of one store.
pub struct Journal {
    dir: PathBuf,
    options: JournalOptions,
    state: Mutex<JournalState>,
    flushed: Condvar,
    checkpoint_requested: AtomicBool,
}

impl Journal {
    /// Opens the journal in `dir` after a scan of the existing files.
    ///
    /// A torn tail reported by the scan is cut off, then a fresh file is
    /// started so new entries never follow damaged bytes.
    pub fn open(dir: impl AsRef<Path>, options: JournalOptions, scan: &ScanSummary) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        if let (true, Some(last)) = (scan.torn_tail, scan.last_file) {
            let path = journal_file_path(&dir, last);
            if scan.valid_end < FILE_HEADER_LEN as u64 {
                warn!(file = last, "journal.open.remove_partial_file");
                fs::remove_file(&path)?;
            } else {
                warn!(file = last, valid_end = scan.valid_end, "journal.open.truncate_tail");
                let io = StdFileIo::open(&path)?;
                io.truncate(scan.valid_end)?;
                io.sync_all()?;
            }
        }
        let next_lsn = scan.last_lsn.next();
        let file_no = scan.last_file.map(|no| no + 1).unwrap_or(1);
        let file = create_file(&dir, file_no, next_lsn)?;
        info!(file = file_no, next_lsn = next_lsn.0, "journal.open");
        Ok(Self {
            dir,
            state: Mutex::new(JournalState {
                file,
                buffer: Vec::with_capacity(options.buffer_size.min(1 << 20)),
                next_lsn,
                written_lsn: scan.last_lsn,
                durable_lsn: scan.last_lsn,
                flushing: false,
                closed: false,
                stats: JournalStats {
                    files_created: 1,
                    ..JournalStats::default()
                },
            }),
            options,
            flushed: Condvar::new(),
            checkpoint_requested: AtomicBool::new(false),
        })
    }

    /// Directory holding the journal files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends a record and returns its LSN. The entry is buffered only.
    pub fn log_operation(&self, txn: TxnId, record: &LogRecord) -> Result<Lsn> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ArbolError::ShutDown);
        }
        let lsn = state.next_lsn;
        let mut encoded = Vec::new();
        encode_entry(lsn, txn, record, &mut encoded)?;
        if !state.buffer.is_empty() && state.buffer.len() + encoded.len() > self.options.buffer_size
        {
            state = self.write_buffer(state, false)?;
        }
        state.buffer.extend_from_slice(&encoded);
        state.next_lsn = lsn.next();
        state.stats.entries += 1;
        state.stats.bytes += encoded.len() as u64;
        Ok(lsn)
    }

    /// Writes buffered entries. Syncs when `force_sync` is set, or when `fsync`
    /// is set and commits are configured to sync.
    pub fn flush(&self, fsync: bool, force_sync: bool) -> Result<()> {
        let sync = force_sync || (fsync && self.options.sync_on_commit);
        let state = self.state.lock();
        let state = self.write_buffer(state, sync)?;
        drop(state);
        Ok(())
    }

    /// Blocks until every entry up to `lsn` is on stable storage.
    ///
    /// The first caller to find no flush in progress writes and syncs the
    /// whole buffer; later callers whose LSN that covers return without
    /// their own sync.
    pub fn flush_durable(&self, lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        let mut led = false;
        loop {
            if state.durable_lsn >= lsn {
                if !led {
                    state.stats.piggybacked += 1;
                }
                return Ok(());
            }
            if state.flushing {
                self.flushed.wait(&mut state);
                continue;
            }
            led = true;
            state = self.write_buffer(state, true)?;
        }
    }

    /// Makes a commit at `lsn` durable according to the sync policy.
    pub fn commit_flush(&self, lsn: Lsn) -> Result<()> {
        if self.options.sync_on_commit {
            self.flush_durable(lsn)
        } else {
            self.flush(false, false)
        }
    }

    /// Writes a checkpoint record and drops journal files recovery no longer
    /// needs. Pages must already be synced up to the current LSN.
    ///
    /// `oldest_active` is the first LSN of the oldest transaction that still
    /// has unfinished writes; without one the checkpoint itself is the
    /// minimum.
    pub fn checkpoint(
        &self,
        next_txn: TxnId,
        active: Vec<TxnId>,
        oldest_active: Option<Lsn>,
    ) -> Result<Lsn> {
        let predicted = {
            let state = self.state.lock();
            let mut state = self.write_buffer(state, true)?;
            let size = state.file.append_offset;
            if size >= self.options.min_size || size >= self.options.max_size {
                self.switch_files_locked(&mut state)?;
            }
            state.next_lsn
        };
        let min_lsn = oldest_active.unwrap_or(predicted);
        let record = LogRecord::Checkpoint(CheckpointRecord {
            min_lsn,
            next_txn,
            active,
        });
        let lsn = self.log_operation(TxnId(0), &record)?;
        self.flush_durable(lsn)?;
        self.remove_obsolete_files(min_lsn)?;
        self.checkpoint_requested.store(false, Ordering::Release);
        info!(lsn = lsn.0, min_lsn = min_lsn.0, "journal.checkpoint");
        Ok(lsn)
    }

    /// Starts a new journal file.
    pub fn switch_files(&self) -> Result<()> {
        let state = self.state.lock();
        let mut state = self.write_buffer(state, true)?;
        self.switch_files_locked(&mut state)
    }

    /// Whether the journal grew past its size limit since the last checkpoint.
    pub fn checkpoint_requested(&self) -> bool {
        self.checkpoint_requested.load(Ordering::Acquire)
    }

    /// Stops accepting entries. With `flush` the buffer is synced first;
    /// without it buffered entries are dropped as in a crash.
    pub fn close(&self, flush: bool) -> Result<()> {
        let state = self.state.lock();
        let mut state = if flush {
            self.write_buffer(state, true)?
        } else {
            state
        };
        if !flush {
            let dropped = state.buffer.len();
            state.buffer.clear();
            debug!(dropped_bytes = dropped, "journal.close.discard_buffer");
        }
        state.closed = true;
        Ok(())
    }

    /// Last LSN handed out.
    pub fn current_lsn(&self) -> Lsn {
        Lsn(self.state.lock().next_lsn.0 - 1)
    }

    /// Highest LSN on stable storage.
    pub fn durable_lsn(&self) -> Lsn {
        self.state.lock().durable_lsn
    }

    /// Number of the file receiving entries.
    pub fn current_file(&self) -> u32 {
        self.state.lock().file.file_no
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> JournalStats {
        self.state.lock().stats.clone()
    }

    fn write_buffer<'a>(
        &'a self,
        mut state: MutexGuard<'a, JournalState>,
        sync: bool,
    ) -> Result<MutexGuard<'a, JournalState>> {
        while state.flushing {
            self.flushed.wait(&mut state);
        }
        let upto = Lsn(state.next_lsn.0 - 1);
        let need_sync = sync && state.durable_lsn < upto;
        if state.buffer.is_empty() && !need_sync {
            return Ok(state);
        }
        state.flushing = true;
        let buf = std::mem::take(&mut state.buffer);
        let io = Arc::clone(&state.file.io);
        let offset = state.file.append_offset;
        state.file.append_offset += buf.len() as u64;
        let result = MutexGuard::unlocked(&mut state, || -> Result<()> {
            if !buf.is_empty() {
                io.write_at(offset, &buf)?;
            }
            if need_sync {
                io.sync_all()?;
            }
            Ok(())
        });
        state.flushing = false;
        self.flushed.notify_all();
        if let Err(err) = result {
            state.file.append_offset = offset;
            let mut restored = buf;
            restored.extend_from_slice(&state.buffer);
            state.buffer = restored;
            warn!(error = %err, "journal.write_buffer.failed");
            return Err(err);
        }
        if !buf.is_empty() {
            state.stats.writes += 1;
            state.written_lsn = upto;
        }
        if need_sync {
            state.stats.syncs += 1;
            state.durable_lsn = upto;
            debug!(lsn = upto.0, "journal.flush.synced");
        }
        if state.file.append_offset >= self.options.max_size
            && !self.checkpoint_requested.swap(true, Ordering::AcqRel)
        {
            info!(
                file = state.file.file_no,
                size = state.file.append_offset,
                "journal.size_limit.checkpoint_requested"
            );
        }
        let mut buf = buf;
        buf.clear();
        if state.buffer.is_empty() {
            state.buffer = buf;
        }
        Ok(state)
    }

    fn switch_files_locked(&self, state: &mut JournalState) -> Result<()> {
        let file_no = state.file.file_no + 1;
        let file = create_file(&self.dir, file_no, state.next_lsn)?;
        debug!(
            from = state.file.file_no,
            to = file_no,
            start_lsn = state.next_lsn.0,
            "journal.switch_files"
        );
        state.file = file;
        state.stats.files_created += 1;
        Ok(())
    }

    fn remove_obsolete_files(&self, min_lsn: Lsn) -> Result<()> {
        let current = self.current_file();
        let files = list_journal_files(&self.dir)?;
        // A file is obsolete once its successor starts at or below min_lsn.
        let mut removed = 0u64;
        for window in files.windows(2) {
            let (no, path) = &window[0];
            let (_, next_path) = &window[1];
            if *no >= current {
                break;
            }
            if read_file_header(next_path)?.start_lsn <= min_lsn {
                fs::remove_file(path)?;
                removed += 1;
                debug!(file = *no, "journal.remove_file");
            } else {
                break;
            }
        }
        if removed > 0 {
            self.state.lock().stats.files_deleted += removed;
        }
        Ok(())
    }
}

fn create_file(dir: &Path, file_no: u32, start_lsn: Lsn) -> Result<ActiveFile> {
    let path = journal_file_path(dir, file_no);
    if path.exists() {
        let backup = path.with_extension("bak");
        warn!(file = file_no, "journal.create_file.backup_existing");
        fs::rename(&path, backup)?;
    }
    let io = StdFileIo::open(&path)?;
    io.truncate(0)?;
    let header = FileHeader { file_no, start_lsn };
    io.write_at(0, &header.encode())?;
    io.sync_all()?;
    Ok(ActiveFile {
        io: Arc::new(io),
        file_no,
        append_offset: FILE_HEADER_LEN as u64,
    })
}
