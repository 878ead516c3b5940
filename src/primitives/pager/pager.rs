use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::frame::Frame;
use super::meta::{create_meta, decode_meta, encode_meta, load_meta, Meta};
use crate::primitives::io::FileIo;
use crate::primitives::journal::{Compensation, Journal, LogRecord, PageOp, PageWrite};
use crate::types::{
    page::{self, header, PAGE_MAGIC},
    ArbolError, Lsn, PageId, Result, TxnId,
};

/// Sink for the page mutations of one transaction.
///
/// The page store calls [`WriteLog::prepare_write`] before touching anything
/// and reports every journaled change through [`WriteLog::logged`], so the
/// owner can undo it later.
pub trait WriteLog {
    /// Transaction the journal entries belong to.
    fn txn_id(&self) -> TxnId;
    /// Called before a mutation; may block to acquire write access.
    fn prepare_write(&mut self) -> Result<()>;
    /// Receives the undo information of a journaled write.
    fn logged(&mut self, write: LoggedWrite);
}

/// Undo information for one journaled page write.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoggedWrite {
    /// LSN of the `PageWrite` entry.
    pub lsn: Lsn,
    /// Page written.
    pub page: PageId,
    /// Start of the changed range.
    pub offset: u32,
    /// Bytes the range held before the write.
    pub before: Vec<u8>,
}

/// Page store configuration.
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Page size used when creating a new file.
    pub page_size: u32,
    /// Pages kept in the cache.
    pub cache_pages: usize,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: page::DEFAULT_PAGE_SIZE,
            cache_pages: 1024,
        }
    }
}

/// Page store counters.
#[derive(Clone, Debug, Default)]
pub struct PagerStats {
    /// Cache hits.
    pub hits: u64,
    /// Cache misses.
    pub misses: u64,
    /// Frames evicted from the cache.
    pub evictions: u64,
    /// Dirty pages written to the file.
    pub dirty_writebacks: u64,
    /// `PageWrite` entries journaled.
    pub journaled_writes: u64,
    /// Of those, entries carrying a full page image.
    pub full_images: u64,
    /// Page file syncs.
    pub syncs: u64,
}

struct PagerInner {
    frames: LruCache<PageId, Frame>,
    /// Pages journaled since the last checkpoint. The first write to any other
    /// page logs the full page so redo can rebuild a torn page.
    imaged: HashSet<PageId>,
    stats: PagerStats,
}

/// Fixed-size page file with an LRU cache, journaling every mutation before it
/// is applied.
pub struct PageStore {
    io: Arc<dyn FileIo>,
    journal: Arc<Journal>,
    page_size: usize,
    salt: u64,
    inner: Mutex<PagerInner>,
    recovering: AtomicBool,
}

impl PageStore {
    /// Opens the page file, formatting page 0 when the file is empty.
    ///
    /// With `tolerate_damage` checksum failures on read are accepted (logged
    /// and replaced by blank pages) until [`PageStore::set_recovering`] is
    /// cleared.
    pub fn open(
        io: Arc<dyn FileIo>,
        journal: Arc<Journal>,
        options: &PagerOptions,
        tolerate_damage: bool,
    ) -> Result<(Self, bool)> {
        let created = io.is_empty()?;
        let (meta, page0) = if created {
            let meta = create_meta(io.as_ref(), options.page_size)?;
            let (_, page0) = load_meta(io.as_ref(), false)?;
            info!(page_size = meta.page_size, "pager.create");
            (meta, page0)
        } else {
            load_meta(io.as_ref(), tolerate_damage)?
        };
        if !created && meta.page_size != options.page_size {
            warn!(
                configured = options.page_size,
                stored = meta.page_size,
                "pager.open.page_size_from_file"
            );
        }
        let capacity = NonZeroUsize::new(options.cache_pages.max(16))
            .ok_or(ArbolError::Invalid("cache must hold at least one page"))?;
        let mut frames = LruCache::new(capacity);
        frames.put(PageId(0), Frame::clean(page0));
        let store = Self {
            io,
            journal,
            page_size: meta.page_size as usize,
            salt: meta.salt,
            inner: Mutex::new(PagerInner {
                frames,
                imaged: HashSet::new(),
                stats: PagerStats::default(),
            }),
            recovering: AtomicBool::new(tolerate_damage),
        };
        debug!(
            next_page = meta.next_page.0,
            free_pages = meta.free_pages,
            "pager.open"
        );
        Ok((store, created))
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The journal this store writes ahead to.
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// Switches damage tolerance used while recovery replays the journal.
    pub fn set_recovering(&self, recovering: bool) {
        self.recovering.store(recovering, Ordering::Release);
    }

    /// Runs `f` over the current image of a page.
    pub fn with_page<R>(&self, id: PageId, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let mut inner = self.inner.lock();
        let frame = self.load_frame(&mut inner, id)?;
        Ok(f(&frame.data))
    }

    /// Copies the current image of a page.
    pub fn read_page(&self, id: PageId) -> Result<Vec<u8>> {
        self.with_page(id, |data| data.to_vec())
    }

    /// Replaces a page image, journaling the changed byte range first.
    ///
    /// The header LSN and checksum of `image` are ignored; the store stamps
    /// the LSN of the new journal entry.
    pub fn write_page(
        &self,
        log: &mut dyn WriteLog,
        id: PageId,
        op: PageOp,
        image: &[u8],
    ) -> Result<()> {
        if image.len() != self.page_size {
            return Err(ArbolError::Invalid("page image has the wrong size"));
        }
        log.prepare_write()?;
        let txn = log.txn_id();
        let mut inner = self.inner.lock();
        let first_touch = !inner.imaged.contains(&id);
        let frame = self.load_frame(&mut inner, id)?;
        let mut next = image.to_vec();
        next[header::LSN].copy_from_slice(&frame.data[header::LSN]);
        next[header::CRC32].copy_from_slice(&frame.data[header::CRC32]);
        let Some(changed) = diff_range(&frame.data, &next) else {
            return Ok(());
        };
        let range = if first_touch { 0..self.page_size } else { changed };
        let before = frame.data[range.clone()].to_vec();
        let record = LogRecord::PageWrite(PageWrite {
            page: id,
            op,
            offset: range.start as u32,
            before: before.clone(),
            after: next[range.clone()].to_vec(),
        });
        let lsn = self.journal.log_operation(txn, &record)?;
        frame.data[range.clone()].copy_from_slice(&next[range.clone()]);
        stamp_lsn(&mut frame.data, lsn);
        frame.dirty = true;
        inner.stats.journaled_writes += 1;
        if first_touch {
            inner.imaged.insert(id);
            inner.stats.full_images += 1;
        }
        drop(inner);
        log.logged(LoggedWrite {
            lsn,
            page: id,
            offset: range.start as u32,
            before,
        });
        Ok(())
    }

    /// Current meta page contents.
    pub fn meta(&self) -> Result<Meta> {
        self.with_page(PageId(0), decode_meta)?
    }

    /// Journals a new meta page.
    pub fn write_meta(&self, log: &mut dyn WriteLog, meta: &Meta) -> Result<()> {
        log.prepare_write()?;
        let mut image = self.read_page(PageId(0))?;
        encode_meta(&mut image, meta);
        self.write_page(log, PageId(0), PageOp::Meta, &image)
    }

    /// Read-modify-write of the meta page.
    pub fn update_meta<R>(
        &self,
        log: &mut dyn WriteLog,
        f: impl FnOnce(&mut Meta) -> R,
    ) -> Result<R> {
        log.prepare_write()?;
        let mut meta = self.meta()?;
        let out = f(&mut meta);
        self.write_meta(log, &meta)?;
        Ok(out)
    }

    /// Writes every dirty page and syncs the file, flushing the journal first
    /// as far as the newest dirty page requires.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let dirty: Vec<PageId> = inner
            .frames
            .iter()
            .filter(|(_, frame)| frame.dirty)
            .map(|(id, _)| *id)
            .collect();
        let max_lsn = inner
            .frames
            .iter()
            .filter(|(_, frame)| frame.dirty)
            .map(|(_, frame)| frame.lsn())
            .max()
            .unwrap_or(Lsn::ZERO);
        if max_lsn > self.journal.durable_lsn() {
            self.journal.flush_durable(max_lsn)?;
        }
        for id in &dirty {
            if let Some(frame) = inner.frames.peek(id) {
                self.write_back(*id, &frame.data)?;
            }
            if let Some(frame) = inner.frames.peek_mut(id) {
                frame.dirty = false;
            }
            inner.stats.dirty_writebacks += 1;
        }
        self.io.sync_all()?;
        inner.stats.syncs += 1;
        debug!(pages = dirty.len(), max_lsn = max_lsn.0, "pager.sync");
        Ok(())
    }

    /// Starts a new full-image epoch; called right after a checkpoint.
    pub fn reset_full_image_tracking(&self) {
        self.inner.lock().imaged.clear();
    }

    /// Drops every cached page without writing it back.
    pub fn discard_cache(&self) {
        let mut inner = self.inner.lock();
        let dirty = inner.frames.iter().filter(|(_, f)| f.dirty).count();
        inner.frames.clear();
        warn!(dirty, "pager.discard_cache");
    }

    /// Applies a redo image during recovery without journaling it.
    pub fn redo_write(&self, lsn: Lsn, id: PageId, offset: u32, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let frame = self.load_frame(&mut inner, id)?;
        let range = checked_range(offset, bytes.len(), frame.data.len())?;
        frame.data[range].copy_from_slice(bytes);
        stamp_lsn(&mut frame.data, lsn);
        frame.dirty = true;
        Ok(())
    }

    /// Restores an undo image during recovery without journaling it.
    pub fn undo_write(&self, id: PageId, offset: u32, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let frame = self.load_frame(&mut inner, id)?;
        let range = checked_range(offset, bytes.len(), frame.data.len())?;
        frame.data[range].copy_from_slice(bytes);
        frame.dirty = true;
        Ok(())
    }

    /// Applies a compensation at runtime: journals a redo-only entry and
    /// restores `bytes`.
    pub fn compensate(
        &self,
        txn: TxnId,
        undoes: Lsn,
        id: PageId,
        offset: u32,
        bytes: &[u8],
    ) -> Result<Lsn> {
        let mut inner = self.inner.lock();
        let frame = self.load_frame(&mut inner, id)?;
        let range = checked_range(offset, bytes.len(), frame.data.len())?;
        let record = LogRecord::Compensation(Compensation {
            page: id,
            offset,
            after: bytes.to_vec(),
            undoes,
        });
        let lsn = self.journal.log_operation(txn, &record)?;
        frame.data[range].copy_from_slice(bytes);
        stamp_lsn(&mut frame.data, lsn);
        frame.dirty = true;
        Ok(lsn)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PagerStats {
        self.inner.lock().stats.clone()
    }

    /// Number of pages the file spans according to the meta page.
    pub fn page_count(&self) -> Result<u64> {
        Ok(self.meta()?.next_page.0)
    }

    fn load_frame<'a>(&self, inner: &'a mut PagerInner, id: PageId) -> Result<&'a mut Frame> {
        if inner.frames.contains(&id) {
            inner.stats.hits += 1;
        } else {
            inner.stats.misses += 1;
            let data = self.read_from_disk(id)?;
            self.make_room(inner)?;
            inner.frames.put(id, Frame::clean(data));
        }
        inner
            .frames
            .get_mut(&id)
            .ok_or(ArbolError::Corruption("page frame missing after load"))
    }

    fn make_room(&self, inner: &mut PagerInner) -> Result<()> {
        while inner.frames.len() >= inner.frames.cap().get() {
            let Some((&victim, frame)) = inner.frames.peek_lru() else {
                break;
            };
            if frame.dirty {
                let lsn = frame.lsn();
                if lsn > self.journal.durable_lsn() {
                    self.journal.flush_durable(lsn)?;
                }
                self.write_back(victim, &frame.data)?;
                inner.stats.dirty_writebacks += 1;
            }
            inner.frames.pop_lru();
            inner.stats.evictions += 1;
        }
        Ok(())
    }

    fn write_back(&self, id: PageId, data: &[u8]) -> Result<()> {
        let mut out = data.to_vec();
        if out[header::MAGIC] == PAGE_MAGIC {
            page::seal_page(&mut out, id, self.salt);
        } else {
            // An undo restored the page to its never-written state.
            out.fill(0);
        }
        self.io.write_at(id.0 * self.page_size as u64, &out)
    }

    fn read_from_disk(&self, id: PageId) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size];
        let got = self
            .io
            .read_at_or_zero(id.0 * self.page_size as u64, &mut buf)?;
        if got == 0 {
            return Ok(buf);
        }
        let result = if got < self.page_size {
            Err(ArbolError::Corruption("page truncated at end of file"))
        } else {
            page::verify_page(&mut buf, id, self.salt).map(|_| ())
        };
        match result {
            Ok(()) => Ok(buf),
            Err(err) if err.is_corruption() && self.recovering.load(Ordering::Acquire) => {
                warn!(page = id.0, error = %err, "pager.read.damaged_page_blanked");
                buf.fill(0);
                Ok(buf)
            }
            Err(err) => Err(err),
        }
    }
}

/// Stamps the LSN of a formatted page; unformatted pages stay all-zero.
fn stamp_lsn(data: &mut [u8], lsn: Lsn) {
    if data[header::MAGIC] == PAGE_MAGIC {
        page::set_page_lsn(data, lsn);
    }
}

/// Smallest range covering every differing byte.
fn diff_range(old: &[u8], new: &[u8]) -> Option<std::ops::Range<usize>> {
    let start = old.iter().zip(new).position(|(a, b)| a != b)?;
    let end = old.len() - old.iter().rev().zip(new.iter().rev()).position(|(a, b)| a != b)?;
    Some(start..end)
}

fn checked_range(offset: u32, len: usize, page_size: usize) -> Result<std::ops::Range<usize>> {
    let start = offset as usize;
    let end = start
        .checked_add(len)
        .filter(|&end| end <= page_size)
        .ok_or(ArbolError::Corruption("journal image outside page bounds"))?;
    Ok(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::StdFileIo;
    use crate::primitives::journal::{JournalOptions, JournalReader};
    use crate::types::page::{format_page, PageKind};
    use std::sync::Once;
    use tempfile::{tempdir, TempDir};

    fn init_tracing() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }

    struct TestLog {
        txn: TxnId,
        writes: Vec<LoggedWrite>,
    }

    impl WriteLog for TestLog {
        fn txn_id(&self) -> TxnId {
            self.txn
        }

        fn prepare_write(&mut self) -> Result<()> {
            Ok(())
        }

        fn logged(&mut self, write: LoggedWrite) {
            self.writes.push(write);
        }
    }

    fn open_store(dir: &TempDir, cache_pages: usize) -> Result<PageStore> {
        init_tracing();
        let jdir = dir.path().join("journal");
        let scan = JournalReader::open(&jdir)?.scan(|_| Ok(()))?;
        let journal = Arc::new(Journal::open(&jdir, JournalOptions::default(), &scan)?);
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(dir.path().join("store.dbx"))?);
        let options = PagerOptions {
            page_size: 1024,
            cache_pages,
        };
        Ok(PageStore::open(io, journal, &options, false)?.0)
    }

    fn log() -> TestLog {
        TestLog {
            txn: TxnId(1),
            writes: Vec::new(),
        }
    }

    #[test]
    fn first_write_logs_full_image_then_diffs() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, 16)?;
        let mut log = log();
        let page = store.allocate_page(&mut log)?;
        let mut image = vec![0u8; 1024];
        format_page(&mut image, page, PageKind::DomData)?;
        store.write_page(&mut log, page, PageOp::NodeData, &image)?;
        image[500] = 9;
        store.write_page(&mut log, page, PageOp::NodeData, &image)?;
        let last = log.writes.last().unwrap();
        assert_eq!(last.offset, 500);
        assert_eq!(last.before, vec![0]);
        assert_eq!(store.read_page(page)?[500], 9);
        assert!(store.stats().full_images >= 2);
        Ok(())
    }

    #[test]
    fn identical_image_is_not_journaled() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, 16)?;
        let mut log = log();
        let image = store.read_page(PageId(0))?;
        store.write_page(&mut log, PageId(0), PageOp::Meta, &image)?;
        assert!(log.writes.is_empty());
        Ok(())
    }

    #[test]
    fn eviction_respects_write_ahead() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, 16)?;
        let mut log = log();
        let mut pages = Vec::new();
        for n in 0..40u8 {
            let page = store.allocate_page(&mut log)?;
            let mut image = vec![0u8; 1024];
            format_page(&mut image, page, PageKind::DomData)?;
            image[200] = n;
            store.write_page(&mut log, page, PageOp::NodeData, &image)?;
            pages.push((page, n));
        }
        assert!(store.stats().evictions > 0);
        let durable = store.journal().durable_lsn();
        assert!(durable > Lsn::ZERO, "evicting dirty pages must flush the journal");
        for (page, n) in pages {
            assert_eq!(store.read_page(page)?[200], n);
        }
        Ok(())
    }

    #[test]
    fn free_list_reuses_pages() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, 64)?;
        let mut log = log();
        let a = store.allocate_page(&mut log)?;
        let b = store.allocate_page(&mut log)?;
        let c = store.allocate_page(&mut log)?;
        store.free_page(&mut log, b)?;
        store.free_page(&mut log, c)?;
        assert_eq!(store.meta()?.free_pages, 2);
        let listed = store.free_list()?;
        assert_eq!(listed, vec![b, c]);
        let reused = store.allocate_page(&mut log)?;
        assert_eq!(reused, c);
        let reused = store.allocate_page(&mut log)?;
        assert_eq!(reused, b);
        assert_eq!(store.meta()?.free_pages, 0);
        let fresh = store.allocate_page(&mut log)?;
        assert_eq!(fresh, PageId(a.0 + 3));
        assert!(store.free_page(&mut log, PageId(999)).is_err());
        Ok(())
    }

    #[cfg(debug_assertions)]
    #[test]
    fn double_free_is_rejected() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, 64)?;
        let mut log = log();
        let a = store.allocate_page(&mut log)?;
        let b = store.allocate_page(&mut log)?;
        store.free_page(&mut log, a)?;
        // `a` now heads the list as a trunk page, `b` becomes an entry on it.
        assert!(matches!(store.free_page(&mut log, a), Err(ArbolError::Invalid(_))));
        store.free_page(&mut log, b)?;
        assert!(matches!(store.free_page(&mut log, b), Err(ArbolError::Invalid(_))));
        assert_eq!(store.meta()?.free_pages, 2);
        assert_eq!(store.free_list()?, vec![a, b]);
        Ok(())
    }

    #[test]
    fn sync_persists_pages_across_reopen() -> Result<()> {
        let dir = tempdir().unwrap();
        let page = {
            let store = open_store(&dir, 16)?;
            let mut log = log();
            let page = store.allocate_page(&mut log)?;
            let mut image = vec![0u8; 1024];
            format_page(&mut image, page, PageKind::Overflow)?;
            image[1000] = 0x5A;
            store.write_page(&mut log, page, PageOp::Overflow, &image)?;
            store.sync()?;
            page
        };
        let store = open_store(&dir, 16)?;
        assert_eq!(store.read_page(page)?[1000], 0x5A);
        assert_eq!(store.meta()?.next_page, PageId(page.0 + 1));
        Ok(())
    }

    #[test]
    fn diff_range_bounds() {
        assert_eq!(diff_range(&[1, 2, 3, 4], &[1, 9, 9, 4]), Some(1..3));
        assert_eq!(diff_range(&[1, 2], &[1, 2]), None);
        assert_eq!(diff_range(&[1, 2, 3], &[0, 2, 3]), Some(0..1));
    }
}
