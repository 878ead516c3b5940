use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::config::StoreConfig;
use crate::primitives::concurrency::{DataDirLock, LockManager};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::journal::{Journal, JournalReader};
use crate::primitives::pager::PageStore;
use crate::storage::catalog::Catalog;
use crate::storage::txn::{analyze, recover, RecoveryReport, Txn, TxnManager};
use crate::types::{ArbolError, Lsn, Result};

/// Page file name inside the data directory.
pub const PAGE_FILE_NAME: &str = "arbol.dbx";
/// Journal directory name inside the data directory.
pub const JOURNAL_DIR_NAME: &str = "journal";
/// Marker written by a clean shutdown and removed on open.
pub const CLEAN_SHUTDOWN_MARKER: &str = "clean_shutdown";

/// Everything one open store consists of.
///
/// Opening runs recovery when the previous run did not shut down cleanly,
/// before anything else can touch the pages.
pub struct Store {
    dir: PathBuf,
    config: StoreConfig,
    dir_lock: Mutex<Option<DataDirLock>>,
    journal: Arc<Journal>,
    pages: Arc<PageStore>,
    txns: Arc<TxnManager>,
    catalog: Catalog,
    locks: LockManager,
    recovery: Option<RecoveryReport>,
    closed: AtomicBool,
}

impl Store {
    /// Opens or creates the store in `dir`.
    pub fn open(dir: impl AsRef<Path>, config: &StoreConfig) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|err| ArbolError::InvalidOwned(err.to_string()))?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let dir_lock = DataDirLock::acquire(&dir)?;

        let page_path = dir.join(PAGE_FILE_NAME);
        let existed = fs::metadata(&page_path).map(|m| m.len() > 0).unwrap_or(false);
        let marker = dir.join(CLEAN_SHUTDOWN_MARKER);
        let clean = marker.exists();
        let needs_recovery = existed && !clean;
        if clean {
            fs::remove_file(&marker)?;
        }

        let journal_dir = dir.join(JOURNAL_DIR_NAME);
        fs::create_dir_all(&journal_dir)?;
        let analysis = analyze(&JournalReader::open(&journal_dir)?)?;
        if analysis.summary.torn_tail && !needs_recovery {
            warn!(dir = %dir.display(), "store.open.torn_journal_after_clean_shutdown");
        }
        let journal = Arc::new(Journal::open(
            &journal_dir,
            config.journal_options(),
            &analysis.summary,
        )?);
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&page_path)?);
        let (pages, created) =
            PageStore::open(io, journal.clone(), &config.pager_options(), needs_recovery)?;
        let pages = Arc::new(pages);
        let txns = TxnManager::new(pages.clone(), analysis.last_txn(), config.pool.writer_timeout());

        let recovery = if needs_recovery {
            warn!(dir = %dir.display(), from = analysis.redo_start().0, "store.open.recovering");
            // Rescan: opening the journal may have cut a torn tail.
            let reader = JournalReader::open(&journal_dir)?;
            let report = recover(&pages, &reader, analysis.redo_start())?;
            txns.checkpoint()?;
            Some(report)
        } else {
            None
        };

        let catalog = if Catalog::is_initialized(&pages)? {
            Catalog::open(pages.clone())?
        } else {
            let mut txn = txns.begin()?;
            let catalog = Catalog::create(pages.clone(), &mut txn)?;
            txn.commit()?;
            catalog
        };
        let locks = LockManager::new(config.locks.timeout(), config.locks.single_writer_collections);
        info!(
            dir = %dir.display(),
            created,
            recovered = recovery.is_some(),
            page_size = pages.page_size(),
            "store.open"
        );
        Ok(Arc::new(Self {
            dir,
            config: config.clone(),
            dir_lock: Mutex::new(Some(dir_lock)),
            journal,
            pages,
            txns,
            catalog,
            locks,
            recovery,
            closed: AtomicBool::new(false),
        }))
    }

    /// Data directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Configuration the store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The journal.
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// The page store.
    pub fn pages(&self) -> &Arc<PageStore> {
        &self.pages
    }

    /// The transaction manager.
    pub fn txns(&self) -> &Arc<TxnManager> {
        &self.txns
    }

    /// The catalog trees.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The lock manager.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Report of the recovery run at open, if one was needed.
    pub fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    /// Starts a transaction.
    pub fn begin(&self) -> Result<Txn> {
        self.txns.begin()
    }

    /// Syncs pages and cuts the journal.
    pub fn checkpoint(&self) -> Result<Lsn> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ArbolError::ShutDown);
        }
        self.txns.checkpoint()
    }

    /// Checkpoints when the journal has grown past its limit.
    pub fn checkpoint_if_requested(&self) -> Result<Option<Lsn>> {
        if self.closed.load(Ordering::Acquire) || !self.journal.checkpoint_requested() {
            return Ok(None);
        }
        self.txns.checkpoint().map(Some)
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Shuts the store down and releases the data directory.
    ///
    /// A clean close checkpoints and leaves the clean-shutdown marker. With
    /// `simulate_crash` the store stops as a killed process would after its
    /// last journal flush: buffered journal entries and cached pages are
    /// dropped and the next open recovers.
    pub fn close(&self, simulate_crash: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.txns.shutdown();
        let result = if simulate_crash {
            warn!(dir = %self.dir.display(), "store.close.simulated_crash");
            self.pages.discard_cache();
            self.journal.close(false)
        } else {
            self.close_cleanly()
        };
        self.dir_lock.lock().take();
        result
    }

    fn close_cleanly(&self) -> Result<()> {
        if let Err(err) = self.txns.checkpoint() {
            warn!(error = %err, "store.close.checkpoint_failed");
            self.journal.close(true)?;
            return Err(err);
        }
        self.journal.close(true)?;
        let marker = self.dir.join(CLEAN_SHUTDOWN_MARKER);
        fs::write(&marker, b"")?;
        fs::File::open(&marker)?.sync_all()?;
        info!(dir = %self.dir.display(), "store.close");
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(err) = self.close(false) {
            warn!(error = %err, "store.drop.close_failed");
        }
    }
}
