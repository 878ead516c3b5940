#![forbid(unsafe_code)]

//! Transactions over the page store and restart recovery.
//!
//! Every page mutation of a transaction is journaled before it is applied.
//! The first mutation takes the store's single writer latch, which the
//! transaction keeps until it ends; readers never take it.

mod recovery;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::concurrency::{CollectionLock, LockGuard, LockOwner, WriteLatch, WriteLatchGuard};
use crate::primitives::journal::{Journal, LogRecord};
use crate::primitives::pager::{LoggedWrite, PageStore, WriteLog};
use crate::types::{ArbolError, Lsn, Result, TxnId};

pub use recovery::{analyze, recover, JournalAnalysis, RecoveryReport};

/// Latch holder id used by checkpoints, which never collides with a
/// transaction id.
const CHECKPOINT_HOLDER: u64 = u64::MAX;

/// Lifecycle of a transaction.
///
/// `Active -> Committing -> Committed` or `Active -> Aborting -> Aborted`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TxnState {
    /// Accepting operations.
    Active,
    /// Commit record written, waiting for durability.
    Committing,
    /// Durable.
    Committed,
    /// Compensating its writes.
    Aborting,
    /// Rolled back.
    Aborted,
}

/// Counters kept by the transaction manager.
#[derive(Clone, Debug, Default)]
pub struct TxnStats {
    /// Transactions started.
    pub started: u64,
    /// Transactions committed.
    pub committed: u64,
    /// Transactions rolled back, explicitly or by drop.
    pub aborted: u64,
    /// Transactions whose commit or rollback failed part way.
    pub failed: u64,
    /// Checkpoints taken.
    pub checkpoints: u64,
}

/// Hands out transactions and coordinates checkpoints.
pub struct TxnManager {
    store: Arc<PageStore>,
    journal: Arc<Journal>,
    latch: WriteLatch,
    writer_timeout: Duration,
    next_txn: AtomicU64,
    active: Mutex<BTreeMap<TxnId, Lsn>>,
    stats: Mutex<TxnStats>,
    shut_down: AtomicBool,
}

impl TxnManager {
    /// Creates a manager whose first transaction id follows `last_txn`.
    pub fn new(store: Arc<PageStore>, last_txn: TxnId, writer_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            journal: store.journal().clone(),
            store,
            latch: WriteLatch::new(),
            writer_timeout,
            next_txn: AtomicU64::new(last_txn.0 + 1),
            active: Mutex::new(BTreeMap::new()),
            stats: Mutex::new(TxnStats::default()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Page store the transactions write to.
    pub fn store(&self) -> &Arc<PageStore> {
        &self.store
    }

    /// The single writer latch.
    pub fn latch(&self) -> &WriteLatch {
        &self.latch
    }

    /// Starts a transaction: allocates an id and journals its `Start` record.
    pub fn begin(self: &Arc<Self>) -> Result<Txn> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ArbolError::ShutDown);
        }
        let id = TxnId(self.next_txn.fetch_add(1, Ordering::AcqRel));
        let start_lsn = self.journal.log_operation(id, &LogRecord::Start)?;
        self.active.lock().insert(id, start_lsn);
        self.stats.lock().started += 1;
        debug!(txn = id.0, lsn = start_lsn.0, "txn.begin");
        Ok(Txn {
            id,
            manager: Arc::clone(self),
            state: TxnState::Active,
            start_lsn,
            started: Instant::now(),
            writes: Vec::new(),
            latch: None,
            locks: Vec::new(),
        })
    }

    /// Ids of the transactions that have not finished yet.
    pub fn active(&self) -> Vec<TxnId> {
        self.active.lock().keys().copied().collect()
    }

    /// Id the next transaction receives.
    pub fn next_txn(&self) -> TxnId {
        TxnId(self.next_txn.load(Ordering::Acquire))
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TxnStats {
        self.stats.lock().clone()
    }

    /// Whether `shutdown` has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Makes every page durable and cuts the journal.
    ///
    /// Waits for the writer latch, so no transaction has unfinished page
    /// writes while the checkpoint runs: recovery may start at the checkpoint
    /// itself.
    pub fn checkpoint(&self) -> Result<Lsn> {
        let _latch = self.latch.acquire(CHECKPOINT_HOLDER, self.writer_timeout)?;
        self.journal.flush(true, true)?;
        self.store.sync()?;
        let lsn = self
            .journal
            .checkpoint(self.next_txn(), self.active(), None)?;
        self.store.reset_full_image_tracking();
        self.stats.lock().checkpoints += 1;
        Ok(lsn)
    }

    /// Refuses new transactions. Unfinished ones are reported and left to
    /// their owners.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let active = self.active();
        if !active.is_empty() {
            warn!(count = active.len(), txns = ?active, "txn.shutdown.uncommitted");
        }
        info!("txn.shutdown");
    }

    fn finish(&self, id: TxnId, outcome: Outcome) {
        self.active.lock().remove(&id);
        let mut stats = self.stats.lock();
        match outcome {
            Outcome::Committed => stats.committed += 1,
            Outcome::Aborted => stats.aborted += 1,
            Outcome::Failed => stats.failed += 1,
        }
    }
}

#[derive(Copy, Clone)]
enum Outcome {
    Committed,
    Aborted,
    Failed,
}

/// Lock held on behalf of a transaction until it ends.
enum HeldLock {
    Resource(LockGuard),
    Collection(CollectionLock),
}

/// A transaction.
///
/// Obtained from [`TxnManager::begin`]. Pass it as the [`WriteLog`] of every
/// page-mutating call; the first such call takes the writer latch. A
/// transaction ends with [`Txn::commit`] or [`Txn::abort`]. Dropping an
/// active transaction aborts it.
///
/// Locks handed to [`Txn::hold`] or [`Txn::hold_collection`] are released
/// when the transaction ends, after the writer latch.
pub struct Txn {
    id: TxnId,
    manager: Arc<TxnManager>,
    state: TxnState,
    start_lsn: Lsn,
    started: Instant,
    writes: Vec<LoggedWrite>,
    latch: Option<WriteLatchGuard>,
    locks: Vec<HeldLock>,
}

impl Txn {
    /// Transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Lock owner standing for this transaction.
    pub fn owner(&self) -> LockOwner {
        LockOwner::from(self.id)
    }

    /// Current state.
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// LSN of the `Start` record.
    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    /// Number of journaled page writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Whether the transaction holds the writer latch.
    pub fn is_writer(&self) -> bool {
        self.latch.is_some()
    }

    /// Keeps a resource lock until the transaction ends.
    pub fn hold(&mut self, guard: LockGuard) {
        self.locks.push(HeldLock::Resource(guard));
    }

    /// Keeps a collection lock chain until the transaction ends.
    pub fn hold_collection(&mut self, lock: CollectionLock) {
        self.locks.push(HeldLock::Collection(lock));
    }

    /// Commits: journals `Commit`, releases the writer latch, then waits for
    /// the commit record to become durable.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active("commit on a finished transaction")?;
        self.state = TxnState::Committing;
        let journal = self.manager.journal.clone();
        let lsn = match journal.log_operation(self.id, &LogRecord::Commit) {
            Ok(lsn) => lsn,
            Err(err) => {
                warn!(txn = self.id.0, error = %err, "txn.commit.log_failed");
                self.rollback()?;
                return Err(err);
            }
        };
        let wrote = !self.writes.is_empty();
        self.latch = None;
        if wrote {
            if let Err(err) = journal.commit_flush(lsn) {
                warn!(txn = self.id.0, lsn = lsn.0, error = %err, "txn.commit.flush_failed");
                self.fail();
                return Err(err);
            }
        }
        self.state = TxnState::Committed;
        self.end(Outcome::Committed);
        debug!(
            txn = self.id.0,
            lsn = lsn.0,
            writes = self.writes.len(),
            elapsed_us = self.started.elapsed().as_micros() as u64,
            "txn.commit"
        );
        Ok(())
    }

    /// Rolls back every write of the transaction.
    pub fn abort(&mut self) -> Result<()> {
        self.ensure_active("abort on a finished transaction")?;
        self.rollback()
    }

    /// Aborts an active transaction; no-op once it has ended.
    pub fn close(&mut self) {
        if self.state != TxnState::Active {
            return;
        }
        warn!(txn = self.id.0, writes = self.writes.len(), "txn.close.abort_active");
        if let Err(err) = self.rollback() {
            warn!(txn = self.id.0, error = %err, "txn.close.abort_failed");
        }
    }

    fn rollback(&mut self) -> Result<()> {
        self.state = TxnState::Aborting;
        if let Err(err) = self.compensate_all() {
            warn!(txn = self.id.0, error = %err, "txn.abort.failed");
            self.fail();
            return Err(err);
        }
        self.latch = None;
        self.state = TxnState::Aborted;
        self.end(Outcome::Aborted);
        debug!(txn = self.id.0, undone = self.writes.len(), "txn.abort");
        Ok(())
    }

    fn compensate_all(&self) -> Result<()> {
        let store = &self.manager.store;
        for write in self.writes.iter().rev() {
            store.compensate(self.id, write.lsn, write.page, write.offset, &write.before)?;
        }
        let journal = &self.manager.journal;
        journal.log_operation(self.id, &LogRecord::Abort)?;
        journal.flush(false, false)
    }

    /// Unregisters a transaction whose commit or rollback stopped part way.
    /// The state stays where it stopped, so further use is refused. A half
    /// rolled back transaction keeps the writer latch until it is dropped;
    /// restart recovery settles its writes.
    fn fail(&mut self) {
        self.end(Outcome::Failed);
    }

    fn end(&mut self, outcome: Outcome) {
        while let Some(lock) = self.locks.pop() {
            match lock {
                HeldLock::Resource(guard) => drop(guard),
                HeldLock::Collection(chain) => drop(chain),
            }
        }
        self.manager.finish(self.id, outcome);
    }

    fn ensure_active(&self, reason: &'static str) -> Result<()> {
        if self.state == TxnState::Active {
            Ok(())
        } else {
            Err(ArbolError::TxnMisuse {
                txn: self.id,
                reason,
            })
        }
    }
}

impl WriteLog for Txn {
    fn txn_id(&self) -> TxnId {
        self.id
    }

    fn prepare_write(&mut self) -> Result<()> {
        self.ensure_active("mutation through a finished transaction")?;
        if self.latch.is_none() {
            let timeout = self.manager.writer_timeout;
            self.latch = Some(self.manager.latch.acquire(self.id.0, timeout)?);
        }
        Ok(())
    }

    fn logged(&mut self, write: LoggedWrite) {
        self.writes.push(write);
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("writes", &self.writes.len())
            .field("writer", &self.latch.is_some())
            .finish()
    }
}
