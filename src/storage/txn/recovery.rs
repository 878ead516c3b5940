use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::primitives::journal::{CheckpointRecord, JournalReader, LogRecord, ScanSummary};
use crate::primitives::pager::PageStore;
use crate::types::{Lsn, PageId, Result, TxnId};

/// What a journal scan found before the journal is reopened for writing.
#[derive(Clone, Debug, Default)]
pub struct JournalAnalysis {
    /// Scan totals, including a torn tail if one was dropped.
    pub summary: ScanSummary,
    /// Last checkpoint record and its LSN.
    pub checkpoint: Option<(Lsn, CheckpointRecord)>,
}

impl JournalAnalysis {
    /// LSN recovery starts from.
    pub fn redo_start(&self) -> Lsn {
        self.checkpoint
            .as_ref()
            .map(|(_, record)| record.min_lsn)
            .unwrap_or(Lsn::ZERO)
    }

    /// Highest transaction id the journal knows about.
    pub fn last_txn(&self) -> TxnId {
        let from_checkpoint = self
            .checkpoint
            .as_ref()
            .map(|(_, record)| TxnId(record.next_txn.0.saturating_sub(1)))
            .unwrap_or_default();
        from_checkpoint.max(self.summary.max_txn)
    }
}

/// Outcome of a recovery run.
#[derive(Clone, Debug, Default)]
pub struct RecoveryReport {
    /// First LSN considered.
    pub from: Lsn,
    /// Last LSN replayed.
    pub last_lsn: Lsn,
    /// Page images reapplied.
    pub redone: u64,
    /// Before-images restored for unfinished transactions.
    pub undone: u64,
    /// Transactions that ended with `Commit`.
    pub committed: usize,
    /// Transactions that ended with `Abort`.
    pub aborted: usize,
    /// Transactions rolled back by the undo pass.
    pub losers: Vec<TxnId>,
}

/// Reads the whole journal once, remembering the last checkpoint.
pub fn analyze(reader: &JournalReader) -> Result<JournalAnalysis> {
    let mut checkpoint = None;
    let summary = reader.scan(|entry| {
        if let LogRecord::Checkpoint(record) = &entry.record {
            checkpoint = Some((entry.lsn, record.clone()));
        }
        Ok(())
    })?;
    debug!(
        entries = summary.entries,
        last_lsn = summary.last_lsn.0,
        torn_tail = summary.torn_tail,
        checkpoint = checkpoint.as_ref().map(|(lsn, _): &(Lsn, _)| lsn.0),
        "recovery.analyze"
    );
    Ok(JournalAnalysis {
        summary,
        checkpoint,
    })
}

struct UndoImage {
    lsn: Lsn,
    page: PageId,
    offset: u32,
    before: Vec<u8>,
}

/// Brings the page store to the state of every committed transaction.
///
/// Every page image at or after `from` is reapplied in LSN order, whether
/// its transaction finished or not. Transactions without a `Commit` or
/// `Abort` record are then rolled back from their before-images, newest
/// first. Aborted transactions need no undo: their compensations were
/// journaled and are part of the redo. The store is synced before returning;
/// the caller checkpoints.
///
/// Running it again over the same journal gives the same pages.
pub fn recover(store: &PageStore, reader: &JournalReader, from: Lsn) -> Result<RecoveryReport> {
    store.set_recovering(true);
    let mut report = RecoveryReport {
        from,
        ..RecoveryReport::default()
    };
    let mut pending: BTreeMap<TxnId, Vec<UndoImage>> = BTreeMap::new();
    let mut finished: BTreeSet<TxnId> = BTreeSet::new();
    reader.replay(from, |entry| {
        report.last_lsn = entry.lsn;
        match &entry.record {
            LogRecord::PageWrite(write) => {
                store.redo_write(entry.lsn, write.page, write.offset, &write.after)?;
                report.redone += 1;
                pending.entry(entry.txn).or_default().push(UndoImage {
                    lsn: entry.lsn,
                    page: write.page,
                    offset: write.offset,
                    before: write.before.clone(),
                });
            }
            LogRecord::Compensation(comp) => {
                store.redo_write(entry.lsn, comp.page, comp.offset, &comp.after)?;
                report.redone += 1;
            }
            LogRecord::Commit => {
                pending.remove(&entry.txn);
                finished.insert(entry.txn);
                report.committed += 1;
            }
            LogRecord::Abort => {
                pending.remove(&entry.txn);
                finished.insert(entry.txn);
                report.aborted += 1;
            }
            LogRecord::Start | LogRecord::Checkpoint(_) => {}
        }
        Ok(())
    })?;

    let mut undo: Vec<UndoImage> = Vec::new();
    for (txn, images) in pending {
        if finished.contains(&txn) {
            continue;
        }
        warn!(txn = txn.0, writes = images.len(), "recovery.undo.loser");
        report.losers.push(txn);
        undo.extend(images);
    }
    undo.sort_by(|a, b| b.lsn.cmp(&a.lsn));
    for image in &undo {
        store.undo_write(image.page, image.offset, &image.before)?;
        report.undone += 1;
    }
    store.sync()?;
    store.set_recovering(false);
    info!(
        from = from.0,
        last_lsn = report.last_lsn.0,
        redone = report.redone,
        undone = report.undone,
        losers = report.losers.len(),
        "recovery.complete"
    );
    Ok(report)
}
