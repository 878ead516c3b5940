#![forbid(unsafe_code)]
//! Identifier newtypes, the crate error type and on-disk page metadata.

use std::fmt;
use std::io;
use std::time::Duration;

mod checksum;
pub mod page;

pub use checksum::{page_crc32, Checksum, Crc32Fast};

/// Page number inside the page file. Page 0 is the meta page.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u64);

/// Log sequence number. Assigned by the journal, gap-free and monotonic.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Lsn(pub u64);

/// Transaction identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TxnId(pub u64);

/// Collection identifier stored in catalog keys.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct CollectionId(pub u32);

/// Document identifier stored in catalog and node keys.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct DocId(pub u32);

/// Structural node identifier inside a document (document order).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub u64);

impl PageId {
    /// Sentinel meaning "no page" in on-disk links.
    pub const NONE: PageId = PageId(0);

    /// Returns true when this id is the null link.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl Lsn {
    /// The LSN preceding every journal entry.
    pub const ZERO: Lsn = Lsn(0);

    /// Returns the following LSN.
    pub fn next(self) -> Lsn {
        Lsn(self.0 + 1)
    }
}

macro_rules! display_id {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

display_id!(PageId, Lsn, TxnId, CollectionId, DocId, NodeId);

/// Lock modes understood by the lock manager.
///
/// Callers request `Read` or `Write`; the intention modes are placed on the
/// ancestors of a hierarchical resource.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum LockMode {
    /// Intention to read some descendant.
    IntentionRead,
    /// Intention to write some descendant.
    IntentionWrite,
    /// Shared access.
    Read,
    /// Exclusive access.
    Write,
}

impl LockMode {
    /// Gray et al. compatibility for two holders of different owners.
    pub fn compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (Write, _) | (_, Write) => false,
            (IntentionRead, _) | (_, IntentionRead) => true,
            (IntentionWrite, IntentionWrite) => true,
            (Read, Read) => true,
            (IntentionWrite, Read) | (Read, IntentionWrite) => false,
        }
    }

    /// Whether holding `self` already grants what `wanted` asks for.
    pub fn covers(self, wanted: LockMode) -> bool {
        use LockMode::*;
        match (self, wanted) {
            (Write, _) => true,
            (Read, Read) | (Read, IntentionRead) => true,
            (IntentionWrite, IntentionWrite) | (IntentionWrite, IntentionRead) => true,
            (IntentionRead, IntentionRead) => true,
            _ => false,
        }
    }

    /// Intention mode matching a leaf mode.
    pub fn intention(self) -> LockMode {
        match self {
            LockMode::Read | LockMode::IntentionRead => LockMode::IntentionRead,
            LockMode::Write | LockMode::IntentionWrite => LockMode::IntentionWrite,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockMode::IntentionRead => "IR",
            LockMode::IntentionWrite => "IW",
            LockMode::Read => "R",
            LockMode::Write => "W",
        };
        f.write_str(name)
    }
}

/// Errors produced by the storage core.
#[derive(thiserror::Error, Debug)]
pub enum ArbolError {
    /// Underlying file system failure.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// Structural damage in the page file or journal.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Structural damage with a formatted description.
    #[error("corruption: {0}")]
    CorruptionOwned(String),
    /// Caller supplied an argument the store cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Invalid argument with a formatted description.
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// The named collection or document does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The named collection or document already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// A lock could not be granted before the timeout elapsed.
    #[error("lock timeout on {resource} ({mode})")]
    LockTimeout {
        /// Resource path.
        resource: String,
        /// Requested mode.
        mode: LockMode,
    },
    /// The request conflicts with a lock held by the same owner.
    #[error("lock conflict on {resource}: {reason}")]
    LockConflict {
        /// Resource path.
        resource: String,
        /// Why the request was refused.
        reason: &'static str,
    },
    /// The store writer latch stayed busy past the timeout.
    #[error("writer busy after {0:?}")]
    WriterBusy(Duration),
    /// No broker became available within the timeout.
    #[error("broker pool exhausted after {0:?}")]
    PoolExhausted(Duration),
    /// Transaction used outside of its lifecycle.
    #[error("transaction {txn}: {reason}")]
    TxnMisuse {
        /// Offending transaction.
        txn: TxnId,
        /// Description of the misuse.
        reason: &'static str,
    },
    /// The pool or transaction manager has been shut down.
    #[error("database is shut down")]
    ShutDown,
}

impl ArbolError {
    /// Errors a caller may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ArbolError::LockTimeout { .. }
                | ArbolError::WriterBusy(_)
                | ArbolError::PoolExhausted(_)
        )
    }

    /// Errors indicating on-disk damage.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ArbolError::Corruption(_) | ArbolError::CorruptionOwned(_)
        )
    }

    /// Produces an equivalent error for fan-out to several waiters.
    pub(crate) fn duplicate(&self) -> ArbolError {
        match self {
            ArbolError::Io(err) => ArbolError::Io(io::Error::new(err.kind(), err.to_string())),
            ArbolError::Corruption(msg) => ArbolError::Corruption(msg),
            ArbolError::CorruptionOwned(msg) => ArbolError::CorruptionOwned(msg.clone()),
            ArbolError::Invalid(msg) => ArbolError::Invalid(msg),
            ArbolError::InvalidOwned(msg) => ArbolError::InvalidOwned(msg.clone()),
            ArbolError::NotFound(what) => ArbolError::NotFound(what.clone()),
            ArbolError::AlreadyExists(what) => ArbolError::AlreadyExists(what.clone()),
            ArbolError::LockTimeout { resource, mode } => ArbolError::LockTimeout {
                resource: resource.clone(),
                mode: *mode,
            },
            ArbolError::LockConflict { resource, reason } => ArbolError::LockConflict {
                resource: resource.clone(),
                reason,
            },
            ArbolError::WriterBusy(d) => ArbolError::WriterBusy(*d),
            ArbolError::PoolExhausted(d) => ArbolError::PoolExhausted(*d),
            ArbolError::TxnMisuse { txn, reason } => ArbolError::TxnMisuse { txn: *txn, reason },
            ArbolError::ShutDown => ArbolError::ShutDown,
        }
    }
}

/// Crate result alias.
pub type Result<T> = std::result::Result<T, ArbolError>;
