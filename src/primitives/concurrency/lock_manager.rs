use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::types::{ArbolError, LockMode, Result, TxnId};

/// Identity a lock is held under. Transactions lock as themselves; work
/// outside a transaction gets a fresh owner per call.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct LockOwner(pub u64);

impl From<TxnId> for LockOwner {
    fn from(txn: TxnId) -> Self {
        LockOwner(txn.0)
    }
}

/// A lockable resource.
#[derive(Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub enum ResourceId {
    /// A collection path such as `/db/a/b`.
    Collection(String),
    /// A document path such as `/db/a/b/doc.xml`.
    Document(String),
}

impl ResourceId {
    /// The path part of the id.
    pub fn path(&self) -> &str {
        match self {
            ResourceId::Collection(path) | ResourceId::Document(path) => path,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Collection(path) => write!(f, "collection {path}"),
            ResourceId::Document(path) => write!(f, "document {path}"),
        }
    }
}

/// What happened to a lock request.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LockEventKind {
    /// A request was made.
    Attempt,
    /// The request was granted.
    Acquired,
    /// The request timed out or was refused.
    AttemptFailed,
    /// A granted lock was released.
    Released,
}

/// One lock table event.
#[derive(Clone, Debug)]
pub struct LockEvent {
    /// Event kind.
    pub kind: LockEventKind,
    /// Resource concerned.
    pub resource: ResourceId,
    /// Mode requested or released.
    pub mode: LockMode,
    /// Requesting owner.
    pub owner: LockOwner,
}

type Listener = Box<dyn Fn(&LockEvent) + Send + Sync>;

/// Counters and listeners for lock activity.
#[derive(Default)]
pub struct LockTable {
    attempts: AtomicU64,
    acquired: AtomicU64,
    failed: AtomicU64,
    released: AtomicU64,
    listeners: Mutex<Vec<Listener>>,
}

/// Snapshot of the lock table counters.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LockTableSnapshot {
    /// Requests made.
    pub attempts: u64,
    /// Requests granted.
    pub acquired: u64,
    /// Requests that failed.
    pub failed: u64,
    /// Grants released.
    pub released: u64,
}

impl LockTable {
    /// Registers a callback invoked for every event.
    pub fn add_listener(&self, listener: impl Fn(&LockEvent) + Send + Sync + 'static) {
        self.listeners.lock().push(Box::new(listener));
    }

    /// Grants not yet released. Zero whenever no lock is held.
    pub fn outstanding(&self) -> u64 {
        let acquired = self.acquired.load(Ordering::Acquire);
        acquired.saturating_sub(self.released.load(Ordering::Acquire))
    }

    /// Current counters.
    pub fn snapshot(&self) -> LockTableSnapshot {
        LockTableSnapshot {
            attempts: self.attempts.load(Ordering::Acquire),
            acquired: self.acquired.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            released: self.released.load(Ordering::Acquire),
        }
    }

    fn record(&self, kind: LockEventKind, resource: &ResourceId, mode: LockMode, owner: LockOwner) {
        let counter = match kind {
            LockEventKind::Attempt => &self.attempts,
            LockEventKind::Acquired => &self.acquired,
            LockEventKind::AttemptFailed => &self.failed,
            LockEventKind::Released => &self.released,
        };
        counter.fetch_add(1, Ordering::AcqRel);
        let listeners = self.listeners.lock();
        if listeners.is_empty() {
            return;
        }
        let event = LockEvent {
            kind,
            resource: resource.clone(),
            mode,
            owner,
        };
        for listener in listeners.iter() {
            listener(&event);
        }
    }
}

/// Grants one owner holds on one resource. The effective mode is the
/// strongest of the stacked grants.
#[derive(Default)]
struct Holding {
    grants: SmallVec<[LockMode; 4]>,
}

impl Holding {
    fn mode(&self) -> Option<LockMode> {
        self.grants.iter().copied().reduce(join)
    }
}

#[derive(Default)]
struct ResourceState {
    holders: HashMap<LockOwner, Holding>,
}

struct Inner {
    resources: Mutex<HashMap<ResourceId, ResourceState>>,
    released: Condvar,
    table: LockTable,
    next_owner: AtomicU64,
    single_writer_collections: bool,
    default_timeout: Duration,
}

/// Multi-granularity lock manager for collections and documents.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<Inner>,
}

/// First anonymous owner id; transaction ids stay far below it.
const ANONYMOUS_OWNER_BASE: u64 = 1 << 62;

impl LockManager {
    /// Creates a lock manager.
    ///
    /// With `single_writer_collections` the ancestors of a collection written
    /// to are locked `Write` instead of `IntentionWrite`.
    pub fn new(default_timeout: Duration, single_writer_collections: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                resources: Mutex::new(HashMap::new()),
                released: Condvar::new(),
                table: LockTable::default(),
                next_owner: AtomicU64::new(ANONYMOUS_OWNER_BASE),
                single_writer_collections,
                default_timeout,
            }),
        }
    }

    /// Timeout used when callers do not pass one.
    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// A fresh owner for work done outside a transaction.
    pub fn anonymous_owner(&self) -> LockOwner {
        LockOwner(self.inner.next_owner.fetch_add(1, Ordering::AcqRel))
    }

    /// Event counters.
    pub fn table(&self) -> &LockTable {
        &self.inner.table
    }

    /// Acquires `mode` on `resource`, waiting up to `timeout`.
    ///
    /// An owner may re-acquire a mode it already holds. A stronger mode is
    /// granted when it is compatible with every other holder; otherwise the
    /// request fails with [`ArbolError::LockConflict`] instead of waiting on
    /// itself.
    pub fn acquire(
        &self,
        owner: LockOwner,
        resource: ResourceId,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<LockGuard> {
        let inner = &self.inner;
        inner.table.record(LockEventKind::Attempt, &resource, mode, owner);
        let deadline = Instant::now() + timeout;
        let mut resources = inner.resources.lock();
        loop {
            let state = resources.entry(resource.clone()).or_default();
            let held = state.holders.get(&owner).and_then(Holding::mode);
            // What the owner would hold once granted.
            let effective = held.map_or(mode, |held| join(held, mode));
            let others_compatible = state
                .holders
                .iter()
                .filter(|(holder, _)| **holder != owner)
                .filter_map(|(_, holding)| holding.mode())
                .all(|other| other.compatible_with(effective));
            match held {
                Some(held) if held.covers(mode) => break,
                _ if others_compatible => break,
                Some(_) => {
                    drop(resources);
                    inner.table.record(LockEventKind::AttemptFailed, &resource, mode, owner);
                    debug!(resource = %resource, mode = %mode, owner = owner.0, "lock.upgrade_refused");
                    return Err(ArbolError::LockConflict {
                        resource: resource.to_string(),
                        reason: "upgrade would wait on other holders",
                    });
                }
                None => {}
            }
            if inner.released.wait_until(&mut resources, deadline).timed_out() {
                if let Some(state) = resources.get(&resource) {
                    if state.holders.is_empty() {
                        resources.remove(&resource);
                    }
                }
                drop(resources);
                inner.table.record(LockEventKind::AttemptFailed, &resource, mode, owner);
                debug!(resource = %resource, mode = %mode, owner = owner.0, "lock.timeout");
                return Err(ArbolError::LockTimeout {
                    resource: resource.to_string(),
                    mode,
                });
            }
        }
        resources
            .entry(resource.clone())
            .or_default()
            .holders
            .entry(owner)
            .or_default()
            .grants
            .push(mode);
        drop(resources);
        inner.table.record(LockEventKind::Acquired, &resource, mode, owner);
        trace!(resource = %resource, mode = %mode, owner = owner.0, "lock.acquired");
        Ok(LockGuard {
            manager: self.clone(),
            owner,
            resource,
            mode,
        })
    }

    /// Locks a collection and its ancestors, root first.
    pub fn lock_collection(
        &self,
        owner: LockOwner,
        path: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<CollectionLock> {
        let ancestor_mode = if self.inner.single_writer_collections && mode == LockMode::Write {
            LockMode::Write
        } else {
            mode.intention()
        };
        let chain = path_chain(path)?;
        let mut guards = Vec::with_capacity(chain.len());
        let last = chain.len() - 1;
        for (idx, prefix) in chain.into_iter().enumerate() {
            let wanted = if idx == last { mode } else { ancestor_mode };
            // Partial chains unwind through CollectionLock's drop.
            match self.acquire(owner, ResourceId::Collection(prefix), wanted, timeout) {
                Ok(guard) => guards.push(guard),
                Err(err) => {
                    drop(CollectionLock { guards });
                    return Err(err);
                }
            }
        }
        Ok(CollectionLock { guards })
    }

    /// Locks a single document.
    pub fn lock_document(
        &self,
        owner: LockOwner,
        path: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<LockGuard> {
        self.acquire(owner, ResourceId::Document(path.to_string()), mode, timeout)
    }

    /// Locks two resources in ascending order, so concurrent pair lockers
    /// never wait on each other in a cycle.
    pub fn lock_pair(
        &self,
        owner: LockOwner,
        a: ResourceId,
        b: ResourceId,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Vec<LockGuard>> {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        let mut guards = Vec::with_capacity(2);
        let same = first == second;
        guards.push(self.acquire(owner, first, mode, timeout)?);
        if !same {
            guards.push(self.acquire(owner, second, mode, timeout)?);
        }
        Ok(guards)
    }

    /// Mode `owner` currently holds on `resource`.
    pub fn held_mode(&self, owner: LockOwner, resource: &ResourceId) -> Option<LockMode> {
        let resources = self.inner.resources.lock();
        resources
            .get(resource)
            .and_then(|state| state.holders.get(&owner))
            .and_then(Holding::mode)
    }

    /// Resources with at least one holder.
    pub fn locked_resources(&self) -> Vec<ResourceId> {
        let resources = self.inner.resources.lock();
        let mut out: Vec<ResourceId> = resources
            .iter()
            .filter(|(_, state)| !state.holders.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        out.sort();
        out
    }

    fn release(&self, owner: LockOwner, resource: &ResourceId, mode: LockMode) {
        let inner = &self.inner;
        let mut resources = inner.resources.lock();
        if let Some(state) = resources.get_mut(resource) {
            if let Some(holding) = state.holders.get_mut(&owner) {
                if let Some(pos) = holding.grants.iter().rposition(|m| *m == mode) {
                    holding.grants.remove(pos);
                }
                if holding.grants.is_empty() {
                    state.holders.remove(&owner);
                }
            }
            if state.holders.is_empty() {
                resources.remove(resource);
            }
        }
        drop(resources);
        inner.released.notify_all();
        inner.table.record(LockEventKind::Released, resource, mode, owner);
        trace!(resource = %resource, mode = %mode, owner = owner.0, "lock.released");
    }
}

/// A granted lock, released on drop.
pub struct LockGuard {
    manager: LockManager,
    owner: LockOwner,
    resource: ResourceId,
    mode: LockMode,
}

impl LockGuard {
    /// Locked resource.
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// Granted mode.
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("owner", &self.owner)
            .field("resource", &self.resource)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.manager.release(self.owner, &self.resource, self.mode);
    }
}

/// Locks on a collection and its ancestors, released leaf first.
#[derive(Debug)]
pub struct CollectionLock {
    guards: Vec<LockGuard>,
}

impl CollectionLock {
    /// The lock on the collection itself.
    pub fn leaf(&self) -> Option<&LockGuard> {
        self.guards.last()
    }

    /// Number of resources locked, ancestors included.
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    /// Whether nothing is locked.
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

impl Drop for CollectionLock {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

/// Prefixes of a collection path, root first: `/db/a` gives `/db`, `/db/a`.
pub fn path_chain(path: &str) -> Result<Vec<String>> {
    let mut chain = Vec::new();
    let mut current = String::new();
    for part in path.split('/').filter(|part| !part.is_empty()) {
        current.push('/');
        current.push_str(part);
        chain.push(current.clone());
    }
    if chain.is_empty() {
        return Err(ArbolError::InvalidOwned(format!("empty collection path {path:?}")));
    }
    Ok(chain)
}

fn join(a: LockMode, b: LockMode) -> LockMode {
    if a.covers(b) {
        a
    } else if b.covers(a) {
        b
    } else {
        LockMode::Write
    }
}
