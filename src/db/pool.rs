//! Broker pool: bounded, thread-reentrant access to one open store.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use super::config::{PoolConfig, StoreConfig};
use super::store::Store;
use crate::primitives::concurrency::{LockManager, ResourceId};
use crate::primitives::journal::Journal;
use crate::primitives::pager::WriteLog;
use crate::storage::catalog::{
    normalize_collection_path, split_document_path, Catalog, Collection, Document,
};
use crate::storage::txn::Txn;
use crate::types::{ArbolError, LockMode, NodeId, Result};

/// Caller identity carried by a broker.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Identity(pub String);

impl Identity {
    /// The identity internal tasks run as.
    pub fn system() -> Self {
        Identity("SYSTEM".to_string())
    }

    /// Unauthenticated caller.
    pub fn guest() -> Self {
        Identity("guest".to_string())
    }

    /// Identity name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pool counters.
#[derive(Clone, Debug, Default)]
pub struct PoolStats {
    /// Slots created so far.
    pub slots: usize,
    /// Slots currently checked out.
    pub active: usize,
    /// Checkouts served, reentrant ones included.
    pub checkouts: u64,
    /// Checkouts that had to wait for a slot.
    pub waits: u64,
    /// Checkouts that gave up with `PoolExhausted`.
    pub exhausted: u64,
}

struct Slot {
    refs: usize,
    /// One entry per live checkout, tagged with its checkout token.
    identities: Vec<(u64, Identity)>,
    next_token: u64,
    owner: Option<ThreadId>,
    generation: u64,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Slot>,
    idle: Vec<usize>,
    by_thread: HashMap<ThreadId, usize>,
    stats: PoolStats,
}

struct PoolShared {
    store: Arc<Store>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
    shut_down: AtomicBool,
    force_corruption: AtomicBool,
}

/// Fixed-capacity pool of brokers over one store.
///
/// A thread holds at most one slot: asking again while holding a broker
/// returns the same slot with the new identity pushed on its stack.
pub struct BrokerPool {
    shared: Arc<PoolShared>,
}

impl BrokerPool {
    /// Opens the store in `dir` (recovering it if needed) and pre-creates
    /// `min_brokers` slots.
    pub fn open(dir: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let store = Store::open(dir, &config)?;
        let mut state = PoolState::default();
        for _ in 0..config.pool.min_brokers {
            let idx = state.slots.len();
            state.slots.push(Slot::new());
            state.idle.push(idx);
        }
        state.stats.slots = state.slots.len();
        info!(
            min = config.pool.min_brokers,
            max = config.pool.max_brokers,
            "pool.open"
        );
        Ok(Self {
            shared: Arc::new(PoolShared {
                store,
                config: config.pool,
                state: Mutex::new(state),
                available: Condvar::new(),
                shut_down: AtomicBool::new(false),
                force_corruption: AtomicBool::new(false),
            }),
        })
    }

    /// Checks out a broker for `identity`, waiting up to `timeout` for a slot.
    pub fn get(&self, identity: Identity, timeout: Duration) -> Result<Broker> {
        let shared = &self.shared;
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut state = shared.state.lock();
        let mut waited = false;
        let idx = loop {
            if shared.shut_down.load(Ordering::Acquire) {
                return Err(ArbolError::ShutDown);
            }
            if let Some(&idx) = state.by_thread.get(&me) {
                let slot = &mut state.slots[idx];
                slot.refs += 1;
                let token = slot.push_identity(identity);
                let generation = slot.generation;
                state.stats.checkouts += 1;
                return Ok(Broker::new(shared.clone(), idx, generation, token));
            }
            if let Some(idx) = state.idle.pop() {
                break idx;
            }
            if state.slots.len() < shared.config.max_brokers {
                state.slots.push(Slot::new());
                state.stats.slots = state.slots.len();
                debug!(slots = state.slots.len(), "pool.slot.create");
                break state.slots.len() - 1;
            }
            if !waited {
                waited = true;
                state.stats.waits += 1;
            }
            if shared.available.wait_until(&mut state, deadline).timed_out() {
                state.stats.exhausted += 1;
                warn!(timeout_ms = timeout.as_millis() as u64, "pool.exhausted");
                return Err(ArbolError::PoolExhausted(timeout));
            }
        };
        let slot = &mut state.slots[idx];
        slot.refs = 1;
        let token = slot.push_identity(identity);
        slot.owner = Some(me);
        let generation = slot.generation;
        state.by_thread.insert(me, idx);
        state.stats.active += 1;
        state.stats.checkouts += 1;
        Ok(Broker::new(shared.clone(), idx, generation, token))
    }

    /// The store behind the pool.
    pub fn store(&self) -> &Arc<Store> {
        &self.shared.store
    }

    /// The journal, for explicit durability barriers.
    pub fn journal(&self) -> &Arc<Journal> {
        self.shared.store.journal()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PoolStats {
        self.shared.state.lock().stats.clone()
    }

    /// Brokers currently checked out.
    pub fn active(&self) -> usize {
        self.shared.state.lock().stats.active
    }

    /// Makes the next shutdown behave like process death after the last
    /// journal flush: no page sync, no checkpoint, no clean-shutdown marker.
    pub fn set_force_corruption(&self, force: bool) {
        self.shared.force_corruption.store(force, Ordering::Release);
    }

    /// Refuses new checkouts, waits for outstanding brokers, then closes the
    /// store.
    pub fn shutdown(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let timeout = shared.config.shutdown_timeout();
        let deadline = Instant::now() + timeout;
        let mut state = shared.state.lock();
        // Wake waiters so they see the shutdown.
        shared.available.notify_all();
        while state.stats.active > 0 {
            if shared.available.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.stats.active > 0 {
            warn!(outstanding = state.stats.active, "pool.shutdown.reclaim");
            let state = &mut *state;
            for slot in state.slots.iter_mut().filter(|slot| slot.refs > 0) {
                slot.reclaim();
            }
            state.by_thread.clear();
            state.idle = (0..state.slots.len()).collect();
            state.stats.active = 0;
        }
        drop(state);
        let crash = shared.force_corruption.load(Ordering::Acquire);
        let result = shared.store.close(crash);
        info!(simulated_crash = crash, "pool.shutdown");
        result
    }

    /// Whether `shutdown` has run.
    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }
}

impl Drop for BrokerPool {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "pool.drop.shutdown_failed");
        }
    }
}

impl Slot {
    fn new() -> Self {
        Self {
            refs: 0,
            identities: Vec::new(),
            next_token: 0,
            owner: None,
            generation: 0,
        }
    }

    fn push_identity(&mut self, identity: Identity) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        self.identities.push((token, identity));
        token
    }

    /// Drops the entry of one checkout, wherever it sits in the stack.
    fn remove_identity(&mut self, token: u64) -> bool {
        match self.identities.iter().rposition(|(t, _)| *t == token) {
            Some(pos) => {
                self.identities.remove(pos);
                true
            }
            None => false,
        }
    }

    fn reclaim(&mut self) {
        self.refs = 0;
        self.identities.clear();
        self.owner = None;
        self.generation += 1;
    }
}

impl PoolShared {
    fn release(&self, idx: usize, generation: u64, token: u64) {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(idx) else {
            return;
        };
        if slot.generation != generation || slot.refs == 0 || !slot.remove_identity(token) {
            return;
        }
        slot.refs -= 1;
        if slot.refs > 0 {
            return;
        }
        let owner = slot.owner.take();
        slot.identities.clear();
        if let Some(owner) = owner {
            state.by_thread.remove(&owner);
        }
        state.idle.push(idx);
        state.stats.active -= 1;
        let idle = state.stats.active == 0;
        drop(state);
        self.available.notify_all();
        if idle && !self.shut_down.load(Ordering::Acquire) {
            if let Err(err) = self.store.checkpoint_if_requested() {
                warn!(error = %err, "pool.idle_checkpoint_failed");
            }
        }
    }

    fn identity(&self, idx: usize, generation: u64) -> Option<Identity> {
        let state = self.state.lock();
        state
            .slots
            .get(idx)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.identities.last().map(|(_, identity)| identity.clone()))
    }
}

/// A checked-out slot of the pool.
///
/// Every catalog operation runs inside a caller-supplied transaction: it
/// takes the writer latch first when it mutates, then the resource locks,
/// which the transaction keeps until it ends.
///
/// Brokers belong to the thread that checked them out and are not `Send`.
/// Nested checkouts on one thread share a slot; the slot acts as the
/// identity of the most recent checkout still held, whatever order the
/// brokers are released in.
pub struct Broker {
    shared: Arc<PoolShared>,
    slot: usize,
    generation: u64,
    token: u64,
    released: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl Broker {
    fn new(shared: Arc<PoolShared>, slot: usize, generation: u64, token: u64) -> Self {
        Self {
            shared,
            slot,
            generation,
            token,
            released: false,
            _thread_bound: PhantomData,
        }
    }

    /// Index of the pool slot.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Identity on top of the slot's stack.
    pub fn identity(&self) -> Option<Identity> {
        self.shared.identity(self.slot, self.generation)
    }

    /// The store.
    pub fn store(&self) -> &Arc<Store> {
        &self.shared.store
    }

    /// Starts a transaction.
    pub fn begin_transaction(&self) -> Result<Txn> {
        self.shared.store.begin()
    }

    /// Returns the broker to the pool; same as dropping it.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.release(self.slot, self.generation, self.token);
        }
    }

    fn catalog(&self) -> &Catalog {
        self.shared.store.catalog()
    }

    fn locks(&self) -> &LockManager {
        self.shared.store.locks()
    }

    fn lock_collection(&self, txn: &mut Txn, path: &str, mode: LockMode) -> Result<()> {
        let timeout = self.locks().default_timeout();
        let lock = self.locks().lock_collection(txn.owner(), path, mode, timeout)?;
        txn.hold_collection(lock);
        Ok(())
    }

    fn lock_document(&self, txn: &mut Txn, path: &str, mode: LockMode) -> Result<()> {
        let timeout = self.locks().default_timeout();
        let guard = self.locks().lock_document(txn.owner(), path, mode, timeout)?;
        txn.hold(guard);
        Ok(())
    }

    /// Locks a document and its collection, returning the normalized path.
    fn lock_for_document(&self, txn: &mut Txn, path: &str, mode: LockMode) -> Result<String> {
        let (collection, name) = split_document_path(path)?;
        self.lock_collection(txn, &collection, mode)?;
        let path = format!("{collection}/{name}");
        self.lock_document(txn, &path, mode)?;
        Ok(path)
    }

    /// Locks both ends of a move or copy: the two collections, then the two
    /// documents, each pair in ascending order.
    fn lock_document_pair(
        &self,
        txn: &mut Txn,
        from: &str,
        to: &str,
        source_mode: LockMode,
    ) -> Result<(String, String)> {
        let (from_coll, from_name) = split_document_path(from)?;
        let (to_coll, to_name) = split_document_path(to)?;
        let mut collections = vec![
            (from_coll.clone(), source_mode),
            (to_coll.clone(), LockMode::Write),
        ];
        collections.sort_by(|a, b| a.0.cmp(&b.0));
        collections.dedup_by(|later, earlier| {
            if later.0 == earlier.0 {
                earlier.1 = LockMode::Write;
                true
            } else {
                false
            }
        });
        for (path, mode) in &collections {
            self.lock_collection(txn, path, *mode)?;
        }
        let from = format!("{from_coll}/{from_name}");
        let to = format!("{to_coll}/{to_name}");
        let timeout = self.locks().default_timeout();
        let guards = self.locks().lock_pair(
            txn.owner(),
            ResourceId::Document(from.clone()),
            ResourceId::Document(to.clone()),
            LockMode::Write,
            timeout,
        )?;
        for guard in guards {
            txn.hold(guard);
        }
        Ok((from, to))
    }

    /// Creates a collection (and missing ancestors).
    pub fn create_collection(&self, txn: &mut Txn, path: &str) -> Result<Collection> {
        txn.prepare_write()?;
        let path = normalize_collection_path(path)?;
        self.lock_collection(txn, &path, LockMode::Write)?;
        self.catalog().create_collection(txn, &path)
    }

    /// Looks up a collection.
    pub fn get_collection(&self, txn: &mut Txn, path: &str) -> Result<Option<Collection>> {
        let path = normalize_collection_path(path)?;
        self.lock_collection(txn, &path, LockMode::Read)?;
        self.catalog().get_collection(&path)
    }

    /// Child collection paths.
    pub fn list_collections(&self, txn: &mut Txn, path: &str) -> Result<Vec<String>> {
        let path = normalize_collection_path(path)?;
        self.lock_collection(txn, &path, LockMode::Read)?;
        self.catalog().list_collections(&path)
    }

    /// Removes a collection recursively. Returns the number of documents removed.
    pub fn remove_collection(&self, txn: &mut Txn, path: &str) -> Result<usize> {
        txn.prepare_write()?;
        let path = normalize_collection_path(path)?;
        self.lock_collection(txn, &path, LockMode::Write)?;
        self.catalog().remove_collection(txn, &path)
    }

    /// Renames a collection with its subtree.
    pub fn move_collection(&self, txn: &mut Txn, from: &str, to: &str) -> Result<Collection> {
        txn.prepare_write()?;
        let from = normalize_collection_path(from)?;
        let to = normalize_collection_path(to)?;
        let (first, second) = if from <= to { (&from, &to) } else { (&to, &from) };
        self.lock_collection(txn, first, LockMode::Write)?;
        self.lock_collection(txn, second, LockMode::Write)?;
        self.catalog().move_collection(txn, &from, &to)
    }

    /// Copies a collection with its subtree. The source chain is read
    /// locked and the target chain write locked, in path order.
    pub fn copy_collection(&self, txn: &mut Txn, from: &str, to: &str) -> Result<Collection> {
        txn.prepare_write()?;
        let from = normalize_collection_path(from)?;
        let to = normalize_collection_path(to)?;
        let mut chains = [(&from, LockMode::Read), (&to, LockMode::Write)];
        chains.sort_by(|a, b| a.0.cmp(b.0));
        for (path, mode) in chains {
            self.lock_collection(txn, path, mode)?;
        }
        self.catalog().copy_collection(txn, &from, &to)
    }

    /// Stores (creates or replaces) a document from its node payloads.
    pub fn store_document(&self, txn: &mut Txn, path: &str, nodes: &[Vec<u8>]) -> Result<Document> {
        txn.prepare_write()?;
        let path = self.lock_for_document(txn, path, LockMode::Write)?;
        self.catalog().store_document(txn, &path, nodes)
    }

    /// Looks up a document.
    pub fn get_document(&self, txn: &mut Txn, path: &str) -> Result<Option<Document>> {
        let path = self.lock_for_document(txn, path, LockMode::Read)?;
        self.catalog().get_document(&path)
    }

    /// All node payloads of a document.
    pub fn read_document(&self, txn: &mut Txn, path: &str) -> Result<Option<Vec<(NodeId, Vec<u8>)>>> {
        let path = self.lock_for_document(txn, path, LockMode::Read)?;
        self.catalog().read_document(&path)
    }

    /// Appends a node to a document.
    pub fn append_node(&self, txn: &mut Txn, path: &str, data: &[u8]) -> Result<NodeId> {
        txn.prepare_write()?;
        let path = self.lock_for_document(txn, path, LockMode::Write)?;
        self.catalog().append_node(txn, &path, data)
    }

    /// Appends bytes to one node payload.
    pub fn extend_node(&self, txn: &mut Txn, path: &str, node: NodeId, more: &[u8]) -> Result<()> {
        txn.prepare_write()?;
        let path = self.lock_for_document(txn, path, LockMode::Write)?;
        self.catalog().extend_node(txn, &path, node, more)
    }

    /// One node payload.
    pub fn read_node(&self, txn: &mut Txn, path: &str, node: NodeId) -> Result<Option<Vec<u8>>> {
        let path = self.lock_for_document(txn, path, LockMode::Read)?;
        self.catalog().read_node(&path, node)
    }

    /// Removes one node.
    pub fn remove_node(&self, txn: &mut Txn, path: &str, node: NodeId) -> Result<bool> {
        txn.prepare_write()?;
        let path = self.lock_for_document(txn, path, LockMode::Write)?;
        self.catalog().remove_node(txn, &path, node)
    }

    /// Removes a document.
    pub fn remove_document(&self, txn: &mut Txn, path: &str) -> Result<bool> {
        txn.prepare_write()?;
        let path = self.lock_for_document(txn, path, LockMode::Write)?;
        self.catalog().remove_document(txn, &path)
    }

    /// Moves a document.
    pub fn move_document(&self, txn: &mut Txn, from: &str, to: &str) -> Result<Document> {
        txn.prepare_write()?;
        let (from, to) = self.lock_document_pair(txn, from, to, LockMode::Write)?;
        self.catalog().move_document(txn, &from, &to)
    }

    /// Copies a document.
    pub fn copy_document(&self, txn: &mut Txn, from: &str, to: &str) -> Result<Document> {
        txn.prepare_write()?;
        let (from, to) = self.lock_document_pair(txn, from, to, LockMode::Read)?;
        self.catalog().copy_document(txn, &from, &to)
    }

    /// Document names in a collection.
    pub fn list_documents(&self, txn: &mut Txn, path: &str) -> Result<Vec<String>> {
        let path = normalize_collection_path(path)?;
        self.lock_collection(txn, &path, LockMode::Read)?;
        self.catalog().list_documents(&path)
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("slot", &self.slot)
            .field("identity", &self.identity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const WAIT: Duration = Duration::from_millis(50);

    #[test]
    fn same_thread_gets_same_slot_with_identity_stack() -> Result<()> {
        let dir = tempdir()?;
        let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
        let outer = pool.get(Identity("alice".into()), WAIT)?;
        let inner = pool.get(Identity::system(), WAIT)?;
        assert_eq!(outer.slot(), inner.slot());
        assert_eq!(outer.identity(), Some(Identity::system()));
        drop(inner);
        assert_eq!(outer.identity(), Some(Identity("alice".into())));
        assert_eq!(pool.active(), 1);
        outer.release();
        assert_eq!(pool.active(), 0);
        pool.shutdown()?;
        Ok(())
    }

    #[test]
    fn releasing_outer_broker_keeps_inner_identity() -> Result<()> {
        let dir = tempdir()?;
        let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
        let outer = pool.get(Identity("x".into()), WAIT)?;
        let inner = pool.get(Identity("y".into()), WAIT)?;
        drop(outer);
        assert_eq!(inner.identity(), Some(Identity("y".into())));
        assert_eq!(pool.active(), 1);
        drop(inner);
        assert_eq!(pool.active(), 0);
        let again = pool.get(Identity::guest(), WAIT)?;
        assert_eq!(again.identity(), Some(Identity::guest()));
        Ok(())
    }

    #[test]
    fn exhausted_pool_times_out() -> Result<()> {
        let dir = tempdir()?;
        let mut config = StoreConfig::testing();
        config.pool.max_brokers = 1;
        let pool = Arc::new(BrokerPool::open(dir.path(), config)?);
        let _held = pool.get(Identity::guest(), WAIT)?;
        let other = Arc::clone(&pool);
        let err = thread::spawn(move || other.get(Identity::guest(), WAIT).map(|_| ()))
            .join()
            .map_err(|_| ArbolError::Invalid("checkout thread panicked"))?;
        assert!(matches!(err, Err(ArbolError::PoolExhausted(_))));
        assert_eq!(pool.stats().exhausted, 1);
        Ok(())
    }

    #[test]
    fn shutdown_refuses_checkouts() -> Result<()> {
        let dir = tempdir()?;
        let pool = BrokerPool::open(dir.path(), StoreConfig::testing())?;
        pool.shutdown()?;
        assert!(matches!(pool.get(Identity::guest(), WAIT), Err(ArbolError::ShutDown)));
        Ok(())
    }
}
