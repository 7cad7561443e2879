//! Database, connections and shared store handles.
//!
//! A [`Database`] wraps one engine [`Environment`]. Each thread works through
//! its own [`Connection`], which holds that thread's ambient transaction:
//! every map operation issued through the connection runs inside it without
//! the transaction being passed explicitly.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use stowkv_core::{
    Config, Environment, Index, IndexDefinition, SnapshotResult, Store, StoreOptions, TxnHandle,
};

use crate::codec::KeyOrder;
use crate::error::{MapError, MapResult};
use crate::map::{MapOptions, PrimaryMap};
use crate::registry::IteratorRegistry;
use crate::retry::RetryPolicy;

/// Context used for errors that concern the environment rather than a store
const ENVIRONMENT: &str = "<environment>";

/// One opened store, shared by every map opened on it through the same
/// database.
pub(crate) struct StoreHandle {
    name: String,
    store: RwLock<Store>,
    pub(crate) registry: IteratorRegistry,
    indices: Mutex<HashMap<String, Index>>,
    closed: AtomicBool,
}

impl StoreHandle {
    fn new(name: &str, store: Store) -> Self {
        Self {
            name: name.to_string(),
            store: RwLock::new(store),
            registry: IteratorRegistry::default(),
            indices: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn store(&self) -> Store {
        self.store.read().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> MapResult<()> {
        if self.is_closed() {
            return Err(MapError::Closed { store: self.name.clone() });
        }
        Ok(())
    }

    /// Associate an index with the store. True if the association is new.
    pub(crate) fn attach_index(&self, definition: IndexDefinition) -> MapResult<bool> {
        let store = self.store();
        let (index, created) = store.associate(definition).map_err(|e| MapError::engine(&self.name, "associate", e))?;
        if created {
            tracing::debug!(store = %self.name, index = %index.name(), "index associated");
        }
        self.indices.lock().insert(index.name().to_string(), index);
        Ok(created)
    }

    pub(crate) fn index(&self, name: &str) -> Option<Index> {
        self.indices.lock().get(name).cloned()
    }

    /// Detach an index from the store and forget it.
    pub(crate) fn detach_index(&self, name: &str) -> MapResult<()> {
        self.indices.lock().remove(name);
        self.store().dissociate(name).map_err(|e| MapError::engine(&self.name, "dissociate", e))
    }

    /// Swap in the store that replaced this one, with its indices.
    pub(crate) fn replace(&self, store: Store, indices: Vec<Index>) {
        *self.store.write() = store;
        let mut current = self.indices.lock();
        current.clear();
        for index in indices {
            current.insert(index.name().to_string(), index);
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.indices.lock().clear();
    }
}

struct DatabaseInner {
    env: Environment,
    handles: Mutex<HashMap<String, Weak<StoreHandle>>>,
    next_map_id: AtomicU64,
}

/// A database: one engine environment plus the store handles opened on it
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Open (or create) a database directory.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> MapResult<Self> {
        let env = Environment::open(path, config).map_err(|e| MapError::engine(ENVIRONMENT, "open", e))?;
        Ok(Self::from_environment(env))
    }

    /// Wrap an already open environment.
    pub fn from_environment(env: Environment) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                env,
                handles: Mutex::new(HashMap::new()),
                next_map_id: AtomicU64::new(1),
            }),
        }
    }

    /// The underlying engine environment
    pub fn environment(&self) -> &Environment {
        &self.inner.env
    }

    /// A new connection with no ambient transaction and the default retry
    /// policy.
    pub fn connect(&self) -> Connection {
        Connection {
            db: self.clone(),
            ambient: Arc::new(Mutex::new(None)),
            retry: RetryPolicy::default(),
        }
    }

    /// Snapshot every store and retire the WAL it covers.
    pub fn checkpoint(&self) -> MapResult<SnapshotResult> {
        self.inner.env.checkpoint().map_err(|e| MapError::engine(ENVIRONMENT, "checkpoint", e))
    }

    pub(crate) fn next_map_id(&self) -> u64 {
        self.inner.next_map_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Open the shared handle for `name` and associate `indices` with it.
    /// Returns the handle and whether any association was new.
    pub(crate) fn attach(
        &self,
        name: &str,
        order: &KeyOrder,
        create: bool,
        indices: Vec<IndexDefinition>,
    ) -> MapResult<(Arc<StoreHandle>, bool)> {
        let options = StoreOptions { create, comparator: order.comparator() };
        let handle = {
            let mut handles = self.inner.handles.lock();
            let live = handles.get(name).and_then(Weak::upgrade).filter(|handle| !handle.is_closed());
            match live {
                Some(handle) => {
                    // Validates the ordering against the installed one
                    self.inner.env.open_store(name, options).map_err(|e| MapError::engine(name, "open", e))?;
                    handle
                }
                None => {
                    let store =
                        self.inner.env.open_store(name, options).map_err(|e| MapError::engine(name, "open", e))?;
                    let handle = Arc::new(StoreHandle::new(name, store));
                    handles.retain(|_, weak| weak.strong_count() > 0);
                    handles.insert(name.to_string(), Arc::downgrade(&handle));
                    handle
                }
            }
        };

        let mut created = false;
        for definition in indices {
            created |= handle.attach_index(definition)?;
        }
        Ok((handle, created))
    }

    /// Drop the handle table entry for `name`.
    pub(crate) fn forget(&self, name: &str) {
        self.inner.handles.lock().remove(name);
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.inner.env.path()).finish()
    }
}

/// A caller's session: owns the ambient transaction slot.
///
/// Clones share the slot, so a connection should stay on one thread.
#[derive(Clone)]
pub struct Connection {
    db: Database,
    ambient: Arc<Mutex<Option<TxnHandle>>>,
    retry: RetryPolicy,
}

impl Connection {
    /// Use `retry` for transaction-free operations and `run_in_transaction`.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The database this connection belongs to
    pub fn database(&self) -> &Database {
        &self.db
    }

    pub(crate) fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Begin the ambient transaction. Fails with `Unsupported` if one is
    /// already active.
    pub fn begin(&self) -> MapResult<TxnHandle> {
        let mut ambient = self.ambient.lock();
        if ambient.as_ref().is_some_and(TxnHandle::is_active) {
            return Err(MapError::Unsupported("a transaction is already active on this connection"));
        }
        let txn = self.db.inner.env.begin().map_err(|e| MapError::engine(ENVIRONMENT, "begin", e))?;
        tracing::trace!(txn = txn.id(), "ambient transaction started");
        *ambient = Some(txn.clone());
        Ok(txn)
    }

    /// Commit the ambient transaction.
    pub fn commit(&self) -> MapResult<()> {
        let txn = self.ambient.lock().take().ok_or(MapError::Unsupported("no active transaction"))?;
        txn.commit().map_err(|e| MapError::engine(ENVIRONMENT, "commit", e))
    }

    /// Abort the ambient transaction.
    pub fn abort(&self) -> MapResult<()> {
        let txn = self.ambient.lock().take().ok_or(MapError::Unsupported("no active transaction"))?;
        txn.abort().map_err(|e| MapError::engine(ENVIRONMENT, "abort", e))
    }

    /// The active ambient transaction, if any
    pub fn transaction(&self) -> Option<TxnHandle> {
        self.ambient.lock().as_ref().filter(|txn| txn.is_active()).cloned()
    }

    /// Run `work` in a fresh ambient transaction and commit it. On
    /// `Deadlock` the transaction is aborted and `work` re-run, up to the
    /// connection's retry policy; any other error aborts and is returned.
    pub fn run_in_transaction<T>(&self, mut work: impl FnMut(&TxnHandle) -> MapResult<T>) -> MapResult<T> {
        self.retry.run_map(None, || self.attempt_transaction(&mut work))
    }

    fn attempt_transaction<T>(&self, work: &mut impl FnMut(&TxnHandle) -> MapResult<T>) -> MapResult<T> {
        let txn = self.begin()?;
        match work(&txn) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_error) = self.abort() {
                    tracing::warn!(txn = txn.id(), error = %abort_error, "abort after failure did not complete");
                }
                Err(e)
            }
        }
    }

    /// Open the map called `name`.
    pub fn open_map<K: 'static, V: 'static>(&self, name: &str, options: MapOptions<K, V>) -> MapResult<PrimaryMap<K, V>> {
        let definitions = options.index_definitions();
        let (handle, owns_indices) = self.db.attach(name, &options.order, options.create, definitions)?;
        tracing::debug!(store = name, indices = options.indices.len(), "map opened");
        Ok(PrimaryMap::new(self.db.next_map_id(), handle, self.clone(), options, owns_indices))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("transaction", &self.transaction().map(|txn| txn.id())).finish()
    }
}
