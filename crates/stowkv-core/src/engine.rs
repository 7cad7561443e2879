//! Environment: the catalog of stores plus the shared machinery behind them.
//!
//! **Read path**: record lock, then the store's in-RAM ordered map
//! **Write path**: exclusive record lock, in-place update with undo, WAL on commit
//! **Recovery**: latest snapshot, then every committed WAL transaction after it

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::format::{LogRecord, Operation, SizeLimits};
use crate::lock::{LockManager, LockMode};
use crate::snapshot::{read_snapshot, write_snapshot, SnapshotResult, StoreImage};
use crate::store::{comparator_name, KeyComparator, Store, StoreInner, StoreOptions};
use crate::txn::{TxnHandle, Undo};
use crate::wal::{WalReader, WalWriter};

/// Lock-table store id for catalog entries (store names)
const CATALOG_LOCK_ID: u64 = 0;

/// State shared by the environment, its stores, cursors and transactions.
pub(crate) struct Shared {
    pub(crate) config: Config,
    path: PathBuf,
    wal: Mutex<WalWriter>,
    pub(crate) locks: LockManager,
    catalog: RwLock<HashMap<String, Arc<StoreInner>>>,
    next_store_id: AtomicU64,
    next_locker: AtomicU64,
    /// Active transaction count; held across a checkpoint to keep new ones out
    active: Mutex<usize>,
}

impl Shared {
    fn limits(&self) -> SizeLimits {
        SizeLimits { max_key_size: self.config.max_key_size, max_value_size: self.config.max_value_size }
    }

    /// Fresh id for a transaction or a short-lived reader
    pub(crate) fn next_locker(&self) -> u64 {
        self.next_locker.fetch_add(1, AtomicOrdering::Relaxed)
    }

    fn next_store_id(&self) -> u64 {
        self.next_store_id.fetch_add(1, AtomicOrdering::Relaxed)
    }

    pub(crate) fn check_sizes(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        if key.len() > self.config.max_key_size {
            return Err(StoreError::OversizedEntry {
                entry_size: key.len() as u64,
                max_size: self.config.max_key_size as u64,
                component: "key",
            });
        }
        if value.len() > self.config.max_value_size {
            return Err(StoreError::OversizedEntry {
                entry_size: value.len() as u64,
                max_size: self.config.max_value_size as u64,
                component: "value",
            });
        }
        Ok(())
    }

    fn begin(self: &Arc<Self>) -> TxnHandle {
        let mut active = self.active.lock();
        *active += 1;
        TxnHandle::begin(self.next_locker(), Arc::clone(self))
    }

    pub(crate) fn end_transaction(&self, txn_id: u64) {
        self.locks.release_all(txn_id);
        let mut active = self.active.lock();
        *active = active.saturating_sub(1);
    }

    pub(crate) fn log_commit(&self, batch: &[LogRecord]) -> StoreResult<()> {
        self.wal.lock().append_batch(batch, self.config.sync_on_commit)
    }

    /// Run `f` in `txn`, or in a single-operation transaction when `None`.
    pub(crate) fn autocommit<T>(
        self: &Arc<Self>,
        txn: Option<&TxnHandle>,
        f: impl FnOnce(&TxnHandle) -> StoreResult<T>,
    ) -> StoreResult<T> {
        if let Some(txn) = txn {
            return f(txn);
        }
        let txn = self.begin();
        match f(&txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    tracing::warn!(txn = txn.id(), error = %abort_err, "failed to abort autocommit transaction");
                }
                Err(e)
            }
        }
    }

    fn lock_name(&self, txn: &TxnHandle, name: &str) -> StoreResult<()> {
        self.locks
            .acquire(txn.id(), &(CATALOG_LOCK_ID, name.as_bytes().to_vec()), LockMode::Exclusive, name)
    }

    fn lookup(&self, name: &str) -> Option<Arc<StoreInner>> {
        self.catalog.read().get(name).cloned()
    }

    pub(crate) fn catalog_forget(&self, store: &Arc<StoreInner>) {
        let name = store.name();
        let mut catalog = self.catalog.write();
        if catalog.get(&name).map_or(false, |s| Arc::ptr_eq(s, store)) {
            catalog.remove(&name);
        }
        store.set_dropped(true);
    }

    pub(crate) fn catalog_rename_back(&self, store: &Arc<StoreInner>, from: &str) {
        let mut catalog = self.catalog.write();
        let current = store.name();
        if catalog.get(&current).map_or(false, |s| Arc::ptr_eq(s, store)) {
            catalog.remove(&current);
        }
        *store.name.write() = from.to_string();
        catalog.insert(from.to_string(), Arc::clone(store));
    }

    pub(crate) fn catalog_restore(&self, store: &Arc<StoreInner>) {
        store.set_dropped(false);
        self.catalog.write().insert(store.name(), Arc::clone(store));
    }

    /// Apply one recovered record directly, without locks or logging.
    fn replay(&self, record: &LogRecord) -> StoreResult<()> {
        match record.operation {
            Operation::CreateStore => {
                let inner = StoreInner::new(self.next_store_id(), &record.store, None, false);
                self.catalog.write().insert(record.store.clone(), Arc::new(inner));
            }
            Operation::RenameStore => {
                let to = String::from_utf8_lossy(&record.value).into_owned();
                let mut catalog = self.catalog.write();
                if let Some(store) = catalog.remove(&record.store) {
                    *store.name.write() = to.clone();
                    catalog.insert(to, store);
                }
            }
            Operation::DropStore => {
                self.catalog.write().remove(&record.store);
            }
            Operation::Put | Operation::Delete => {
                let store = self
                    .lookup(&record.store)
                    .ok_or_else(|| StoreError::StoreNotFound { name: record.store.clone() })?;
                let value = (record.operation == Operation::Put).then_some(record.value.as_slice());
                store.apply(&record.key, value)?;
            }
            Operation::Commit => {}
        }
        Ok(())
    }
}

/// Summary of what [`Environment::open`] recovered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Stores loaded from the snapshot
    pub snapshot_stores: usize,
    /// Records loaded from the snapshot
    pub snapshot_records: usize,
    /// Committed WAL transactions replayed
    pub transactions: usize,
}

/// An open storage environment.
///
/// Cheap to clone; all clones share the same stores, lock table and WAL.
#[derive(Clone)]
pub struct Environment {
    shared: Arc<Shared>,
    recovery: RecoveryStats,
}

impl Environment {
    /// Open or create an environment at `path`.
    ///
    /// Loads the latest snapshot, replays committed WAL transactions written
    /// after it, and opens the WAL for appending.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> StoreResult<Self> {
        config.validate().map_err(|reason| StoreError::Io {
            path: None,
            kind: std::io::ErrorKind::InvalidInput,
            message: format!("Invalid configuration: {}", reason),
        })?;
        let path = path.as_ref().to_path_buf();
        let wal_dir = path.join("wal");
        std::fs::create_dir_all(&wal_dir)
            .map_err(|e| StoreError::io(&wal_dir, "Failed to create WAL directory", e))?;

        let limits = SizeLimits { max_key_size: config.max_key_size, max_value_size: config.max_value_size };
        let wal = WalWriter::new(&wal_dir, limits, config.wal_rotation_size_bytes)?;
        let shared = Arc::new(Shared {
            locks: LockManager::new(config.lock_timeout),
            config,
            path: path.clone(),
            wal: Mutex::new(wal),
            catalog: RwLock::new(HashMap::new()),
            next_store_id: AtomicU64::new(1),
            next_locker: AtomicU64::new(1),
            active: Mutex::new(0),
        });

        let mut recovery = RecoveryStats::default();
        let mut from_sequence = 0;
        if let Some(snapshot) = read_snapshot(&path)? {
            from_sequence = snapshot.wal_sequence;
            for (name, records) in snapshot.stores {
                let inner = StoreInner::new(shared.next_store_id(), &name, None, false);
                for (key, value) in &records {
                    inner.apply(key, Some(value))?;
                }
                recovery.snapshot_stores += 1;
                recovery.snapshot_records += records.len();
                shared.catalog.write().insert(name, Arc::new(inner));
            }
        }

        for txn in WalReader::new(&wal_dir).committed_transactions(from_sequence)? {
            for record in &txn {
                shared.replay(record)?;
            }
            recovery.transactions += 1;
        }

        if recovery != RecoveryStats::default() {
            tracing::info!(
                path = %path.display(),
                snapshot_stores = recovery.snapshot_stores,
                snapshot_records = recovery.snapshot_records,
                transactions = recovery.transactions,
                "recovered environment"
            );
        }

        Ok(Self { shared, recovery })
    }

    /// What was recovered when the environment was opened
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery
    }

    /// Environment directory
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Engine configuration
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Begin a transaction.
    pub fn begin(&self) -> StoreResult<TxnHandle> {
        Ok(self.shared.begin())
    }

    /// Number of transactions neither committed nor aborted
    pub fn active_transactions(&self) -> usize {
        *self.shared.active.lock()
    }

    /// True if a store called `name` exists
    pub fn store_exists(&self, name: &str) -> bool {
        self.shared.catalog.read().contains_key(name)
    }

    /// Names of all stores, sorted
    pub fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.catalog.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Open the store called `name`, creating it if `options.create` is set.
    ///
    /// The first open of a recovered store installs `options.comparator`;
    /// later opens must name the same ordering.
    pub fn open_store(&self, name: &str, options: StoreOptions) -> StoreResult<Store> {
        if let Some(inner) = self.shared.lookup(name) {
            inner.install_comparator(options.comparator)?;
            return Ok(Store::new(inner, Arc::clone(&self.shared)));
        }
        if !options.create {
            return Err(StoreError::StoreNotFound { name: name.to_string() });
        }
        match self.create_store(None, name, options.comparator.clone()) {
            Err(StoreError::StoreExists { .. }) => {
                // Lost a creation race; open the winner's store
                let inner = self
                    .shared
                    .lookup(name)
                    .ok_or_else(|| StoreError::StoreNotFound { name: name.to_string() })?;
                inner.install_comparator(options.comparator)?;
                Ok(Store::new(inner, Arc::clone(&self.shared)))
            }
            other => other,
        }
    }

    /// Create an empty store ordered by `comparator`.
    pub fn create_store(
        &self,
        txn: Option<&TxnHandle>,
        name: &str,
        comparator: Option<Arc<dyn KeyComparator>>,
    ) -> StoreResult<Store> {
        self.shared.autocommit(txn, |txn| {
            txn.ensure_active()?;
            self.shared.lock_name(txn, name)?;
            let inner = {
                let mut catalog = self.shared.catalog.write();
                if catalog.contains_key(name) {
                    return Err(StoreError::StoreExists { name: name.to_string() });
                }
                let inner = Arc::new(StoreInner::new(self.shared.next_store_id(), name, comparator.clone(), true));
                catalog.insert(name.to_string(), Arc::clone(&inner));
                inner
            };
            txn.record(Undo::Created { store: Arc::clone(&inner) }, Some(LogRecord::create_store(txn.id(), name)))?;
            tracing::debug!(store = name, comparator = comparator_name(comparator.as_ref()), "created store");
            Ok(Store::new(inner, Arc::clone(&self.shared)))
        })
    }

    /// Rename store `from` to `to`. Open handles follow the store.
    pub fn rename_store(&self, txn: Option<&TxnHandle>, from: &str, to: &str) -> StoreResult<()> {
        self.shared.autocommit(txn, |txn| {
            txn.ensure_active()?;
            self.shared.lock_name(txn, from)?;
            self.shared.lock_name(txn, to)?;
            let inner = {
                let mut catalog = self.shared.catalog.write();
                if catalog.contains_key(to) {
                    return Err(StoreError::StoreExists { name: to.to_string() });
                }
                let inner = catalog.remove(from).ok_or_else(|| StoreError::StoreNotFound { name: from.to_string() })?;
                *inner.name.write() = to.to_string();
                catalog.insert(to.to_string(), Arc::clone(&inner));
                inner
            };
            txn.record(
                Undo::Renamed { store: inner, from: from.to_string() },
                Some(LogRecord::rename_store(txn.id(), from, to)),
            )
        })
    }

    /// Drop store `name` and all of its records.
    ///
    /// Handles to the store fail with `StoreDropped` once this commits.
    pub fn drop_store(&self, txn: Option<&TxnHandle>, name: &str) -> StoreResult<()> {
        self.shared.autocommit(txn, |txn| {
            txn.ensure_active()?;
            self.shared.lock_name(txn, name)?;
            let inner = self
                .shared
                .catalog
                .write()
                .remove(name)
                .ok_or_else(|| StoreError::StoreNotFound { name: name.to_string() })?;
            inner.set_dropped(true);
            txn.record(Undo::Dropped { store: inner }, Some(LogRecord::drop_store(txn.id(), name)))
        })
    }

    /// Write a snapshot of every store and retire the WAL segments it covers.
    ///
    /// Refused with `CheckpointBusy` while any transaction is active; new
    /// transactions wait until the checkpoint finishes.
    pub fn checkpoint(&self) -> StoreResult<SnapshotResult> {
        let active = self.shared.active.lock();
        if *active > 0 {
            return Err(StoreError::CheckpointBusy { active: *active });
        }

        let mut wal = self.shared.wal.lock();
        let sequence = wal.start_new_segment()?;

        let mut images: Vec<StoreImage> = self
            .shared
            .catalog
            .read()
            .iter()
            .map(|(name, store)| (name.clone(), store.snapshot_records()))
            .collect();
        images.sort_by(|a, b| a.0.cmp(&b.0));

        let result = write_snapshot(&self.shared.path, sequence, &images, self.shared.limits())?;
        let retired = wal.retire_segments_before(sequence)?;
        drop(wal);
        drop(active);

        tracing::info!(
            stores = result.stores,
            records = result.records,
            bytes = result.bytes,
            retired_segments = retired,
            "checkpoint complete"
        );
        Ok(result)
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment").field("path", &self.shared.path).finish()
    }
}
