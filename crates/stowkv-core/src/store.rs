//! Named ordered stores
//!
//! A store is an ordered map from key bytes to value bytes held in RAM. Keys
//! are ordered by raw bytes unless a [`KeyComparator`] is installed. Every
//! write also maintains the store's associated secondary indices.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cursor::Cursor;
use crate::engine::Shared;
use crate::error::{StoreError, StoreResult};
use crate::format::LogRecord;
use crate::index::{Index, IndexDefinition, IndexInner, IndexUpdate};
use crate::lock::LockMode;
use crate::txn::{TxnHandle, Undo};

/// Name reported for stores ordered by raw bytes
pub const BYTEWISE: &str = "bytewise";

/// User-supplied key ordering.
///
/// Must be a total order consistent with equality of the encoded keys. The
/// name identifies the ordering across reopens of the same store.
pub trait KeyComparator: Send + Sync {
    /// Stable name of this ordering
    fn name(&self) -> &str;

    /// Compare two encoded keys
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Name of an optional comparator, [`BYTEWISE`] when absent.
pub fn comparator_name(comparator: Option<&Arc<dyn KeyComparator>>) -> &str {
    comparator.map_or(BYTEWISE, |c| c.name())
}

/// Key bytes paired with the ordering they sort under.
#[derive(Clone)]
pub(crate) struct SortKey {
    pub(crate) bytes: Vec<u8>,
    order: Option<Arc<dyn KeyComparator>>,
}

impl SortKey {
    pub(crate) fn new(bytes: Vec<u8>, order: Option<Arc<dyn KeyComparator>>) -> Self {
        Self { bytes, order }
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match &self.order {
            Some(comparator) => comparator.compare(&self.bytes, &other.bytes),
            None => self.bytes.cmp(&other.bytes),
        }
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

impl fmt::Debug for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SortKey({:02x?})", self.bytes)
    }
}

/// Options for [`crate::Environment::open_store`]
#[derive(Clone, Default)]
pub struct StoreOptions {
    /// Create the store if it does not exist
    pub create: bool,
    /// Key ordering; raw bytes when `None`
    pub comparator: Option<Arc<dyn KeyComparator>>,
}

impl StoreOptions {
    /// Options that create the store when missing
    pub fn create() -> Self {
        Self { create: true, comparator: None }
    }

    /// Use `comparator` for key ordering
    pub fn with_comparator(mut self, comparator: Arc<dyn KeyComparator>) -> Self {
        self.comparator = Some(comparator);
        self
    }
}

/// Store statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of records
    pub record_count: usize,
    /// Names of associated indices
    pub indices: Vec<String>,
}

pub(crate) struct OrderState {
    pub(crate) comparator: Option<Arc<dyn KeyComparator>>,
    /// False for stores recovered from disk and not yet opened: the first
    /// open installs its comparator.
    pub(crate) fixed: bool,
}

/// A stored value. A delete by a transaction that has not finished leaves
/// the record in place as a tombstone owned by that transaction, so readers
/// still find the key and block on the deleter's lock.
#[derive(Debug, Clone)]
pub(crate) struct Record {
    pub(crate) value: Vec<u8>,
    pub(crate) deleted_by: Option<u64>,
}

impl Record {
    fn live(value: &[u8]) -> Self {
        Self { value: value.to_vec(), deleted_by: None }
    }

    pub(crate) fn live_value(&self) -> Option<&[u8]> {
        match self.deleted_by {
            None => Some(&self.value),
            Some(_) => None,
        }
    }

    /// Counted for `reader`: live, or deleted by some other transaction.
    fn visible_to(&self, reader: Option<u64>) -> bool {
        self.deleted_by.is_none() || self.deleted_by != reader
    }
}

pub(crate) type Records = BTreeMap<SortKey, Record>;

/// Where to look for the next record relative to a probe key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Seek {
    First,
    Last,
    Ge,
    Gt,
    Lt,
    Exact,
}

pub(crate) struct StoreInner {
    pub(crate) id: u64,
    pub(crate) name: RwLock<String>,
    pub(crate) order: RwLock<OrderState>,
    pub(crate) data: RwLock<Records>,
    pub(crate) indices: RwLock<Vec<Arc<IndexInner>>>,
    dropped: AtomicBool,
}

impl StoreInner {
    pub(crate) fn new(id: u64, name: &str, comparator: Option<Arc<dyn KeyComparator>>, fixed: bool) -> Self {
        Self {
            id,
            name: RwLock::new(name.to_string()),
            order: RwLock::new(OrderState { comparator, fixed }),
            data: RwLock::new(BTreeMap::new()),
            indices: RwLock::new(Vec::new()),
            dropped: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.dropped.load(AtomicOrdering::Acquire)
    }

    pub(crate) fn set_dropped(&self, dropped: bool) {
        self.dropped.store(dropped, AtomicOrdering::Release);
    }

    /// Install `requested` as the store's ordering, or check it matches.
    pub(crate) fn install_comparator(&self, requested: Option<Arc<dyn KeyComparator>>) -> StoreResult<()> {
        let mut order = self.order.write();
        let installed = comparator_name(order.comparator.as_ref()).to_string();
        let wanted = comparator_name(requested.as_ref()).to_string();

        if order.fixed {
            if installed != wanted {
                return Err(StoreError::ComparatorMismatch { name: self.name(), installed, requested: wanted });
            }
            return Ok(());
        }

        if installed != wanted {
            let mut data = self.data.write();
            let old = std::mem::take(&mut *data);
            for (key, value) in old {
                data.insert(SortKey::new(key.bytes, requested.clone()), value);
            }
            for index in self.indices.read().iter() {
                index.reorder_primary(requested.clone());
            }
            tracing::debug!(store = %self.name(), comparator = %wanted, "re-sorted recovered store");
        }
        order.comparator = requested;
        order.fixed = true;
        Ok(())
    }

    pub(crate) fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match &self.order.read().comparator {
            Some(comparator) => comparator.compare(a, b),
            None => a.cmp(b),
        }
    }

    /// Current value of `key`, without locking. Tombstones read as absent.
    pub(crate) fn read_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        let order = self.order.read();
        let probe = SortKey::new(key.to_vec(), order.comparator.clone());
        self.data.read().get(&probe).and_then(Record::live_value).map(<[u8]>::to_vec)
    }

    /// Key of the record `seek` finds relative to `key`, without locking.
    /// Tombstones are candidates too.
    pub(crate) fn find_key(&self, seek: Seek, key: &[u8]) -> Option<Vec<u8>> {
        let order = self.order.read();
        let probe = SortKey::new(key.to_vec(), order.comparator.clone());
        let data = self.data.read();
        let found = match seek {
            Seek::First => data.keys().next(),
            Seek::Last => data.keys().next_back(),
            Seek::Ge => data.range((Bound::Included(&probe), Bound::Unbounded)).next().map(|(k, _)| k),
            Seek::Gt => data.range((Bound::Excluded(&probe), Bound::Unbounded)).next().map(|(k, _)| k),
            Seek::Lt => data.range((Bound::Unbounded, Bound::Excluded(&probe))).next_back().map(|(k, _)| k),
            Seek::Exact => data.get_key_value(&probe).map(|(k, _)| k),
        };
        found.map(|k| k.bytes.clone())
    }

    /// Record count as seen by `reader`: its own pending deletes are gone,
    /// everyone else's still count.
    pub(crate) fn len(&self, reader: Option<u64>) -> usize {
        self.data.read().values().filter(|record| record.visible_to(reader)).count()
    }

    /// Write `value` (or delete when `None`) outright, for recovery and undo.
    pub(crate) fn apply(&self, key: &[u8], value: Option<&[u8]>) -> StoreResult<Option<Vec<u8>>> {
        self.update(None, key, value)
    }

    /// Write on behalf of transaction `txn_id`. A delete leaves a tombstone
    /// that [`StoreInner::purge`] removes at commit.
    pub(crate) fn apply_in(&self, txn_id: u64, key: &[u8], value: Option<&[u8]>) -> StoreResult<Option<Vec<u8>>> {
        self.update(Some(txn_id), key, value)
    }

    /// Secondary keys are extracted before anything changes, so an
    /// extractor failure leaves the store and its indices untouched.
    fn update(&self, owner: Option<u64>, key: &[u8], value: Option<&[u8]>) -> StoreResult<Option<Vec<u8>>> {
        let order = self.order.read();
        let sort_key = SortKey::new(key.to_vec(), order.comparator.clone());
        let mut data = self.data.write();
        let previous = data.get(&sort_key).and_then(Record::live_value).map(<[u8]>::to_vec);
        if owner.is_some() && value.is_none() && previous.is_none() {
            return Ok(None);
        }

        let indices = self.indices.read();
        let mut updates: Vec<(&Arc<IndexInner>, IndexUpdate)> = Vec::with_capacity(indices.len());
        for index in indices.iter() {
            updates.push((index, index.plan(key, previous.as_deref(), value)?));
        }

        match (value, owner, &previous) {
            (Some(value), _, _) => {
                data.insert(sort_key, Record::live(value));
            }
            (None, Some(txn_id), Some(previous)) => {
                data.insert(sort_key, Record { value: previous.clone(), deleted_by: Some(txn_id) });
            }
            (None, _, _) => {
                data.remove(&sort_key);
            }
        }
        for (index, update) in updates {
            index.apply(key, update, owner);
        }
        Ok(previous)
    }

    /// Drop the tombstones transaction `txn_id` left for `key`, once its
    /// delete is committed. `previous` locates the index entries it hid.
    pub(crate) fn purge(&self, txn_id: u64, key: &[u8], previous: Option<&[u8]>) {
        let order = self.order.read();
        let sort_key = SortKey::new(key.to_vec(), order.comparator.clone());
        let mut data = self.data.write();
        if data.get(&sort_key).is_some_and(|record| record.deleted_by == Some(txn_id)) {
            data.remove(&sort_key);
        }
        if let Some(previous) = previous {
            for index in self.indices.read().iter() {
                index.purge(txn_id, key, previous);
            }
        }
    }

    pub(crate) fn snapshot_records(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.data
            .read()
            .iter()
            .filter_map(|(k, record)| record.live_value().map(|value| (k.bytes.clone(), value.to_vec())))
            .collect()
    }
}

/// Handle to a named store in an [`crate::Environment`].
///
/// Cheap to clone; all clones refer to the same store. Operations taking
/// `txn: None` run as a single-operation transaction.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
    pub(crate) shared: Arc<Shared>,
}

impl Store {
    pub(crate) fn new(inner: Arc<StoreInner>, shared: Arc<Shared>) -> Self {
        Self { inner, shared }
    }

    /// Current name of the store
    pub fn name(&self) -> String {
        self.inner.name()
    }

    /// Identifier that stays the same across renames
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The installed key ordering, `None` for raw bytes
    pub fn comparator(&self) -> Option<Arc<dyn KeyComparator>> {
        self.inner.order.read().comparator.clone()
    }

    /// Compare two keys under the store's ordering
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.inner.compare(a, b)
    }

    /// True once the store has been dropped (and the drop not rolled back)
    pub fn is_dropped(&self) -> bool {
        self.inner.is_dropped()
    }

    pub(crate) fn ensure_live(&self) -> StoreResult<()> {
        if self.inner.is_dropped() {
            return Err(StoreError::StoreDropped { name: self.name() });
        }
        Ok(())
    }

    /// Take a shared lock on `key` for `txn`, or for a short-lived locker
    /// whose id is returned so the caller can release it after reading.
    pub(crate) fn lock_for_read(&self, txn: Option<&TxnHandle>, key: &[u8]) -> StoreResult<Option<u64>> {
        let lock_key = (self.inner.id, key.to_vec());
        match txn {
            Some(txn) => {
                txn.ensure_active()?;
                self.shared.locks.acquire(txn.id(), &lock_key, LockMode::Shared, &self.name())?;
                Ok(None)
            }
            None => {
                let locker = self.shared.next_locker();
                self.shared.locks.acquire(locker, &lock_key, LockMode::Shared, &self.name())?;
                Ok(Some(locker))
            }
        }
    }

    pub(crate) fn release_read(&self, locker: Option<u64>, key: &[u8]) {
        if let Some(locker) = locker {
            self.shared.locks.release(locker, &(self.inner.id, key.to_vec()));
        }
    }

    /// Read the value stored under `key`.
    pub fn get(&self, txn: Option<&TxnHandle>, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.ensure_live()?;
        let locker = self.lock_for_read(txn, key)?;
        let value = self.inner.read_value(key);
        self.release_read(locker, key);
        Ok(value)
    }

    /// Store `value` under `key`, returning the previous value.
    pub fn put(&self, txn: Option<&TxnHandle>, key: &[u8], value: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.shared.check_sizes(key, value)?;
        self.shared.autocommit(txn, |txn| self.write(txn, key, Some(value)))
    }

    /// Delete `key`, returning the value it held.
    pub fn delete(&self, txn: Option<&TxnHandle>, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.shared.autocommit(txn, |txn| self.write(txn, key, None))
    }

    fn write(&self, txn: &TxnHandle, key: &[u8], value: Option<&[u8]>) -> StoreResult<Option<Vec<u8>>> {
        txn.ensure_active()?;
        self.ensure_live()?;
        let name = self.name();
        self.shared
            .locks
            .acquire(txn.id(), &(self.inner.id, key.to_vec()), LockMode::Exclusive, &name)?;

        let previous = self.inner.apply_in(txn.id(), key, value)?;
        if value.is_none() && previous.is_none() {
            return Ok(None);
        }
        let redo = match value {
            Some(value) => LogRecord::put(txn.id(), &name, key, value),
            None => LogRecord::delete(txn.id(), &name, key),
        };
        let undo = Undo::Record { store: Arc::clone(&self.inner), key: key.to_vec(), previous: previous.clone() };
        if let Err(e) = txn.record(undo, Some(redo)) {
            // Finished concurrently: put the record back as it was
            self.inner.apply(key, previous.as_deref())?;
            return Err(e);
        }
        Ok(previous)
    }

    /// Record count and index names. Deletes that are not yet committed
    /// still count.
    pub fn stats(&self) -> StoreResult<StoreStats> {
        self.ensure_live()?;
        let indices = self.inner.indices.read().iter().map(|i| i.name.clone()).collect();
        Ok(StoreStats { record_count: self.inner.len(None), indices })
    }

    /// Number of records visible to `txn`: its own deletes no longer count.
    pub fn count(&self, txn: Option<&TxnHandle>) -> StoreResult<usize> {
        self.ensure_live()?;
        if let Some(txn) = txn {
            txn.ensure_active()?;
        }
        Ok(self.inner.len(txn.map(TxnHandle::id)))
    }

    /// Open a cursor, bound to `txn` when given.
    pub fn cursor(&self, txn: Option<&TxnHandle>) -> StoreResult<Cursor> {
        self.ensure_live()?;
        if let Some(txn) = txn {
            txn.ensure_active()?;
        }
        Ok(Cursor::new(self.clone(), txn.cloned()))
    }

    /// Associate a secondary index with the store.
    ///
    /// A new index is populated from the existing records and the flag is
    /// true. If an index with the same name is already associated it is
    /// returned unchanged and the flag is false.
    pub fn associate(&self, definition: IndexDefinition) -> StoreResult<(Index, bool)> {
        self.ensure_live()?;
        let order = self.inner.order.read();
        let data = self.inner.data.read();
        {
            let indices = self.inner.indices.read();
            if let Some(existing) = indices.iter().find(|i| i.name == definition.name) {
                return Ok((Index::new(Arc::clone(existing), self.clone()), false));
            }
        }

        let index = Arc::new(IndexInner::new(definition, order.comparator.clone()));
        index.populate(&data)?;
        self.inner.indices.write().push(Arc::clone(&index));
        tracing::debug!(store = %self.name(), index = %index.name, entries = index.len(), "associated index");
        Ok((Index::new(index, self.clone()), true))
    }

    /// Detach the named index; later writes no longer maintain it.
    pub fn dissociate(&self, name: &str) -> StoreResult<()> {
        let mut indices = self.inner.indices.write();
        let before = indices.len();
        indices.retain(|i| i.name != name);
        if indices.len() == before {
            return Err(StoreError::IndexNotFound { store: self.name(), index: name.to_string() });
        }
        Ok(())
    }

    /// The associated index called `name`, if any
    pub fn index(&self, name: &str) -> Option<Index> {
        let indices = self.inner.indices.read();
        indices.iter().find(|i| i.name == name).map(|i| Index::new(Arc::clone(i), self.clone()))
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("id", &self.inner.id).field("name", &self.name()).finish()
    }
}
