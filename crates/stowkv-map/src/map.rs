//! The primary map: a typed, ordered, transactional view of one store

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use stowkv_core::{Environment, Index, IndexDefinition, KeyComparator, KeyValue, Store, StoreError, StoreResult, TxnHandle};

use crate::codec::{Codec, KeyOrder};
use crate::database::{Connection, StoreHandle};
use crate::entry::{Codecs, Entry};
use crate::error::{MapError, MapResult};
use crate::index::{IndexBinding, IndexSpec, SecondaryIndex};
use crate::iter::{Keys, MapIter, Values, Walk};
use crate::range::ViewBounds;
use crate::retry::RetryPolicy;
use crate::search::{self, SearchKind};
use crate::view::MapView;

/// How to open a map
pub struct MapOptions<K, V> {
    pub(crate) codecs: Codecs<K, V>,
    pub(crate) order: KeyOrder,
    pub(crate) indices: Vec<Arc<dyn IndexBinding<V>>>,
    pub(crate) create: bool,
    pub(crate) retry: Option<RetryPolicy>,
}

impl<K: 'static, V: 'static> MapOptions<K, V> {
    /// Options with the given codecs, no key ordering, no indices, and
    /// `create` unset.
    pub fn new(key_codec: impl Codec<K> + 'static, value_codec: impl Codec<V> + 'static) -> Self {
        Self {
            codecs: Codecs { key: Arc::new(key_codec), value: Arc::new(value_codec) },
            order: KeyOrder::Unordered,
            indices: Vec::new(),
            create: false,
            retry: None,
        }
    }

    /// Key ordering for navigable search and views
    pub fn order(mut self, order: KeyOrder) -> Self {
        self.order = order;
        self
    }

    /// Order keys by their encoded bytes
    pub fn ordered(self) -> Self {
        self.order(KeyOrder::Bytewise)
    }

    /// Order keys with `comparator`, installed in the engine
    pub fn comparator(self, comparator: Arc<dyn KeyComparator>) -> Self {
        self.order(KeyOrder::Custom(comparator))
    }

    /// Create the store if it does not exist
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Maintain a secondary index
    pub fn index<SK: 'static>(mut self, spec: IndexSpec<SK, V>) -> Self {
        self.indices.push(Arc::new(spec));
        self
    }

    /// Retry policy for transaction-free operations; defaults to the
    /// connection's
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

impl<K, V> MapOptions<K, V> {
    pub(crate) fn index_definitions(&self) -> Vec<IndexDefinition> {
        self.indices.iter().map(|binding| binding.definition(Arc::clone(&self.codecs.value))).collect()
    }
}

struct MapInner<K, V> {
    id: u64,
    handle: Arc<StoreHandle>,
    conn: Connection,
    codecs: Codecs<K, V>,
    order: KeyOrder,
    retry: RetryPolicy,
    owns_indices: bool,
    closed: AtomicBool,
}

/// A typed map over one store.
///
/// Every operation consults the connection's ambient transaction. Without
/// one, point operations autocommit and are retried on deadlock; with one,
/// a deadlock surfaces as [`MapError::Deadlock`] and the caller must abort
/// and re-run the whole transaction.
pub struct PrimaryMap<K, V> {
    inner: Arc<MapInner<K, V>>,
}

impl<K, V> Clone for PrimaryMap<K, V> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<K, V> fmt::Debug for PrimaryMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimaryMap")
            .field("store", &self.name())
            .field("order", &self.inner.order)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<K, V> PrimaryMap<K, V> {
    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Store name
    pub fn name(&self) -> &str {
        self.inner.handle.name()
    }

    /// Connection whose ambient transaction this map uses
    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    /// Key ordering
    pub fn order(&self) -> &KeyOrder {
        &self.inner.order
    }

    /// True after [`PrimaryMap::close`] or a `destroy` through any map on
    /// the same store
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.handle.is_closed()
    }

    /// Open iterators on this store, across all maps sharing it
    pub fn open_iterators(&self) -> usize {
        self.inner.handle.registry.len()
    }

    pub(crate) fn handle(&self) -> &Arc<StoreHandle> {
        &self.inner.handle
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn codecs(&self) -> &Codecs<K, V> {
        &self.inner.codecs
    }

    pub(crate) fn retry(&self) -> RetryPolicy {
        self.inner.retry
    }

    pub(crate) fn txn(&self) -> Option<TxnHandle> {
        self.inner.conn.transaction()
    }

    pub(crate) fn store(&self) -> Store {
        self.inner.handle.store()
    }

    fn environment(&self) -> &Environment {
        self.inner.conn.database().environment()
    }

    pub(crate) fn ensure_open(&self) -> MapResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(MapError::Closed { store: self.name().to_string() });
        }
        self.inner.handle.ensure_open()
    }
}

impl<K: 'static, V: 'static> PrimaryMap<K, V> {
    pub(crate) fn new(
        id: u64,
        handle: Arc<StoreHandle>,
        conn: Connection,
        options: MapOptions<K, V>,
        owns_indices: bool,
    ) -> Self {
        let retry = options.retry.unwrap_or_else(|| conn.retry());
        Self {
            inner: Arc::new(MapInner {
                id,
                handle,
                conn,
                codecs: options.codecs,
                order: options.order,
                retry,
                owns_indices,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn encode_key(&self, key: &K) -> MapResult<Vec<u8>> {
        self.inner.codecs.key.encode(key)
    }

    fn decode_value(&self, raw: Option<Vec<u8>>) -> MapResult<Option<V>> {
        raw.map(|bytes| self.inner.codecs.value.decode(&bytes)).transpose()
    }

    pub(crate) fn entry(&self, (key, value): KeyValue) -> Entry<K, V> {
        Entry::new(key, value, self.inner.codecs.clone(), None)
    }

    fn force_close_iterators(&self) {
        self.inner.handle.registry.close_non_transactional(None);
    }

    // -----------------------------------------------------------------------
    // Point operations
    // -----------------------------------------------------------------------

    /// Value stored under `key`
    pub fn get(&self, key: &K) -> MapResult<Option<V>> {
        let raw = self.get_raw(key)?;
        self.decode_value(raw)
    }

    /// True if `key` is present
    pub fn contains_key(&self, key: &K) -> MapResult<bool> {
        Ok(self.get_raw(key)?.is_some())
    }

    fn get_raw(&self, key: &K) -> MapResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        let key = self.encode_key(key)?;
        let store = self.store();
        let txn = self.txn();
        self.retry().run(self.name(), "get", txn.as_ref(), || store.get(txn.as_ref(), &key))
    }

    /// Store `value` under `key`, returning the previous value.
    ///
    /// Outside a transaction this force-closes the store's transaction-free
    /// iterators first.
    pub fn put(&self, key: &K, value: &V) -> MapResult<Option<V>> {
        self.ensure_open()?;
        let key = self.encode_key(key)?;
        let value = self.inner.codecs.value.encode(value)?;
        let store = self.store();
        let txn = self.txn();
        if txn.is_none() {
            self.force_close_iterators();
        }
        let previous = self.retry().run(self.name(), "put", txn.as_ref(), || store.put(txn.as_ref(), &key, &value))?;
        self.decode_value(previous)
    }

    /// Remove `key`, returning its value.
    ///
    /// Outside a transaction this force-closes the store's transaction-free
    /// iterators first.
    pub fn remove(&self, key: &K) -> MapResult<Option<V>> {
        self.ensure_open()?;
        let key = self.encode_key(key)?;
        let store = self.store();
        let txn = self.txn();
        if txn.is_none() {
            self.force_close_iterators();
        }
        let previous = self.retry().run(self.name(), "remove", txn.as_ref(), || store.delete(txn.as_ref(), &key))?;
        self.decode_value(previous)
    }

    /// Number of records
    pub fn len(&self) -> MapResult<usize> {
        self.ensure_open()?;
        let store = self.store();
        let txn = self.txn();
        self.retry().run(self.name(), "len", txn.as_ref(), || store.count(txn.as_ref()))
    }

    /// True if the map has no records
    pub fn is_empty(&self) -> MapResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Delete every record, in the ambient transaction or an internal one.
    pub fn clear(&self) -> MapResult<()> {
        self.ensure_open()?;
        let store = self.store();
        let removed = self.write_txn("clear", |txn| {
            let mut cursor = store.cursor(Some(txn))?;
            let mut removed = 0usize;
            while cursor.next()?.is_some() {
                if cursor.delete()? {
                    removed += 1;
                }
            }
            cursor.close();
            Ok(removed)
        })?;
        tracing::debug!(store = %self.name(), removed, "map cleared");
        Ok(())
    }

    /// Run `work` in the ambient transaction, or in an internal transaction
    /// that is committed on success and aborted on failure. The internal
    /// case force-closes transaction-free iterators and retries deadlocks.
    pub(crate) fn write_txn<T>(
        &self,
        operation: &'static str,
        mut work: impl FnMut(&TxnHandle) -> StoreResult<T>,
    ) -> MapResult<T> {
        if let Some(txn) = self.txn() {
            return self.retry().run(self.name(), operation, Some(&txn), || work(&txn));
        }
        self.force_close_iterators();
        let env = self.environment();
        self.retry().run(self.name(), operation, None, || {
            let txn = env.begin()?;
            match work(&txn) {
                Ok(value) => {
                    txn.commit()?;
                    Ok(value)
                }
                Err(e) => {
                    if let Err(abort_error) = txn.abort() {
                        tracing::warn!(txn = txn.id(), error = %abort_error, "rollback failed");
                    }
                    Err(e)
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    /// Run a search within `bounds` and return the raw record.
    pub(crate) fn locate(
        &self,
        bounds: &ViewBounds,
        kind: SearchKind,
        target: &[u8],
        operation: &'static str,
    ) -> MapResult<Option<KeyValue>> {
        self.ensure_open()?;
        let store = self.store();
        let cmp = |a: &[u8], b: &[u8]| store.compare(a, b);
        let (kind, target) = bounds.plan(kind, target, &cmp);
        let valid = |key: &[u8]| bounds.contains(key, &cmp);
        let txn = self.txn();
        self.retry().run(self.name(), operation, txn.as_ref(), || {
            let mut cursor = store.cursor(txn.as_ref())?;
            let found = search::position(&mut cursor, kind, &target, Some(&valid));
            cursor.close();
            found
        })
    }

    /// Find the record `kind` selects within `bounds` and delete it.
    pub(crate) fn poll(&self, bounds: &ViewBounds, kind: SearchKind) -> MapResult<Option<Entry<K, V>>> {
        self.ensure_open()?;
        self.inner.order.require("poll")?;
        let store = self.store();
        let cmp = |a: &[u8], b: &[u8]| store.compare(a, b);
        let (kind, target) = bounds.plan(kind, &[], &cmp);
        let valid = |key: &[u8]| bounds.contains(key, &cmp);
        let found = self.write_txn("poll", |txn| {
            let mut cursor = store.cursor(Some(txn))?;
            let found = search::position(&mut cursor, kind, &target, Some(&valid))?;
            if found.is_some() {
                cursor.delete()?;
            }
            cursor.close();
            Ok(found)
        })?;
        Ok(found.map(|record| self.entry(record)))
    }

    pub(crate) fn iterate(&self, bounds: ViewBounds) -> MapResult<MapIter<K, V>> {
        self.ensure_open()?;
        let txn = self.txn();
        let cursor = self.store().cursor(txn.as_ref()).map_err(|e| MapError::engine(self.name(), "iterate", e))?;
        let walk = Walk::bounded(Arc::clone(&self.inner.handle), self.inner.id, cursor, self.retry(), bounds);
        Ok(MapIter::new(walk, self.inner.codecs.clone()))
    }

    // -----------------------------------------------------------------------
    // Navigation (whole map)
    // -----------------------------------------------------------------------

    fn whole(&self) -> MapView<K, V> {
        MapView::new(self.clone(), ViewBounds::default())
    }

    /// Entry with the smallest key
    pub fn first_entry(&self) -> MapResult<Option<Entry<K, V>>> {
        self.whole().first_entry()
    }

    /// Entry with the largest key
    pub fn last_entry(&self) -> MapResult<Option<Entry<K, V>>> {
        self.whole().last_entry()
    }

    /// Entry with the smallest key >= `key`
    pub fn ceiling_entry(&self, key: &K) -> MapResult<Option<Entry<K, V>>> {
        self.whole().ceiling_entry(key)
    }

    /// Entry with the largest key <= `key`
    pub fn floor_entry(&self, key: &K) -> MapResult<Option<Entry<K, V>>> {
        self.whole().floor_entry(key)
    }

    /// Entry with the smallest key > `key`
    pub fn higher_entry(&self, key: &K) -> MapResult<Option<Entry<K, V>>> {
        self.whole().higher_entry(key)
    }

    /// Entry with the largest key < `key`
    pub fn lower_entry(&self, key: &K) -> MapResult<Option<Entry<K, V>>> {
        self.whole().lower_entry(key)
    }

    /// Smallest key; `NoSuchElement` when empty
    pub fn first_key(&self) -> MapResult<K> {
        self.whole().first_key()
    }

    /// Largest key; `NoSuchElement` when empty
    pub fn last_key(&self) -> MapResult<K> {
        self.whole().last_key()
    }

    /// Smallest key >= `key`
    pub fn ceiling_key(&self, key: &K) -> MapResult<Option<K>> {
        self.whole().ceiling_key(key)
    }

    /// Largest key <= `key`
    pub fn floor_key(&self, key: &K) -> MapResult<Option<K>> {
        self.whole().floor_key(key)
    }

    /// Smallest key > `key`
    pub fn higher_key(&self, key: &K) -> MapResult<Option<K>> {
        self.whole().higher_key(key)
    }

    /// Largest key < `key`
    pub fn lower_key(&self, key: &K) -> MapResult<Option<K>> {
        self.whole().lower_key(key)
    }

    /// Remove and return the first entry
    pub fn poll_first_entry(&self) -> MapResult<Option<Entry<K, V>>> {
        self.whole().poll_first_entry()
    }

    /// Remove and return the last entry
    pub fn poll_last_entry(&self) -> MapResult<Option<Entry<K, V>>> {
        self.whole().poll_last_entry()
    }

    // -----------------------------------------------------------------------
    // Views and iteration
    // -----------------------------------------------------------------------

    /// Keys before `to`
    pub fn head_view(&self, to: &K, inclusive: bool) -> MapResult<MapView<K, V>> {
        self.whole().head_view(to, inclusive)
    }

    /// Keys from `from` on
    pub fn tail_view(&self, from: &K, inclusive: bool) -> MapResult<MapView<K, V>> {
        self.whole().tail_view(from, inclusive)
    }

    /// Keys between `from` and `to`
    pub fn sub_view(&self, from: &K, from_inclusive: bool, to: &K, to_inclusive: bool) -> MapResult<MapView<K, V>> {
        self.whole().sub_view(from, from_inclusive, to, to_inclusive)
    }

    /// The whole map in reverse key order
    pub fn descending_view(&self) -> MapResult<Arc<MapView<K, V>>> {
        self.inner.order.require("descending_view")?;
        Ok(Arc::new(MapView::new(self.clone(), ViewBounds::default().reversed())))
    }

    /// Iterator over every entry in key order
    pub fn iter(&self) -> MapResult<MapIter<K, V>> {
        self.iterate(ViewBounds::default())
    }

    /// Iterator over every key
    pub fn keys(&self) -> MapResult<Keys<K, V>> {
        self.iter().map(Keys::new)
    }

    /// Iterator over every value
    pub fn values(&self) -> MapResult<Values<K, V>> {
        self.iter().map(Values::new)
    }

    // -----------------------------------------------------------------------
    // Indices
    // -----------------------------------------------------------------------

    /// The secondary index described by `spec`, which must have been part
    /// of the index set when the store was opened or last recreated.
    pub fn index<SK: 'static>(&self, spec: &IndexSpec<SK, V>) -> MapResult<SecondaryIndex<SK, K, V>> {
        self.ensure_open()?;
        let index = self.inner.handle.index(spec.name()).ok_or_else(|| {
            MapError::engine(
                self.name(),
                "index",
                StoreError::IndexNotFound { store: self.name().to_string(), index: spec.name().to_string() },
            )
        })?;
        Ok(SecondaryIndex::new(self.clone(), index, spec, self.inner.owns_indices))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Close this map: its transaction-free iterators are closed and later
    /// operations fail with `Closed`. Other maps on the store are unaffected.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            let iterators = self.inner.handle.registry.close_non_transactional(Some(self.inner.id));
            tracing::debug!(store = %self.name(), iterators, "map closed");
        }
    }

    /// Delete the store and its indices. Every map on the store is closed.
    /// Not allowed inside a transaction.
    pub fn destroy(&self) -> MapResult<()> {
        if self.txn().is_some() {
            return Err(MapError::Unsupported("destroy inside a transaction"));
        }
        self.ensure_open()?;
        self.force_close_iterators();
        let handle = &self.inner.handle;
        let env = self.environment();
        self.retry().run(handle.name(), "destroy", None, || env.drop_store(None, handle.name()))?;
        handle.mark_closed();
        self.inner.conn.database().forget(handle.name());
        tracing::info!(store = %handle.name(), "map destroyed");
        Ok(())
    }

    /// Rebuild the store with a new index set, keeping every record.
    ///
    /// In one transaction the store is renamed aside, a replacement is
    /// created with `indices` associated, every record is copied across,
    /// and the old store with its indices is dropped. Not allowed inside a
    /// transaction.
    pub fn recreate(&self, indices: &[&dyn IndexBinding<V>]) -> MapResult<()> {
        if self.txn().is_some() {
            return Err(MapError::Unsupported("recreate inside a transaction"));
        }
        self.ensure_open()?;
        self.force_close_iterators();

        let handle = &self.inner.handle;
        let env = self.environment();
        let old = handle.store();
        let comparator = self.inner.order.comparator();
        let definitions: Vec<IndexDefinition> =
            indices.iter().map(|binding| binding.definition(Arc::clone(&self.inner.codecs.value))).collect();

        let (store, attached) = self.retry().run(handle.name(), "recreate", None, || {
            let txn = env.begin()?;
            match rebuild(env, &txn, &old, handle.name(), comparator.clone(), &definitions) {
                Ok(rebuilt) => {
                    txn.commit()?;
                    Ok(rebuilt)
                }
                Err(e) => {
                    if let Err(abort_error) = txn.abort() {
                        tracing::warn!(txn = txn.id(), error = %abort_error, "rollback failed");
                    }
                    Err(e)
                }
            }
        })?;

        let count = attached.len();
        handle.replace(store, attached);
        tracing::info!(store = %handle.name(), indices = count, "map recreated");
        Ok(())
    }
}

fn rebuild(
    env: &Environment,
    txn: &TxnHandle,
    old: &Store,
    name: &str,
    comparator: Option<Arc<dyn KeyComparator>>,
    definitions: &[IndexDefinition],
) -> StoreResult<(Store, Vec<Index>)> {
    let aside = format!("{}.recreate-{}", name, txn.id());
    env.rename_store(Some(txn), name, &aside)?;
    let store = env.create_store(Some(txn), name, comparator)?;

    let mut indices = Vec::with_capacity(definitions.len());
    for definition in definitions {
        indices.push(store.associate(definition.clone())?.0);
    }

    let mut cursor = old.cursor(Some(txn))?;
    let mut copied = 0usize;
    while let Some((key, value)) = cursor.next()? {
        store.put(Some(txn), &key, &value)?;
        copied += 1;
    }
    cursor.close();

    env.drop_store(Some(txn), &aside)?;
    tracing::debug!(store = name, copied, "records copied into replacement store");
    Ok((store, indices))
}
