//! Secondary indices: definitions, lookups and grouped range views.
//!
//! An index is declared with an [`IndexSpec`] when the map is opened. The
//! engine recomputes its secondary key on every primary write, so the
//! index itself is read-only. Lookups resolve to primary entries grouped
//! by secondary key.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use stowkv_core::{Extractor, Index, IndexDefinition, IndexRecord};

use crate::codec::{Codec, KeyOrder};
use crate::entry::Entry;
use crate::error::{MapError, MapResult};
use crate::iter::{self, GroupIter, IndexIter, Walk};
use crate::map::PrimaryMap;
use crate::range::{Bound, ViewBounds};
use crate::search::{self, SearchKind};

type KeyExtractor<SK, V> = Arc<dyn Fn(&V) -> Option<SK> + Send + Sync>;

/// Declares a secondary index over a map's values
pub struct IndexSpec<SK, V> {
    name: String,
    key_codec: Arc<dyn Codec<SK>>,
    extractor: KeyExtractor<SK, V>,
    order: KeyOrder,
}

impl<SK, V> Clone for IndexSpec<SK, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            key_codec: Arc::clone(&self.key_codec),
            extractor: Arc::clone(&self.extractor),
            order: self.order.clone(),
        }
    }
}

impl<SK, V> fmt::Debug for IndexSpec<SK, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexSpec").field("name", &self.name).field("order", &self.order).finish()
    }
}

impl<SK: 'static, V: 'static> IndexSpec<SK, V> {
    /// An unordered index. Records for which `extractor` returns `None` are
    /// left out.
    pub fn new(
        name: impl Into<String>,
        key_codec: impl Codec<SK> + 'static,
        extractor: impl Fn(&V) -> Option<SK> + Send + Sync + 'static,
    ) -> Self {
        Self { name: name.into(), key_codec: Arc::new(key_codec), extractor: Arc::new(extractor), order: KeyOrder::Unordered }
    }

    /// Secondary key ordering for range views
    pub fn order(mut self, order: KeyOrder) -> Self {
        self.order = order;
        self
    }

    /// Order secondary keys by their encoded bytes
    pub fn ordered(self) -> Self {
        self.order(KeyOrder::Bytewise)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Type-erased index declaration, as kept by a map's options
pub trait IndexBinding<V>: Send + Sync {
    /// Index name, unique per store
    fn name(&self) -> &str;

    /// Engine definition: decode the value, extract, encode the secondary key
    fn definition(&self, value_codec: Arc<dyn Codec<V>>) -> IndexDefinition;
}

impl<SK: 'static, V: 'static> IndexBinding<V> for IndexSpec<SK, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn definition(&self, value_codec: Arc<dyn Codec<V>>) -> IndexDefinition {
        let key_codec = Arc::clone(&self.key_codec);
        let extractor = Arc::clone(&self.extractor);
        let extract: Extractor = Arc::new(move |_key: &[u8], value: &[u8]| {
            let value = value_codec.decode(value).map_err(|e| e.to_string())?;
            match extractor(&value) {
                Some(secondary) => key_codec.encode(&secondary).map(Some).map_err(|e| e.to_string()),
                None => Ok(None),
            }
        });
        let definition = IndexDefinition::new(self.name.clone(), extract);
        match self.order.comparator() {
            Some(comparator) => definition.with_comparator(comparator),
            None => definition,
        }
    }
}

/// Primary entries sharing one secondary key, in primary key order
#[derive(Debug)]
pub struct IndexGroup<SK, K, V> {
    pub key: SK,
    pub entries: Vec<Entry<K, V>>,
}

struct IndexShared<SK, K, V> {
    map: PrimaryMap<K, V>,
    index: Index,
    key_codec: Arc<dyn Codec<SK>>,
    order: KeyOrder,
}

impl<SK: 'static, K: 'static, V: 'static> IndexShared<SK, K, V> {
    fn encode(&self, key: &SK) -> MapResult<Vec<u8>> {
        self.key_codec.encode(key)
    }

    /// The duplicate run at exactly `secondary`, empty if there is none
    fn run_at(&self, secondary: &[u8], operation: &'static str) -> MapResult<Vec<IndexRecord>> {
        self.map.ensure_open()?;
        let txn = self.map.txn();
        self.map.retry().run(self.map.name(), operation, txn.as_ref(), || {
            let mut cursor = self.index.cursor(txn.as_ref())?;
            let run = match cursor.seek_exact(secondary)? {
                Some(landed) => iter::collect_run(&mut cursor, &landed)?,
                None => Vec::new(),
            };
            cursor.close();
            Ok(run)
        })
    }

    fn to_group(&self, run: Vec<IndexRecord>) -> MapResult<Option<IndexGroup<SK, K, V>>> {
        if run.is_empty() {
            return Ok(None);
        }
        iter::group(run, self.key_codec.as_ref(), self.map.codecs()).map(Some)
    }

    fn walk(&self, bounds: ViewBounds) -> MapResult<Walk<stowkv_core::IndexCursor>> {
        self.map.ensure_open()?;
        let txn = self.map.txn();
        let cursor = self
            .index
            .cursor(txn.as_ref())
            .map_err(|e| MapError::engine(self.map.name(), "iterate index", e))?;
        Ok(Walk::bounded(Arc::clone(self.map.handle()), self.map.id(), cursor, self.map.retry(), bounds))
    }
}

/// A secondary index of a [`PrimaryMap`]
pub struct SecondaryIndex<SK, K, V> {
    shared: Arc<IndexShared<SK, K, V>>,
    owning: bool,
    closed: AtomicBool,
}

impl<SK, K, V> fmt::Debug for SecondaryIndex<SK, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecondaryIndex")
            .field("name", &self.shared.index.name())
            .field("owning", &self.owning)
            .finish()
    }
}

impl<SK: 'static, K: 'static, V: 'static> SecondaryIndex<SK, K, V> {
    pub(crate) fn new(map: PrimaryMap<K, V>, index: Index, spec: &IndexSpec<SK, V>, owning: bool) -> Self {
        Self {
            shared: Arc::new(IndexShared {
                map,
                index,
                key_codec: Arc::clone(&spec.key_codec),
                order: spec.order.clone(),
            }),
            owning,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        self.shared.index.name()
    }

    /// True if this reference created the association and closing it
    /// detaches the index
    pub fn is_owning(&self) -> bool {
        self.owning
    }

    fn ensure_open(&self) -> MapResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MapError::Closed { store: self.shared.map.name().to_string() });
        }
        self.shared.map.ensure_open()
    }

    /// Entries whose secondary key equals `key`, in primary key order. With
    /// `only_duplicates` unset, iteration carries on into later secondary
    /// keys.
    pub fn find(&self, key: &SK, only_duplicates: bool) -> MapResult<IndexIter<K, V>> {
        self.ensure_open()?;
        let map = &self.shared.map;
        let secondary = self.shared.encode(key)?;
        let txn = map.txn();
        let cursor = self.shared.index.cursor(txn.as_ref()).map_err(|e| MapError::engine(map.name(), "find", e))?;
        Ok(IndexIter::find(
            Arc::clone(map.handle()),
            map.id(),
            cursor,
            map.retry(),
            map.codecs().clone(),
            secondary,
            only_duplicates,
        ))
    }

    /// Number of entries whose secondary key equals `key`
    pub fn count(&self, key: &SK) -> MapResult<usize> {
        self.ensure_open()?;
        let secondary = self.shared.encode(key)?;
        let map = &self.shared.map;
        let txn = map.txn();
        map.retry().run(map.name(), "count", txn.as_ref(), || {
            let mut cursor = self.shared.index.cursor(txn.as_ref())?;
            let count = match cursor.seek_exact(&secondary)? {
                Some(_) => cursor.count_duplicates()?,
                None => 0,
            };
            cursor.close();
            Ok(count)
        })
    }

    pub fn contains_key(&self, key: &SK) -> MapResult<bool> {
        Ok(self.count(key)? > 0)
    }

    /// Entries whose secondary key equals `key`, as one group
    pub fn get(&self, key: &SK) -> MapResult<Option<IndexGroup<SK, K, V>>> {
        self.ensure_open()?;
        let run = self.shared.run_at(&self.shared.encode(key)?, "get")?;
        self.shared.to_group(run)
    }

    /// The whole index as a navigable view
    pub fn view(&self) -> MapResult<IndexView<SK, K, V>> {
        self.ensure_open()?;
        self.shared.order.require("index view")?;
        Ok(IndexView::new(Arc::clone(&self.shared), ViewBounds::default()))
    }

    pub fn head_view(&self, to: &SK, inclusive: bool) -> MapResult<IndexView<SK, K, V>> {
        self.view()?.head_view(to, inclusive)
    }

    pub fn tail_view(&self, from: &SK, inclusive: bool) -> MapResult<IndexView<SK, K, V>> {
        self.view()?.tail_view(from, inclusive)
    }

    pub fn sub_view(&self, from: &SK, from_inclusive: bool, to: &SK, to_inclusive: bool) -> MapResult<IndexView<SK, K, V>> {
        self.view()?.sub_view(from, from_inclusive, to, to_inclusive)
    }

    pub fn descending_view(&self) -> MapResult<Arc<IndexView<SK, K, V>>> {
        self.ensure_open()?;
        self.shared.order.require("index descending_view")?;
        Ok(Arc::new(IndexView::new(Arc::clone(&self.shared), ViewBounds::default().reversed())))
    }

    /// Release this reference. The owning reference detaches the index
    /// from the store; closing any other reference does nothing to the
    /// store.
    pub fn close(&self) -> MapResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) || !self.owning {
            return Ok(());
        }
        let map = &self.shared.map;
        map.handle().detach_index(self.name())?;
        tracing::debug!(store = %map.name(), index = %self.name(), "index detached");
        Ok(())
    }
}

/// A bounded, possibly reversed view of a secondary index. Results are
/// grouped by secondary key.
pub struct IndexView<SK, K, V> {
    shared: Arc<IndexShared<SK, K, V>>,
    bounds: ViewBounds,
    reversed: OnceLock<Arc<IndexView<SK, K, V>>>,
}

impl<SK, K, V> fmt::Debug for IndexView<SK, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexView").field("index", &self.shared.index.name()).field("bounds", &self.bounds).finish()
    }
}

impl<SK: 'static, K: 'static, V: 'static> IndexView<SK, K, V> {
    fn new(shared: Arc<IndexShared<SK, K, V>>, bounds: ViewBounds) -> Self {
        Self { shared, bounds, reversed: OnceLock::new() }
    }

    fn in_range(&self, secondary: &[u8]) -> bool {
        let index = &self.shared.index;
        self.bounds.contains(secondary, &|a: &[u8], b: &[u8]| index.compare(a, b))
    }

    fn find(&self, operation: &'static str, kind: SearchKind, target: Option<&SK>) -> MapResult<Option<IndexGroup<SK, K, V>>> {
        let shared = &self.shared;
        shared.map.ensure_open()?;
        let target = match target {
            Some(key) => shared.encode(key)?,
            None => Vec::new(),
        };
        let index = &shared.index;
        let cmp = |a: &[u8], b: &[u8]| index.compare(a, b);
        let (kind, target) = self.bounds.plan(kind, &target, &cmp);
        let valid = |key: &[u8]| self.bounds.contains(key, &cmp);
        let txn = shared.map.txn();
        let run = shared.map.retry().run(shared.map.name(), operation, txn.as_ref(), || {
            let mut cursor = index.cursor(txn.as_ref())?;
            let run = match search::position(&mut cursor, kind, &target, Some(&valid))? {
                Some(landed) => iter::collect_run(&mut cursor, &landed)?,
                None => Vec::new(),
            };
            cursor.close();
            Ok(run)
        })?;
        shared.to_group(run)
    }

    /// First group in view order
    pub fn first_group(&self) -> MapResult<Option<IndexGroup<SK, K, V>>> {
        self.find("first_group", SearchKind::First, None)
    }

    /// Last group in view order
    pub fn last_group(&self) -> MapResult<Option<IndexGroup<SK, K, V>>> {
        self.find("last_group", SearchKind::Last, None)
    }

    pub fn ceiling_group(&self, key: &SK) -> MapResult<Option<IndexGroup<SK, K, V>>> {
        self.find("ceiling_group", SearchKind::Ceiling, Some(key))
    }

    pub fn floor_group(&self, key: &SK) -> MapResult<Option<IndexGroup<SK, K, V>>> {
        self.find("floor_group", SearchKind::Floor, Some(key))
    }

    pub fn higher_group(&self, key: &SK) -> MapResult<Option<IndexGroup<SK, K, V>>> {
        self.find("higher_group", SearchKind::Higher, Some(key))
    }

    pub fn lower_group(&self, key: &SK) -> MapResult<Option<IndexGroup<SK, K, V>>> {
        self.find("lower_group", SearchKind::Lower, Some(key))
    }

    /// First secondary key in view order; `NoSuchElement` when empty
    pub fn first_key(&self) -> MapResult<SK> {
        Ok(self.first_group()?.ok_or(MapError::NoSuchElement)?.key)
    }

    /// Last secondary key in view order; `NoSuchElement` when empty
    pub fn last_key(&self) -> MapResult<SK> {
        Ok(self.last_group()?.ok_or(MapError::NoSuchElement)?.key)
    }

    /// The group at `key`, or `None` if absent or outside the view
    pub fn get(&self, key: &SK) -> MapResult<Option<IndexGroup<SK, K, V>>> {
        let secondary = self.shared.encode(key)?;
        if !self.in_range(&secondary) {
            return Ok(None);
        }
        let run = self.shared.run_at(&secondary, "get")?;
        self.shared.to_group(run)
    }

    pub fn contains_key(&self, key: &SK) -> MapResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// One group per distinct secondary key, in view order
    pub fn groups(&self) -> MapResult<GroupIter<SK, K, V>> {
        let walk = self.shared.walk(self.bounds.clone())?;
        Ok(GroupIter::new(
            walk,
            self.shared.index.clone(),
            Arc::clone(&self.shared.key_codec),
            self.shared.map.codecs().clone(),
            self.bounds.descending,
        ))
    }

    /// Every primary entry in the view, ordered by secondary key in view
    /// order
    pub fn entries(&self) -> MapResult<IndexIter<K, V>> {
        let walk = self.shared.walk(self.bounds.clone())?;
        Ok(IndexIter::bounded(walk, self.shared.map.codecs().clone()))
    }

    fn narrowed(&self, narrow: impl FnOnce(&ViewBounds) -> MapResult<ViewBounds>) -> MapResult<Self> {
        Ok(Self::new(Arc::clone(&self.shared), narrow(&self.bounds)?))
    }

    pub fn head_view(&self, to: &SK, inclusive: bool) -> MapResult<Self> {
        let to = self.shared.encode(to)?;
        let index = &self.shared.index;
        self.narrowed(|bounds| bounds.head(to, inclusive, &|a: &[u8], b: &[u8]| index.compare(a, b)))
    }

    pub fn tail_view(&self, from: &SK, inclusive: bool) -> MapResult<Self> {
        let from = self.shared.encode(from)?;
        let index = &self.shared.index;
        self.narrowed(|bounds| bounds.tail(from, inclusive, &|a: &[u8], b: &[u8]| index.compare(a, b)))
    }

    pub fn sub_view(&self, from: &SK, from_inclusive: bool, to: &SK, to_inclusive: bool) -> MapResult<Self> {
        let from = Bound::new(self.shared.encode(from)?, from_inclusive);
        let to = Bound::new(self.shared.encode(to)?, to_inclusive);
        let index = &self.shared.index;
        self.narrowed(|bounds| bounds.sub(from, to, &|a: &[u8], b: &[u8]| index.compare(a, b)))
    }

    /// The same range in the opposite direction, built once and cached
    pub fn descending_view(&self) -> MapResult<Arc<Self>> {
        self.shared.order.require("index descending_view")?;
        Ok(Arc::clone(self.reversed.get_or_init(|| Arc::new(Self::new(Arc::clone(&self.shared), self.bounds.reversed())))))
    }
}
