//! Range views over a primary map

use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::entry::Entry;
use crate::error::{MapError, MapResult};
use crate::iter::{Keys, MapIter, Values};
use crate::map::PrimaryMap;
use crate::range::{Bound, ViewBounds};
use crate::search::SearchKind;

/// A bounded, possibly reversed, live view of a [`PrimaryMap`].
///
/// Views hold no cursor of their own; every call reads the map as it is
/// now. Keys outside the bounds are invisible: searches clamp to the
/// range, `get` misses, and `put` is refused.
pub struct MapView<K, V> {
    map: PrimaryMap<K, V>,
    bounds: ViewBounds,
    reversed: OnceLock<Arc<MapView<K, V>>>,
}

impl<K, V> fmt::Debug for MapView<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapView").field("map", &self.map).field("bounds", &self.bounds).finish()
    }
}

impl<K: 'static, V: 'static> MapView<K, V> {
    pub(crate) fn new(map: PrimaryMap<K, V>, bounds: ViewBounds) -> Self {
        Self { map, bounds, reversed: OnceLock::new() }
    }

    /// The map this view reads
    pub fn map(&self) -> &PrimaryMap<K, V> {
        &self.map
    }

    /// True if iteration runs from high keys to low
    pub fn is_descending(&self) -> bool {
        self.bounds.descending
    }

    fn in_range(&self, raw: &[u8]) -> bool {
        let store = self.map.store();
        self.bounds.contains(raw, &|a: &[u8], b: &[u8]| store.compare(a, b))
    }

    fn find(&self, operation: &'static str, kind: SearchKind, target: Option<&K>) -> MapResult<Option<Entry<K, V>>> {
        self.map.order().require(operation)?;
        let target = match target {
            Some(key) => self.map.encode_key(key)?,
            None => Vec::new(),
        };
        let found = self.map.locate(&self.bounds, kind, &target, operation)?;
        Ok(found.map(|record| self.map.entry(record)))
    }

    fn find_key(&self, operation: &'static str, kind: SearchKind, target: &K) -> MapResult<Option<K>> {
        self.find(operation, kind, Some(target))?.map(Entry::into_key).transpose()
    }

    // -----------------------------------------------------------------------
    // Navigation
    // -----------------------------------------------------------------------

    /// First entry in view order
    pub fn first_entry(&self) -> MapResult<Option<Entry<K, V>>> {
        self.find("first_entry", SearchKind::First, None)
    }

    /// Last entry in view order
    pub fn last_entry(&self) -> MapResult<Option<Entry<K, V>>> {
        self.find("last_entry", SearchKind::Last, None)
    }

    /// Least entry at or after `key` in view order
    pub fn ceiling_entry(&self, key: &K) -> MapResult<Option<Entry<K, V>>> {
        self.find("ceiling_entry", SearchKind::Ceiling, Some(key))
    }

    /// Greatest entry at or before `key` in view order
    pub fn floor_entry(&self, key: &K) -> MapResult<Option<Entry<K, V>>> {
        self.find("floor_entry", SearchKind::Floor, Some(key))
    }

    /// Least entry strictly after `key` in view order
    pub fn higher_entry(&self, key: &K) -> MapResult<Option<Entry<K, V>>> {
        self.find("higher_entry", SearchKind::Higher, Some(key))
    }

    /// Greatest entry strictly before `key` in view order
    pub fn lower_entry(&self, key: &K) -> MapResult<Option<Entry<K, V>>> {
        self.find("lower_entry", SearchKind::Lower, Some(key))
    }

    /// First key in view order; `NoSuchElement` when the view is empty
    pub fn first_key(&self) -> MapResult<K> {
        self.first_entry()?.ok_or(MapError::NoSuchElement)?.into_key()
    }

    /// Last key in view order; `NoSuchElement` when the view is empty
    pub fn last_key(&self) -> MapResult<K> {
        self.last_entry()?.ok_or(MapError::NoSuchElement)?.into_key()
    }

    pub fn ceiling_key(&self, key: &K) -> MapResult<Option<K>> {
        self.find_key("ceiling_key", SearchKind::Ceiling, key)
    }

    pub fn floor_key(&self, key: &K) -> MapResult<Option<K>> {
        self.find_key("floor_key", SearchKind::Floor, key)
    }

    pub fn higher_key(&self, key: &K) -> MapResult<Option<K>> {
        self.find_key("higher_key", SearchKind::Higher, key)
    }

    pub fn lower_key(&self, key: &K) -> MapResult<Option<K>> {
        self.find_key("lower_key", SearchKind::Lower, key)
    }

    /// Remove and return the first entry in view order
    pub fn poll_first_entry(&self) -> MapResult<Option<Entry<K, V>>> {
        self.map.poll(&self.bounds, SearchKind::First)
    }

    /// Remove and return the last entry in view order
    pub fn poll_last_entry(&self) -> MapResult<Option<Entry<K, V>>> {
        self.map.poll(&self.bounds, SearchKind::Last)
    }

    // -----------------------------------------------------------------------
    // Point operations
    // -----------------------------------------------------------------------

    /// Value under `key`, or `None` if absent or outside the view
    pub fn get(&self, key: &K) -> MapResult<Option<V>> {
        if !self.in_range(&self.map.encode_key(key)?) {
            return Ok(None);
        }
        self.map.get(key)
    }

    pub fn contains_key(&self, key: &K) -> MapResult<bool> {
        Ok(self.in_range(&self.map.encode_key(key)?) && self.map.contains_key(key)?)
    }

    /// Remove `key` if it lies inside the view
    pub fn remove(&self, key: &K) -> MapResult<Option<V>> {
        if !self.in_range(&self.map.encode_key(key)?) {
            return Ok(None);
        }
        self.map.remove(key)
    }

    /// Always `Unsupported`: write through the map instead
    pub fn put(&self, _key: &K, _value: &V) -> MapResult<Option<V>> {
        Err(MapError::Unsupported("put through a range view"))
    }

    /// Number of entries in the view. Counts by iterating unless the view
    /// spans the whole map.
    pub fn len(&self) -> MapResult<usize> {
        if self.bounds.is_unbounded() {
            return self.map.len();
        }
        let mut iter = self.iter()?;
        let mut count = 0;
        while iter.has_next()? {
            iter.next_entry()?;
            count += 1;
        }
        iter.close();
        Ok(count)
    }

    pub fn is_empty(&self) -> MapResult<bool> {
        Ok(self.first_entry()?.is_none())
    }

    // -----------------------------------------------------------------------
    // Iteration
    // -----------------------------------------------------------------------

    /// Iterator over the view in its direction
    pub fn iter(&self) -> MapResult<MapIter<K, V>> {
        self.map.iterate(self.bounds.clone())
    }

    pub fn keys(&self) -> MapResult<Keys<K, V>> {
        self.iter().map(Keys::new)
    }

    pub fn values(&self) -> MapResult<Values<K, V>> {
        self.iter().map(Values::new)
    }

    // -----------------------------------------------------------------------
    // Sub-views
    // -----------------------------------------------------------------------

    fn narrowed(&self, operation: &'static str, narrow: impl FnOnce(&ViewBounds) -> MapResult<ViewBounds>) -> MapResult<Self> {
        self.map.order().require(operation)?;
        Ok(Self::new(self.map.clone(), narrow(&self.bounds)?))
    }

    /// Entries before `to` in view order
    pub fn head_view(&self, to: &K, inclusive: bool) -> MapResult<Self> {
        let to = self.map.encode_key(to)?;
        let store = self.map.store();
        self.narrowed("head_view", |bounds| bounds.head(to, inclusive, &|a: &[u8], b: &[u8]| store.compare(a, b)))
    }

    /// Entries from `from` on in view order
    pub fn tail_view(&self, from: &K, inclusive: bool) -> MapResult<Self> {
        let from = self.map.encode_key(from)?;
        let store = self.map.store();
        self.narrowed("tail_view", |bounds| bounds.tail(from, inclusive, &|a: &[u8], b: &[u8]| store.compare(a, b)))
    }

    /// Entries from `from` to `to` in view order
    pub fn sub_view(&self, from: &K, from_inclusive: bool, to: &K, to_inclusive: bool) -> MapResult<Self> {
        let from = Bound::new(self.map.encode_key(from)?, from_inclusive);
        let to = Bound::new(self.map.encode_key(to)?, to_inclusive);
        let store = self.map.store();
        self.narrowed("sub_view", |bounds| bounds.sub(from, to, &|a: &[u8], b: &[u8]| store.compare(a, b)))
    }

    /// The same range in the opposite direction. Built once and shared, so
    /// reversing twice yields a view equal to this one.
    pub fn descending_view(&self) -> MapResult<Arc<Self>> {
        self.map.order().require("descending_view")?;
        Ok(Arc::clone(self.reversed.get_or_init(|| Arc::new(Self::new(self.map.clone(), self.bounds.reversed())))))
    }
}

impl<K: 'static, V: 'static> PartialEq for MapView<K, V> {
    /// Views are equal when they read the same store with the same bounds
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(self.map.handle(), other.map.handle()) && self.bounds == other.bounds
    }
}
