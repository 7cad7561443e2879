//! Secondary indices
//!
//! An index is an ordered set of (secondary key, primary key) pairs derived
//! from a store's records by an extractor function. Duplicate secondary keys
//! are allowed and ordered by primary key. Index entries are never logged:
//! they are rebuilt whenever an index is associated with a store. An entry
//! a pending transaction removed stays as a tombstone until it commits.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cursor::IndexCursor;
use crate::error::{StoreError, StoreResult};
use crate::store::{KeyComparator, Records, SortKey, Store};
use crate::txn::TxnHandle;

/// Computes the secondary key of a record from its primary key and value.
///
/// `Ok(None)` leaves the record out of the index.
pub type Extractor = Arc<dyn Fn(&[u8], &[u8]) -> Result<Option<Vec<u8>>, String> + Send + Sync>;

/// Everything needed to associate an index with a store
#[derive(Clone)]
pub struct IndexDefinition {
    /// Index name, unique per store
    pub name: String,
    /// Secondary key ordering; raw bytes when `None`
    pub comparator: Option<Arc<dyn KeyComparator>>,
    /// Secondary key extractor
    pub extractor: Extractor,
}

impl IndexDefinition {
    /// Define an index ordered by raw secondary key bytes
    pub fn new(name: impl Into<String>, extractor: Extractor) -> Self {
        Self { name: name.into(), comparator: None, extractor }
    }

    /// Order secondary keys with `comparator`
    pub fn with_comparator(mut self, comparator: Arc<dyn KeyComparator>) -> Self {
        self.comparator = Some(comparator);
        self
    }
}

impl fmt::Debug for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexDefinition").field("name", &self.name).finish()
    }
}

/// Primary-key half of an index entry. `Min`/`Max` sort before/after every
/// primary key sharing the same secondary key and are only used as probes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Edge {
    Min,
    Key(SortKey),
    Max,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct IndexKey {
    pub(crate) secondary: SortKey,
    pub(crate) primary: Edge,
}

impl IndexKey {
    pub(crate) fn primary_bytes(&self) -> &[u8] {
        match &self.primary {
            Edge::Key(key) => &key.bytes,
            Edge::Min | Edge::Max => &[],
        }
    }
}

/// Index changes one primary write implies
pub(crate) struct IndexUpdate {
    remove: Option<Vec<u8>>,
    insert: Option<Vec<u8>>,
}

/// Which index entry to look for relative to a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexSeek {
    First,
    Last,
    /// First entry whose secondary key is >= the probe's
    Ge,
    /// Entry strictly after the probe entry
    Gt,
    /// Entry strictly before the probe entry
    Lt,
    /// Entry after the probe entry, only within the same secondary key
    NextDup,
    /// Entry before the probe entry, only within the same secondary key
    PrevDup,
    /// First entry of the next distinct secondary key
    NextUnique,
    /// Last entry of the previous distinct secondary key
    PrevUnique,
}

pub(crate) struct IndexInner {
    pub(crate) name: String,
    comparator: Option<Arc<dyn KeyComparator>>,
    primary_order: RwLock<Option<Arc<dyn KeyComparator>>>,
    extractor: Extractor,
    /// Entry -> transaction whose uncommitted write removed it
    entries: RwLock<BTreeMap<IndexKey, Option<u64>>>,
}

impl IndexInner {
    pub(crate) fn new(definition: IndexDefinition, primary_order: Option<Arc<dyn KeyComparator>>) -> Self {
        Self {
            name: definition.name,
            comparator: definition.comparator,
            primary_order: RwLock::new(primary_order),
            extractor: definition.extractor,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    fn extract(&self, key: &[u8], value: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        (self.extractor)(key, value).map_err(|reason| StoreError::Extractor { index: self.name.clone(), reason })
    }

    pub(crate) fn secondary(&self, bytes: &[u8]) -> SortKey {
        SortKey::new(bytes.to_vec(), self.comparator.clone())
    }

    fn entry(&self, secondary: &[u8], primary: &[u8]) -> IndexKey {
        IndexKey {
            secondary: self.secondary(secondary),
            primary: Edge::Key(SortKey::new(primary.to_vec(), self.primary_order.read().clone())),
        }
    }

    fn edge(&self, secondary: &[u8], edge: Edge) -> IndexKey {
        IndexKey { secondary: self.secondary(secondary), primary: edge }
    }

    pub(crate) fn compare_secondary(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        self.secondary(a).cmp(&self.secondary(b))
    }

    /// Entries not removed by a pending transaction
    pub(crate) fn len(&self) -> usize {
        self.entries.read().values().filter(|owner| owner.is_none()).count()
    }

    /// Work out the index change for a write, failing before anything moves.
    pub(crate) fn plan(&self, key: &[u8], previous: Option<&[u8]>, value: Option<&[u8]>) -> StoreResult<IndexUpdate> {
        let remove = match previous {
            Some(previous) => self.extract(key, previous)?,
            None => None,
        };
        let insert = match value {
            Some(value) => self.extract(key, value)?,
            None => None,
        };
        Ok(IndexUpdate { remove, insert })
    }

    /// Apply a planned change. With an `owner` transaction the removed
    /// entry is kept as its tombstone.
    pub(crate) fn apply(&self, key: &[u8], update: IndexUpdate, owner: Option<u64>) {
        let mut entries = self.entries.write();
        if let Some(secondary) = update.remove {
            let entry = self.entry(&secondary, key);
            match owner {
                Some(txn_id) => {
                    if let Some(slot) = entries.get_mut(&entry) {
                        *slot = Some(txn_id);
                    }
                }
                None => {
                    entries.remove(&entry);
                }
            }
        }
        if let Some(secondary) = update.insert {
            entries.insert(self.entry(&secondary, key), None);
        }
    }

    /// Remove the tombstone `txn_id` left when it replaced `previous`.
    pub(crate) fn purge(&self, txn_id: u64, key: &[u8], previous: &[u8]) {
        let secondary = match self.extract(key, previous) {
            Ok(Some(secondary)) => secondary,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(index = %self.name, error = %e, "cannot locate tombstone at commit");
                return;
            }
        };
        let entry = self.entry(&secondary, key);
        let mut entries = self.entries.write();
        if entries.get(&entry) == Some(&Some(txn_id)) {
            entries.remove(&entry);
        }
    }

    /// Build entries for every record of a freshly associated index.
    pub(crate) fn populate(&self, records: &Records) -> StoreResult<()> {
        let mut entries = BTreeMap::new();
        for (key, record) in records {
            if let Some(secondary) = self.extract(&key.bytes, &record.value)? {
                entries.insert(self.entry(&secondary, &key.bytes), record.deleted_by);
            }
        }
        *self.entries.write() = entries;
        Ok(())
    }

    /// Re-sort duplicate runs after the primary store changed its ordering.
    pub(crate) fn reorder_primary(&self, primary_order: Option<Arc<dyn KeyComparator>>) {
        *self.primary_order.write() = primary_order;
        let mut entries = self.entries.write();
        let old = std::mem::take(&mut *entries);
        for (key, owner) in old {
            let secondary = key.secondary.bytes.clone();
            entries.insert(self.entry(&secondary, key.primary_bytes()), owner);
        }
    }

    /// Locate an entry relative to `(secondary, primary)` without locking.
    /// Tombstones are candidates too.
    pub(crate) fn find(&self, seek: IndexSeek, secondary: &[u8], primary: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let entries = self.entries.read();
        let found = match seek {
            IndexSeek::First => entries.keys().next(),
            IndexSeek::Last => entries.keys().next_back(),
            IndexSeek::Ge => {
                let probe = self.edge(secondary, Edge::Min);
                entries.range((Bound::Included(probe), Bound::Unbounded)).next().map(|(k, _)| k)
            }
            IndexSeek::Gt | IndexSeek::NextDup => {
                let probe = self.entry(secondary, primary);
                entries.range((Bound::Excluded(probe), Bound::Unbounded)).next().map(|(k, _)| k)
            }
            IndexSeek::Lt | IndexSeek::PrevDup => {
                let probe = self.entry(secondary, primary);
                entries.range((Bound::Unbounded, Bound::Excluded(probe))).next_back().map(|(k, _)| k)
            }
            IndexSeek::NextUnique => {
                let probe = self.edge(secondary, Edge::Max);
                entries.range((Bound::Excluded(probe), Bound::Unbounded)).next().map(|(k, _)| k)
            }
            IndexSeek::PrevUnique => {
                let probe = self.edge(secondary, Edge::Min);
                entries.range((Bound::Unbounded, Bound::Excluded(probe))).next_back().map(|(k, _)| k)
            }
        };
        let found = found?;
        if matches!(seek, IndexSeek::NextDup | IndexSeek::PrevDup) && found.secondary != self.secondary(secondary) {
            return None;
        }
        Some((found.secondary.bytes.clone(), found.primary_bytes().to_vec()))
    }

    /// True for a live entry; tombstones read as absent.
    pub(crate) fn contains(&self, secondary: &[u8], primary: &[u8]) -> bool {
        self.entries.read().get(&self.entry(secondary, primary)) == Some(&None)
    }

    /// Number of entries whose secondary key equals `secondary`, as seen by
    /// `reader`: its own pending removals are gone, everyone else's count.
    pub(crate) fn count(&self, secondary: &[u8], reader: Option<u64>) -> usize {
        let low = self.edge(secondary, Edge::Min);
        let high = self.edge(secondary, Edge::Max);
        self.entries
            .read()
            .range(low..=high)
            .filter(|(_, owner)| owner.is_none() || **owner != reader)
            .count()
    }
}

/// Handle to a secondary index associated with a [`Store`].
#[derive(Clone)]
pub struct Index {
    pub(crate) inner: Arc<IndexInner>,
    pub(crate) store: Store,
}

impl Index {
    pub(crate) fn new(inner: Arc<IndexInner>, store: Store) -> Self {
        Self { inner, store }
    }

    /// Index name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The primary store this index is associated with
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Compare two secondary keys under the index ordering
    pub fn compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        self.inner.compare_secondary(a, b)
    }

    /// Secondary key ordering, `None` for raw bytes
    pub fn comparator(&self) -> Option<Arc<dyn KeyComparator>> {
        self.inner.comparator.clone()
    }

    /// Total number of index entries
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when no record is indexed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a cursor over the index, bound to `txn` when given.
    pub fn cursor(&self, txn: Option<&TxnHandle>) -> StoreResult<IndexCursor> {
        self.store.ensure_live()?;
        if let Some(txn) = txn {
            txn.ensure_active()?;
        }
        Ok(IndexCursor::new(self.clone(), txn.cloned()))
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index").field("name", &self.inner.name).field("store", &self.store.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreInner;

    fn by_first_byte() -> IndexDefinition {
        IndexDefinition::new(
            "first",
            Arc::new(|_key: &[u8], value: &[u8]| Ok::<_, String>(value.first().map(|b| vec![*b]))),
        )
    }

    #[test]
    fn test_populate_and_maintain() {
        let store = StoreInner::new(1, "s", None, true);
        store.apply(b"1", Some(b"apple")).unwrap();
        store.apply(b"2", Some(b"avocado")).unwrap();

        let index = Arc::new(IndexInner::new(by_first_byte(), None));
        index.populate(&store.data.read()).unwrap();
        store.indices.write().push(Arc::clone(&index));
        assert_eq!(index.count(b"a", None), 2);

        store.apply(b"2", Some(b"banana")).unwrap();
        assert_eq!(index.count(b"a", None), 1);
        assert_eq!(index.count(b"b", None), 1);
        assert!(index.contains(b"b", b"2"));
        assert!(!index.contains(b"a", b"2"));

        store.apply(b"1", None).unwrap();
        assert_eq!(index.count(b"a", None), 0);
    }

    #[test]
    fn test_pending_removal_keeps_entry_until_purged() {
        let store = StoreInner::new(1, "s", None, true);
        let index = Arc::new(IndexInner::new(by_first_byte(), None));
        store.indices.write().push(Arc::clone(&index));
        store.apply(b"1", Some(b"apple")).unwrap();
        store.apply(b"2", Some(b"avocado")).unwrap();

        // Moving "2" from "a" to "b" hides the old entry behind a tombstone
        store.apply_in(9, b"2", Some(b"banana")).unwrap();
        assert_eq!(index.find(IndexSeek::Last, b"", b""), Some((b"b".to_vec(), b"2".to_vec())));
        assert_eq!(index.find(IndexSeek::NextDup, b"a", b"1"), Some((b"a".to_vec(), b"2".to_vec())));
        assert!(!index.contains(b"a", b"2"));
        assert_eq!(index.count(b"a", None), 2);
        assert_eq!(index.count(b"a", Some(9)), 1);
        assert_eq!(index.len(), 2);

        store.purge(9, b"2", Some(b"avocado"));
        assert_eq!(index.find(IndexSeek::NextDup, b"a", b"1"), None);
        assert_eq!(index.count(b"a", None), 1);
    }

    #[test]
    fn test_extractor_failure_leaves_store_untouched() {
        let store = StoreInner::new(1, "s", None, true);
        let failing = IndexDefinition::new(
            "strict",
            Arc::new(|_key: &[u8], value: &[u8]| {
                if value.is_empty() { Err("empty value".to_string()) } else { Ok(Some(value.to_vec())) }
            }),
        );
        store.indices.write().push(Arc::new(IndexInner::new(failing, None)));
        store.apply(b"k", Some(b"v")).unwrap();

        let err = store.apply(b"k", Some(b"")).unwrap_err();
        assert!(matches!(err, StoreError::Extractor { .. }));
        assert_eq!(store.read_value(b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_unique_and_duplicate_steps() {
        let store = StoreInner::new(1, "s", None, true);
        let index = Arc::new(IndexInner::new(by_first_byte(), None));
        store.indices.write().push(Arc::clone(&index));
        for (k, v) in [(b"1", b"ax"), (b"2", b"ay"), (b"3", b"bz"), (b"4", b"cz")] {
            store.apply(k, Some(v)).unwrap();
        }

        assert_eq!(index.find(IndexSeek::Ge, b"b", b""), Some((b"b".to_vec(), b"3".to_vec())));
        assert_eq!(index.find(IndexSeek::NextDup, b"a", b"1"), Some((b"a".to_vec(), b"2".to_vec())));
        assert_eq!(index.find(IndexSeek::NextDup, b"a", b"2"), None);
        assert_eq!(index.find(IndexSeek::NextUnique, b"a", b"1"), Some((b"b".to_vec(), b"3".to_vec())));
        assert_eq!(index.find(IndexSeek::PrevUnique, b"c", b"4"), Some((b"b".to_vec(), b"3".to_vec())));
        assert_eq!(index.find(IndexSeek::PrevUnique, b"b", b"3"), Some((b"a".to_vec(), b"2".to_vec())));
        assert_eq!(index.find(IndexSeek::Last, b"", b""), Some((b"c".to_vec(), b"4".to_vec())));
    }
}
