//! Navigable search: FIRST, LAST, CEILING, FLOOR, HIGHER, LOWER.
//!
//! The engine only offers "smallest key >= target" plus stepping, so every
//! search kind is reduced to those moves. The optional validator (a range
//! view's bounds check) is applied to whatever the search lands on; a hit
//! that fails it reads as no result.

use std::cmp::Ordering;

use stowkv_core::{Cursor, IndexCursor, IndexRecord, KeyValue, StoreResult, TxnHandle};

/// Navigable search kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchKind {
    /// Smallest key
    First,
    /// Largest key
    Last,
    /// Smallest key >= target
    Ceiling,
    /// Largest key <= target
    Floor,
    /// Smallest key > target
    Higher,
    /// Largest key < target
    Lower,
}

impl SearchKind {
    /// The same search seen through a reversed ordering
    pub fn descending(self) -> Self {
        match self {
            SearchKind::First => SearchKind::Last,
            SearchKind::Last => SearchKind::First,
            SearchKind::Ceiling => SearchKind::Floor,
            SearchKind::Floor => SearchKind::Ceiling,
            SearchKind::Higher => SearchKind::Lower,
            SearchKind::Lower => SearchKind::Higher,
        }
    }

    /// False for FIRST and LAST
    pub fn needs_target(self) -> bool {
        !matches!(self, SearchKind::First | SearchKind::Last)
    }
}

/// Bounds check applied to a search result's key
pub(crate) type Validator<'a> = &'a dyn Fn(&[u8]) -> bool;

/// Cursor operations the search and iteration logic needs. Implemented by
/// primary cursors (unique keys) and index cursors (duplicate runs).
pub(crate) trait SearchCursor: Send + Sized + 'static {
    type Item: Send + 'static;

    /// Key the ordering applies to: primary key or secondary key
    fn key_of(item: &Self::Item) -> &[u8];

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
    fn txn(&self) -> Option<&TxnHandle>;
    fn close(&mut self);

    fn seek_first(&mut self) -> StoreResult<Option<Self::Item>>;
    fn seek_last(&mut self) -> StoreResult<Option<Self::Item>>;
    fn seek_ge(&mut self, key: &[u8]) -> StoreResult<Option<Self::Item>>;
    fn next(&mut self) -> StoreResult<Option<Self::Item>>;
    fn prev(&mut self) -> StoreResult<Option<Self::Item>>;
    fn next_unique(&mut self) -> StoreResult<Option<Self::Item>>;
    fn prev_unique(&mut self) -> StoreResult<Option<Self::Item>>;
    fn next_dup(&mut self) -> StoreResult<Option<Self::Item>>;
}

impl SearchCursor for Cursor {
    type Item = KeyValue;

    fn key_of(item: &KeyValue) -> &[u8] {
        &item.0
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.store().compare(a, b)
    }

    fn txn(&self) -> Option<&TxnHandle> {
        Cursor::txn(self)
    }

    fn close(&mut self) {
        Cursor::close(self)
    }

    fn seek_first(&mut self) -> StoreResult<Option<KeyValue>> {
        Cursor::seek_first(self)
    }

    fn seek_last(&mut self) -> StoreResult<Option<KeyValue>> {
        Cursor::seek_last(self)
    }

    fn seek_ge(&mut self, key: &[u8]) -> StoreResult<Option<KeyValue>> {
        Cursor::seek_ge(self, key)
    }

    fn next(&mut self) -> StoreResult<Option<KeyValue>> {
        Cursor::next(self)
    }

    fn prev(&mut self) -> StoreResult<Option<KeyValue>> {
        Cursor::prev(self)
    }

    fn next_unique(&mut self) -> StoreResult<Option<KeyValue>> {
        Cursor::next_unique(self)
    }

    fn prev_unique(&mut self) -> StoreResult<Option<KeyValue>> {
        Cursor::prev_unique(self)
    }

    fn next_dup(&mut self) -> StoreResult<Option<KeyValue>> {
        Ok(None)
    }
}

impl SearchCursor for IndexCursor {
    type Item = IndexRecord;

    fn key_of(item: &IndexRecord) -> &[u8] {
        &item.secondary_key
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.index().compare(a, b)
    }

    fn txn(&self) -> Option<&TxnHandle> {
        IndexCursor::txn(self)
    }

    fn close(&mut self) {
        IndexCursor::close(self)
    }

    fn seek_first(&mut self) -> StoreResult<Option<IndexRecord>> {
        IndexCursor::seek_first(self)
    }

    fn seek_last(&mut self) -> StoreResult<Option<IndexRecord>> {
        IndexCursor::seek_last(self)
    }

    fn seek_ge(&mut self, key: &[u8]) -> StoreResult<Option<IndexRecord>> {
        IndexCursor::seek_ge(self, key)
    }

    fn next(&mut self) -> StoreResult<Option<IndexRecord>> {
        IndexCursor::next(self)
    }

    fn prev(&mut self) -> StoreResult<Option<IndexRecord>> {
        IndexCursor::prev(self)
    }

    fn next_unique(&mut self) -> StoreResult<Option<IndexRecord>> {
        IndexCursor::next_unique(self)
    }

    fn prev_unique(&mut self) -> StoreResult<Option<IndexRecord>> {
        IndexCursor::prev_unique(self)
    }

    fn next_dup(&mut self) -> StoreResult<Option<IndexRecord>> {
        IndexCursor::next_dup(self)
    }
}

/// Position `cursor` on the record `kind` selects relative to `target`
/// (ignored for FIRST and LAST), then apply `validator`.
///
/// On an index cursor FLOOR and LOWER land on the last entry of the chosen
/// secondary key; the others land on its first entry.
pub(crate) fn position<C: SearchCursor>(
    cursor: &mut C,
    kind: SearchKind,
    target: &[u8],
    validator: Option<Validator<'_>>,
) -> StoreResult<Option<C::Item>> {
    let found = match kind {
        SearchKind::First => cursor.seek_first()?,
        SearchKind::Last => cursor.seek_last()?,
        SearchKind::Ceiling => cursor.seek_ge(target)?,
        SearchKind::Higher => match cursor.seek_ge(target)? {
            Some(item) if cursor.compare(C::key_of(&item), target).is_eq() => cursor.next_unique()?,
            other => other,
        },
        SearchKind::Floor => match cursor.seek_ge(target)? {
            Some(item) if cursor.compare(C::key_of(&item), target).is_eq() => Some(last_duplicate(cursor, item)?),
            Some(_) => cursor.prev_unique()?,
            None => cursor.seek_last()?,
        },
        SearchKind::Lower => match cursor.seek_ge(target)? {
            Some(_) => cursor.prev_unique()?,
            None => cursor.seek_last()?,
        },
    };

    Ok(match (found, validator) {
        (Some(item), Some(valid)) if !valid(C::key_of(&item)) => None,
        (found, _) => found,
    })
}

/// Walk to the end of the duplicate run starting at `item`
fn last_duplicate<C: SearchCursor>(cursor: &mut C, mut item: C::Item) -> StoreResult<C::Item> {
    while let Some(next) = cursor.next_dup()? {
        item = next;
    }
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stowkv_core::{Config, Environment, IndexDefinition, Store, StoreOptions};
    use tempfile::TempDir;

    fn store_with(keys: &[u8]) -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), Config::testing()).unwrap();
        let store = env.open_store("s", StoreOptions::create()).unwrap();
        for key in keys {
            store.put(None, &[*key], &[*key / 10]).unwrap();
        }
        (store, dir)
    }

    fn search(store: &Store, kind: SearchKind, target: u8) -> Option<u8> {
        let mut cursor = store.cursor(None).unwrap();
        position(&mut cursor, kind, &[target], None).unwrap().map(|(k, _)| k[0])
    }

    #[test]
    fn test_primary_kinds() {
        let (store, _dir) = store_with(&[10, 20, 30]);
        assert_eq!(search(&store, SearchKind::First, 0), Some(10));
        assert_eq!(search(&store, SearchKind::Last, 0), Some(30));

        assert_eq!(search(&store, SearchKind::Ceiling, 20), Some(20));
        assert_eq!(search(&store, SearchKind::Ceiling, 21), Some(30));
        assert_eq!(search(&store, SearchKind::Ceiling, 31), None);

        assert_eq!(search(&store, SearchKind::Floor, 20), Some(20));
        assert_eq!(search(&store, SearchKind::Floor, 25), Some(20));
        assert_eq!(search(&store, SearchKind::Floor, 99), Some(30));
        assert_eq!(search(&store, SearchKind::Floor, 5), None);

        assert_eq!(search(&store, SearchKind::Higher, 20), Some(30));
        assert_eq!(search(&store, SearchKind::Higher, 30), None);
        assert_eq!(search(&store, SearchKind::Lower, 20), Some(10));
        assert_eq!(search(&store, SearchKind::Lower, 99), Some(30));
        assert_eq!(search(&store, SearchKind::Lower, 10), None);
    }

    #[test]
    fn test_empty_store() {
        let (store, _dir) = store_with(&[]);
        for kind in [SearchKind::First, SearchKind::Last, SearchKind::Floor, SearchKind::Lower] {
            assert_eq!(search(&store, kind, 5), None);
        }
    }

    #[test]
    fn test_validator_applied_after_fallback() {
        let (store, _dir) = store_with(&[10, 20, 30]);
        let below_25 = |key: &[u8]| key[0] < 25;
        let mut cursor = store.cursor(None).unwrap();
        // FLOOR(99) falls back to LAST = 30, which the validator rejects
        assert_eq!(position(&mut cursor, SearchKind::Floor, &[99], Some(&below_25)).unwrap(), None);
        let hit = position(&mut cursor, SearchKind::Floor, &[22], Some(&below_25)).unwrap();
        assert_eq!(hit.map(|(k, _)| k), Some(vec![20]));
    }

    #[test]
    fn test_index_floor_lands_on_run() {
        let (store, _dir) = store_with(&[10, 11, 20, 30, 31]);
        let definition =
            IndexDefinition::new("tens", Arc::new(|_k: &[u8], v: &[u8]| Ok::<_, String>(Some(v.to_vec()))));
        let (index, _) = store.associate(definition).unwrap();
        let mut cursor = index.cursor(None).unwrap();

        let lower = position(&mut cursor, SearchKind::Lower, &[3], None).unwrap().unwrap();
        assert_eq!((lower.secondary_key, lower.primary_key), (vec![2], vec![20]));
        let higher = position(&mut cursor, SearchKind::Higher, &[1], None).unwrap().unwrap();
        assert_eq!(higher.secondary_key, vec![2]);
        let floor = position(&mut cursor, SearchKind::Floor, &[1], None).unwrap().unwrap();
        assert_eq!((floor.secondary_key, floor.primary_key), (vec![1], vec![11]));
        let ceiling = position(&mut cursor, SearchKind::Ceiling, &[4], None).unwrap();
        assert!(ceiling.is_none());
    }

    #[test]
    fn test_descending_is_involution() {
        for kind in [SearchKind::First, SearchKind::Ceiling, SearchKind::Higher] {
            assert_eq!(kind.descending().descending(), kind);
            assert_ne!(kind.descending(), kind);
        }
    }
}
