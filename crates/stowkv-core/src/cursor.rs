//! Ordered cursors over stores and indices
//!
//! A cursor remembers its position as key bytes rather than a tree node, so
//! the position survives deletion of the record under it: stepping simply
//! continues from the deleted key. Every landing locks the candidate record,
//! re-reads it, and moves on in the same direction if it vanished while the
//! lock was awaited. A record another transaction deleted but has not
//! committed is still a candidate, so the lock blocks until that delete
//! resolves. A failed step (deadlock, timeout) leaves the position
//! unchanged so it can be retried.

use std::fmt;

use crate::error::{StoreError, StoreResult};
use crate::index::{Index, IndexSeek};
use crate::store::{Seek, Store};
use crate::txn::TxnHandle;

/// A record as (key, value)
pub type KeyValue = (Vec<u8>, Vec<u8>);

/// Cursor over a primary store
pub struct Cursor {
    store: Store,
    txn: Option<TxnHandle>,
    position: Option<Vec<u8>>,
    open: bool,
}

impl Cursor {
    pub(crate) fn new(store: Store, txn: Option<TxnHandle>) -> Self {
        Self { store, txn, position: None, open: true }
    }

    /// Store the cursor walks
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Transaction the cursor is bound to, if any
    pub fn txn(&self) -> Option<&TxnHandle> {
        self.txn.as_ref()
    }

    /// False after [`Cursor::close`]
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Key the cursor is positioned at (the record may since have been deleted)
    pub fn position(&self) -> Option<&[u8]> {
        self.position.as_deref()
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if !self.open {
            return Err(StoreError::CursorClosed { store: self.store.name() });
        }
        self.store.ensure_live()
    }

    /// Find, lock and read the record `seek` selects relative to `probe`.
    fn land(&mut self, seek: Seek, probe: &[u8]) -> StoreResult<Option<KeyValue>> {
        self.ensure_open()?;
        let forward = !matches!(seek, Seek::Last | Seek::Lt);
        let mut seek = seek;
        let mut probe = probe.to_vec();

        loop {
            let candidate = match self.store.inner.find_key(seek, &probe) {
                Some(candidate) => candidate,
                None => return Ok(None),
            };

            let locker = self.store.lock_for_read(self.txn.as_ref(), &candidate)?;
            let value = self.store.inner.read_value(&candidate);
            self.store.release_read(locker, &candidate);

            match value {
                Some(value) => {
                    self.position = Some(candidate.clone());
                    return Ok(Some((candidate, value)));
                }
                None if seek == Seek::Exact => return Ok(None),
                None => {
                    seek = if forward { Seek::Gt } else { Seek::Lt };
                    probe = candidate;
                }
            }
        }
    }

    /// Position at the smallest key
    pub fn seek_first(&mut self) -> StoreResult<Option<KeyValue>> {
        self.land(Seek::First, &[])
    }

    /// Position at the largest key
    pub fn seek_last(&mut self) -> StoreResult<Option<KeyValue>> {
        self.land(Seek::Last, &[])
    }

    /// Position at the smallest key >= `key`
    pub fn seek_ge(&mut self, key: &[u8]) -> StoreResult<Option<KeyValue>> {
        self.land(Seek::Ge, key)
    }

    /// Position at `key` exactly
    pub fn seek_exact(&mut self, key: &[u8]) -> StoreResult<Option<KeyValue>> {
        self.land(Seek::Exact, key)
    }

    /// Step to the next key; from an unpositioned cursor, the first key.
    pub fn next(&mut self) -> StoreResult<Option<KeyValue>> {
        match self.position.clone() {
            Some(position) => self.land(Seek::Gt, &position),
            None => self.seek_first(),
        }
    }

    /// Step to the previous key; from an unpositioned cursor, the last key.
    pub fn prev(&mut self) -> StoreResult<Option<KeyValue>> {
        match self.position.clone() {
            Some(position) => self.land(Seek::Lt, &position),
            None => self.seek_last(),
        }
    }

    /// Same as [`Cursor::next`]: primary keys are unique.
    pub fn next_unique(&mut self) -> StoreResult<Option<KeyValue>> {
        self.next()
    }

    /// Same as [`Cursor::prev`]: primary keys are unique.
    pub fn prev_unique(&mut self) -> StoreResult<Option<KeyValue>> {
        self.prev()
    }

    /// Re-read the record at the current position; `None` if it was deleted.
    pub fn current(&mut self) -> StoreResult<Option<KeyValue>> {
        self.ensure_open()?;
        let position = self.unpositioned_guard()?;
        let locker = self.store.lock_for_read(self.txn.as_ref(), &position)?;
        let value = self.store.inner.read_value(&position);
        self.store.release_read(locker, &position);
        Ok(value.map(|value| (position, value)))
    }

    /// Delete the record at the current position; false if already gone.
    ///
    /// The position is kept, so `next`/`prev` continue from the deleted key.
    pub fn delete(&mut self) -> StoreResult<bool> {
        self.ensure_open()?;
        let position = self.unpositioned_guard()?;
        Ok(self.store.delete(self.txn.as_ref(), &position)?.is_some())
    }

    /// Overwrite the value at the current position.
    pub fn put_current(&mut self, value: &[u8]) -> StoreResult<()> {
        self.ensure_open()?;
        let position = self.unpositioned_guard()?;
        self.store.put(self.txn.as_ref(), &position, value)?;
        Ok(())
    }

    /// Open a second cursor at the same position in the same transaction.
    pub fn duplicate(&self) -> StoreResult<Cursor> {
        self.ensure_open()?;
        Ok(Cursor { store: self.store.clone(), txn: self.txn.clone(), position: self.position.clone(), open: true })
    }

    /// Close the cursor. Idempotent.
    pub fn close(&mut self) {
        self.open = false;
        self.position = None;
    }

    fn unpositioned_guard(&self) -> StoreResult<Vec<u8>> {
        self.position.clone().ok_or_else(|| StoreError::CursorUnpositioned { store: self.store.name() })
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("store", &self.store.name())
            .field("position", &self.position)
            .field("open", &self.open)
            .finish()
    }
}

/// A record reached through an index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    /// Secondary key
    pub secondary_key: Vec<u8>,
    /// Primary key
    pub primary_key: Vec<u8>,
    /// Primary value
    pub value: Vec<u8>,
}

/// Cursor over a secondary index, yielding primary records
pub struct IndexCursor {
    index: Index,
    txn: Option<TxnHandle>,
    /// (secondary key, primary key)
    position: Option<(Vec<u8>, Vec<u8>)>,
    open: bool,
}

impl IndexCursor {
    pub(crate) fn new(index: Index, txn: Option<TxnHandle>) -> Self {
        Self { index, txn, position: None, open: true }
    }

    /// Index the cursor walks
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Transaction the cursor is bound to, if any
    pub fn txn(&self) -> Option<&TxnHandle> {
        self.txn.as_ref()
    }

    /// False after [`IndexCursor::close`]
    pub fn is_open(&self) -> bool {
        self.open
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if !self.open {
            return Err(StoreError::CursorClosed { store: self.index.store.name() });
        }
        self.index.store.ensure_live()
    }

    fn land(&mut self, seek: IndexSeek, secondary: &[u8], primary: &[u8]) -> StoreResult<Option<IndexRecord>> {
        self.ensure_open()?;
        let forward = !matches!(seek, IndexSeek::Last | IndexSeek::Lt | IndexSeek::PrevDup | IndexSeek::PrevUnique);
        let within_run = matches!(seek, IndexSeek::NextDup | IndexSeek::PrevDup);
        let mut seek = seek;
        let mut probe = (secondary.to_vec(), primary.to_vec());
        let store = self.index.store.clone();

        loop {
            let (secondary_key, primary_key) = match self.index.inner.find(seek, &probe.0, &probe.1) {
                Some(found) => found,
                None => return Ok(None),
            };

            let locker = store.lock_for_read(self.txn.as_ref(), &primary_key)?;
            let value = if self.index.inner.contains(&secondary_key, &primary_key) {
                store.inner.read_value(&primary_key)
            } else {
                None
            };
            store.release_read(locker, &primary_key);

            match value {
                Some(value) => {
                    self.position = Some((secondary_key.clone(), primary_key.clone()));
                    return Ok(Some(IndexRecord { secondary_key, primary_key, value }));
                }
                None => {
                    seek = match (forward, within_run) {
                        (true, true) => IndexSeek::NextDup,
                        (true, false) => IndexSeek::Gt,
                        (false, true) => IndexSeek::PrevDup,
                        (false, false) => IndexSeek::Lt,
                    };
                    probe = (secondary_key, primary_key);
                }
            }
        }
    }

    /// Position at the first entry
    pub fn seek_first(&mut self) -> StoreResult<Option<IndexRecord>> {
        self.land(IndexSeek::First, &[], &[])
    }

    /// Position at the last entry
    pub fn seek_last(&mut self) -> StoreResult<Option<IndexRecord>> {
        self.land(IndexSeek::Last, &[], &[])
    }

    /// Position at the first entry whose secondary key is >= `secondary`
    pub fn seek_ge(&mut self, secondary: &[u8]) -> StoreResult<Option<IndexRecord>> {
        self.land(IndexSeek::Ge, secondary, &[])
    }

    /// Position at the first entry whose secondary key equals `secondary`
    pub fn seek_exact(&mut self, secondary: &[u8]) -> StoreResult<Option<IndexRecord>> {
        let saved = self.position.clone();
        match self.land(IndexSeek::Ge, secondary, &[])? {
            Some(record) if self.index.compare(&record.secondary_key, secondary).is_eq() => Ok(Some(record)),
            _ => {
                self.position = saved;
                Ok(None)
            }
        }
    }

    fn step(&mut self, seek: IndexSeek, unpositioned: IndexSeek) -> StoreResult<Option<IndexRecord>> {
        match self.position.clone() {
            Some((secondary, primary)) => self.land(seek, &secondary, &primary),
            None => self.land(unpositioned, &[], &[]),
        }
    }

    /// Next entry, possibly with the same secondary key
    pub fn next(&mut self) -> StoreResult<Option<IndexRecord>> {
        self.step(IndexSeek::Gt, IndexSeek::First)
    }

    /// Previous entry, possibly with the same secondary key
    pub fn prev(&mut self) -> StoreResult<Option<IndexRecord>> {
        self.step(IndexSeek::Lt, IndexSeek::Last)
    }

    /// Next entry only if it shares the current secondary key
    pub fn next_dup(&mut self) -> StoreResult<Option<IndexRecord>> {
        self.ensure_open()?;
        let (secondary, primary) = self.unpositioned_guard()?;
        self.land(IndexSeek::NextDup, &secondary, &primary)
    }

    /// Previous entry only if it shares the current secondary key
    pub fn prev_dup(&mut self) -> StoreResult<Option<IndexRecord>> {
        self.ensure_open()?;
        let (secondary, primary) = self.unpositioned_guard()?;
        self.land(IndexSeek::PrevDup, &secondary, &primary)
    }

    /// First entry of the next distinct secondary key
    pub fn next_unique(&mut self) -> StoreResult<Option<IndexRecord>> {
        self.step(IndexSeek::NextUnique, IndexSeek::First)
    }

    /// Last entry of the previous distinct secondary key
    pub fn prev_unique(&mut self) -> StoreResult<Option<IndexRecord>> {
        self.step(IndexSeek::PrevUnique, IndexSeek::Last)
    }

    /// Re-read the entry at the current position; `None` if it is gone.
    pub fn current(&mut self) -> StoreResult<Option<IndexRecord>> {
        self.ensure_open()?;
        let (secondary_key, primary_key) = self.unpositioned_guard()?;
        let store = self.index.store.clone();
        let locker = store.lock_for_read(self.txn.as_ref(), &primary_key)?;
        let value = if self.index.inner.contains(&secondary_key, &primary_key) {
            store.inner.read_value(&primary_key)
        } else {
            None
        };
        store.release_read(locker, &primary_key);
        Ok(value.map(|value| IndexRecord { secondary_key, primary_key, value }))
    }

    /// Number of entries sharing the current secondary key
    pub fn count_duplicates(&self) -> StoreResult<usize> {
        self.ensure_open()?;
        let (secondary, _) = self.unpositioned_guard()?;
        Ok(self.index.inner.count(&secondary, self.txn.as_ref().map(TxnHandle::id)))
    }

    /// Open a second cursor at the same position in the same transaction.
    pub fn duplicate(&self) -> StoreResult<IndexCursor> {
        self.ensure_open()?;
        Ok(IndexCursor { index: self.index.clone(), txn: self.txn.clone(), position: self.position.clone(), open: true })
    }

    /// Close the cursor. Idempotent.
    pub fn close(&mut self) {
        self.open = false;
        self.position = None;
    }

    fn unpositioned_guard(&self) -> StoreResult<(Vec<u8>, Vec<u8>)> {
        self.position.clone().ok_or_else(|| StoreError::CursorUnpositioned { store: self.index.store.name() })
    }
}

impl fmt::Debug for IndexCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexCursor")
            .field("index", &self.index.name())
            .field("position", &self.position)
            .field("open", &self.open)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::Environment;
    use crate::index::IndexDefinition;
    use crate::store::StoreOptions;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn populated() -> (Environment, Store, TempDir) {
        let temp = TempDir::new().unwrap();
        let env = Environment::open(temp.path(), Config::testing()).unwrap();
        let store = env.open_store("s", StoreOptions::create()).unwrap();
        for k in [b"a", b"c", b"e", b"g"] {
            store.put(None, k, b"v").unwrap();
        }
        (env, store, temp)
    }

    fn key(found: Option<KeyValue>) -> Option<Vec<u8>> {
        found.map(|(k, _)| k)
    }

    #[test]
    fn test_seek_and_step() {
        let (_env, store, _temp) = populated();
        let mut cursor = store.cursor(None).unwrap();

        assert_eq!(key(cursor.seek_ge(b"b").unwrap()), Some(b"c".to_vec()));
        assert_eq!(key(cursor.next().unwrap()), Some(b"e".to_vec()));
        assert_eq!(key(cursor.prev().unwrap()), Some(b"c".to_vec()));
        assert_eq!(key(cursor.seek_last().unwrap()), Some(b"g".to_vec()));
        assert_eq!(cursor.next().unwrap(), None);
        // Failed step keeps the position
        assert_eq!(cursor.position(), Some(&b"g"[..]));
        assert_eq!(cursor.seek_exact(b"d").unwrap(), None);
    }

    #[test]
    fn test_position_survives_delete() {
        let (env, store, _temp) = populated();
        let txn = env.begin().unwrap();
        let mut cursor = store.cursor(Some(&txn)).unwrap();

        cursor.seek_ge(b"c").unwrap();
        assert!(cursor.delete().unwrap());
        assert_eq!(cursor.current().unwrap(), None);
        assert_eq!(key(cursor.next().unwrap()), Some(b"e".to_vec()));
        assert_eq!(key(cursor.prev().unwrap()), Some(b"a".to_vec()));
        cursor.close();
        txn.commit().unwrap();

        assert_eq!(store.stats().unwrap().record_count, 3);
    }

    #[test]
    fn test_pending_delete_blocks_other_readers() {
        let (env, store, _temp) = populated();
        let txn = env.begin().unwrap();
        store.delete(Some(&txn), b"a").unwrap();

        // The deleting transaction no longer sees the key
        let mut own = store.cursor(Some(&txn)).unwrap();
        assert_eq!(key(own.seek_first().unwrap()), Some(b"c".to_vec()));
        assert_eq!(store.count(Some(&txn)).unwrap(), 3);
        assert_eq!(store.count(None).unwrap(), 4);
        own.close();

        let reader_store = store.clone();
        let reader = std::thread::spawn(move || {
            let mut cursor = reader_store.cursor(None).unwrap();
            key(cursor.seek_first().unwrap())
        });
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(!reader.is_finished());
        txn.abort().unwrap();
        assert_eq!(reader.join().unwrap(), Some(b"a".to_vec()));

        let txn = env.begin().unwrap();
        store.delete(Some(&txn), b"a").unwrap();
        let reader_store = store.clone();
        let reader = std::thread::spawn(move || {
            let mut cursor = reader_store.cursor(None).unwrap();
            key(cursor.seek_first().unwrap())
        });
        std::thread::sleep(std::time::Duration::from_millis(100));
        txn.commit().unwrap();
        assert_eq!(reader.join().unwrap(), Some(b"c".to_vec()));
        assert_eq!(store.stats().unwrap().record_count, 3);
    }

    #[test]
    fn test_closed_cursor_rejected() {
        let (_env, store, _temp) = populated();
        let mut cursor = store.cursor(None).unwrap();
        cursor.close();
        cursor.close();
        assert!(!cursor.is_open());
        assert!(matches!(cursor.seek_first(), Err(StoreError::CursorClosed { .. })));
    }

    #[test]
    fn test_duplicate_and_put_current() {
        let (env, store, _temp) = populated();
        let txn = env.begin().unwrap();
        let mut cursor = store.cursor(Some(&txn)).unwrap();
        cursor.seek_exact(b"e").unwrap();

        let mut dup = cursor.duplicate().unwrap();
        dup.put_current(b"changed").unwrap();
        assert_eq!(cursor.current().unwrap(), Some((b"e".to_vec(), b"changed".to_vec())));
        txn.commit().unwrap();
    }

    #[test]
    fn test_index_cursor_runs() {
        let (_env, store, _temp) = populated();
        store.put(None, b"a", b"x1").unwrap();
        store.put(None, b"c", b"x2").unwrap();
        store.put(None, b"e", b"y1").unwrap();
        store.put(None, b"g", b"z1").unwrap();
        let definition = IndexDefinition::new(
            "prefix",
            Arc::new(|_key: &[u8], value: &[u8]| Ok::<_, String>(Some(value[..1].to_vec()))),
        );
        let (index, created) = store.associate(definition.clone()).unwrap();
        assert!(created);
        assert!(!store.associate(definition).unwrap().1);

        let mut cursor = index.cursor(None).unwrap();
        let first = cursor.seek_exact(b"x").unwrap().unwrap();
        assert_eq!(first.primary_key, b"a");
        assert_eq!(cursor.count_duplicates().unwrap(), 2);
        assert_eq!(cursor.next_dup().unwrap().unwrap().primary_key, b"c");
        assert_eq!(cursor.next_dup().unwrap(), None);
        assert_eq!(cursor.next_unique().unwrap().unwrap().secondary_key, b"y");
        assert_eq!(cursor.prev_unique().unwrap().unwrap().primary_key, b"c");
        assert_eq!(cursor.seek_exact(b"w").unwrap(), None);
    }
}
