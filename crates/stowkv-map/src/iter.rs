//! Live iterators over maps, views and indices.
//!
//! Each iterator owns exactly one engine cursor, kept in a shared [`Slot`]
//! so that the store's iterator registry can close it from the outside and
//! entries can write back through it. The state machine is
//! `Created -> Pending <-> Consumed -> Exhausted`, with `Closed` reachable
//! from anywhere. A transaction-free iterator closes its cursor as soon as
//! it runs off the end of its range.

use std::sync::Arc;

use parking_lot::Mutex;
use stowkv_core::{Cursor, Index, IndexCursor, IndexRecord, StoreResult, TxnHandle};

use crate::codec::Codec;
use crate::database::StoreHandle;
use crate::entry::{Codecs, Entry, Origin};
use crate::error::{MapError, MapResult};
use crate::index::IndexGroup;
use crate::range::ViewBounds;
use crate::registry::ForceClose;
use crate::retry::RetryPolicy;
use crate::search::{self, SearchCursor, SearchKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Open,
    Closed,
    ForceClosed,
}

/// An iterator's cursor, shared with the registry and with entries
pub(crate) struct Slot<C> {
    cursor: C,
    store: String,
    generation: u64,
    state: SlotState,
}

impl<C: SearchCursor> Slot<C> {
    fn close(&mut self, state: SlotState) {
        if self.state == SlotState::Open {
            self.cursor.close();
            self.generation += 1;
            self.state = state;
        }
    }
}

impl<C: SearchCursor> ForceClose for Mutex<Slot<C>> {
    fn force_close(&self) {
        self.lock().close(SlotState::ForceClosed);
    }
}

impl Slot<Cursor> {
    /// Overwrite (`Some`) or delete (`None`) the record at `key`.
    ///
    /// Goes through the iterator's own cursor when it still sits on `key`,
    /// otherwise through a duplicate re-seeked to `key`, so the iterator's
    /// position is left alone.
    pub(crate) fn write(&mut self, generation: u64, key: &[u8], value: Option<&[u8]>) -> MapResult<()> {
        let txn = self
            .cursor
            .txn()
            .cloned()
            .ok_or(MapError::Unsupported("modifying through an iterator requires a transaction"))?;
        if self.state != SlotState::Open || self.generation != generation {
            return Err(MapError::Closed { store: self.store.clone() });
        }

        let written = if self.cursor.position() == Some(key) {
            write_at(&mut self.cursor, value).map(|()| true)
        } else {
            match self.cursor.duplicate() {
                Ok(mut duplicate) => {
                    let written = seek_and_write(&mut duplicate, key, value);
                    duplicate.close();
                    written
                }
                Err(e) => Err(e),
            }
        };

        let operation = if value.is_some() { "set_value" } else { "remove" };
        match written {
            Ok(true) => Ok(()),
            // Already gone: nothing to remove
            Ok(false) if value.is_none() => Ok(()),
            Ok(false) => Err(MapError::NoSuchElement),
            Err(e) if e.is_deadlock() => Err(MapError::Deadlock { txn }),
            Err(e) => Err(MapError::engine(&self.store, operation, e)),
        }
    }
}

fn write_at(cursor: &mut Cursor, value: Option<&[u8]>) -> StoreResult<()> {
    match value {
        Some(value) => cursor.put_current(value),
        None => cursor.delete().map(|_| ()),
    }
}

fn seek_and_write(cursor: &mut Cursor, key: &[u8], value: Option<&[u8]>) -> StoreResult<bool> {
    match cursor.seek_exact(key)? {
        Some(_) => write_at(cursor, value).map(|()| true),
        None => Ok(false),
    }
}

type Move<C> = Box<dyn FnMut(&mut C) -> StoreResult<Option<<C as SearchCursor>::Item>> + Send>;
type Accept<C> = Box<dyn Fn(&C, &<C as SearchCursor>::Item) -> bool + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkState {
    Created,
    Pending,
    Consumed,
    Exhausted,
    Closed,
}

/// The state machine shared by every iterator kind
pub(crate) struct Walk<C: SearchCursor> {
    slot: Arc<Mutex<Slot<C>>>,
    handle: Arc<StoreHandle>,
    registration: u64,
    txn: Option<TxnHandle>,
    retry: RetryPolicy,
    start: Move<C>,
    step: Move<C>,
    accept: Accept<C>,
    state: WalkState,
    pending: Option<C::Item>,
}

impl<C: SearchCursor> Walk<C> {
    fn open(
        handle: Arc<StoreHandle>,
        owner: u64,
        cursor: C,
        retry: RetryPolicy,
        start: Move<C>,
        step: Move<C>,
        accept: Accept<C>,
    ) -> Self {
        let txn = cursor.txn().cloned();
        let slot = Arc::new(Mutex::new(Slot {
            cursor,
            store: handle.name().to_string(),
            generation: 0,
            state: SlotState::Open,
        }));
        let target: Arc<dyn ForceClose> = slot.clone();
        let registration = handle.registry.register(owner, txn.is_some(), Arc::downgrade(&target));
        Self {
            slot,
            handle,
            registration,
            txn,
            retry,
            start,
            step,
            accept,
            state: WalkState::Created,
            pending: None,
        }
    }

    /// Walk a view's range in its direction.
    pub(crate) fn bounded(
        handle: Arc<StoreHandle>,
        owner: u64,
        cursor: C,
        retry: RetryPolicy,
        bounds: ViewBounds,
    ) -> Self {
        let first = bounds.clone();
        let start: Move<C> = Box::new(move |cursor: &mut C| {
            let (kind, target) = {
                let cmp = |a: &[u8], b: &[u8]| cursor.compare(a, b);
                first.plan(SearchKind::First, &[], &cmp)
            };
            search::position(cursor, kind, &target, None)
        });
        let forward = !bounds.descending;
        let step: Move<C> = Box::new(move |cursor: &mut C| if forward { cursor.next() } else { cursor.prev() });
        let accept: Accept<C> = Box::new(move |cursor: &C, item: &C::Item| {
            bounds.contains(C::key_of(item), &|a: &[u8], b: &[u8]| cursor.compare(a, b))
        });
        Self::open(handle, owner, cursor, retry, start, step, accept)
    }

    /// True if another item is available; advances the cursor at most once
    /// per consumed item.
    pub(crate) fn has_next(&mut self) -> MapResult<bool> {
        match self.state {
            WalkState::Pending => return Ok(true),
            WalkState::Exhausted | WalkState::Closed => return Ok(false),
            WalkState::Created | WalkState::Consumed => {}
        }

        let store = self.handle.name().to_string();
        let found = {
            let mut guard = self.slot.lock();
            if guard.state != SlotState::Open {
                return Err(MapError::Closed { store });
            }
            let slot = &mut *guard;
            let fresh = self.state == WalkState::Created;
            let (start, step, accept) = (&mut self.start, &mut self.step, &self.accept);
            self.retry.run(&store, "iterate", self.txn.as_ref(), || {
                let found = if fresh { start(&mut slot.cursor)? } else { step(&mut slot.cursor)? };
                Ok(found.filter(|item| accept(&slot.cursor, item)))
            })?
        };

        match found {
            Some(item) => {
                self.pending = Some(item);
                self.state = WalkState::Pending;
                Ok(true)
            }
            None => {
                self.state = WalkState::Exhausted;
                if self.txn.is_none() {
                    self.release();
                }
                Ok(false)
            }
        }
    }

    /// The pending item, marked consumed
    pub(crate) fn take(&mut self) -> MapResult<C::Item> {
        if !self.has_next()? {
            return Err(MapError::NoSuchElement);
        }
        self.state = WalkState::Consumed;
        self.pending.take().ok_or(MapError::NoSuchElement)
    }

    pub(crate) fn close(&mut self) {
        if self.state != WalkState::Closed {
            self.state = WalkState::Closed;
            self.pending = None;
            self.release();
        }
    }

    /// Close the cursor, then leave the registry. Never holds the slot lock
    /// while taking the registry lock.
    fn release(&mut self) {
        self.slot.lock().close(SlotState::Closed);
        self.handle.registry.unregister(self.registration);
    }

    pub(crate) fn slot(&self) -> &Arc<Mutex<Slot<C>>> {
        &self.slot
    }

    pub(crate) fn generation(&self) -> u64 {
        self.slot.lock().generation
    }

    pub(crate) fn store_name(&self) -> &str {
        self.handle.name()
    }

    pub(crate) fn is_transactional(&self) -> bool {
        self.txn.is_some()
    }
}

impl<C: SearchCursor> Drop for Walk<C> {
    fn drop(&mut self) {
        let leaked = self.slot.lock().state == SlotState::Open;
        if leaked {
            tracing::warn!(store = %self.handle.name(), "iterator dropped without close, closing its cursor");
        }
        self.release();
    }
}

/// Iterator over a primary map or one of its range views
pub struct MapIter<K, V> {
    walk: Walk<Cursor>,
    codecs: Codecs<K, V>,
    last: Option<Vec<u8>>,
    failed: bool,
}

impl<K, V> MapIter<K, V> {
    pub(crate) fn new(walk: Walk<Cursor>, codecs: Codecs<K, V>) -> Self {
        Self { walk, codecs, last: None, failed: false }
    }

    /// True if [`MapIter::next_entry`] has an entry to return
    pub fn has_next(&mut self) -> MapResult<bool> {
        self.walk.has_next()
    }

    /// Next entry, or `NoSuchElement`
    pub fn next_entry(&mut self) -> MapResult<Entry<K, V>> {
        let (key, value) = self.walk.take()?;
        self.last = Some(key.clone());
        let origin = Origin {
            slot: Arc::downgrade(self.walk.slot()),
            generation: self.walk.generation(),
            store: self.walk.store_name().to_string(),
        };
        Ok(Entry::new(key, value, self.codecs.clone(), Some(origin)))
    }

    /// Delete the entry last returned. Needs a transaction.
    pub fn remove(&mut self) -> MapResult<()> {
        if !self.walk.is_transactional() {
            return Err(MapError::Unsupported("remove through an iterator requires a transaction"));
        }
        let key = self.last.take().ok_or(MapError::Unsupported("remove called before next"))?;
        let generation = self.walk.generation();
        let result = self.walk.slot().lock().write(generation, &key, None);
        if result.is_err() {
            self.last = Some(key);
        }
        result
    }

    /// Replace the value of the entry last returned. Needs a transaction.
    pub fn set_value(&mut self, value: &V) -> MapResult<()> {
        if !self.walk.is_transactional() {
            return Err(MapError::Unsupported("set_value through an iterator requires a transaction"));
        }
        let key = self.last.as_deref().ok_or(MapError::Unsupported("set_value called before next"))?;
        let bytes = self.codecs.value.encode(value)?;
        let generation = self.walk.generation();
        self.walk.slot().lock().write(generation, key, Some(&bytes))
    }

    /// True if bound to the connection's transaction
    pub fn is_transactional(&self) -> bool {
        self.walk.is_transactional()
    }

    /// Close the cursor. Idempotent.
    pub fn close(&mut self) {
        self.walk.close();
    }
}

impl<K, V> Iterator for MapIter<K, V> {
    type Item = MapResult<Entry<K, V>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.walk.has_next() {
            Ok(true) => Some(self.next_entry()),
            Ok(false) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Keys of a [`MapIter`]
pub struct Keys<K, V>(MapIter<K, V>);

impl<K, V> Keys<K, V> {
    pub(crate) fn new(inner: MapIter<K, V>) -> Self {
        Self(inner)
    }

    /// Close the cursor. Idempotent.
    pub fn close(&mut self) {
        self.0.close();
    }
}

impl<K, V> Iterator for Keys<K, V> {
    type Item = MapResult<K>;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|entry| entry.and_then(Entry::into_key))
    }
}

/// Values of a [`MapIter`]
pub struct Values<K, V>(MapIter<K, V>);

impl<K, V> Values<K, V> {
    pub(crate) fn new(inner: MapIter<K, V>) -> Self {
        Self(inner)
    }

    /// Close the cursor. Idempotent.
    pub fn close(&mut self) {
        self.0.close();
    }
}

impl<K, V> Iterator for Values<K, V> {
    type Item = MapResult<V>;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|entry| entry.and_then(Entry::into_value))
    }
}

/// Iterator over primary entries reached through a secondary index.
/// Read-only: `remove` and `set_value` are unsupported.
pub struct IndexIter<K, V> {
    walk: Walk<IndexCursor>,
    codecs: Codecs<K, V>,
    failed: bool,
}

impl<K, V> IndexIter<K, V> {
    /// Entries whose secondary key equals `secondary`; with
    /// `only_duplicates` unset, iteration continues into later keys.
    pub(crate) fn find(
        handle: Arc<StoreHandle>,
        owner: u64,
        cursor: IndexCursor,
        retry: RetryPolicy,
        codecs: Codecs<K, V>,
        secondary: Vec<u8>,
        only_duplicates: bool,
    ) -> Self {
        let start: Move<IndexCursor> = Box::new(move |cursor: &mut IndexCursor| cursor.seek_exact(&secondary));
        let step: Move<IndexCursor> = Box::new(move |cursor: &mut IndexCursor| {
            if only_duplicates {
                cursor.next_dup()
            } else {
                cursor.next()
            }
        });
        let accept: Accept<IndexCursor> = Box::new(|_: &IndexCursor, _: &IndexRecord| true);
        let walk = Walk::open(handle, owner, cursor, retry, start, step, accept);
        Self { walk, codecs, failed: false }
    }

    pub(crate) fn bounded(walk: Walk<IndexCursor>, codecs: Codecs<K, V>) -> Self {
        Self { walk, codecs, failed: false }
    }

    /// True if [`IndexIter::next_entry`] has an entry to return
    pub fn has_next(&mut self) -> MapResult<bool> {
        self.walk.has_next()
    }

    /// Next primary entry, or `NoSuchElement`
    pub fn next_entry(&mut self) -> MapResult<Entry<K, V>> {
        let record = self.walk.take()?;
        Ok(Entry::new(record.primary_key, record.value, self.codecs.clone(), None))
    }

    /// Always `Unsupported`: index iterators are read-only
    pub fn remove(&mut self) -> MapResult<()> {
        Err(MapError::Unsupported("remove through a secondary index iterator"))
    }

    /// Always `Unsupported`: index iterators are read-only
    pub fn set_value(&mut self, _value: &V) -> MapResult<()> {
        Err(MapError::Unsupported("set_value through a secondary index iterator"))
    }

    /// Close the cursor. Idempotent.
    pub fn close(&mut self) {
        self.walk.close();
    }
}

impl<K, V> Iterator for IndexIter<K, V> {
    type Item = MapResult<Entry<K, V>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.walk.has_next() {
            Ok(true) => Some(self.next_entry()),
            Ok(false) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Iterator over an index view, one group per distinct secondary key
pub struct GroupIter<SK, K, V> {
    walk: Walk<IndexCursor>,
    index: Index,
    key_codec: Arc<dyn Codec<SK>>,
    codecs: Codecs<K, V>,
    descending: bool,
    peeked: Option<IndexRecord>,
    failed: bool,
}

impl<SK, K, V> GroupIter<SK, K, V> {
    pub(crate) fn new(
        walk: Walk<IndexCursor>,
        index: Index,
        key_codec: Arc<dyn Codec<SK>>,
        codecs: Codecs<K, V>,
        descending: bool,
    ) -> Self {
        Self { walk, index, key_codec, codecs, descending, peeked: None, failed: false }
    }

    /// Next group, or `None` at the end of the view. Entries within a
    /// group are in primary key order whatever the view's direction.
    pub fn next_group(&mut self) -> MapResult<Option<IndexGroup<SK, K, V>>> {
        let first = match self.peeked.take() {
            Some(record) => record,
            None if self.walk.has_next()? => self.walk.take()?,
            None => return Ok(None),
        };

        let mut run = vec![first];
        while self.walk.has_next()? {
            let record = self.walk.take()?;
            if self.index.compare(&record.secondary_key, &run[0].secondary_key).is_eq() {
                run.push(record);
            } else {
                self.peeked = Some(record);
                break;
            }
        }
        if self.descending {
            run.reverse();
        }
        group(run, self.key_codec.as_ref(), &self.codecs).map(Some)
    }

    /// Close the cursor. Idempotent.
    pub fn close(&mut self) {
        self.peeked = None;
        self.walk.close();
    }
}

impl<SK, K, V> Iterator for GroupIter<SK, K, V> {
    type Item = MapResult<IndexGroup<SK, K, V>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_group() {
            Ok(group) => group.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Build a group from a run of index records sharing a secondary key
pub(crate) fn group<SK, K, V>(
    run: Vec<IndexRecord>,
    key_codec: &dyn Codec<SK>,
    codecs: &Codecs<K, V>,
) -> MapResult<IndexGroup<SK, K, V>> {
    let secondary = run.first().map(|record| record.secondary_key.as_slice()).ok_or(MapError::NoSuchElement)?;
    let key = key_codec.decode(secondary)?;
    let entries = run
        .into_iter()
        .map(|record| Entry::new(record.primary_key, record.value, codecs.clone(), None))
        .collect();
    Ok(IndexGroup { key, entries })
}

/// Every entry sharing the secondary key of `landed`, in primary key order
pub(crate) fn collect_run(cursor: &mut IndexCursor, landed: &IndexRecord) -> StoreResult<Vec<IndexRecord>> {
    let mut run = Vec::new();
    let mut next = cursor.seek_exact(&landed.secondary_key)?;
    while let Some(record) = next {
        run.push(record);
        next = cursor.next_dup()?;
    }
    Ok(run)
}
