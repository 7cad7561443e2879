//! Lazily decoded map entries

use std::cell::{OnceCell, RefCell};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use stowkv_core::Cursor;

use crate::codec::Codec;
use crate::error::{MapError, MapResult};
use crate::iter::Slot;

/// Key and value codecs of one map
pub(crate) struct Codecs<K, V> {
    pub(crate) key: Arc<dyn Codec<K>>,
    pub(crate) value: Arc<dyn Codec<V>>,
}

impl<K, V> Clone for Codecs<K, V> {
    fn clone(&self) -> Self {
        Self { key: Arc::clone(&self.key), value: Arc::clone(&self.value) }
    }
}

/// Weak link back to the iterator that produced an entry
pub(crate) struct Origin {
    pub(crate) slot: Weak<Mutex<Slot<Cursor>>>,
    pub(crate) generation: u64,
    pub(crate) store: String,
}

/// One record. The key and value are decoded on first access and cached;
/// the raw value bytes are released once decoded.
pub struct Entry<K, V> {
    raw_key: Vec<u8>,
    key: OnceCell<K>,
    raw_value: RefCell<Option<Vec<u8>>>,
    value: OnceCell<V>,
    codecs: Codecs<K, V>,
    origin: Option<Origin>,
}

impl<K, V> Entry<K, V> {
    pub(crate) fn new(raw_key: Vec<u8>, raw_value: Vec<u8>, codecs: Codecs<K, V>, origin: Option<Origin>) -> Self {
        Self {
            raw_key,
            key: OnceCell::new(),
            raw_value: RefCell::new(Some(raw_value)),
            value: OnceCell::new(),
            codecs,
            origin,
        }
    }

    /// Encoded key
    pub fn raw_key(&self) -> &[u8] {
        &self.raw_key
    }

    /// Decoded key
    pub fn key(&self) -> MapResult<&K> {
        if let Some(key) = self.key.get() {
            return Ok(key);
        }
        let decoded = self.codecs.key.decode(&self.raw_key)?;
        Ok(self.key.get_or_init(|| decoded))
    }

    /// Decoded value
    pub fn value(&self) -> MapResult<&V> {
        if let Some(value) = self.value.get() {
            return Ok(value);
        }
        let decoded = match self.raw_value.borrow().as_deref() {
            Some(bytes) => self.codecs.value.decode(bytes)?,
            None => return Err(MapError::Codec("entry value is missing".into())),
        };
        self.raw_value.borrow_mut().take();
        Ok(self.value.get_or_init(|| decoded))
    }

    /// Decoded key, consuming the entry
    pub fn into_key(self) -> MapResult<K> {
        self.key()?;
        self.key.into_inner().ok_or_else(|| MapError::Codec("entry key is missing".into()))
    }

    /// Decoded value, consuming the entry
    pub fn into_value(self) -> MapResult<V> {
        self.value()?;
        self.value.into_inner().ok_or_else(|| MapError::Codec("entry value is missing".into()))
    }

    /// Decoded (key, value), consuming the entry
    pub fn into_pair(self) -> MapResult<(K, V)> {
        self.key()?;
        self.value()?;
        match (self.key.into_inner(), self.value.into_inner()) {
            (Some(key), Some(value)) => Ok((key, value)),
            _ => Err(MapError::Codec("entry is missing its key or value".into())),
        }
    }

    /// Replace the value through the iterator that produced this entry.
    ///
    /// Needs the iterator to be open and bound to a transaction. Entries
    /// from searches and index iterators are detached and fail with
    /// `Unsupported`.
    pub fn set_value(&mut self, value: V) -> MapResult<()> {
        let origin = self.origin.as_ref().ok_or(MapError::Unsupported("entry is not attached to a primary iterator"))?;
        let slot = origin.slot.upgrade().ok_or_else(|| MapError::Closed { store: origin.store.clone() })?;
        let bytes = self.codecs.value.encode(&value)?;
        slot.lock().write(origin.generation, &self.raw_key, Some(&bytes))?;

        self.raw_value.get_mut().take();
        self.value = OnceCell::from(value);
        Ok(())
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for Entry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("raw_key", &self.raw_key)
            .field("key", &self.key.get())
            .field("value", &self.value.get())
            .finish()
    }
}
