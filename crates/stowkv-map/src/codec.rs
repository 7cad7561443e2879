//! Codecs between typed keys/values and stored bytes, and key orderings.
//!
//! Key codecs must be order-preserving for the ordering they are used with:
//! if `a < b` then `encode(a)` sorts before `encode(b)`. The built-in
//! integer codecs write big-endian with the sign bit flipped so raw byte
//! order matches numeric order.

use std::fmt;
use std::sync::Arc;

use stowkv_core::KeyComparator;

use crate::error::{MapError, MapResult};

/// Converts `T` to and from bytes
pub trait Codec<T>: Send + Sync {
    /// Encode a value
    fn encode(&self, value: &T) -> MapResult<Vec<u8>>;

    /// Decode a value
    fn decode(&self, bytes: &[u8]) -> MapResult<T>;
}

fn fixed<const N: usize>(bytes: &[u8], type_name: &str) -> MapResult<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| MapError::Codec(format!("expected {} bytes for {}, got {}", N, type_name, bytes.len())))
}

/// `u32`, big-endian
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderedU32;

impl Codec<u32> for OrderedU32 {
    fn encode(&self, value: &u32) -> MapResult<Vec<u8>> {
        Ok(value.to_be_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> MapResult<u32> {
        Ok(u32::from_be_bytes(fixed(bytes, "u32")?))
    }
}

/// `u64`, big-endian
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderedU64;

impl Codec<u64> for OrderedU64 {
    fn encode(&self, value: &u64) -> MapResult<Vec<u8>> {
        Ok(value.to_be_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> MapResult<u64> {
        Ok(u64::from_be_bytes(fixed(bytes, "u64")?))
    }
}

/// `i32`, big-endian with the sign bit flipped
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderedI32;

impl Codec<i32> for OrderedI32 {
    fn encode(&self, value: &i32) -> MapResult<Vec<u8>> {
        Ok(((*value as u32) ^ (1 << 31)).to_be_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> MapResult<i32> {
        Ok((u32::from_be_bytes(fixed(bytes, "i32")?) ^ (1 << 31)) as i32)
    }
}

/// `i64`, big-endian with the sign bit flipped
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderedI64;

impl Codec<i64> for OrderedI64 {
    fn encode(&self, value: &i64) -> MapResult<Vec<u8>> {
        Ok(((*value as u64) ^ (1 << 63)).to_be_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> MapResult<i64> {
        Ok((u64::from_be_bytes(fixed(bytes, "i64")?) ^ (1 << 63)) as i64)
    }
}

/// UTF-8 strings; byte order is code point order
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8;

impl Codec<String> for Utf8 {
    fn encode(&self, value: &String) -> MapResult<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> MapResult<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| MapError::Codec(format!("invalid UTF-8: {}", e)))
    }
}

/// Bytes stored as-is
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBytes;

impl Codec<Vec<u8>> for RawBytes {
    fn encode(&self, value: &Vec<u8>) -> MapResult<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> MapResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Ordering of a map's keys or an index's secondary keys
#[derive(Clone, Default)]
pub enum KeyOrder {
    /// No ordering: navigable search and views are unavailable
    #[default]
    Unordered,
    /// Raw byte order of the encoded keys
    Bytewise,
    /// A comparator installed in the engine
    Custom(Arc<dyn KeyComparator>),
}

impl KeyOrder {
    /// True unless [`KeyOrder::Unordered`]
    pub fn is_ordered(&self) -> bool {
        !matches!(self, KeyOrder::Unordered)
    }

    /// Comparator to install in the engine
    pub(crate) fn comparator(&self) -> Option<Arc<dyn KeyComparator>> {
        match self {
            KeyOrder::Custom(comparator) => Some(Arc::clone(comparator)),
            KeyOrder::Unordered | KeyOrder::Bytewise => None,
        }
    }

    pub(crate) fn require(&self, operation: &'static str) -> MapResult<()> {
        if self.is_ordered() {
            Ok(())
        } else {
            Err(MapError::UnsupportedOrdering { operation })
        }
    }
}

impl fmt::Debug for KeyOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyOrder::Unordered => write!(f, "Unordered"),
            KeyOrder::Bytewise => write!(f, "Bytewise"),
            KeyOrder::Custom(comparator) => write!(f, "Custom({})", comparator.name()),
        }
    }
}
