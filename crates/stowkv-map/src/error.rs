//! Error types for map-layer operations

use stowkv_core::{StoreError, TxnHandle};
use thiserror::Error;

/// Map-layer error
#[derive(Debug, Error)]
pub enum MapError {
    /// Lock conflict inside the ambient transaction. The whole transaction
    /// must be aborted and re-run; retrying only the failed call is not enough.
    #[error("deadlock in transaction {}: abort and retry the transaction", .txn.id())]
    Deadlock {
        /// The ambient transaction that lost
        txn: TxnHandle,
    },

    /// Map, index or store handle used after `close`/`destroy`
    #[error("store '{store}' is closed")]
    Closed {
        /// Store name
        store: String,
    },

    /// Malformed range bounds or bounds outside the parent view
    #[error("invalid range: {reason}")]
    InvalidRange {
        /// What is wrong with the bounds
        reason: String,
    },

    /// Navigable or range operation on a map or index without a key ordering
    #[error("{operation} requires a configured key ordering")]
    UnsupportedOrdering {
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Operation not available through this map, view or iterator
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// Nothing to return
    #[error("no such element")]
    NoSuchElement,

    /// Transaction-free operation kept deadlocking
    #[error("gave up after {attempts} deadlocked attempts")]
    RetryExhausted {
        /// Attempts made
        attempts: u32,
    },

    /// Key or value could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),

    /// Any other engine failure
    #[error("{operation} on store '{store}' failed: {source}")]
    Engine {
        /// Store name
        store: String,
        /// Operation that failed
        operation: &'static str,
        /// Engine error
        #[source]
        source: StoreError,
    },
}

impl MapError {
    /// Wrap an engine error with context. A dropped store reads as `Closed`.
    pub(crate) fn engine(store: &str, operation: &'static str, source: StoreError) -> Self {
        match source {
            StoreError::StoreDropped { .. } => MapError::Closed { store: store.to_string() },
            source => MapError::Engine { store: store.to_string(), operation, source },
        }
    }

    /// True for the transient lock conflict, with or without a transaction
    pub fn is_deadlock(&self) -> bool {
        match self {
            MapError::Deadlock { .. } => true,
            MapError::Engine { source, .. } => source.is_deadlock(),
            _ => false,
        }
    }

    /// Ambient transaction carried by a `Deadlock`
    pub fn transaction(&self) -> Option<&TxnHandle> {
        match self {
            MapError::Deadlock { txn } => Some(txn),
            _ => None,
        }
    }
}

/// Result type alias for map operations
pub type MapResult<T> = Result<T, MapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropped_store_reads_as_closed() {
        let err = MapError::engine("users", "get", StoreError::StoreDropped { name: "users".into() });
        assert!(matches!(err, MapError::Closed { ref store } if store == "users"));
    }

    #[test]
    fn test_engine_deadlock_is_transient() {
        let err = MapError::engine("users", "put", StoreError::Deadlock { txn_id: 3 });
        assert!(err.is_deadlock());
        assert!(err.transaction().is_none());
        assert!(err.to_string().contains("put on store 'users'"));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            MapError::UnsupportedOrdering { operation: "head_view" }.to_string(),
            "head_view requires a configured key ordering"
        );
        assert_eq!(MapError::NoSuchElement.to_string(), "no such element");
    }
}
