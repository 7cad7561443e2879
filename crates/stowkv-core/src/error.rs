//! Error types for StowKV engine operations
//!
//! All engine errors are represented by the [`StoreError`] enum. Variants carry
//! enough context (paths, offsets, store names, transaction ids) to diagnose
//! a failure without a debugger attached.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// StowKV engine error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", .path.as_ref().map(|p| format!(" in {}", p.display())).unwrap_or_default())]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// WAL or snapshot file is corrupted and cannot be recovered
    #[error("log corrupted in {} at offset {offset}: {reason}", .path.display())]
    WalCorrupted {
        /// Path to the corrupted file
        path: PathBuf,
        /// Byte offset where corruption was detected
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Checksum verification failed
    #[error("checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}", .path.display())]
    ChecksumMismatch {
        /// File where checksum failed
        path: PathBuf,
        /// Expected checksum value
        expected: u32,
        /// Actual checksum computed
        actual: u32,
        /// Byte offset of the corrupted data
        offset: u64,
    },

    /// Torn write detected (partial write at end of file)
    #[error("torn write in {} at offset {offset}: expected {expected_size} bytes, only {available_bytes} available", .path.display())]
    TornWrite {
        /// File with torn write
        path: PathBuf,
        /// Expected entry size
        expected_size: u32,
        /// Actual bytes available
        available_bytes: u64,
        /// Offset where torn write begins
        offset: u64,
    },

    /// Magic bytes not found at expected location
    #[error("magic bytes not found in {} at offset {offset}: found {:02x}{:02x}{:02x}{:02x}", .path.display(), .found_bytes[0], .found_bytes[1], .found_bytes[2], .found_bytes[3])]
    NoMagicFound {
        /// File being read
        path: PathBuf,
        /// Offset where magic was expected
        offset: u64,
        /// Bytes actually found
        found_bytes: [u8; 4],
    },

    /// Entry size exceeds maximum allowed
    #[error("entry {component} too large: {entry_size} bytes exceeds limit of {max_size} bytes")]
    OversizedEntry {
        /// Size of the oversized entry
        entry_size: u64,
        /// Maximum allowed size
        max_size: u64,
        /// Whether it's the key, value or store name that's oversized
        component: &'static str,
    },

    /// A lock request would close a cycle in the wait-for graph.
    ///
    /// The requesting locker is the victim. Transient: the operation may
    /// succeed if its transaction is aborted and retried.
    #[error("deadlock detected: locker {txn_id} chosen as victim")]
    Deadlock {
        /// Transaction (or short-lived locker) id of the victim
        txn_id: u64,
    },

    /// A lock request waited longer than the configured lock timeout
    #[error("lock wait timed out after {waited:?} for locker {txn_id} on store {store}")]
    LockTimeout {
        /// Waiting locker
        txn_id: u64,
        /// Store the contended record belongs to
        store: String,
        /// How long the request waited
        waited: Duration,
    },

    /// Named store does not exist
    #[error("store '{name}' not found")]
    StoreNotFound {
        /// Requested store name
        name: String,
    },

    /// Named store already exists
    #[error("store '{name}' already exists")]
    StoreExists {
        /// Conflicting store name
        name: String,
    },

    /// Store was dropped while a handle to it was still in use
    #[error("store '{name}' has been dropped")]
    StoreDropped {
        /// Name the store had when it was dropped
        name: String,
    },

    /// Store was opened with a comparator other than the one it is sorted by
    #[error("store '{name}' is ordered by '{installed}', cannot open with '{requested}'")]
    ComparatorMismatch {
        /// Store name
        name: String,
        /// Comparator already installed
        installed: String,
        /// Comparator requested by the caller
        requested: String,
    },

    /// Named index is not associated with the store
    #[error("index '{index}' is not associated with store '{store}'")]
    IndexNotFound {
        /// Store name
        store: String,
        /// Requested index name
        index: String,
    },

    /// Secondary key extraction failed for a record
    #[error("index '{index}' could not extract a key: {reason}")]
    Extractor {
        /// Index whose extractor failed
        index: String,
        /// Extractor's own description of the failure
        reason: String,
    },

    /// Transaction was already committed or aborted
    #[error("transaction {txn_id} is no longer active")]
    TransactionFinished {
        /// Finished transaction id
        txn_id: u64,
    },

    /// Cursor was used after close
    #[error("cursor on store '{store}' is closed")]
    CursorClosed {
        /// Store the cursor was opened on
        store: String,
    },

    /// Positional operation on a cursor that is not positioned on a record
    #[error("cursor on store '{store}' is not positioned on a record")]
    CursorUnpositioned {
        /// Store the cursor was opened on
        store: String,
    },

    /// Operation not supported by this kind of cursor or store
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// Checkpoint requested while transactions are active
    #[error("checkpoint refused: {active} transaction(s) still active")]
    CheckpointBusy {
        /// Number of active transactions
        active: usize,
    },
}

impl StoreError {
    /// True for the transient lock-conflict signal that may succeed on retry.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, StoreError::Deadlock { .. })
    }

    /// Build an [`StoreError::Io`] carrying the path and a short description.
    pub(crate) fn io(path: &std::path::Path, context: &str, err: std::io::Error) -> Self {
        StoreError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", context, err),
        }
    }
}

/// Convert std::io::Error to StoreError::Io
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for engine operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::ChecksumMismatch {
            path: PathBuf::from("/tmp/test.wal"),
            expected: 0x12345678,
            actual: 0x87654321,
            offset: 1024,
        };

        let display = format!("{}", err);
        assert!(display.contains("checksum mismatch"));
        assert!(display.contains("0x12345678"));
        assert!(display.contains("0x87654321"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: StoreError = io_err.into();

        match err {
            StoreError::Io { kind, path, .. } => {
                assert_eq!(kind, std::io::ErrorKind::NotFound);
                assert!(path.is_none());
            }
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_io_display_with_path() {
        let err = StoreError::io(
            std::path::Path::new("/data/wal"),
            "Failed to create WAL directory",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let display = err.to_string();
        assert!(display.contains("/data/wal"));
        assert!(display.contains("Failed to create WAL directory"));
    }

    #[test]
    fn test_deadlock_is_transient() {
        assert!(StoreError::Deadlock { txn_id: 7 }.is_deadlock());
        assert!(!StoreError::TransactionFinished { txn_id: 7 }.is_deadlock());
    }
}
