//! StowKV Core: embedded transactional ordered key/value engine
//!
//! Named stores keep their records in RAM as ordered maps; a CRC-framed
//! write-ahead log plus periodic snapshots make committed transactions
//! survive crashes.
//!
//! # Architecture
//!
//! - **Stores**: ordered by raw bytes or by a [`KeyComparator`]
//! - **Transactions**: record-level shared/exclusive locks, deadlock
//!   detection on the wait-for graph, in-place writes with an undo log
//! - **Secondary indices**: derived (secondary key, primary key) sets kept in
//!   step with every primary write
//! - **Cursors**: positioned by key, so a position survives deletion
//! - **Durability**: WAL batch per commit, snapshot on checkpoint
//!
//! Higher-level typed maps live in separate crates (e.g. stowkv-map).

pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod format;
pub mod index;
mod lock;
pub mod platform_durability;
pub mod snapshot;
pub mod store;
pub mod txn;
pub mod wal;

// Re-export key types for convenience
pub use config::Config;
pub use cursor::{Cursor, IndexCursor, IndexRecord, KeyValue};
pub use engine::{Environment, RecoveryStats};
pub use error::{StoreError, StoreResult};
pub use format::Operation;
pub use index::{Extractor, Index, IndexDefinition};
pub use lock::LockMode;
pub use snapshot::SnapshotResult;
pub use store::{comparator_name, KeyComparator, Store, StoreOptions, StoreStats, BYTEWISE};
pub use txn::TxnHandle;
pub use wal::{WalReader, WalWriter};
