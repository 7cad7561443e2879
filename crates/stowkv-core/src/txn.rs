//! Transactions
//!
//! Writes are applied in place under exclusive record locks and remembered
//! twice: an undo entry to restore the old state on abort, and a redo record
//! for the WAL. Commit appends the redo records plus a `Commit` marker as one
//! batch; abort replays the undo entries in reverse through the normal write
//! path so secondary indices are restored too. Deletes leave tombstones that
//! commit removes before the locks are released.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::Shared;
use crate::error::{StoreError, StoreResult};
use crate::format::LogRecord;
use crate::store::StoreInner;

/// How to reverse one change
pub(crate) enum Undo {
    /// Restore `previous` under `key` (delete when `None`)
    Record { store: Arc<StoreInner>, key: Vec<u8>, previous: Option<Vec<u8>> },
    /// Forget a store created by the transaction
    Created { store: Arc<StoreInner> },
    /// Give a renamed store its old name back
    Renamed { store: Arc<StoreInner>, from: String },
    /// Put a dropped store back in the catalog
    Dropped { store: Arc<StoreInner> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Active,
    Committed,
    Aborted,
}

struct TxnState {
    status: Status,
    undo: Vec<Undo>,
    redo: Vec<LogRecord>,
}

pub(crate) struct Transaction {
    id: u64,
    shared: Arc<Shared>,
    state: Mutex<TxnState>,
}

impl Transaction {
    fn finish(&self, state: &mut TxnState, status: Status) {
        state.status = status;
        state.undo.clear();
        state.redo.clear();
        self.shared.end_transaction(self.id);
    }

    fn rollback(&self, state: &mut TxnState) {
        while let Some(undo) = state.undo.pop() {
            match undo {
                Undo::Record { store, key, previous } => {
                    if let Err(e) = store.apply(&key, previous.as_deref()) {
                        tracing::warn!(txn = self.id, store = %store.name(), error = %e, "failed to restore record during abort");
                    }
                }
                Undo::Created { store } => self.shared.catalog_forget(&store),
                Undo::Renamed { store, from } => self.shared.catalog_rename_back(&store, &from),
                Undo::Dropped { store } => self.shared.catalog_restore(&store),
            }
        }
    }

    /// Physically remove what the committed deletes left behind, while the
    /// locks are still held.
    fn purge_tombstones(&self, state: &TxnState) {
        for undo in &state.undo {
            if let Undo::Record { store, key, previous } = undo {
                store.purge(self.id, key, previous.as_deref());
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.status == Status::Active {
            tracing::warn!(txn = self.id, "transaction dropped while active, aborting");
            self.rollback(&mut state);
            self.finish(&mut state, Status::Aborted);
        }
    }
}

/// Handle to a transaction.
///
/// Clones share the transaction. A transaction whose last handle is dropped
/// while still active is aborted.
#[derive(Clone)]
pub struct TxnHandle(Arc<Transaction>);

impl TxnHandle {
    pub(crate) fn begin(id: u64, shared: Arc<Shared>) -> Self {
        TxnHandle(Arc::new(Transaction {
            id,
            shared,
            state: Mutex::new(TxnState { status: Status::Active, undo: Vec::new(), redo: Vec::new() }),
        }))
    }

    /// Transaction id, also used as its locker id
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// True until commit or abort
    pub fn is_active(&self) -> bool {
        self.0.state.lock().status == Status::Active
    }

    /// True when both handles refer to the same transaction
    pub fn same_as(&self, other: &TxnHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn ensure_active(&self) -> StoreResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(StoreError::TransactionFinished { txn_id: self.0.id })
        }
    }

    /// Remember a change made on behalf of this transaction.
    pub(crate) fn record(&self, undo: Undo, redo: Option<LogRecord>) -> StoreResult<()> {
        let mut state = self.0.state.lock();
        if state.status != Status::Active {
            return Err(StoreError::TransactionFinished { txn_id: self.0.id });
        }
        state.undo.push(undo);
        if let Some(redo) = redo {
            state.redo.push(redo);
        }
        Ok(())
    }

    /// Make the transaction's writes durable and release its locks.
    ///
    /// If the WAL write fails the transaction is rolled back and the error
    /// returned.
    pub fn commit(&self) -> StoreResult<()> {
        let txn = &self.0;
        let mut state = txn.state.lock();
        if state.status != Status::Active {
            return Err(StoreError::TransactionFinished { txn_id: txn.id });
        }

        if !state.redo.is_empty() {
            let mut batch = std::mem::take(&mut state.redo);
            batch.push(LogRecord::commit(txn.id));
            if let Err(e) = txn.shared.log_commit(&batch) {
                tracing::warn!(txn = txn.id, error = %e, "commit failed, rolling back");
                txn.rollback(&mut state);
                txn.finish(&mut state, Status::Aborted);
                return Err(e);
            }
        }

        txn.purge_tombstones(&state);
        txn.finish(&mut state, Status::Committed);
        Ok(())
    }

    /// Undo the transaction's writes and release its locks.
    pub fn abort(&self) -> StoreResult<()> {
        let txn = &self.0;
        let mut state = txn.state.lock();
        if state.status != Status::Active {
            return Err(StoreError::TransactionFinished { txn_id: txn.id });
        }
        txn.rollback(&mut state);
        txn.finish(&mut state, Status::Aborted);
        Ok(())
    }
}

impl fmt::Debug for TxnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnHandle").field("id", &self.0.id).field("active", &self.is_active()).finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::engine::Environment;
    use crate::error::StoreError;
    use crate::store::StoreOptions;
    use tempfile::TempDir;

    fn test_env() -> (Environment, TempDir) {
        let temp = TempDir::new().unwrap();
        let env = Environment::open(temp.path(), Config::testing()).unwrap();
        (env, temp)
    }

    #[test]
    fn test_abort_restores_previous_values() {
        let (env, _temp) = test_env();
        let store = env.open_store("s", StoreOptions::create()).unwrap();
        store.put(None, b"k", b"old").unwrap();

        let txn = env.begin().unwrap();
        store.put(Some(&txn), b"k", b"new").unwrap();
        store.put(Some(&txn), b"fresh", b"1").unwrap();
        assert_eq!(store.get(Some(&txn), b"k").unwrap(), Some(b"new".to_vec()));
        txn.abort().unwrap();

        assert_eq!(store.get(None, b"k").unwrap(), Some(b"old".to_vec()));
        assert_eq!(store.get(None, b"fresh").unwrap(), None);
    }

    #[test]
    fn test_finished_transaction_rejected() {
        let (env, _temp) = test_env();
        let store = env.open_store("s", StoreOptions::create()).unwrap();
        let txn = env.begin().unwrap();
        txn.commit().unwrap();

        assert!(!txn.is_active());
        assert!(matches!(txn.commit(), Err(StoreError::TransactionFinished { .. })));
        assert!(matches!(store.put(Some(&txn), b"k", b"v"), Err(StoreError::TransactionFinished { .. })));
    }

    #[test]
    fn test_dropped_handle_aborts() {
        let (env, _temp) = test_env();
        let store = env.open_store("s", StoreOptions::create()).unwrap();
        {
            let txn = env.begin().unwrap();
            store.put(Some(&txn), b"k", b"v").unwrap();
        }
        assert_eq!(env.active_transactions(), 0);
        assert_eq!(store.get(None, b"k").unwrap(), None);
    }

    #[test]
    fn test_abort_undoes_catalog_changes() {
        let (env, _temp) = test_env();
        env.open_store("keep", StoreOptions::create()).unwrap();

        let txn = env.begin().unwrap();
        env.create_store(Some(&txn), "temp", None).unwrap();
        env.rename_store(Some(&txn), "keep", "renamed").unwrap();
        env.drop_store(Some(&txn), "renamed").unwrap();
        txn.abort().unwrap();

        assert!(env.store_exists("keep"));
        assert!(!env.store_exists("renamed"));
        assert!(!env.store_exists("temp"));
    }
}
