//! Record lock manager with wait-for-graph deadlock detection
//!
//! Locks are keyed by (store id, key bytes) and held by lockers: either a
//! transaction id or a short-lived id used for a single non-transactional
//! read. A request that would close a cycle in the wait-for graph fails
//! immediately with [`StoreError::Deadlock`]; the requester is the victim.

use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex};

use crate::error::{StoreError, StoreResult};

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Any number of readers
    Shared,
    /// A single writer
    Exclusive,
}

/// (store id, key bytes)
pub(crate) type LockKey = (u64, Vec<u8>);

#[derive(Default)]
struct LockEntry {
    shared: HashSet<u64>,
    exclusive: Option<u64>,
}

impl LockEntry {
    /// Lockers other than `locker` that prevent granting `mode` to it.
    fn blockers(&self, locker: u64, mode: LockMode) -> Vec<u64> {
        let mut blockers: Vec<u64> = self.exclusive.into_iter().filter(|&h| h != locker).collect();
        if mode == LockMode::Exclusive {
            blockers.extend(self.shared.iter().copied().filter(|&h| h != locker));
        }
        blockers
    }

    fn is_free(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none()
    }
}

#[derive(Default)]
struct LockTable {
    locks: HashMap<LockKey, LockEntry>,
    /// What each blocked locker is waiting for
    waiting: HashMap<u64, (LockKey, LockMode)>,
    /// Keys each locker holds, for release
    held: HashMap<u64, HashSet<LockKey>>,
}

impl LockTable {
    /// Would `locker` waiting on `key` in `mode` close a cycle?
    fn closes_cycle(&self, locker: u64, key: &LockKey, mode: LockMode) -> bool {
        let mut stack = match self.locks.get(key) {
            Some(entry) => entry.blockers(locker, mode),
            None => return false,
        };
        let mut seen = HashSet::new();
        while let Some(holder) = stack.pop() {
            if holder == locker {
                return true;
            }
            if !seen.insert(holder) {
                continue;
            }
            if let Some((waited_key, waited_mode)) = self.waiting.get(&holder) {
                if let Some(entry) = self.locks.get(waited_key) {
                    stack.extend(entry.blockers(holder, *waited_mode));
                }
            }
        }
        false
    }

    fn grant(&mut self, locker: u64, key: &LockKey, mode: LockMode) {
        let entry = self.locks.entry(key.clone()).or_default();
        match mode {
            LockMode::Shared => {
                if entry.exclusive != Some(locker) {
                    entry.shared.insert(locker);
                }
            }
            LockMode::Exclusive => {
                entry.shared.remove(&locker);
                entry.exclusive = Some(locker);
            }
        }
        self.held.entry(locker).or_default().insert(key.clone());
    }
}

/// Shared/exclusive record locks for every store of an environment.
pub(crate) struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    timeout: Duration,
}

impl LockManager {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self { table: Mutex::new(LockTable::default()), released: Condvar::new(), timeout }
    }

    /// Acquire `mode` on `key` for `locker`, blocking while it conflicts.
    ///
    /// Re-acquiring a held lock is a no-op; a sole shared holder upgrades
    /// in place. `store` only decorates the timeout error.
    pub(crate) fn acquire(&self, locker: u64, key: &LockKey, mode: LockMode, store: &str) -> StoreResult<()> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut table = self.table.lock();

        loop {
            let blocked = table.locks.get(key).map_or(false, |entry| !entry.blockers(locker, mode).is_empty());
            if !blocked {
                table.waiting.remove(&locker);
                table.grant(locker, key, mode);
                return Ok(());
            }

            if table.closes_cycle(locker, key, mode) {
                table.waiting.remove(&locker);
                tracing::debug!(locker, store, "deadlock detected, requester chosen as victim");
                return Err(StoreError::Deadlock { txn_id: locker });
            }

            table.waiting.insert(locker, (key.clone(), mode));
            if self.released.wait_until(&mut table, deadline).timed_out() {
                table.waiting.remove(&locker);
                return Err(StoreError::LockTimeout {
                    txn_id: locker,
                    store: store.to_string(),
                    waited: started.elapsed(),
                });
            }
        }
    }

    /// Release a single lock held by `locker`.
    pub(crate) fn release(&self, locker: u64, key: &LockKey) {
        let mut table = self.table.lock();
        Self::release_locked(&mut table, locker, key);
        if let Some(keys) = table.held.get_mut(&locker) {
            keys.remove(key);
            if keys.is_empty() {
                table.held.remove(&locker);
            }
        }
        drop(table);
        self.released.notify_all();
    }

    /// Release every lock held by `locker`.
    pub(crate) fn release_all(&self, locker: u64) {
        let mut table = self.table.lock();
        if let Some(keys) = table.held.remove(&locker) {
            for key in keys {
                Self::release_locked(&mut table, locker, &key);
            }
        }
        table.waiting.remove(&locker);
        drop(table);
        self.released.notify_all();
    }

    fn release_locked(table: &mut LockTable, locker: u64, key: &LockKey) {
        if let Some(entry) = table.locks.get_mut(key) {
            entry.shared.remove(&locker);
            if entry.exclusive == Some(locker) {
                entry.exclusive = None;
            }
            if entry.is_free() {
                table.locks.remove(key);
            }
        }
    }

    /// Number of keys with at least one holder
    #[cfg(test)]
    pub(crate) fn locked_keys(&self) -> usize {
        self.table.lock().locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn key(k: &str) -> LockKey {
        (1, k.as_bytes().to_vec())
    }

    #[test]
    fn test_shared_locks_are_compatible() {
        let locks = LockManager::new(Duration::from_millis(100));
        locks.acquire(1, &key("a"), LockMode::Shared, "s").unwrap();
        locks.acquire(2, &key("a"), LockMode::Shared, "s").unwrap();
        locks.release_all(1);
        locks.release_all(2);
        assert_eq!(locks.locked_keys(), 0);
    }

    #[test]
    fn test_exclusive_conflict_times_out() {
        let locks = LockManager::new(Duration::from_millis(50));
        locks.acquire(1, &key("a"), LockMode::Exclusive, "s").unwrap();
        let err = locks.acquire(2, &key("a"), LockMode::Shared, "s").unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { txn_id: 2, .. }));
    }

    #[test]
    fn test_sole_holder_upgrades() {
        let locks = LockManager::new(Duration::from_millis(50));
        locks.acquire(1, &key("a"), LockMode::Shared, "s").unwrap();
        locks.acquire(1, &key("a"), LockMode::Exclusive, "s").unwrap();
        locks.acquire(1, &key("a"), LockMode::Shared, "s").unwrap();
        assert!(locks.acquire(2, &key("a"), LockMode::Shared, "s").is_err());
    }

    #[test]
    fn test_release_wakes_waiter() {
        let locks = Arc::new(LockManager::new(Duration::from_secs(5)));
        locks.acquire(1, &key("a"), LockMode::Exclusive, "s").unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || locks.acquire(2, &key("a"), LockMode::Exclusive, "s"))
        };
        thread::sleep(Duration::from_millis(20));
        locks.release_all(1);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_two_party_deadlock_picks_requester() {
        let locks = Arc::new(LockManager::new(Duration::from_secs(5)));
        let barrier = Arc::new(Barrier::new(2));

        locks.acquire(1, &key("a"), LockMode::Exclusive, "s").unwrap();
        locks.acquire(2, &key("b"), LockMode::Exclusive, "s").unwrap();

        let first = {
            let locks = Arc::clone(&locks);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let result = locks.acquire(1, &key("b"), LockMode::Exclusive, "s");
                if result.is_err() {
                    locks.release_all(1);
                }
                result
            })
        };
        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        let second = locks.acquire(2, &key("a"), LockMode::Exclusive, "s");
        if second.is_err() {
            locks.release_all(2);
        }
        let first = first.join().unwrap();

        // Exactly one side is the victim; the other proceeds once it releases
        let victims = [&first, &second].iter().filter(|r| matches!(r, Err(StoreError::Deadlock { .. }))).count();
        assert_eq!(victims, 1);
        assert!(first.is_ok() || second.is_ok());
    }
}
