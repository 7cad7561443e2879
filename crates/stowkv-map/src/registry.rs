//! Open-iterator registry per store handle.
//!
//! Transaction-free iterators hold no locks between steps, but their
//! cursors would observe a store that is being rewritten underneath them.
//! Before a transaction-free write, or when a map is closed or destroyed,
//! the registry force-closes them. Iterators bound to a transaction are
//! left alone: the transaction's locks already order them against writers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use hashbrown::HashMap;
use parking_lot::Mutex;

/// Something the registry can close from the outside
pub(crate) trait ForceClose: Send + Sync {
    /// Close now. Idempotent.
    fn force_close(&self);
}

struct Registration {
    owner: u64,
    transactional: bool,
    target: Weak<dyn ForceClose>,
}

#[derive(Default)]
pub(crate) struct IteratorRegistry {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, Registration>>,
}

impl IteratorRegistry {
    /// Track an iterator opened through map `owner`.
    pub(crate) fn register(&self, owner: u64, transactional: bool, target: Weak<dyn ForceClose>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.lock().insert(id, Registration { owner, transactional, target });
        id
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.live.lock().remove(&id);
    }

    /// Force-close transaction-free iterators, all of them or only those
    /// opened through `owner`, and drop them from the registry. Returns how
    /// many were closed.
    ///
    /// The sweep holds the registry lock throughout, so nothing registers
    /// mid-sweep. Iterators never take the registry lock while holding their
    /// own.
    pub(crate) fn close_non_transactional(&self, owner: Option<u64>) -> usize {
        let mut closed = 0;
        self.live.lock().retain(|_, registration| {
            let Some(target) = registration.target.upgrade() else {
                return false;
            };
            if registration.transactional || owner.is_some_and(|owner| registration.owner != owner) {
                return true;
            }
            target.force_close();
            closed += 1;
            false
        });
        if closed > 0 {
            tracing::debug!(closed, "force-closed transaction-free iterators");
        }
        closed
    }

    pub(crate) fn len(&self) -> usize {
        self.live.lock().len()
    }
}
