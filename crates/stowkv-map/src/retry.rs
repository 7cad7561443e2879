//! Deadlock handling for map operations.
//!
//! Inside an ambient transaction a deadlock cannot be retried locally: the
//! caller's earlier writes in the same transaction may be what the other
//! party is waiting on. The error is surfaced as [`MapError::Deadlock`]
//! carrying the transaction. Without an ambient transaction the operation
//! ran in its own internal transaction, which the engine already aborted,
//! so it is simply run again after a backoff from `backon`.

use std::cell::Cell;
use std::time::Duration;

use backon::{BlockingRetryable, ExponentialBuilder};
use stowkv_core::{StoreResult, TxnHandle};

use crate::error::{MapError, MapResult};

/// Default attempt limit for transaction-free operations.
const DEFAULT_MAX_ATTEMPTS: u32 = 1000;

/// Delay after the first failed attempt.
const INITIAL_BACKOFF: Duration = Duration::from_millis(1);

/// Maximum delay between attempts.
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts before giving up with [`MapError::RetryExhausted`]
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Backoff schedule between attempts. `backon` counts retries, not
    /// attempts, so the first attempt is not part of it.
    pub(crate) fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::new()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(self.multiplier as f32)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }

    /// Run an engine operation, wrapping its errors with store context.
    pub(crate) fn run<T>(
        &self,
        store: &str,
        operation: &'static str,
        txn: Option<&TxnHandle>,
        mut op: impl FnMut() -> StoreResult<T>,
    ) -> MapResult<T> {
        self.run_map(txn, || op().map_err(|e| MapError::engine(store, operation, e)))
    }

    /// Run an operation already speaking `MapError`.
    pub(crate) fn run_map<T>(&self, txn: Option<&TxnHandle>, op: impl FnMut() -> MapResult<T>) -> MapResult<T> {
        let attempts = Cell::new(1u32);
        let result = op
            .retry(self.backoff())
            .sleep(std::thread::sleep)
            .when(|e: &MapError| txn.is_none() && e.is_deadlock())
            .notify(|e: &MapError, delay: Duration| {
                tracing::debug!(
                    attempt = attempts.get(),
                    backoff_us = delay.as_micros() as u64,
                    error = %e,
                    "deadlock, retrying"
                );
                attempts.set(attempts.get() + 1);
            })
            .call();

        match (result, txn) {
            (Err(e), Some(txn)) if e.is_deadlock() => Err(MapError::Deadlock { txn: txn.clone() }),
            (Err(e), None) if e.is_deadlock() => {
                tracing::warn!(attempts = attempts.get(), "giving up on deadlocked operation");
                Err(MapError::RetryExhausted { attempts: attempts.get() })
            }
            (result, _) => result,
        }
    }
}
