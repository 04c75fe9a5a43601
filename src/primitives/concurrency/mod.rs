#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

use crate::types::{LockMode, Result, StoreError};

/// File-wide reader/writer lock whose acquisition gives up after a timeout.
///
/// Guards the index and page state of one open store together, so index and
/// data mutations are observed consistently.
pub struct FileLock<T> {
    inner: RwLock<T>,
    timeout: Duration,
}

/// Snapshot of lock state for observability.
#[derive(Default, Debug, Clone, Copy)]
pub struct LockSnapshot {
    /// Whether any guard is currently held.
    pub locked: bool,
    /// Whether the held guard is exclusive.
    pub writer: bool,
    /// Configured acquisition timeout.
    pub timeout: Duration,
}

impl<T> FileLock<T> {
    /// Wraps `value`, bounding every acquisition by `timeout`.
    pub fn new(value: T, timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(value),
            timeout,
        }
    }

    /// Shared access; fails with [`StoreError::LockTimeout`] on expiry.
    pub fn read(&self) -> Result<RwLockReadGuard<'_, T>> {
        let started = Instant::now();
        self.inner
            .try_read_for(self.timeout)
            .ok_or_else(|| timed_out(LockMode::Read, started))
    }

    /// Exclusive access; fails with [`StoreError::LockTimeout`] on expiry.
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, T>> {
        let started = Instant::now();
        self.inner
            .try_write_for(self.timeout)
            .ok_or_else(|| timed_out(LockMode::Write, started))
    }

    /// Current lock state.
    pub fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            locked: self.inner.is_locked(),
            writer: self.inner.is_locked_exclusive(),
            timeout: self.timeout,
        }
    }

    /// Consumes the lock, returning the guarded value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

fn timed_out(mode: LockMode, started: Instant) -> StoreError {
    let waited = started.elapsed();
    warn!(%mode, waited_ms = waited.as_millis() as u64, "lock.timeout");
    StoreError::LockTimeout { mode, waited }
}
