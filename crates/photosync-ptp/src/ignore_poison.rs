//! Mutex locking that survives poisoning.
//!
//! The session keeps its state, connection slot, and worker bookkeeping behind plain
//! mutexes. A panic on the worker thread must not make `close()` panic too, because the
//! caller relies on being able to close unconditionally during shutdown.

use std::sync::{Mutex, MutexGuard, TryLockError};

pub(crate) trait IgnorePoison<T> {
    /// Locks the mutex, recovering the guard if a previous holder panicked.
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T>;

    /// Like `try_lock`, but treats a poisoned mutex as acquired. `None` means another
    /// thread holds it right now.
    fn try_lock_ignore_poison(&self) -> Option<MutexGuard<'_, T>>;
}

impl<T> IgnorePoison<T> for Mutex<T> {
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_lock_ignore_poison(&self) -> Option<MutexGuard<'_, T>> {
        match self.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}
