// src/lock.rs

use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex guard, ignoring poisoning.
///
/// Every critical section in this crate leaves its state consistent before
/// anything that can panic, so a poisoned lock still holds valid data.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
