//! Small helpers around `std::sync` primitives.
//!
//! Engine state lives behind short, never-awaited critical sections; a
//! poisoned lock only means a user callback panicked elsewhere, so the data
//! is still usable.

use std::sync::{Mutex, MutexGuard};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
