#[cfg(feature = "loom")]
pub(crate) use loom::sync;

#[cfg(not(feature = "loom"))]
pub(crate) use std::sync;

/// Acquires a [`sync::Mutex`], recovering the guard if a previous holder panicked.
///
/// Every critical section guarded this way leaves its state consistent before it can panic, so a
/// poisoned lock carries no more information than a clean one.
pub(crate) fn lock<T>(mutex: &sync::Mutex<T>) -> sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
