use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// Every critical section in the core finishes its table update before calling
// anything that can panic, so a poisoned guard still protects consistent data.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// First characters of a session token, safe to put in debug logs.
pub(crate) fn token_preview(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(6)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    &token[..end]
}
