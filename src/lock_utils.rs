//! Poison-aware helpers for the std locks guarding in-process caches.
//!
//! The rule table and the validation cache can always be recovered after a
//! panicking validator: the worst case is a stale cache entry. The SQLite
//! connection cannot, so store adapters use [`lock_or_fail`] and report the
//! store as unavailable instead.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::error;

use crate::error::GuardError;

/// Lock a mutex, taking the inner guard back if a previous holder panicked.
pub fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        error!("Mutex poisoned for '{}' - continuing with recovered state", context);
        poisoned.into_inner()
    })
}

/// Lock a mutex, mapping poisoning to [`GuardError::StoreUnavailable`].
pub fn lock_or_fail<'a, T>(mutex: &'a Mutex<T>, context: &str) -> Result<MutexGuard<'a, T>, GuardError> {
    mutex.lock().map_err(|_| {
        error!("Mutex poisoned for '{}' - refusing to use it", context);
        GuardError::StoreUnavailable(format!("{} lock poisoned", context))
    })
}

pub fn read_lock_or_recover<'a, T>(rwlock: &'a RwLock<T>, context: &str) -> RwLockReadGuard<'a, T> {
    rwlock.read().unwrap_or_else(|poisoned| {
        error!("RwLock (read) poisoned for '{}' - continuing with recovered state", context);
        poisoned.into_inner()
    })
}

pub fn write_lock_or_recover<'a, T>(rwlock: &'a RwLock<T>, context: &str) -> RwLockWriteGuard<'a, T> {
    rwlock.write().unwrap_or_else(|poisoned| {
        error!("RwLock (write) poisoned for '{}' - continuing with recovered state", context);
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_recover_after_panic() {
        let mutex = Arc::new(Mutex::new(vec![1, 2, 3]));
        let cloned = mutex.clone();

        let _ = thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("validator blew up");
        })
        .join();

        assert!(mutex.is_poisoned());
        let guard = lock_or_recover(&mutex, "test cache");
        assert_eq!(*guard, vec![1, 2, 3]);
    }

    #[test]
    fn test_fail_on_poison() {
        let mutex = Arc::new(Mutex::new(0u32));
        let cloned = mutex.clone();

        let _ = thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("writer blew up");
        })
        .join();

        let result = lock_or_fail(&mutex, "sqlite connection");
        assert!(matches!(result, Err(GuardError::StoreUnavailable(_))));
    }

    #[test]
    fn test_rwlock_recover() {
        let lock = Arc::new(RwLock::new(String::from("rules")));
        let cloned = lock.clone();

        let _ = thread::spawn(move || {
            let _guard = cloned.write().unwrap();
            panic!("registration blew up");
        })
        .join();

        assert_eq!(*read_lock_or_recover(&lock, "rules"), "rules");
        write_lock_or_recover(&lock, "rules").push_str("!");
        assert_eq!(*read_lock_or_recover(&lock, "rules"), "rules!");
    }
}
