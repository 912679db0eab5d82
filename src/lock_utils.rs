//! Poison-tolerant locking helpers
//!
//! Every lock in the signer (scheduler queue, FifoQ, batch counters, zone
//! state, zonelist) is taken through these helpers. A thread that panics
//! while holding one of them poisons the lock; the rest of the engine keeps
//! running on the recovered guard instead of cascading the panic into every
//! worker and drudger.
//!
//! Condition variable waits are wrapped too, because `Condvar::wait` hands
//! back a poison error in exactly the same way as `Mutex::lock`.

use std::sync::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tracing::error;

/// Acquire a Mutex lock, recovering from poisoning if necessary.
///
/// # Arguments
/// * `mutex` - The Mutex to lock
/// * `context` - What the lock protects (for logging)
pub fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!("Mutex poisoned for '{}' - recovering guard", context);
            poisoned.into_inner()
        }
    }
}

/// Block on `condvar` until notified, recovering the guard if the lock was
/// poisoned while we slept.
pub fn wait_or_recover<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    context: &str,
) -> MutexGuard<'a, T> {
    match condvar.wait(guard) {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!("Mutex poisoned during wait on '{}' - recovering guard", context);
            poisoned.into_inner()
        }
    }
}

/// Block on `condvar` for at most `timeout`.
///
/// Returns the guard and whether the wait ended by timing out.
pub fn wait_timeout_or_recover<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
    context: &str,
) -> (MutexGuard<'a, T>, bool) {
    match condvar.wait_timeout(guard, timeout) {
        Ok((guard, result)) => (guard, result.timed_out()),
        Err(poisoned) => {
            error!(
                "Mutex poisoned during timed wait on '{}' - recovering guard",
                context
            );
            let (guard, result) = poisoned.into_inner();
            (guard, result.timed_out())
        }
    }
}

/// Acquire a RwLock read lock, recovering from poisoning if necessary.
pub fn read_lock_or_recover<'a, T>(rwlock: &'a RwLock<T>, context: &str) -> RwLockReadGuard<'a, T> {
    match rwlock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!("RwLock (read) poisoned for '{}' - recovering guard", context);
            poisoned.into_inner()
        }
    }
}

/// Acquire a RwLock write lock, recovering from poisoning if necessary.
pub fn write_lock_or_recover<'a, T>(
    rwlock: &'a RwLock<T>,
    context: &str,
) -> RwLockWriteGuard<'a, T> {
    match rwlock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!("RwLock (write) poisoned for '{}' - recovering guard", context);
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_lock_or_recover_normal_operation() {
        let mutex = Mutex::new(42);
        let guard = lock_or_recover(&mutex, "test value");
        assert_eq!(*guard, 42);
    }

    #[test]
    fn test_write_then_read() {
        let rwlock = RwLock::new(0);
        {
            let mut guard = write_lock_or_recover(&rwlock, "test counter");
            *guard = 100;
        }
        let guard = read_lock_or_recover(&rwlock, "test counter");
        assert_eq!(*guard, 100);
    }

    #[test]
    fn test_mutex_poisoning_recovery() {
        let mutex = Arc::new(Mutex::new(42));
        let mutex_clone = Arc::clone(&mutex);

        let handle = thread::spawn(move || {
            let _guard = mutex_clone.lock().unwrap();
            panic!("Intentional panic to poison the lock");
        });
        let _ = handle.join();

        let guard = lock_or_recover(&mutex, "poisoned test");
        assert_eq!(*guard, 42);
    }

    #[test]
    fn test_rwlock_poisoning_recovery() {
        let rwlock = Arc::new(RwLock::new(String::from("original")));
        let rwlock_clone = Arc::clone(&rwlock);

        let handle = thread::spawn(move || {
            let _guard = rwlock_clone.write().unwrap();
            panic!("Intentional panic to poison the lock");
        });
        let _ = handle.join();

        let guard = read_lock_or_recover(&rwlock, "poisoned rwlock");
        assert_eq!(*guard, "original");
    }

    #[test]
    fn test_wait_timeout_reports_timeout() {
        let mutex = Mutex::new(());
        let condvar = Condvar::new();
        let start = Instant::now();
        let guard = lock_or_recover(&mutex, "timeout test");
        let (_guard, timed_out) =
            wait_timeout_or_recover(&condvar, guard, Duration::from_millis(20), "timeout test");
        assert!(timed_out);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_or_recover_wakes_on_notify() {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let pair_clone = Arc::clone(&pair);

        let handle = thread::spawn(move || {
            let (lock, cvar) = &*pair_clone;
            *lock_or_recover(lock, "flag") = true;
            cvar.notify_all();
        });

        let (lock, cvar) = &*pair;
        let mut ready = lock_or_recover(lock, "flag");
        while !*ready {
            ready = wait_or_recover(cvar, ready, "flag");
        }
        assert!(*ready);
        handle.join().unwrap();
    }
}
