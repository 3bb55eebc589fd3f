use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// A mutex bundled with its condition variable.
///
/// Waiters take the lock with [`SyncObject::lock`], inspect the guarded
/// state, and park with [`SyncObject::wait`] or
/// [`SyncObject::wait_timeout`]; producers mutate the state and call
/// [`SyncObject::notify_all`].
pub struct SyncObject<T> {
    state: Mutex<T>,
    cond: Condvar,
}

impl<T> SyncObject<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(value),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock().unwrap()
    }

    /// Release the guard and park until notified.
    pub fn wait<'a>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.cond.wait(guard).unwrap()
    }

    /// Release the guard and park until notified or until `timeout`
    /// elapses. Returns the reacquired guard and whether the wait timed
    /// out.
    pub fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        let (guard, result) = self.cond.wait_timeout(guard, timeout).unwrap();
        (guard, result.timed_out())
    }

    pub fn notify_all(&self) {
        self.cond.notify_all();
    }

    pub fn notify_one(&self) {
        self.cond.notify_one();
    }
}
