//! Single-writer lock of a pair (value lock / disk lock).
//!
//! Thin wrapper over ReaderWriterLock used only in exclusive mode; the waiter
//! counters are what eviction and the cleaner look at to skip busy pairs.

use std::sync::MutexGuard;

use super::ReaderWriterLock;

#[derive(Debug, Default)]
pub struct PairLock {
    rw: ReaderWriterLock,
}

impl PairLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire exclusively, waiting on the external mutex if needed.
    pub fn lock<'a, T, F>(guard: MutexGuard<'a, T>, select: F) -> MutexGuard<'a, T>
    where
        F: Fn(&mut T) -> &mut PairLock,
    {
        ReaderWriterLock::write_lock(guard, move |t: &mut T| &mut select(t).rw)
    }

    pub fn unlock(&mut self) {
        self.rw.write_unlock();
    }

    /// 1 when held.
    #[inline]
    pub fn active_writers(&self) -> u32 {
        self.rw.writers()
    }

    #[inline]
    pub fn blocked_writers(&self) -> u32 {
        self.rw.blocked_writers()
    }

    /// Holder plus waiters.
    #[inline]
    pub fn total_waiters(&self) -> u32 {
        self.rw.users()
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.rw.users() == 0
    }

    /// Wait until nobody holds or waits for this lock.
    pub fn wait_for_users<'a, T, F>(guard: MutexGuard<'a, T>, select: F) -> MutexGuard<'a, T>
    where
        F: Fn(&mut T) -> &mut PairLock,
    {
        ReaderWriterLock::wait_for_users(guard, move |t: &mut T| &mut select(t).rw)
    }
}
