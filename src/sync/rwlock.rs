//! Reader/writer lock whose state is guarded by an *external* mutex.
//!
//! The lock itself never owns a mutex. Every call takes the `MutexGuard` of the
//! structure that contains the lock plus a selector that projects the lock out
//! of the guarded data; waiting releases that mutex and re-acquires it before
//! returning. Writers have priority: a reader blocks while any writer holds or
//! waits for the lock.
//!
//! Releases never block and are plain `&mut self` methods: the caller already
//! holds the external mutex.

use std::sync::{Arc, Condvar, MutexGuard};

use crate::util::relock;

#[derive(Debug, Default)]
pub struct ReaderWriterLock {
    readers: u32,
    want_read: u32,
    writer: bool,
    want_write: u32,
    cond: Arc<Condvar>,
}

impl ReaderWriterLock {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn readers(&self) -> u32 {
        self.readers
    }
    #[inline]
    pub fn blocked_readers(&self) -> u32 {
        self.want_read
    }
    #[inline]
    pub fn writers(&self) -> u32 {
        self.writer as u32
    }
    #[inline]
    pub fn blocked_writers(&self) -> u32 {
        self.want_write
    }

    /// Holders plus waiters of either kind.
    #[inline]
    pub fn users(&self) -> u32 {
        self.readers + self.want_read + self.writers() + self.want_write
    }

    #[inline]
    fn read_ready(&self) -> bool {
        !self.writer && self.want_write == 0
    }

    #[inline]
    fn write_ready(&self) -> bool {
        !self.writer && self.readers == 0
    }

    /// Shared acquire. Blocks while a writer holds or waits.
    pub fn read_lock<'a, T, F>(mut guard: MutexGuard<'a, T>, select: F) -> MutexGuard<'a, T>
    where
        F: Fn(&mut T) -> &mut ReaderWriterLock,
    {
        let cond = {
            let rw = select(&mut guard);
            if rw.read_ready() {
                rw.readers += 1;
                return guard;
            }
            rw.want_read += 1;
            Arc::clone(&rw.cond)
        };
        loop {
            guard = relock(cond.wait(guard));
            let rw = select(&mut guard);
            if rw.read_ready() {
                rw.want_read -= 1;
                rw.readers += 1;
                return guard;
            }
        }
    }

    /// Exclusive acquire.
    pub fn write_lock<'a, T, F>(mut guard: MutexGuard<'a, T>, select: F) -> MutexGuard<'a, T>
    where
        F: Fn(&mut T) -> &mut ReaderWriterLock,
    {
        let cond = {
            let rw = select(&mut guard);
            if rw.write_ready() {
                rw.writer = true;
                return guard;
            }
            rw.want_write += 1;
            Arc::clone(&rw.cond)
        };
        loop {
            guard = relock(cond.wait(guard));
            let rw = select(&mut guard);
            if rw.write_ready() {
                rw.want_write -= 1;
                rw.writer = true;
                return guard;
            }
        }
    }

    pub fn read_unlock(&mut self) {
        assert!(self.readers > 0, "read_unlock without a reader");
        self.readers -= 1;
        self.cond.notify_all();
    }

    pub fn write_unlock(&mut self) {
        assert!(self.writer, "write_unlock without a writer");
        self.writer = false;
        self.cond.notify_all();
    }

    /// Block until nobody holds or waits for the lock. One-shot: a new user
    /// may arrive right after this returns.
    pub fn wait_for_users<'a, T, F>(mut guard: MutexGuard<'a, T>, select: F) -> MutexGuard<'a, T>
    where
        F: Fn(&mut T) -> &mut ReaderWriterLock,
    {
        let cond = {
            let rw = select(&mut guard);
            if rw.users() == 0 {
                return guard;
            }
            Arc::clone(&rw.cond)
        };
        loop {
            guard = relock(cond.wait(guard));
            if select(&mut guard).users() == 0 {
                return guard;
            }
        }
    }
}
