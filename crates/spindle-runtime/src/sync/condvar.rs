//! Condition variable usable with any [`Lockable`].

use super::{Futex, Lockable, MutexGuard};
use std::sync::atomic::{AtomicU32, Ordering};

/// Task-aware condition variable.
///
/// A waiter snapshots the sequence counter before releasing its lock and
/// sleeps only while the counter still holds that snapshot, so a notify
/// that lands between the release and the sleep is not lost.
#[derive(Default)]
pub struct Condvar {
    seq: AtomicU32,
    futex: Futex,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
            futex: Futex::new(),
        }
    }

    /// Release the guard's mutex, sleep until notified, then reacquire it.
    ///
    /// May wake spuriously.
    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = MutexGuard::mutex(&guard);
        let seq = self.seq.load(Ordering::Acquire);
        drop(guard);
        self.futex.wait(&self.seq, seq);
        mutex.lock()
    }

    /// Wait until `condition` returns false.
    pub fn wait_while<'a, T: ?Sized, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut condition: F,
    ) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *guard) {
            guard = self.wait(guard);
        }
        guard
    }

    /// [`wait`](Condvar::wait) for an arbitrary lock.
    ///
    /// # Safety
    ///
    /// The caller must hold `lock`; it is held again when this returns.
    pub unsafe fn wait_any<L: Lockable + ?Sized>(&self, lock: &L) {
        let seq = self.seq.load(Ordering::Acquire);
        lock.unlock();
        self.futex.wait(&self.seq, seq);
        lock.lock();
    }

    pub fn notify_one(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        self.futex.wake(1);
    }

    pub fn notify_all(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        self.futex.wake(usize::MAX);
    }
}
