//! Wait queue keyed by the value of an atomic word.

use super::SpinLock;
use crate::task::{TaskHandle, TaskState};
use crate::thread_context;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

/// User-space futex: tasks sleep on it while a word holds an expected value.
///
/// The comparison and the enqueue happen under one spin lock, and wakers
/// dequeue under the same lock, so a wake issued after the word changes can
/// never be missed by a waiter that saw the old value.
#[derive(Default)]
pub struct Futex {
    waiters: SpinLock<VecDeque<TaskHandle>>,
}

impl Futex {
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Sleep while `word` holds `expected`.
    ///
    /// May return spuriously; callers re-check their condition. Outside a
    /// task this yields the OS thread instead of sleeping.
    pub fn wait(&self, word: &AtomicU32, expected: u32) {
        let Some(task) = thread_context::current_task() else {
            std::thread::yield_now();
            return;
        };

        {
            let mut waiters = self.waiters.lock();
            if word.load(Ordering::Acquire) != expected {
                return;
            }
            task.set_state(TaskState::Sleeping);
            waiters.push_back(task.clone());
        }

        thread_context::yield_current();

        // Resumed by something other than `wake`: drop the stale entry.
        let id = task.id();
        self.waiters.lock().retain(|waiter| waiter.id() != id);
    }

    /// Wake up to `n` waiters in FIFO order; returns how many were dequeued.
    pub fn wake(&self, n: usize) -> usize {
        let woken: Vec<TaskHandle> = {
            let mut waiters = self.waiters.lock();
            let n = n.min(waiters.len());
            waiters.drain(..n).collect()
        };
        for task in &woken {
            task.wake();
        }
        woken.len()
    }

    /// Number of queued waiters.
    pub fn waiters(&self) -> usize {
        self.waiters.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_outside_task_returns() {
        let futex = Futex::new();
        let word = AtomicU32::new(1);
        futex.wait(&word, 1);
        futex.wait(&word, 0);
        assert_eq!(futex.waiters(), 0);
    }

    #[test]
    fn test_wake_without_waiters() {
        let futex = Futex::new();
        assert_eq!(futex.wake(1), 0);
        assert_eq!(futex.wake(usize::MAX), 0);
    }
}
