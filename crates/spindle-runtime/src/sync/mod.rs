//! Task-aware synchronization primitives
//!
//! Everything here is built on [`Futex`]: a wait queue keyed by the value of
//! an atomic word. Blocking suspends the calling task, not its OS thread, so
//! the thread keeps running other tasks. Called from a plain OS thread the
//! primitives still work, but waiting degrades to yielding the thread.

mod condvar;
mod futex;
mod mutex;
mod shared_mutex;
mod spinlock;

pub use condvar::Condvar;
pub use futex::Futex;
pub use mutex::{Mutex, MutexGuard, RawMutex};
pub use shared_mutex::{RawSharedMutex, SharedMutex, SharedMutexGuard, SharedMutexReadGuard};
pub use spinlock::{SpinLock, SpinLockGuard};

/// A lock a [`Condvar`] can release and reacquire around a wait.
pub trait Lockable {
    /// Acquire the lock, suspending the calling task while it is held.
    fn lock(&self);

    /// Release the lock.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock.
    unsafe fn unlock(&self);
}
