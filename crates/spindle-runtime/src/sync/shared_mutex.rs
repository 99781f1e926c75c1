//! Task-aware reader-writer lock
//!
//! The whole lock state lives in one word:
//!
//! ```text
//!  31       30 ..................... 2      1                 0
//! [writer] [reader count (29 bits)     ] [pending readers] [pending writers]
//! ```
//!
//! Tasks that cannot take the lock register themselves in the pending
//! counters under an internal mutex, snapshot a serial and sleep on it.
//! Every hand-off bumps the serial under the same mutex, so a registration
//! that races an unlock either sees the new state or the new serial.
//! Writers are preferred: readers do not enter while a writer is pending,
//! and a release wakes one pending writer before any pending reader.

use super::{Futex, Lockable, RawMutex};
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

const PENDING_WRITERS: u32 = 1 << 0;
const PENDING_READERS: u32 = 1 << 1;
const READER: u32 = 1 << 2;
const WRITER: u32 = 1 << 31;
const READER_MASK: u32 = !(WRITER | PENDING_READERS | PENDING_WRITERS);

fn readers(state: u32) -> u32 {
    (state & READER_MASK) >> 2
}

fn can_lock_shared(state: u32) -> bool {
    state & (WRITER | PENDING_WRITERS) == 0 && state & READER_MASK != READER_MASK
}

fn can_lock(state: u32) -> bool {
    state & (WRITER | READER_MASK) == 0
}

/// Reader-writer lock without data.
#[derive(Default)]
pub struct RawSharedMutex {
    state: AtomicU32,

    /// Guards the pending counters and serial bumps
    guard: RawMutex,
    pending_readers: AtomicU32,
    pending_writers: AtomicU32,

    reader_serial: AtomicU32,
    writer_serial: AtomicU32,
    reader_futex: Futex,
    writer_futex: Futex,
}

impl RawSharedMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            guard: RawMutex::new(),
            pending_readers: AtomicU32::new(0),
            pending_writers: AtomicU32::new(0),
            reader_serial: AtomicU32::new(0),
            writer_serial: AtomicU32::new(0),
            reader_futex: Futex::new(),
            writer_futex: Futex::new(),
        }
    }

    pub fn try_lock_shared(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        while can_lock_shared(state) {
            match self.state.compare_exchange_weak(
                state,
                state + READER,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => state = current,
            }
        }
        false
    }

    pub fn try_lock(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        while can_lock(state) {
            match self.state.compare_exchange_weak(
                state,
                state | WRITER,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => state = current,
            }
        }
        false
    }

    pub fn lock_shared(&self) {
        while !self.try_lock_shared() {
            self.guard.lock();
            self.pending_readers.fetch_add(1, Ordering::Relaxed);
            self.state.fetch_or(PENDING_READERS, Ordering::Relaxed);
            let serial = self.reader_serial.load(Ordering::Relaxed);
            unsafe { self.guard.unlock() };

            if !can_lock_shared(self.state.load(Ordering::Acquire)) {
                self.reader_futex.wait(&self.reader_serial, serial);
            }

            self.guard.lock();
            if self.pending_readers.fetch_sub(1, Ordering::Relaxed) == 1 {
                self.state.fetch_and(!PENDING_READERS, Ordering::Relaxed);
            }
            unsafe { self.guard.unlock() };
        }
    }

    pub fn lock(&self) {
        while !self.try_lock() {
            self.guard.lock();
            self.pending_writers.fetch_add(1, Ordering::Relaxed);
            self.state.fetch_or(PENDING_WRITERS, Ordering::Relaxed);
            let serial = self.writer_serial.load(Ordering::Relaxed);
            unsafe { self.guard.unlock() };

            if !can_lock(self.state.load(Ordering::Acquire)) {
                self.writer_futex.wait(&self.writer_serial, serial);
            }

            self.guard.lock();
            if self.pending_writers.fetch_sub(1, Ordering::Relaxed) == 1 {
                self.state.fetch_and(!PENDING_WRITERS, Ordering::Relaxed);
            }
            unsafe { self.guard.unlock() };
        }
    }

    /// Release a shared lock.
    ///
    /// # Safety
    ///
    /// The caller must hold a shared lock.
    pub unsafe fn unlock_shared(&self) {
        let state = self.state.fetch_sub(READER, Ordering::Release) - READER;
        if readers(state) == 0 {
            self.hand_off(state);
        }
    }

    /// Release the exclusive lock.
    ///
    /// # Safety
    ///
    /// The caller must hold the exclusive lock.
    pub unsafe fn unlock(&self) {
        let state = self.state.fetch_and(!WRITER, Ordering::Release) & !WRITER;
        self.hand_off(state);
    }

    fn hand_off(&self, state: u32) {
        if state & PENDING_WRITERS != 0 {
            self.guard.lock();
            self.writer_serial.fetch_add(1, Ordering::Release);
            unsafe { self.guard.unlock() };
            self.writer_futex.wake(1);
        } else if state & PENDING_READERS != 0 {
            self.guard.lock();
            self.reader_serial.fetch_add(1, Ordering::Release);
            unsafe { self.guard.unlock() };
            self.reader_futex.wake(usize::MAX);
        }
    }

    /// Number of shared holders.
    pub fn reader_count(&self) -> u32 {
        readers(self.state.load(Ordering::Relaxed))
    }

    pub fn is_locked_exclusive(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }
}

/// Exclusive mode.
impl Lockable for RawSharedMutex {
    fn lock(&self) {
        RawSharedMutex::lock(self)
    }

    unsafe fn unlock(&self) {
        RawSharedMutex::unlock(self)
    }
}

/// Task-aware reader-writer lock protecting a value
pub struct SharedMutex<T: ?Sized> {
    raw: RawSharedMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SharedMutex<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for SharedMutex<T> {}

impl<T> SharedMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawSharedMutex::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SharedMutex<T> {
    pub fn lock(&self) -> SharedMutexGuard<'_, T> {
        self.raw.lock();
        SharedMutexGuard { mutex: self }
    }

    pub fn lock_shared(&self) -> SharedMutexReadGuard<'_, T> {
        self.raw.lock_shared();
        SharedMutexReadGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<SharedMutexGuard<'_, T>> {
        self.raw
            .try_lock()
            .then(|| SharedMutexGuard { mutex: self })
    }

    pub fn try_lock_shared(&self) -> Option<SharedMutexReadGuard<'_, T>> {
        self.raw
            .try_lock_shared()
            .then(|| SharedMutexReadGuard { mutex: self })
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn raw(&self) -> &RawSharedMutex {
        &self.raw
    }
}

impl<T: Default> Default for SharedMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SharedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock_shared() {
            Some(guard) => f.debug_struct("SharedMutex").field("data", &&*guard).finish(),
            None => f.debug_struct("SharedMutex").field("data", &"<locked>").finish(),
        }
    }
}

/// Exclusive guard
pub struct SharedMutexGuard<'a, T: ?Sized> {
    mutex: &'a SharedMutex<T>,
}

impl<T: ?Sized> Deref for SharedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SharedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for SharedMutexGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.mutex.raw.unlock() }
    }
}

/// Shared guard
pub struct SharedMutexReadGuard<'a, T: ?Sized> {
    mutex: &'a SharedMutex<T>,
}

impl<T: ?Sized> Deref for SharedMutexReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for SharedMutexReadGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.mutex.raw.unlock_shared() }
    }
}
