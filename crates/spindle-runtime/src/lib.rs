//! Spindle M:N coroutine runtime
//!
//! This crate multiplexes many stackful, cooperatively scheduled tasks over a
//! fixed pool of OS threads:
//! - Task scheduler with per-thread run queues and a load-balancing monitor
//! - Hand-written context switching (x86_64, aarch64)
//! - Task-aware synchronization (Futex, Mutex, SharedMutex, Condvar)
//! - Edge-triggered I/O readiness built on epoll
//!
//! ```ignore
//! let scheduler = spindle_runtime::Scheduler::with_threads(4)?;
//! scheduler.spawn(|| {
//!     spindle_runtime::spawn(|| println!("child")).map(|_| ())
//! });
//! scheduler.run()?;
//! ```

#![warn(rust_2018_idioms)]

mod arch;
mod balance;
pub mod config;
pub mod error;
pub mod io;
mod monitor;
mod scheduler;
pub mod sync;
mod task;
mod thread_context;

pub use config::{ConfigError, SchedulerConfig};
pub use error::RuntimeError;
pub use scheduler::{Scheduler, SchedulerStats};
pub use task::{IntoTaskResult, TaskHandle, TaskId, TaskState};

use task::Task;

/// Spawn a task on the scheduler running the calling task.
///
/// The new task is queued on the caller's thread. Fails with
/// [`RuntimeError::NotInTask`] when called from outside a scheduler.
pub fn spawn<F, R>(f: F) -> Result<TaskId, RuntimeError>
where
    F: FnOnce() -> R + Send + 'static,
    R: IntoTaskResult,
{
    let shared = thread_context::current_shared().ok_or(RuntimeError::NotInTask)?;
    let stack_size = shared.default_stack_size();
    spawn_on(&shared, f, stack_size)
}

/// Like [`spawn`], with an explicit stack size in bytes.
pub fn spawn_with_stack_size<F, R>(f: F, stack_size: usize) -> Result<TaskId, RuntimeError>
where
    F: FnOnce() -> R + Send + 'static,
    R: IntoTaskResult,
{
    let shared = thread_context::current_shared().ok_or(RuntimeError::NotInTask)?;
    spawn_on(&shared, f, stack_size)
}

fn spawn_on<F, R>(
    shared: &std::sync::Arc<scheduler::Shared>,
    f: F,
    stack_size: usize,
) -> Result<TaskId, RuntimeError>
where
    F: FnOnce() -> R + Send + 'static,
    R: IntoTaskResult,
{
    let task = Task::new(f, stack_size);
    let id = task.id();
    shared.enqueue(task);
    Ok(id)
}

/// Let other tasks on this thread run.
///
/// Outside a task this yields the OS thread instead.
pub fn yield_now() {
    if thread_context::current_task().is_some() {
        thread_context::yield_current();
    } else {
        std::thread::yield_now();
    }
}

/// Suspend the calling task until its handle is woken.
///
/// Wake-ups are not counted: a [`TaskHandle::wake`] that arrives before the
/// task parks is lost, so callers re-check their condition in a loop.
/// Outside a task this yields the OS thread and returns.
pub fn park() {
    if thread_context::current_task().is_some() {
        thread_context::sleep_current();
    } else {
        std::thread::yield_now();
    }
}

/// Handle of the calling task.
pub fn current() -> Option<TaskHandle> {
    thread_context::current_task()
}

/// Index of the scheduler thread running the caller.
pub fn current_thread_id() -> Option<usize> {
    thread_context::current_thread().map(|thread| thread.id())
}
