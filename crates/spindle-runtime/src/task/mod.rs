//! Task representation
//!
//! A task is split in two:
//! - [`Task`] owns the stack, the saved register context and the entry
//!   closure. It is always held as a `Box<Task>` by exactly one
//!   `ThreadContext` and moves between threads, never aliased.
//! - [`TaskHandle`] is the shared identity: id, scheduling state and the
//!   thread that currently owns the task. Wait queues and the I/O layer hold
//!   handles, never tasks.

mod stack;

pub(crate) use stack::Stack;

use crate::arch::{self, Context, INITIAL_FRAME_SIZE};
use crate::error::RuntimeError;
use crate::thread_context::{self, ThreadContext};
use log::{error, trace};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Allocate a fresh process-unique id
    pub(crate) fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> Self {
        TaskId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Scheduling state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Queued or currently running
    Runnable = 0,
    /// Waiting for a wake-up
    Sleeping = 1,
    /// Body finished, panicked or failed
    Terminated = 2,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Runnable,
            1 => TaskState::Sleeping,
            _ => TaskState::Terminated,
        }
    }
}

struct TaskShared {
    id: TaskId,
    state: AtomicU8,
    owner: Mutex<Weak<ThreadContext>>,
}

/// Shared handle to a task.
///
/// Handles are cheap to clone and stay valid after the task terminates.
#[derive(Clone)]
pub struct TaskHandle(Arc<TaskShared>);

impl TaskHandle {
    fn new(id: TaskId) -> Self {
        TaskHandle(Arc::new(TaskShared {
            id,
            state: AtomicU8::new(TaskState::Runnable as u8),
            owner: Mutex::new(Weak::new()),
        }))
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        TaskHandle::new(TaskId::next())
    }

    pub fn id(&self) -> TaskId {
        self.0.id
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.0.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.0.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn set_owner(&self, owner: &Arc<ThreadContext>) {
        *self.0.owner.lock() = Arc::downgrade(owner);
    }

    /// Make a sleeping task runnable again.
    ///
    /// Returns `false` if the task was not sleeping, in which case nothing
    /// happens. Safe to call from any thread, inside or outside a task.
    pub fn wake(&self) -> bool {
        if self
            .0
            .state
            .compare_exchange(
                TaskState::Sleeping as u8,
                TaskState::Runnable as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        let owner = self.0.owner.lock().upgrade();
        if let Some(owner) = owner {
            owner.wake_up(self.id());
        }
        true
    }

    /// Address handed to the trampoline as its argument
    fn as_arg(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TaskHandle {}

/// Values a task body may return.
///
/// `()` always succeeds; `Result<(), E>` fails the scheduler run with
/// [`RuntimeError::TaskFailed`] when it is `Err`.
pub trait IntoTaskResult {
    fn into_task_result(self) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>;
}

impl IntoTaskResult for () {
    fn into_task_result(self) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
        Ok(())
    }
}

impl<E> IntoTaskResult for Result<(), E>
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    fn into_task_result(self) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
        self.map_err(Into::into)
    }
}

pub(crate) type TaskEntry = Box<dyn FnOnce() -> Result<(), RuntimeError> + Send + 'static>;

/// An owned task: stack, saved context and body.
pub(crate) struct Task {
    handle: TaskHandle,
    pub(crate) context: Context,
    stack: Stack,
    entry: Option<TaskEntry>,
    failure: Option<RuntimeError>,
}

impl Task {
    /// Create a runnable task that will run `f` on a fresh stack of at least
    /// `stack_size` bytes.
    pub(crate) fn new<F, R>(f: F, stack_size: usize) -> Box<Task>
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoTaskResult,
    {
        let handle = TaskHandle::new(TaskId::next());
        let id = handle.id();
        let entry: TaskEntry = Box::new(move || {
            f().into_task_result()
                .map_err(|source| RuntimeError::TaskFailed { task: id, source })
        });

        let stack = Stack::new(stack_size);
        let context = unsafe { arch::init_context(stack.top(), trampoline, handle.as_arg()) };
        trace!("created {} with {} byte stack", id, stack.usable_size());

        Box::new(Task {
            handle,
            context,
            stack,
            entry: Some(entry),
            failure: None,
        })
    }

    pub(crate) fn id(&self) -> TaskId {
        self.handle.id()
    }

    pub(crate) fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    pub(crate) fn state(&self) -> TaskState {
        self.handle.state()
    }

    pub(crate) fn take_entry(&mut self) -> Option<TaskEntry> {
        self.entry.take()
    }

    pub(crate) fn set_failure(&mut self, failure: RuntimeError) {
        self.failure = Some(failure);
    }

    pub(crate) fn has_failure(&self) -> bool {
        self.failure.is_some()
    }

    pub(crate) fn take_failure(&mut self) -> Option<RuntimeError> {
        self.failure.take()
    }

    /// Whether the saved stack pointer has left the usable stack region.
    ///
    /// Only meaningful while the task is suspended.
    pub(crate) fn stack_overflowed(&self) -> bool {
        !self.stack.in_bounds(self.context.sp, INITIAL_FRAME_SIZE)
    }

    /// Whether `sp`, taken while the task is running, lies outside its
    /// usable stack.
    pub(crate) fn running_past_stack(&self, sp: usize) -> bool {
        !self.stack.in_bounds(sp, 0)
    }

    /// Whether the body has not been entered yet.
    pub(crate) fn is_unstarted(&self) -> bool {
        self.entry.is_some()
    }
}

/// First function executed on every task stack.
extern "C" fn trampoline(arg: usize) -> ! {
    thread_context::finish_switch();

    // The handle is kept alive by the task that is now running.
    let id = unsafe { (*(arg as *const TaskShared)).id };

    if let Some(entry) = thread_context::take_current_entry() {
        let failure = match panic::catch_unwind(AssertUnwindSafe(entry)) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(payload) => Some(RuntimeError::from_panic(id, payload)),
        };
        thread_context::terminate_current(failure);
    }

    thread_context::yield_current();
    error!("terminated {} was resumed", id);
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_are_unique() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_new_task_is_runnable_and_in_bounds() {
        let task = Task::new(|| {}, 32 * 1024);
        assert_eq!(task.state(), TaskState::Runnable);
        assert!(!task.stack_overflowed());
        assert!(!task.has_failure());
    }

    #[test]
    fn test_wake_only_affects_sleeping_tasks() {
        let handle = TaskHandle::new(TaskId::next());
        assert!(!handle.wake());
        assert_eq!(handle.state(), TaskState::Runnable);

        handle.set_state(TaskState::Sleeping);
        assert!(handle.wake());
        assert_eq!(handle.state(), TaskState::Runnable);
        assert!(!handle.wake());

        handle.set_state(TaskState::Terminated);
        assert!(!handle.wake());
        assert_eq!(handle.state(), TaskState::Terminated);
    }

    #[test]
    fn test_overflow_detected_from_saved_sp() {
        let mut task = Task::new(|| {}, 32 * 1024);
        let guard_end = task.stack.guard_end();
        task.context.sp = guard_end - 16;
        assert!(task.stack_overflowed());
        task.context.sp = guard_end + 256;
        assert!(!task.stack_overflowed());
    }

    #[test]
    fn test_running_stack_pointer_bounds() {
        let task = Task::new(|| {}, 32 * 1024);
        let guard_end = task.stack.guard_end();
        let top = task.stack.top() as usize;
        assert!(!task.running_past_stack(top - 512));
        assert!(!task.running_past_stack(guard_end));
        assert!(task.running_past_stack(guard_end - 1));
        assert!(task.running_past_stack(top + 16));
    }

    #[test]
    fn test_unstarted_until_entry_taken() {
        let mut task = Task::new(|| {}, 32 * 1024);
        assert!(task.is_unstarted());
        assert!(task.take_entry().is_some());
        assert!(!task.is_unstarted());
    }

    #[test]
    fn test_result_bodies() {
        assert!(().into_task_result().is_ok());
        let ok: Result<(), std::io::Error> = Ok(());
        assert!(ok.into_task_result().is_ok());
        let err: Result<(), String> = Err("nope".to_string());
        assert_eq!(err.into_task_result().unwrap_err().to_string(), "nope");
    }
}
