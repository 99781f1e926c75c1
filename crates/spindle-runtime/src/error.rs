//! Runtime error types.

use crate::config::ConfigError;
use crate::task::TaskId;

/// Errors surfaced by [`Scheduler::run`](crate::Scheduler::run) and the
/// task-side helpers.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// A task body panicked
    #[error("task {task} panicked: {message}")]
    TaskPanicked { task: TaskId, message: String },

    /// A task body returned an error
    #[error("task {task} failed: {source}")]
    TaskFailed {
        task: TaskId,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// A task was suspended with its stack pointer outside its stack
    #[error("stack overflow detected in task {0}")]
    StackOverflow(TaskId),

    /// An OS worker or monitor thread could not be started
    #[error("failed to spawn scheduler thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// The readiness multiplexer could not be created or updated
    #[error("I/O poller error: {0}")]
    Poller(#[source] std::io::Error),

    /// An OS worker thread panicked outside of any task
    #[error("scheduler thread panicked: {0}")]
    WorkerPanicked(String),

    /// Invalid scheduler configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A task-only operation was invoked from a plain thread
    #[error("operation requires a running task")]
    NotInTask,

    /// `run` was called while a scheduler is already running on this thread
    #[error("a scheduler is already running on this thread")]
    AlreadyRunning,
}

impl RuntimeError {
    /// Build a [`RuntimeError::TaskPanicked`] from a `catch_unwind` payload.
    pub(crate) fn from_panic(task: TaskId, payload: Box<dyn std::any::Any + Send>) -> Self {
        RuntimeError::TaskPanicked {
            task,
            message: panic_message(payload.as_ref()),
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
