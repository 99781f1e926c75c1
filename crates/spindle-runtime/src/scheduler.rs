//! Main scheduler coordinating the scheduling threads

use crate::config::SchedulerConfig;
use crate::error::{panic_message, RuntimeError};
use crate::io::IoContext;
use crate::monitor::Monitor;
use crate::task::{IntoTaskResult, Task, TaskId};
use crate::thread_context::{self, ThreadContext};
use log::{debug, error};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Total tasks spawned
    pub tasks_spawned: u64,

    /// Total tasks that finished, failed or were killed
    pub tasks_completed: u64,
}

/// State shared by every thread of a scheduler.
pub(crate) struct Shared {
    config: SchedulerConfig,

    /// Descriptor registry
    io: Arc<IoContext>,

    /// Threads of the current run; index 0 runs on the caller of `run`
    threads: RwLock<Vec<Arc<ThreadContext>>>,

    /// First failure of the current run
    failure: Mutex<Option<RuntimeError>>,

    running: AtomicBool,
    tasks_spawned: AtomicU64,
    tasks_completed: AtomicU64,
}

impl Shared {
    pub(crate) fn io(&self) -> &Arc<IoContext> {
        &self.io
    }

    pub(crate) fn default_stack_size(&self) -> usize {
        self.config.stack_size
    }

    /// Record a fatal failure (first one wins) and stop every thread.
    pub(crate) fn fail(&self, failure: RuntimeError) {
        {
            let mut slot = self.failure.lock();
            if slot.is_none() {
                error!("scheduler failed: {}", failure);
                *slot = Some(failure);
            } else {
                debug!("dropping secondary failure: {}", failure);
            }
        }
        self.stop_all();
    }

    pub(crate) fn stop_all(&self) {
        for thread in self.threads.read().iter() {
            thread.stop();
        }
    }

    pub(crate) fn task_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    fn new_thread(&self, id: usize) -> Result<Arc<ThreadContext>, RuntimeError> {
        ThreadContext::new(
            id,
            self.io.clone(),
            self.config.threads == 1,
            self.config.monitor_tick,
        )
    }

    /// Queue a task on the calling task's thread, or on thread 0 when called
    /// from outside this scheduler.
    pub(crate) fn enqueue(self: &Arc<Self>, task: Box<Task>) {
        self.tasks_spawned.fetch_add(1, Ordering::Relaxed);
        let local = thread_context::current_thread().filter(|_| {
            thread_context::current_shared().is_some_and(|shared| Arc::ptr_eq(&shared, self))
        });
        match local {
            Some(thread) => thread.push(task),
            // Held across the push so `run` cannot swap thread 0 out from
            // under a late spawn.
            None => self.threads.read()[0].push(task),
        }
    }
}

/// M:N task scheduler
///
/// Tasks spawned before [`run`](Scheduler::run) wait on thread 0. `run`
/// starts the remaining threads plus a monitor, drives thread 0 on the
/// calling thread, and returns once every task has finished, the scheduler
/// is stopped, or a task fails.
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let shared = Arc::new(Shared {
            config,
            io: Arc::new(IoContext::new()),
            threads: RwLock::new(Vec::new()),
            failure: Mutex::new(None),
            running: AtomicBool::new(false),
            tasks_spawned: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
        });
        let main = shared.new_thread(0)?;
        shared.threads.write().push(main);
        Ok(Self { shared })
    }

    /// Scheduler with `threads` threads and defaults elsewhere
    pub fn with_threads(threads: usize) -> Result<Self, RuntimeError> {
        Self::new(SchedulerConfig::with_threads(threads))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Descriptor registry used by this scheduler's pollers
    pub fn io_context(&self) -> &Arc<IoContext> {
        &self.shared.io
    }

    pub fn spawn<F, R>(&self, f: F) -> TaskId
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoTaskResult,
    {
        self.spawn_with_stack_size(f, self.shared.config.stack_size)
    }

    pub fn spawn_with_stack_size<F, R>(&self, f: F, stack_size: usize) -> TaskId
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoTaskResult,
    {
        let task = Task::new(f, stack_size);
        let id = task.id();
        self.shared.enqueue(task);
        id
    }

    /// Run until all tasks are done.
    ///
    /// Returns the first failure raised by any task. The scheduler can be
    /// reused afterwards. Tasks a failed or stopped run never started are
    /// kept for the next run; tasks it suspended are discarded.
    pub fn run(&self) -> Result<(), RuntimeError> {
        if thread_context::current_thread().is_some()
            || self.shared.running.swap(true, Ordering::AcqRel)
        {
            return Err(RuntimeError::AlreadyRunning);
        }

        let shared = &self.shared;
        let nr_threads = shared.config.threads;
        let main = shared.threads.read()[0].clone();

        let mut workers = Vec::with_capacity(nr_threads.saturating_sub(1));
        for id in 1..nr_threads {
            match shared.new_thread(id) {
                Ok(thread) => workers.push(thread),
                Err(e) => {
                    shared.fail(e);
                    break;
                }
            }
        }
        shared.threads.write().extend(workers.iter().cloned());

        let mut handles = Vec::with_capacity(workers.len());
        for worker in &workers {
            if main.is_stopped() {
                break;
            }
            let thread = worker.clone();
            let thread_shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("spindle-worker-{}", worker.id()))
                .spawn(move || thread.run(&thread_shared));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => shared.fail(RuntimeError::ThreadSpawn(e)),
            }
        }

        let monitor = if nr_threads > 1 && !main.is_stopped() {
            let all = shared.threads.read().clone();
            match Monitor::new(shared.clone(), all, shared.config.monitor_tick).start() {
                Ok(handle) => Some(handle),
                Err(e) => {
                    shared.fail(RuntimeError::ThreadSpawn(e));
                    None
                }
            }
        } else {
            None
        };

        debug!("running with {} threads", nr_threads);
        if let Err(e) = main.run(shared) {
            shared.fail(e);
        }

        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => shared.fail(e),
                Err(payload) => {
                    shared.fail(RuntimeError::WorkerPanicked(panic_message(payload.as_ref())))
                }
            }
        }
        if let Some(handle) = monitor {
            if let Err(payload) = handle.join() {
                shared.fail(RuntimeError::WorkerPanicked(panic_message(payload.as_ref())));
            }
        }

        let reset = shared.new_thread(0);
        let failure = shared.failure.lock().take();
        shared.running.store(false, Ordering::Release);
        let fresh = reset?;
        let mut threads = shared.threads.write();
        let carried: Vec<Box<Task>> = threads.iter().flat_map(|t| t.take_unstarted()).collect();
        if !carried.is_empty() {
            debug!("carrying {} unstarted tasks to the next run", carried.len());
            fresh.push_tasks(carried);
        }
        *threads = vec![fresh];
        drop(threads);

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop every thread; `run` returns once running tasks yield.
    pub fn stop(&self) {
        self.shared.stop_all();
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            tasks_spawned: self.shared.tasks_spawned.load(Ordering::Relaxed),
            tasks_completed: self.shared.tasks_completed.load(Ordering::Relaxed),
        }
    }
}
