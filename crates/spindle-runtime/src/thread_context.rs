//! Per-thread scheduling loop and context switching.
//!
//! Each OS thread owned by a [`Scheduler`](crate::Scheduler) runs one
//! [`ThreadContext`]. The context is split between shared state (run queue,
//! waiting set, park flag, poller) reachable from other threads through an
//! `Arc`, and thread-local state (current task, hand-off slot, zombies, idle
//! frame) that only the owning thread touches.
//!
//! A task that yields is never put back into a shared queue while it is still
//! running on its own stack. It is parked in the thread-local hand-off slot,
//! and the context that resumes after the switch files it into the run
//! queue, waiting set or zombie queue. This keeps other threads from stealing
//! a task whose registers have not been saved yet.

use crate::arch::{self, Context};
use crate::error::RuntimeError;
use crate::io::{IoContext, IoPoller};
use crate::scheduler::Shared;
use crate::task::{Task, TaskEntry, TaskHandle, TaskId, TaskState};
use log::{debug, error, trace, warn};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Snapshot of a thread's queues, taken by the monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ThreadLoad {
    pub run_queue: usize,
    pub waiting: usize,
    pub parked: bool,
    pub io_interest: bool,
}

#[derive(Default)]
struct Queues {
    run_queue: VecDeque<Box<Task>>,
    waiting: FxHashMap<TaskId, Box<Task>>,
}

/// Shared half of a scheduling thread.
pub(crate) struct ThreadContext {
    id: usize,

    /// Run queue and waiting set, guarded together
    queues: Mutex<Queues>,

    /// Signalled when work arrives for a parked thread
    wakeup: Condvar,

    parked: AtomicBool,
    stopped: AtomicBool,

    /// Stop by itself once drained (single-thread schedulers have no monitor)
    solo: bool,

    /// Park timeout while descriptors are subscribed
    park_timeout: Duration,

    poller: IoPoller,
}

impl ThreadContext {
    pub(crate) fn new(
        id: usize,
        io: Arc<IoContext>,
        solo: bool,
        park_timeout: Duration,
    ) -> Result<Arc<Self>, RuntimeError> {
        let poller = IoPoller::new(io).map_err(RuntimeError::Poller)?;
        Ok(Arc::new(Self {
            id,
            queues: Mutex::new(Queues::default()),
            wakeup: Condvar::new(),
            parked: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            solo,
            park_timeout,
            poller,
        }))
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn poller(&self) -> &IoPoller {
        &self.poller
    }

    /// Run the scheduling loop on the calling OS thread until stopped (or,
    /// in solo mode, until no task is left).
    pub(crate) fn run(self: &Arc<Self>, shared: &Arc<Shared>) -> Result<(), RuntimeError> {
        let installed = LOCAL.with(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.is_some() {
                return false;
            }
            *slot = Some(Local {
                shared: shared.clone(),
                thread: self.clone(),
                current: None,
                switched_from: None,
                zombies: VecDeque::new(),
                idle: Box::default(),
            });
            true
        });
        if !installed {
            return Err(RuntimeError::AlreadyRunning);
        }

        debug!("thread {} entering scheduling loop", self.id);
        loop {
            finish_switch();
            if self.is_stopped() {
                break;
            }

            let target = with_local(|local| {
                let next = local.thread.pop_runnable()?;
                let to: *const Context = &next.context;
                local.current = Some(next);
                let from: *mut Context = &mut *local.idle;
                Some((from, to))
            })
            .flatten();

            if let Some((from, to)) = target {
                unsafe { arch::switch(from, to) };
                continue;
            }

            self.poll_io();
            with_local(Local::gc);

            if self.has_runnable() {
                continue;
            }
            if self.solo && self.is_drained() {
                debug!("thread {} drained", self.id);
                self.stop();
                break;
            }
            self.park();
        }

        let local = LOCAL.with(|cell| cell.borrow_mut().take());
        drop(local);
        debug!("thread {} left scheduling loop", self.id);
        Ok(())
    }

    /// Mark the thread stopped and wake it if parked.
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _queues = self.queues.lock();
        self.wakeup.notify_all();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Wake the thread if it is parked.
    pub(crate) fn notify(&self) {
        let _queues = self.queues.lock();
        if self.parked.load(Ordering::SeqCst) {
            self.wakeup.notify_one();
        }
    }

    /// Enqueue a runnable task owned by this thread from now on.
    pub(crate) fn push(self: &Arc<Self>, task: Box<Task>) {
        task.handle().set_owner(self);
        let mut queues = self.queues.lock();
        queues.run_queue.push_back(task);
        if self.parked.load(Ordering::SeqCst) {
            self.wakeup.notify_one();
        }
    }

    /// Enqueue tasks taken from another thread.
    pub(crate) fn push_tasks(self: &Arc<Self>, tasks: Vec<Box<Task>>) {
        for task in &tasks {
            task.handle().set_owner(self);
        }
        let mut queues = self.queues.lock();
        queues.run_queue.extend(tasks);
        if self.parked.load(Ordering::SeqCst) {
            self.wakeup.notify_one();
        }
    }

    /// Remove up to `n` tasks from the back of the run queue.
    pub(crate) fn steal_tasks(&self, n: usize) -> Vec<Box<Task>> {
        let mut queues = self.queues.lock();
        let len = queues.run_queue.len();
        let start = len - n.min(len);
        queues.run_queue.drain(start..).collect()
    }

    /// Remove queued tasks that never started running, keeping the rest.
    pub(crate) fn take_unstarted(&self) -> Vec<Box<Task>> {
        let mut queues = self.queues.lock();
        let (fresh, started): (VecDeque<_>, VecDeque<_>) = queues
            .run_queue
            .drain(..)
            .partition(|task| task.is_unstarted());
        queues.run_queue = started;
        fresh.into()
    }

    /// Move a task that has just been flipped to runnable from the waiting
    /// set to the run queue. A task that has not been filed yet is left to
    /// [`finish_switch`], which sees its new state.
    pub(crate) fn wake_up(&self, id: TaskId) {
        let mut queues = self.queues.lock();
        if let Some(task) = queues.waiting.remove(&id) {
            queues.run_queue.push_back(task);
            if self.parked.load(Ordering::SeqCst) {
                self.wakeup.notify_one();
            }
        }
    }

    pub(crate) fn load(&self) -> ThreadLoad {
        let queues = self.queues.lock();
        ThreadLoad {
            run_queue: queues.run_queue.len(),
            waiting: queues.waiting.len(),
            parked: self.parked.load(Ordering::SeqCst),
            io_interest: self.poller.has_interest(),
        }
    }

    /// Resolve ready descriptors on this thread's poller.
    pub(crate) fn poll_io(&self) {
        if !self.poller.has_interest() {
            return;
        }
        if let Err(e) = self.poller.poll() {
            warn!("thread {}: I/O poll failed: {}", self.id, e);
        }
    }

    fn pop_runnable(&self) -> Option<Box<Task>> {
        self.queues.lock().run_queue.pop_front()
    }

    fn has_runnable(&self) -> bool {
        !self.queues.lock().run_queue.is_empty()
    }

    fn is_drained(&self) -> bool {
        let queues = self.queues.lock();
        queues.run_queue.is_empty() && queues.waiting.is_empty()
    }

    /// Put a suspended task back where its state says it belongs.
    fn file(&self, task: Box<Task>) {
        let mut queues = self.queues.lock();
        // Re-read under the lock so a concurrent wake cannot be missed.
        if task.state() == TaskState::Sleeping {
            queues.waiting.insert(task.id(), task);
        } else {
            queues.run_queue.push_back(task);
        }
    }

    fn park(&self) {
        let mut queues = self.queues.lock();
        if !queues.run_queue.is_empty() || self.is_stopped() {
            return;
        }
        self.parked.store(true, Ordering::SeqCst);
        if self.poller.has_interest() {
            self.wakeup.wait_for(&mut queues, self.park_timeout);
        } else {
            self.wakeup.wait(&mut queues);
        }
        self.parked.store(false, Ordering::SeqCst);
    }
}

/// Thread-local half of a scheduling thread.
struct Local {
    shared: Arc<Shared>,
    thread: Arc<ThreadContext>,
    current: Option<Box<Task>>,
    /// Task switched away from, waiting to be filed by the resumed side
    switched_from: Option<Box<Task>>,
    zombies: VecDeque<Box<Task>>,
    idle: Box<Context>,
}

enum Step {
    Resume,
    Poll(Arc<ThreadContext>),
    Switch(*mut Context, *const Context),
}

impl Local {
    fn next_step(&mut self, polled: bool, sp: usize) -> Step {
        let (state, failed) = match self.current.as_mut() {
            Some(task)
                if task.state() != TaskState::Terminated && task.running_past_stack(sp) =>
            {
                // Reported by the idle side; this stack has no room to spare.
                let id = task.id();
                task.set_failure(RuntimeError::StackOverflow(id));
                task.handle().set_state(TaskState::Terminated);
                return self.switch_to_idle();
            }
            Some(task) => (task.state(), task.has_failure()),
            None => return Step::Resume,
        };

        if failed || self.thread.is_stopped() {
            return self.switch_to_idle();
        }
        if let Some(next) = self.thread.pop_runnable() {
            return self.switch_to(next);
        }
        if !polled && self.thread.poller.has_interest() {
            return Step::Poll(self.thread.clone());
        }
        if state == TaskState::Runnable {
            Step::Resume
        } else {
            self.switch_to_idle()
        }
    }

    fn switch_to(&mut self, next: Box<Task>) -> Step {
        let to: *const Context = &next.context;
        let step = self.stash_current(to);
        self.current = Some(next);
        step
    }

    fn switch_to_idle(&mut self) -> Step {
        let to: *const Context = &*self.idle;
        self.stash_current(to)
    }

    fn stash_current(&mut self, to: *const Context) -> Step {
        match self.current.take() {
            Some(mut prev) => {
                let from: *mut Context = &mut prev.context;
                self.switched_from = Some(prev);
                Step::Switch(from, to)
            }
            None => Step::Resume,
        }
    }

    fn file_switched_from(&mut self) -> Option<(Arc<Shared>, RuntimeError)> {
        let mut prev = self.switched_from.take()?;
        match prev.state() {
            TaskState::Terminated => {
                trace!("{} finished on thread {}", prev.id(), self.thread.id);
                self.shared.task_completed();
                let failure = prev.take_failure();
                self.zombies.push_back(prev);
                failure.map(|e| (self.shared.clone(), e))
            }
            _ if prev.stack_overflowed() => {
                let id = prev.id();
                error!("stack overflow in {} on thread {}", id, self.thread.id);
                prev.handle().set_state(TaskState::Terminated);
                self.shared.task_completed();
                self.zombies.push_back(prev);
                Some((self.shared.clone(), RuntimeError::StackOverflow(id)))
            }
            _ => {
                self.thread.file(prev);
                None
            }
        }
    }

    fn gc(&mut self) {
        if !self.zombies.is_empty() {
            trace!(
                "thread {} reclaiming {} finished tasks",
                self.thread.id,
                self.zombies.len()
            );
            self.zombies.clear();
        }
    }
}

thread_local! {
    static LOCAL: RefCell<Option<Local>> = const { RefCell::new(None) };
}

/// Run `f` against this thread's scheduling state, if any.
///
/// Never inlined: a task may resume on a different OS thread than the one it
/// suspended on, so the thread-local address must be looked up afresh on
/// every call. `f` must not call back into this function and must not
/// switch contexts.
#[inline(never)]
fn with_local<R>(f: impl FnOnce(&mut Local) -> R) -> Option<R> {
    LOCAL.with(|cell| cell.borrow_mut().as_mut().map(f))
}

/// File the task this thread just switched away from. Runs first thing on
/// the resumed side of every switch.
pub(crate) fn finish_switch() {
    if let Some((shared, failure)) = with_local(Local::file_switched_from).flatten() {
        shared.fail(failure);
    }
}

/// Give up the CPU. Returns when the current task is scheduled again, which
/// may be on another OS thread. No-op outside a task.
pub(crate) fn yield_current() {
    let marker = 0u8;
    let sp = std::hint::black_box(&marker) as *const u8 as usize;
    let mut polled = false;
    loop {
        match with_local(|local| local.next_step(polled, sp)) {
            None | Some(Step::Resume) => return,
            Some(Step::Poll(thread)) => {
                thread.poll_io();
                polled = true;
            }
            Some(Step::Switch(from, to)) => {
                unsafe { arch::switch(from, to) };
                finish_switch();
                return;
            }
        }
    }
}

/// Mark the current task sleeping and yield until woken.
pub(crate) fn sleep_current() {
    if let Some(task) = current_task() {
        task.set_state(TaskState::Sleeping);
        yield_current();
    }
}

pub(crate) fn take_current_entry() -> Option<TaskEntry> {
    with_local(|local| local.current.as_mut().and_then(|task| task.take_entry())).flatten()
}

pub(crate) fn terminate_current(failure: Option<RuntimeError>) {
    with_local(|local| {
        if let Some(task) = local.current.as_mut() {
            if let Some(failure) = failure {
                task.set_failure(failure);
            }
            task.handle().set_state(TaskState::Terminated);
        }
    });
}

/// Handle of the running task, if called from one.
pub(crate) fn current_task() -> Option<TaskHandle> {
    with_local(|local| local.current.as_ref().map(|task| task.handle().clone())).flatten()
}

/// Thread context of the calling OS thread, if it is running one.
pub(crate) fn current_thread() -> Option<Arc<ThreadContext>> {
    with_local(|local| local.thread.clone())
}

pub(crate) fn current_shared() -> Option<Arc<Shared>> {
    with_local(|local| local.shared.clone())
}
