//! Edge-triggered I/O readiness layer
//!
//! - [`PollableFd`]: waiters of one descriptor, grouped by interest
//! - [`IoContext`]: descriptor registry shared by a scheduler's threads
//! - [`IoPoller`]: per-thread epoll instance feeding the registry
//!
//! The free functions form the boundary used by code that wants blocking
//! looking I/O to suspend only the calling task. [`poll`] follows the
//! protocol itself: try a zero-timeout call, and if nothing is ready register
//! interest, sleep, and retry. [`read`] and [`write`] wait through [`poll`]
//! before each call inside a task. Outside a task they perform the plain
//! blocking call.

mod context;
mod pollable;
mod poller;

pub use context::IoContext;
pub use pollable::{PollEvents, PollableFd, ReadySlot};
pub use poller::IoPoller;

use crate::task::{TaskHandle, TaskState};
use crate::thread_context;
use log::warn;
use std::io;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

/// Register `task` for `events` on `fd` with the calling thread's poller.
///
/// Returns `false` when called off a scheduler thread or when the kernel
/// subscription fails; callers then fall back to a blocking call.
pub fn register_interest(fd: RawFd, events: PollEvents, task: &TaskHandle, slot: &ReadySlot) -> bool {
    let Some(thread) = thread_context::current_thread() else {
        return false;
    };
    match thread.poller().add(fd, events, task, slot) {
        Ok(()) => true,
        Err(e) => {
            warn!("failed to register interest in fd {}: {}", fd, e);
            false
        }
    }
}

/// Resolve ready descriptors on the calling thread's poller.
pub fn poll_once() {
    if let Some(thread) = thread_context::current_thread() {
        thread.poll_io();
    }
}

/// Start tracking a freshly opened descriptor, dropping any stale entry
/// left by a previous descriptor with the same number.
pub fn create_or_replace_descriptor(fd: RawFd) {
    if let Some(shared) = thread_context::current_shared() {
        shared.io().create_or_replace(fd);
    }
}

/// Task-aware `poll(2)`.
///
/// Inside a task any non-zero timeout waits until a descriptor is ready.
pub fn poll(fds: &mut [libc::pollfd], timeout: libc::c_int) -> io::Result<usize> {
    loop {
        let n = sys_poll(fds, 0)?;
        if n > 0 || timeout == 0 {
            return Ok(n);
        }
        let Some(task) = thread_context::current_task() else {
            return sys_poll(fds, timeout);
        };
        if !suspend_on(&task, fds) {
            return sys_poll(fds, timeout);
        }
    }
}

/// Wait until `fd` reports one of `events` or an error.
pub fn wait_ready(fd: RawFd, events: PollEvents) -> io::Result<PollEvents> {
    let mut fds = [libc::pollfd {
        fd,
        events: events.bits(),
        revents: 0,
    }];
    poll(&mut fds, -1)?;
    Ok(PollEvents::from_bits_truncate(fds[0].revents))
}

/// Task-aware `read(2)`.
///
/// Inside a task the descriptor is polled first, so blocking descriptors
/// only suspend the calling task.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    retry_when_ready(fd, PollEvents::IN, || unsafe {
        libc::read(fd, buf.as_mut_ptr().cast(), buf.len())
    })
}

/// Task-aware `write(2)`; see [`read`].
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    retry_when_ready(fd, PollEvents::OUT, || unsafe {
        libc::write(fd, buf.as_ptr().cast(), buf.len())
    })
}

fn retry_when_ready(
    fd: RawFd,
    events: PollEvents,
    mut op: impl FnMut() -> libc::ssize_t,
) -> io::Result<usize> {
    let in_task = thread_context::current_task().is_some();
    loop {
        if in_task {
            wait_ready(fd, events)?;
        }
        let n = op();
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => {}
            // Inside a task the next pass waits again.
            io::ErrorKind::WouldBlock if in_task => {}
            io::ErrorKind::WouldBlock => {
                wait_ready(fd, events)?;
            }
            _ => return Err(err),
        }
    }
}

/// Non-blocking close-on-exec pipe, registered with the current scheduler.
///
/// Returns `(read end, write end)`.
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    create_or_replace_descriptor(fds[0]);
    create_or_replace_descriptor(fds[1]);
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn sys_poll(fds: &mut [libc::pollfd], timeout: libc::c_int) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Sleep until one of `fds` is reported ready. Returns `false` without
/// sleeping if no descriptor could be registered.
fn suspend_on(task: &TaskHandle, fds: &[libc::pollfd]) -> bool {
    let Some(thread) = thread_context::current_thread() else {
        return false;
    };
    let slot = ReadySlot::new();

    // Sleeping before registering: a wake may arrive as soon as the first
    // descriptor is subscribed.
    task.set_state(TaskState::Sleeping);
    let mut registered = Vec::with_capacity(fds.len());
    for pfd in fds.iter().filter(|pfd| pfd.fd >= 0) {
        let events = PollEvents::from_bits_truncate(pfd.events);
        if register_interest(pfd.fd, events, task, &slot) {
            registered.push(pfd.fd);
        }
    }
    if registered.is_empty() {
        task.set_state(TaskState::Runnable);
        return false;
    }

    thread_context::yield_current();

    // The task may have moved to another thread; its registrations live on
    // the poller it suspended on.
    for fd in registered {
        if let Err(e) = thread.poller().withdraw(fd, task.id()) {
            warn!("failed to withdraw interest in fd {}: {}", fd, e);
        }
    }
    true
}
