//! Edge-triggered epoll instance owned by one scheduling thread.

use super::{IoContext, PollEvents, ReadySlot};
use crate::task::{TaskHandle, TaskId};
use log::trace;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const MAX_EVENTS: usize = 64;

/// Readiness multiplexer for one thread.
///
/// Subscriptions carry exactly the interest still outstanding on each
/// descriptor, so edge-triggered notifications behave like level-triggered
/// `poll(2)` for the waiting tasks.
pub struct IoPoller {
    epoll: OwnedFd,
    io: Arc<IoContext>,
    subscribed: Mutex<FxHashSet<RawFd>>,
    /// Mirror of `subscribed.len()` for lock-free checks
    interest: AtomicUsize,
}

impl IoPoller {
    pub fn new(io: Arc<IoContext>) -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            io,
            subscribed: Mutex::new(FxHashSet::default()),
            interest: AtomicUsize::new(0),
        })
    }

    pub fn registry(&self) -> &Arc<IoContext> {
        &self.io
    }

    /// Whether any descriptor is subscribed on this poller.
    pub fn has_interest(&self) -> bool {
        self.interest.load(Ordering::Acquire) > 0
    }

    /// Register `task` for `events` on `fd` and update the kernel
    /// subscription if the aggregate interest changed.
    ///
    /// On failure the registration is withdrawn.
    pub fn add(
        &self,
        fd: RawFd,
        events: PollEvents,
        task: &TaskHandle,
        slot: &ReadySlot,
    ) -> io::Result<()> {
        let pfd = self.io.get_or_create(fd);
        let (old, new) = pfd.register_interest(events, task.clone(), slot.clone());
        if old == new {
            return Ok(());
        }
        if let Err(e) = self.subscribe(fd, new) {
            pfd.cancel(task.id());
            return Err(e);
        }
        Ok(())
    }

    /// Withdraw `task`'s registration on `fd` and shrink the kernel
    /// subscription to the interest that remains.
    pub fn withdraw(&self, fd: RawFd, task: TaskId) -> io::Result<()> {
        let Some(pfd) = self.io.get(fd) else {
            return Ok(());
        };
        let (old, new) = pfd.cancel(task);
        if old == new {
            return Ok(());
        }
        if new.is_empty() {
            self.unsubscribe(fd)
        } else {
            self.subscribe(fd, new)
        }
    }

    /// Reap ready descriptors without blocking and wake their waiters.
    ///
    /// Returns the number of descriptors reported ready.
    pub fn poll(&self) -> io::Result<usize> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                0,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for event in &events[..n as usize] {
            let fd = { event.u64 } as RawFd;
            let ready = PollEvents::from_epoll({ event.events });
            let outstanding = match self.io.get(fd) {
                Some(pfd) => pfd.notify(ready).1,
                None => PollEvents::empty(),
            };
            trace!("fd {} ready with {:?}, still waiting for {:?}", fd, ready, outstanding);

            if outstanding.is_empty() {
                self.unsubscribe(fd)?;
            } else {
                self.subscribe(fd, outstanding)?;
            }
        }
        Ok(n as usize)
    }

    fn subscribe(&self, fd: RawFd, events: PollEvents) -> io::Result<()> {
        let known = self.subscribed.lock().contains(&fd);
        let first = if known {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };

        match self.ctl(first, fd, events) {
            Ok(()) => {}
            // Closed and reopened behind our back, or subscribed by a
            // previous registration we no longer track.
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                self.ctl(libc::EPOLL_CTL_ADD, fd, events)?
            }
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                self.ctl(libc::EPOLL_CTL_MOD, fd, events)?
            }
            Err(e) => return Err(e),
        }

        let mut subscribed = self.subscribed.lock();
        subscribed.insert(fd);
        self.interest.store(subscribed.len(), Ordering::Release);
        Ok(())
    }

    fn unsubscribe(&self, fd: RawFd) -> io::Result<()> {
        match self.ctl(libc::EPOLL_CTL_DEL, fd, PollEvents::empty()) {
            Ok(()) => {}
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) => {}
            Err(e) => return Err(e),
        }
        let mut subscribed = self.subscribed.lock();
        subscribed.remove(&fd);
        self.interest.store(subscribed.len(), Ordering::Release);
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: PollEvents) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: events.to_epoll() | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        assert_eq!(
            unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) },
            0
        );
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn test_readable_pipe_wakes_waiter() {
        let io = Arc::new(IoContext::new());
        let poller = IoPoller::new(io.clone()).unwrap();
        let (rx, tx) = pipe();

        let task = TaskHandle::detached();
        task.set_state(TaskState::Sleeping);
        let slot = ReadySlot::new();
        poller.add(rx.as_raw_fd(), PollEvents::IN, &task, &slot).unwrap();
        assert!(poller.has_interest());

        assert_eq!(poller.poll().unwrap(), 0);
        assert_eq!(task.state(), TaskState::Sleeping);

        let n = unsafe { libc::write(tx.as_raw_fd(), b"x".as_ptr().cast(), 1) };
        assert_eq!(n, 1);

        assert_eq!(poller.poll().unwrap(), 1);
        assert_eq!(task.state(), TaskState::Runnable);
        assert_eq!(slot.get(), PollEvents::IN);
        assert!(!poller.has_interest());
    }

    #[test]
    fn test_writable_pipe_reported_on_subscribe() {
        let io = Arc::new(IoContext::new());
        let poller = IoPoller::new(io).unwrap();
        let (_rx, tx) = pipe();

        let task = TaskHandle::detached();
        task.set_state(TaskState::Sleeping);
        let slot = ReadySlot::new();
        poller.add(tx.as_raw_fd(), PollEvents::OUT, &task, &slot).unwrap();

        assert_eq!(poller.poll().unwrap(), 1);
        assert_eq!(task.state(), TaskState::Runnable);
        assert!(slot.get().contains(PollEvents::OUT));
    }

    #[test]
    fn test_withdraw_drops_subscription() {
        let io = Arc::new(IoContext::new());
        let poller = IoPoller::new(io.clone()).unwrap();
        let (rx1, _tx1) = pipe();
        let (rx2, _tx2) = pipe();

        let task = TaskHandle::detached();
        task.set_state(TaskState::Sleeping);
        let slot = ReadySlot::new();
        poller.add(rx1.as_raw_fd(), PollEvents::IN, &task, &slot).unwrap();
        poller.add(rx2.as_raw_fd(), PollEvents::IN, &task, &slot).unwrap();
        assert_eq!(poller.subscribed.lock().len(), 2);

        poller.withdraw(rx2.as_raw_fd(), task.id()).unwrap();
        assert!(poller.has_interest());
        assert_eq!(poller.subscribed.lock().len(), 1);
        assert!(io.get(rx2.as_raw_fd()).unwrap().interest().is_empty());

        poller.withdraw(rx1.as_raw_fd(), task.id()).unwrap();
        assert!(!poller.has_interest());

        // Unknown descriptors and repeated withdrawals are no-ops.
        poller.withdraw(rx1.as_raw_fd(), task.id()).unwrap();
        poller.withdraw(12345, task.id()).unwrap();
    }

    #[test]
    fn test_withdraw_keeps_other_waiters_subscribed() {
        let io = Arc::new(IoContext::new());
        let poller = IoPoller::new(io.clone()).unwrap();
        let (rx, tx) = pipe();

        let stays = TaskHandle::detached();
        stays.set_state(TaskState::Sleeping);
        let leaves = TaskHandle::detached();
        leaves.set_state(TaskState::Sleeping);
        let slot = ReadySlot::new();
        poller.add(rx.as_raw_fd(), PollEvents::IN, &stays, &slot).unwrap();
        poller.add(rx.as_raw_fd(), PollEvents::IN, &leaves, &ReadySlot::new()).unwrap();

        poller.withdraw(rx.as_raw_fd(), leaves.id()).unwrap();
        assert!(poller.has_interest());

        let n = unsafe { libc::write(tx.as_raw_fd(), b"x".as_ptr().cast(), 1) };
        assert_eq!(n, 1);
        assert_eq!(poller.poll().unwrap(), 1);
        assert_eq!(stays.state(), TaskState::Runnable);
        assert_eq!(leaves.state(), TaskState::Sleeping);
        assert!(!poller.has_interest());
    }

    #[test]
    fn test_add_bad_fd_fails_and_withdraws() {
        let io = Arc::new(IoContext::new());
        let poller = IoPoller::new(io.clone()).unwrap();
        let task = TaskHandle::detached();
        let err = poller
            .add(-1, PollEvents::IN, &task, &ReadySlot::new())
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
        let pfd = io.get(-1).unwrap();
        assert_eq!(pfd.waiter_count(), 0);
        assert!(pfd.interest().is_empty());
        assert!(!poller.has_interest());
    }
}
