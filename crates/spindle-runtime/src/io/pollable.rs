//! Per-descriptor waiter lists.

use crate::task::{TaskHandle, TaskId};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::Arc;

bitflags! {
    /// `poll(2)` event bits. The values match the corresponding `EPOLL*`
    /// flags on Linux.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PollEvents: i16 {
        const IN = libc::POLLIN;
        const OUT = libc::POLLOUT;
        const ERR = libc::POLLERR;
        const HUP = libc::POLLHUP;
        const NVAL = libc::POLLNVAL;
    }
}

impl PollEvents {
    /// Events that satisfy every waiter regardless of its interest.
    pub const ERRORS: PollEvents = PollEvents::ERR.union(PollEvents::HUP).union(PollEvents::NVAL);

    pub(crate) fn to_epoll(self) -> u32 {
        (self & !PollEvents::NVAL).bits() as u16 as u32
    }

    pub(crate) fn from_epoll(events: u32) -> PollEvents {
        PollEvents::from_bits_truncate(events as u16 as i16)
    }
}

/// Where a woken waiter finds the events that woke it.
#[derive(Debug, Clone, Default)]
pub struct ReadySlot(Arc<AtomicI16>);

impl ReadySlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> PollEvents {
        PollEvents::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, events: PollEvents) {
        self.0.store(events.bits(), Ordering::Release);
    }
}

struct Waiter {
    task: TaskHandle,
    slot: ReadySlot,
}

/// Interest shape of a waiter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Read,
    Write,
    ReadWrite,
    Error,
}

impl Shape {
    const ALL: [Shape; 4] = [Shape::Read, Shape::Write, Shape::ReadWrite, Shape::Error];

    fn of(events: PollEvents) -> Shape {
        match (events.contains(PollEvents::IN), events.contains(PollEvents::OUT)) {
            (true, true) => Shape::ReadWrite,
            (true, false) => Shape::Read,
            (false, true) => Shape::Write,
            (false, false) => Shape::Error,
        }
    }

    /// Events the kernel must report for this list to make progress
    fn requirement(self) -> PollEvents {
        match self {
            Shape::Read => PollEvents::IN,
            Shape::Write => PollEvents::OUT,
            Shape::ReadWrite => PollEvents::IN | PollEvents::OUT,
            Shape::Error => PollEvents::ERR,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Default)]
struct Waiters {
    mask: PollEvents,
    lists: [Vec<Waiter>; 4],
}

impl Waiters {
    /// Rebuild the mask from the lists that still hold waiters.
    ///
    /// Returns the mask before and after.
    fn recompute_mask(&mut self) -> (PollEvents, PollEvents) {
        let mut mask = PollEvents::empty();
        for shape in Shape::ALL {
            if !self.lists[shape.index()].is_empty() {
                mask |= shape.requirement();
            }
        }
        let old = std::mem::replace(&mut self.mask, mask);
        (old, mask)
    }
}

/// A file descriptor tasks can wait on.
pub struct PollableFd {
    fd: RawFd,
    waiters: Mutex<Waiters>,
}

impl PollableFd {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            waiters: Mutex::new(Waiters::default()),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Current aggregate interest mask.
    pub fn interest(&self) -> PollEvents {
        self.waiters.lock().mask
    }

    /// Queue `task` until `events` (or an error) is reported.
    ///
    /// Returns the interest mask before and after registration; the caller
    /// updates the kernel subscription when they differ.
    pub fn register_interest(
        &self,
        events: PollEvents,
        task: TaskHandle,
        slot: ReadySlot,
    ) -> (PollEvents, PollEvents) {
        let shape = Shape::of(events);
        let mut waiters = self.waiters.lock();
        let id = task.id();
        for list in waiters.lists.iter_mut() {
            list.retain(|w| w.task.id() != id);
        }
        waiters.lists[shape.index()].push(Waiter { task, slot });
        waiters.recompute_mask()
    }

    /// Deliver `ready` events: every list they satisfy is woken and cleared;
    /// the others make up the new interest mask.
    ///
    /// Returns the interest mask before and after.
    pub fn notify(&self, ready: PollEvents) -> (PollEvents, PollEvents) {
        let mut woken = Vec::new();
        let (old, new) = {
            let mut waiters = self.waiters.lock();
            let mut new = PollEvents::empty();
            for shape in Shape::ALL {
                let list = &mut waiters.lists[shape.index()];
                if list.is_empty() {
                    continue;
                }
                let accepted = shape.requirement() | PollEvents::ERRORS;
                if ready.intersects(accepted) {
                    let observed = ready & accepted;
                    for waiter in list.drain(..) {
                        waiter.slot.set(observed);
                        woken.push(waiter.task);
                    }
                } else {
                    new |= shape.requirement();
                }
            }
            let old = waiters.mask;
            waiters.mask = new;
            (old, new)
        };

        for task in woken {
            task.wake();
        }
        (old, new)
    }

    /// Drop any registration `task` still holds here and shrink the
    /// interest mask to the lists that remain.
    ///
    /// Returns the interest mask before and after.
    pub fn cancel(&self, task: TaskId) -> (PollEvents, PollEvents) {
        let mut waiters = self.waiters.lock();
        for list in waiters.lists.iter_mut() {
            list.retain(|w| w.task.id() != task);
        }
        waiters.recompute_mask()
    }

    /// Wake every waiter with `NVAL`; used when the descriptor is replaced.
    pub fn invalidate(&self) {
        self.notify(PollEvents::NVAL);
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().lists.iter().map(Vec::len).sum()
    }
}

impl std::fmt::Debug for PollableFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollableFd")
            .field("fd", &self.fd)
            .field("interest", &self.interest())
            .field("waiters", &self.waiter_count())
            .finish()
    }
}
