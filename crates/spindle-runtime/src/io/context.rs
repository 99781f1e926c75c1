//! Descriptor registry shared by every thread of a scheduler.

use super::PollableFd;
use log::trace;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Maps file descriptors to their waiter lists.
///
/// Lookups take the read lock; only creation and replacement write.
#[derive(Default)]
pub struct IoContext {
    fds: RwLock<FxHashMap<RawFd, Arc<PollableFd>>>,
}

impl IoContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<PollableFd>> {
        self.fds.read().get(&fd).cloned()
    }

    /// Entry for `fd`, created on first use.
    pub fn get_or_create(&self, fd: RawFd) -> Arc<PollableFd> {
        if let Some(pfd) = self.get(fd) {
            return pfd;
        }
        self.fds
            .write()
            .entry(fd)
            .or_insert_with(|| Arc::new(PollableFd::new(fd)))
            .clone()
    }

    /// Install a fresh entry for a (re)opened descriptor. Waiters on the
    /// previous entry are woken with `NVAL`.
    pub fn create_or_replace(&self, fd: RawFd) -> Arc<PollableFd> {
        let pfd = Arc::new(PollableFd::new(fd));
        let old = self.fds.write().insert(fd, pfd.clone());
        if let Some(old) = old {
            trace!("replacing registry entry for fd {}", fd);
            old.invalidate();
        }
        pfd
    }

    /// Forget `fd`, waking its waiters with `NVAL`.
    pub fn remove(&self, fd: RawFd) -> Option<Arc<PollableFd>> {
        let old = self.fds.write().remove(&fd);
        if let Some(old) = &old {
            old.invalidate();
        }
        old
    }

    pub fn len(&self) -> usize {
        self.fds.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.read().is_empty()
    }
}
