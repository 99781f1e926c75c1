//! mmap-backed task stacks with guard regions.
//!
//! Layout, from low to high addresses:
//!
//! ```text
//! | PROT_NONE page | soft guard (SOFT_GUARD_SIZE) | usable stack ... | top
//! ```
//!
//! The hard page faults on any access. The soft guard is ordinary memory: a
//! suspended task whose stack pointer lies inside it is reported as having
//! overflowed before it can reach the hard page.

use log::error;
use once_cell::sync::Lazy;
use std::ptr;

/// Size of the writable detection zone above the inaccessible page.
pub(crate) const SOFT_GUARD_SIZE: usize = 16 * 1024;

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
});

pub(crate) fn page_size() -> usize {
    *PAGE_SIZE
}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

/// A task stack.
pub(crate) struct Stack {
    base: *mut u8,
    len: usize,
    guard_len: usize,
}

// The mapping is owned exclusively by the task holding this stack.
unsafe impl Send for Stack {}

impl Stack {
    /// Map a stack with at least `size` usable bytes. Aborts the process if
    /// the mapping cannot be created.
    pub(crate) fn new(size: usize) -> Stack {
        let page = page_size();
        let usable = round_up(size.max(page), page);
        let guard_len = page + round_up(SOFT_GUARD_SIZE, page);
        let len = usable + guard_len;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            error!(
                "failed to map {} byte task stack: {}",
                len,
                std::io::Error::last_os_error()
            );
            std::process::abort();
        }

        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            error!(
                "failed to protect task stack guard page: {}",
                std::io::Error::last_os_error()
            );
            std::process::abort();
        }

        Stack {
            base: base as *mut u8,
            len,
            guard_len,
        }
    }

    /// Highest address of the stack (exclusive); page aligned.
    pub(crate) fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.len) }
    }

    /// Lowest address a suspended stack pointer may legally hold.
    pub(crate) fn guard_end(&self) -> usize {
        self.base as usize + self.guard_len
    }

    /// Usable bytes between the guard region and the top.
    pub(crate) fn usable_size(&self) -> usize {
        self.len - self.guard_len
    }

    /// Whether a saved stack pointer lies inside `[guard_end, top - frame]`.
    pub(crate) fn in_bounds(&self, sp: usize, frame: usize) -> bool {
        sp >= self.guard_end() && sp <= self.top() as usize - frame
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_layout() {
        let stack = Stack::new(64 * 1024);
        let page = page_size();
        assert_eq!(stack.top() as usize % page, 0);
        assert!(stack.usable_size() >= 64 * 1024);
        assert_eq!(
            stack.guard_end() - stack.base as usize,
            page + round_up(SOFT_GUARD_SIZE, page)
        );
    }

    #[test]
    fn test_usable_region_is_writable() {
        let stack = Stack::new(16 * 1024);
        let low = stack.guard_end() as *mut u8;
        unsafe {
            low.write(0xAA);
            stack.top().sub(1).write(0x55);
            assert_eq!(low.read(), 0xAA);
        }
    }

    #[test]
    fn test_bounds() {
        let stack = Stack::new(32 * 1024);
        let top = stack.top() as usize;
        assert!(stack.in_bounds(top - 64, 64));
        assert!(stack.in_bounds(stack.guard_end(), 64));
        assert!(!stack.in_bounds(top - 32, 64));
        assert!(!stack.in_bounds(stack.guard_end() - 8, 64));
    }

    #[test]
    fn test_small_request_rounds_up() {
        let stack = Stack::new(1);
        assert_eq!(stack.usable_size(), page_size());
    }
}
