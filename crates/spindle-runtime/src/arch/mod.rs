//! Register-context switching.
//!
//! This is the only place that knows how a suspended execution context is
//! laid out. Everything above it deals in [`Context`] values and the
//! [`switch`] call.

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
compile_error!("spindle-runtime supports Linux on x86_64 and aarch64 only");

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
use aarch64 as imp;
#[cfg(target_arch = "x86_64")]
use x86_64 as imp;

/// Bytes occupied by the frame [`init_context`] writes below the stack top.
pub(crate) const INITIAL_FRAME_SIZE: usize = imp::INITIAL_FRAME_SIZE;

/// Saved execution context of a suspended task or idle loop.
///
/// Only the stack pointer is stored here; callee-saved registers live on the
/// suspended stack itself.
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct Context {
    pub(crate) sp: usize,
}

extern "C" {
    fn spindle_switch_context(from: *mut Context, to: *const Context);
    fn spindle_task_bootstrap();
}

/// Entry point reached on the first switch into a fresh stack.
pub(crate) type EntryFn = extern "C" fn(usize) -> !;

/// Save the running context into `from` and resume `to`.
///
/// Returns when some other context switches back into `from`.
///
/// # Safety
///
/// `from` must be valid for writes and `to` must hold a context produced by
/// [`init_context`] or by a previous `switch`, whose stack is still mapped
/// and not running anywhere else.
#[inline(never)]
pub(crate) unsafe fn switch(from: *mut Context, to: *const Context) {
    spindle_switch_context(from, to);
}

/// Build the initial frame for a fresh stack so that the first switch into
/// it calls `entry(arg)`.
///
/// # Safety
///
/// `top` must be the 16-byte aligned upper end of a writable mapping with at
/// least [`INITIAL_FRAME_SIZE`] bytes below it.
pub(crate) unsafe fn init_context(top: *mut u8, entry: EntryFn, arg: usize) -> Context {
    debug_assert_eq!(top as usize % 16, 0);
    let sp = imp::write_initial_frame(
        top,
        spindle_task_bootstrap as usize,
        entry as usize,
        arg,
    );
    Context { sp }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    thread_local! {
        static MAIN: Cell<*mut Context> = const { Cell::new(std::ptr::null_mut()) };
        static COROUTINE: Cell<*mut Context> = const { Cell::new(std::ptr::null_mut()) };
        static TRACE: Cell<usize> = const { Cell::new(0) };
    }

    extern "C" fn bounce(arg: usize) -> ! {
        TRACE.with(|t| t.set(t.get() + arg));
        let (main, co) = (MAIN.with(Cell::get), COROUTINE.with(Cell::get));
        unsafe { switch(co, main) };
        TRACE.with(|t| t.set(t.get() * 10));
        unsafe { switch(co, main) };
        std::process::abort();
    }

    #[test]
    fn test_switch_round_trip() {
        let mut stack = vec![0u128; 4096];
        let top = unsafe { stack.as_mut_ptr().add(stack.len()) } as *mut u8;

        let main: *mut Context = Box::into_raw(Box::default());
        let co: *mut Context = Box::into_raw(Box::new(unsafe { init_context(top, bounce, 4) }));
        assert_eq!(unsafe { (*co).sp }, top as usize - INITIAL_FRAME_SIZE);

        MAIN.with(|c| c.set(main));
        COROUTINE.with(|c| c.set(co));

        unsafe { switch(main, co) };
        assert_eq!(TRACE.with(Cell::get), 4);

        unsafe { switch(main, co) };
        assert_eq!(TRACE.with(Cell::get), 40);

        unsafe {
            drop(Box::from_raw(main));
            drop(Box::from_raw(co));
        }
        drop(stack);
    }
}
