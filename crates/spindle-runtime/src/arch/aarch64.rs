//! AArch64 AAPCS64 context switch.
//!
//! A suspended context's stack holds a 160-byte block: x19..x28, the frame
//! pointer and link register, then d8..d15.

pub(crate) const INITIAL_FRAME_SIZE: usize = 160;

core::arch::global_asm!(
    ".text",
    ".global spindle_switch_context",
    ".type spindle_switch_context, %function",
    ".p2align 4",
    "spindle_switch_context:",
    "sub sp, sp, #160",
    "stp x19, x20, [sp, #0x00]",
    "stp x21, x22, [sp, #0x10]",
    "stp x23, x24, [sp, #0x20]",
    "stp x25, x26, [sp, #0x30]",
    "stp x27, x28, [sp, #0x40]",
    "stp x29, x30, [sp, #0x50]",
    "stp d8, d9, [sp, #0x60]",
    "stp d10, d11, [sp, #0x70]",
    "stp d12, d13, [sp, #0x80]",
    "stp d14, d15, [sp, #0x90]",
    "mov x2, sp",
    "str x2, [x0]",
    "ldr x2, [x1]",
    "mov sp, x2",
    "ldp x19, x20, [sp, #0x00]",
    "ldp x21, x22, [sp, #0x10]",
    "ldp x23, x24, [sp, #0x20]",
    "ldp x25, x26, [sp, #0x30]",
    "ldp x27, x28, [sp, #0x40]",
    "ldp x29, x30, [sp, #0x50]",
    "ldp d8, d9, [sp, #0x60]",
    "ldp d10, d11, [sp, #0x70]",
    "ldp d12, d13, [sp, #0x80]",
    "ldp d14, d15, [sp, #0x90]",
    "add sp, sp, #160",
    "ret",
    ".size spindle_switch_context, . - spindle_switch_context",
    "",
    ".global spindle_task_bootstrap",
    ".type spindle_task_bootstrap, %function",
    ".p2align 4",
    "spindle_task_bootstrap:",
    "mov x0, x19",
    "blr x20",
    "brk #1",
    ".size spindle_task_bootstrap, . - spindle_task_bootstrap",
);

/// Lay out the first frame so that `ret` lands in the bootstrap shim with
/// x19 = `arg` and x20 = `entry`. Returns the saved stack pointer.
pub(crate) unsafe fn write_initial_frame(
    top: *mut u8,
    bootstrap: usize,
    entry: usize,
    arg: usize,
) -> usize {
    let frame = top.sub(INITIAL_FRAME_SIZE) as *mut usize;
    for slot in 0..INITIAL_FRAME_SIZE / 8 {
        frame.add(slot).write(0);
    }
    frame.write(arg); // x19
    frame.add(1).write(entry); // x20
    frame.add(11).write(bootstrap); // x30
    frame as usize
}
