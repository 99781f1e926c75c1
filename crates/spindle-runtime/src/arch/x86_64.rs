//! x86_64 System V context switch.
//!
//! A suspended context's stack holds, from its saved stack pointer upwards:
//! MXCSR and the x87 control word (8 bytes), r15, r14, r13, r12, rbx, rbp and
//! the return address.

/// MXCSR slot (8 bytes) + six callee-saved registers + return address.
pub(crate) const INITIAL_FRAME_SIZE: usize = 64;

const DEFAULT_MXCSR: u32 = 0x1F80;
const DEFAULT_FPU_CW: u16 = 0x037F;

core::arch::global_asm!(
    ".text",
    ".global spindle_switch_context",
    ".type spindle_switch_context, @function",
    ".p2align 4",
    "spindle_switch_context:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "sub rsp, 8",
    "stmxcsr dword ptr [rsp]",
    "fnstcw word ptr [rsp + 4]",
    "mov [rdi], rsp",
    "mov rsp, [rsi]",
    "ldmxcsr dword ptr [rsp]",
    "fldcw word ptr [rsp + 4]",
    "add rsp, 8",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    ".size spindle_switch_context, . - spindle_switch_context",
    "",
    ".global spindle_task_bootstrap",
    ".type spindle_task_bootstrap, @function",
    ".p2align 4",
    "spindle_task_bootstrap:",
    "mov rdi, r12",
    "call r13",
    "ud2",
    ".size spindle_task_bootstrap, . - spindle_task_bootstrap",
);

/// Lay out the first frame so that `ret` lands in the bootstrap shim with
/// r12 = `arg` and r13 = `entry`. Returns the saved stack pointer.
pub(crate) unsafe fn write_initial_frame(
    top: *mut u8,
    bootstrap: usize,
    entry: usize,
    arg: usize,
) -> usize {
    let top = top as *mut usize;
    top.sub(1).write(bootstrap);
    top.sub(2).write(0); // rbp
    top.sub(3).write(0); // rbx
    top.sub(4).write(arg); // r12
    top.sub(5).write(entry); // r13
    top.sub(6).write(0); // r14
    top.sub(7).write(0); // r15

    let csr = top.sub(8);
    csr.write(0);
    (csr as *mut u32).write(DEFAULT_MXCSR);
    ((csr as *mut u8).add(4) as *mut u16).write(DEFAULT_FPU_CW);
    csr as usize
}
