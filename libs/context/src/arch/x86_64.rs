//! x86_64 (sysv) context switching.
//!
//! ## Stack layout
//!
//! A suspended context's stack, from the saved stack pointer upwards:
//!
//! ```text
//! +--------------+
//! | Saved RBP    |
//! +--------------+
//! | Saved RBX    |
//! +--------------+
//! | Resume RIP   |  <- saved stack pointer
//! +--------------+
//! ```
//!
//! A freshly initialised context instead carries its entry frame:
//!
//! ```text
//! +--------------+  <- stack top (16-aligned)
//! | Argument     |
//! +--------------+
//! | Entry point  |
//! +--------------+
//! | Trampoline   |  <- saved stack pointer
//! +--------------+
//! ```
//!
//! Both shapes are entered the same way: [`switch`] installs the saved
//! stack pointer and executes `ret`.

use crate::EntryPoint;
use crate::arch::push;
use core::arch::{asm, naked_asm};

pub const STACK_ALIGNMENT: usize = 16;

/// Seeds a fresh stack so that the first [`switch`] into it lands in
/// [`stack_init_trampoline`] with the entry point and argument on top.
///
/// # Safety
///
/// `top` must be the `STACK_ALIGNMENT`-aligned top of an owned, writable
/// stack.
pub unsafe fn init_stack(top: usize, entry: EntryPoint, arg: usize) -> usize {
    // Safety: ensured by caller.
    unsafe {
        let mut sp = top;
        push(&mut sp, arg);
        push(&mut sp, entry as usize);
        push(&mut sp, stack_init_trampoline as usize);
        sp
    }
}

#[unsafe(naked)]
unsafe extern "C" fn stack_init_trampoline() {
    naked_asm! {
        ".balign 16",
        // Entered via the RET in switch(): RSP points at the entry point
        // slot, the argument slot above it.
        //
        // Terminate the frame pointer chain so backtraces stop here.
        "xor ebp, ebp",
        "pop rax",
        "pop rdi",
        // RSP is now at the stack top (16-aligned); CALL pushes the dummy
        // return address that re-establishes the ABI's entry alignment.
        "call rax",
        // The entry point never returns.
        "ud2",
    }
}

/// Saves the current execution into `*from_sp` and resumes the context
/// saved at `to_sp`.
///
/// Only RBP and RBX are saved by hand (LLVM reserves them, so they cannot
/// be clobber-listed); the remaining callee-saved registers are spilled by
/// the compiler around the asm block, which avoids redundant saves when a
/// function switches more than once.
///
/// # Safety
///
/// `to_sp` must be the saved stack pointer of a suspended context that no
/// other thread is resuming.
#[inline]
pub unsafe fn switch(from_sp: *mut usize, to_sp: usize) {
    // Safety: inline assembly.
    unsafe {
        asm! {
            "push rbp",
            "push rbx",
            // The address this context continues at when switched back in.
            "lea rax, [rip + 2f]",
            "push rax",
            // Publish our stack pointer, adopt the target's.
            "mov [rdi], rsp",
            "mov rsp, rdx",
            // Return into the target: its own label 2, or the init
            // trampoline for a stack that has never run.
            "ret",
            "2:",
            "pop rbx",
            "pop rbp",
            in("rdi") from_sp,
            in("rdx") to_sp,
            // RBX and RBP are LLVM reserved registers and were saved
            // manually above; everything else is spilled by the compiler.
            lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
            clobber_abi("sysv64"),
        }
    }
}
