//! aarch64 (AAPCS64) context switching.
//!
//! ## Stack layout
//!
//! A suspended context's frame, from the saved stack pointer upwards:
//!
//! ```text
//! +--------------+
//! | Padding      |
//! +--------------+
//! | Resume PC    |
//! +--------------+
//! | Saved X29    |
//! +--------------+
//! | Saved X19    |  <- saved stack pointer (16-aligned)
//! +--------------+
//! ```
//!
//! A fresh context reuses the same frame shape, with the entry point and
//! argument smuggled through the X29/X19 slots: the first switch
//! "restores" them and the trampoline moves them into place.

use crate::EntryPoint;
use crate::arch::push;
use core::arch::{asm, naked_asm};

pub const STACK_ALIGNMENT: usize = 16;

/// Seeds a fresh stack for the first [`switch`].
///
/// # Safety
///
/// `top` must be the `STACK_ALIGNMENT`-aligned top of an owned, writable
/// stack.
pub unsafe fn init_stack(top: usize, entry: EntryPoint, arg: usize) -> usize {
    // Safety: ensured by caller.
    unsafe {
        let mut sp = top;
        push(&mut sp, 0); // padding
        push(&mut sp, stack_init_trampoline as usize); // resume pc
        push(&mut sp, entry as usize); // lands in x29
        push(&mut sp, arg); // lands in x19
        sp
    }
}

#[unsafe(naked)]
unsafe extern "C" fn stack_init_trampoline() {
    naked_asm! {
        ".balign 4",
        // Entered via the RET in switch() with SP at the stack top. The
        // switch "restored" the argument into X19 and the entry point
        // into X29.
        "mov x0, x19",
        "mov x9, x29",
        // Terminate the frame record chain so backtraces stop here.
        "mov x29, xzr",
        "mov lr, xzr",
        // The entry point never returns, so a plain branch will do.
        "br x9",
    }
}

/// Saves the current execution into `*from_sp` and resumes the context
/// saved at `to_sp`.
///
/// Only X19 and X29 are saved by hand (LLVM reserves them); the remaining
/// callee-saved registers, including D8–D15, are spilled by the compiler
/// through the clobber list.
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
            // Build our frame: X19, X29 and the resume address.
            "adr lr, 2f",
            "stp x19, x29, [sp, #-32]!",
            "str lr, [sp, #16]",
            // Publish our stack pointer, adopt the target's.
            "mov x9, sp",
            "str x9, [x0]",
            "mov sp, x1",
            // Restore the target's frame and return into it: its own
            // label 2, or the init trampoline for a fresh stack.
            "ldr lr, [sp, #16]",
            "ldp x19, x29, [sp]",
            "add sp, sp, #32",
            "ret",
            "2:",
            in("x0") from_sp,
            in("x1") to_sp,
            // X19 and X29 are LLVM reserved registers and were saved
            // manually above; everything else is spilled by the compiler.
            lateout("x20") _, lateout("x21") _, lateout("x22") _, lateout("x23") _,
            lateout("x24") _, lateout("x25") _, lateout("x26") _, lateout("x27") _,
            lateout("x28") _,
            lateout("v8") _, lateout("v9") _, lateout("v10") _, lateout("v11") _,
            lateout("v12") _, lateout("v13") _, lateout("v14") _, lateout("v15") _,
            clobber_abi("C"),
        }
    }
}
