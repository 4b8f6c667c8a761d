// =============================================================================
// nanokern — x86_64 Back-End
// =============================================================================
//
// The whole back-end is three primitives around one idea: on x86_64 (SysV
// ABI) a context is fully described by its stack once the callee-saved
// registers are parked there. The switch routine below is an ordinary
// function-call boundary; everything the ABI does not require a callee to
// preserve is dead across the call anyway, so saving rbp, rbx and r12–r15
// plus the return address is a complete context save.
//
// A fresh process needs a stack that *looks like* it was suspended by that
// routine. `boot_frame` fabricates exactly that: six zeroed register slots
// and a return slot aimed at the process trampoline.
// =============================================================================

use core::arch::{asm, global_asm};

/// Words in the synthetic first frame: r15, r14, r13, r12, rbx, rbp, the
/// return address, and one alignment word below the stack top.
pub const BOOT_FRAME_WORDS: usize = 8;

global_asm!(
    ".global nanokern_switch_context",
    "nanokern_switch_context:",
    // rdi = &mut outgoing saved SP, rsi = incoming saved SP
    //
    // Save callee-saved registers on the outgoing stack
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    // Save outgoing RSP
    "mov [rdi], rsp",
    // Load incoming RSP
    "mov rsp, rsi",
    // Restore callee-saved registers from the incoming stack
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    // Return to wherever the incoming context left off (pops RIP)
    "ret",
);

unsafe extern "C" {
    fn nanokern_switch_context(save: *mut usize, load: usize);
}

/// Reads the current value of the RSP register.
///
/// This is the "save current stack pointer into X" primitive: the scheduler
/// records it for the bootstrapping process, whose stack it does not own.
#[inline]
pub fn stack_pointer() -> usize {
    let sp: usize;
    // SAFETY: reading RSP has no side effects.
    unsafe {
        asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    sp
}

/// Swaps the active stack: stores the current stack pointer through `save`,
/// installs `load`, and returns *on the new stack*.
///
/// The return consumes the topmost frame of the incoming stack — either the
/// frame a previous switch parked there, or the frame `boot_frame` forged.
///
/// # Safety
/// `save` must be valid for a write and `load` must have been produced by a
/// previous switch out of a live stack or by [`boot_frame`]. The caller must
/// not hold borrows that the stack change invalidates.
pub unsafe fn switch_context(save: *mut usize, load: usize) {
    // SAFETY: a real call into the assembly routine above; the compiler
    // treats it as an opaque extern "C" function, so only callee-saved state
    // is assumed to survive — which is exactly what the routine preserves.
    unsafe { nanokern_switch_context(save, load) }
}

/// Writes the synthetic first frame onto a fresh stack and returns the
/// initial saved stack pointer.
///
/// Layout, matching the pop order of the switch routine:
/// ```text
///   [sp + 0]  r15 = 0
///   [sp + 8]  r14 = 0
///   [sp + 16] r13 = 0
///   [sp + 24] r12 = 0
///   [sp + 32] rbx = 0
///   [sp + 40] rbp = 0
///   [sp + 48] rip → entry
///   [sp + 56] (alignment word)
/// ```
/// The top is aligned down to 16 bytes first, so `entry` begins with
/// `rsp ≡ 8 (mod 16)` — the state the SysV ABI guarantees at any function
/// entry.
///
/// # Safety
/// `top` must point one past the end of a writable stack at least
/// `BOOT_FRAME_WORDS` words long.
pub unsafe fn boot_frame(top: *mut u8, entry: extern "C" fn() -> !) -> usize {
    let top = (top as usize) & !0xF;
    let sp = top - BOOT_FRAME_WORDS * size_of::<usize>();

    // SAFETY: the frame lies within the caller-provided stack.
    unsafe {
        let frame = sp as *mut usize;
        frame.add(0).write(0); // r15
        frame.add(1).write(0); // r14
        frame.add(2).write(0); // r13
        frame.add(3).write(0); // r12
        frame.add(4).write(0); // rbx
        frame.add(5).write(0); // rbp
        frame.add(6).write(entry as usize); // rip (ret target)
        frame.add(7).write(0);
    }
    sp
}
