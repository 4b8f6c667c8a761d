// =============================================================================
// nanokern — aarch64 Back-End
// =============================================================================
//
// Same contract as the x86_64 back-end, expressed in AAPCS64 terms: the
// callee-saved set is x19–x28 plus the frame pointer (x29) and the link
// register (x30). Parking those twelve registers on the stack captures the
// context completely; `ret` branches to x30, so a forged frame only needs a
// trampoline address in the x30 slot.
//
// AArch64 requires SP to stay 16-byte aligned at all times, hence the frame
// size of 96 bytes and the aligned-down stack top in `boot_frame`.
// =============================================================================

use core::arch::{asm, global_asm};

/// Words in the synthetic first frame: x19–x28, x29 and x30.
pub const BOOT_FRAME_WORDS: usize = 12;

global_asm!(
    ".global nanokern_switch_context",
    "nanokern_switch_context:",
    // x0 = &mut outgoing saved SP, x1 = incoming saved SP
    //
    // Save callee-saved registers on the outgoing stack
    "sub sp, sp, #96",
    "stp x19, x20, [sp]",
    "stp x21, x22, [sp, #16]",
    "stp x23, x24, [sp, #32]",
    "stp x25, x26, [sp, #48]",
    "stp x27, x28, [sp, #64]",
    "stp x29, x30, [sp, #80]",
    // Save outgoing SP
    "mov x9, sp",
    "str x9, [x0]",
    // Load incoming SP
    "mov sp, x1",
    // Restore callee-saved registers from the incoming stack
    "ldp x19, x20, [sp]",
    "ldp x21, x22, [sp, #16]",
    "ldp x23, x24, [sp, #32]",
    "ldp x25, x26, [sp, #48]",
    "ldp x27, x28, [sp, #64]",
    "ldp x29, x30, [sp, #80]",
    "add sp, sp, #96",
    // Branch to wherever the incoming context left off (x30)
    "ret",
);

unsafe extern "C" {
    fn nanokern_switch_context(save: *mut usize, load: usize);
}

/// Reads the current value of the SP register.
#[inline]
pub fn stack_pointer() -> usize {
    let sp: usize;
    // SAFETY: reading SP has no side effects.
    unsafe {
        asm!("mov {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    sp
}

/// Swaps the active stack: stores the current stack pointer through `save`,
/// installs `load`, and returns *on the new stack*.
///
/// # Safety
/// `save` must be valid for a write and `load` must have been produced by a
/// previous switch out of a live stack or by [`boot_frame`]. The caller must
/// not hold borrows that the stack change invalidates.
pub unsafe fn switch_context(save: *mut usize, load: usize) {
    // SAFETY: a real call into the assembly routine above; only the
    // callee-saved set is assumed to survive, which it preserves.
    unsafe { nanokern_switch_context(save, load) }
}

/// Writes the synthetic first frame onto a fresh stack and returns the
/// initial saved stack pointer.
///
/// Layout, matching the load order of the switch routine:
/// ```text
///   [sp + 0]  x19 = 0      ...      [sp + 72] x28 = 0
///   [sp + 80] x29 = 0
///   [sp + 88] x30 → entry
/// ```
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
        for slot in 0..BOOT_FRAME_WORDS - 1 {
            frame.add(slot).write(0); // x19..x28, x29
        }
        frame.add(BOOT_FRAME_WORDS - 1).write(entry as usize); // x30 (ret target)
    }
    sp
}
