// =============================================================================
// nanokern — Architecture Abstraction
// =============================================================================
//
// This module re-exports the current architecture's back-end. The rest of
// the runtime uses `crate::arch::*` and never names a target directly.
//
// Every back-end exposes the same three primitives:
//   stack_pointer()   — read the hardware stack pointer
//   switch_context()  — save the outgoing SP, load the incoming SP
//   boot_frame()      — lay out the synthetic first frame of a fresh stack
//
// To add a new architecture:
//   1. Create `arch/<target>/mod.rs` with the same public interface
//   2. Add a `#[cfg(target_arch = "<target>")]` pair here
//   3. Everything else just works
// =============================================================================

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(target_arch = "aarch64")]
pub use aarch64::*;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("nanokern has no back-end for this target architecture");
