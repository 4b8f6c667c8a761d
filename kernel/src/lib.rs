// =============================================================================
// nanokern — Cooperative Toy-Kernel Runtime
// =============================================================================
//
// nanokern is the smallest runtime that still demonstrates the machinery a
// real kernel is built on:
//
//   memory/ — an in-place region allocator. The caller hands it one
//             contiguous byte region; every piece of bookkeeping (block
//             headers, free-index links) lives inside that region. Worst-fit
//             placement backed by a size-sorted free index, coalescing frees.
//   task/   — a cooperative scheduler. Lightweight processes on a round-robin
//             ready queue; a context switch rewrites the hardware stack
//             pointer and lets the ABI's callee-save convention carry the
//             rest.
//   arch/   — the per-target back-end: read the stack pointer, switch stacks,
//             lay out the synthetic first frame of a fresh process.
//
// The scheduler draws all of its runtime memory (process records and stacks)
// from the allocator; the allocator depends on nothing.
//
// The crate is `no_std`: it runs inside whatever program embeds it, on that
// program's memory. The test suite embeds it in an ordinary hosted process.
// =============================================================================

//! A cooperative toy-kernel runtime.
//!
//! ```
//! use nanokern_kernel::memory::RegionAllocator;
//!
//! // Any word-aligned byte region works as backing storage.
//! let mut backing = [0u64; 512];
//! let mut region = RegionAllocator::new();
//! unsafe { region.init(backing.as_mut_ptr().cast(), backing.len() * 8) };
//!
//! let p = region.alloc(64);
//! assert!(!p.is_null());
//! unsafe { region.free(p) };
//! ```

#![no_std]

pub mod arch;
pub mod memory;
pub mod task;
