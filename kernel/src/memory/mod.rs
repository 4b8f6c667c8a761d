// =============================================================================
// nanokern — Memory Subsystem
// =============================================================================
//
// The memory subsystem partitions one caller-supplied byte region into
// variable-sized blocks. There is no paging and no frame management — the
// region is the whole memory universe, and every piece of bookkeeping lives
// inside it:
//
//   region.rs — the region allocator (inline block headers, size-sorted free
//               index, worst-fit placement, coalescing frees) plus the
//               spin-locked process-wide instance the scheduler draws from.
//
// This module only exposes what's needed. Internal details stay private.
// =============================================================================

pub mod region;

pub use region::{
    RegionAllocator, alloc, allocated_bytes, check_consistency, free, free_block_count, init,
    largest_free_block, total_bytes,
};
