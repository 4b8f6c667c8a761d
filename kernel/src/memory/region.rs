// =============================================================================
// nanokern — Region Allocator
// =============================================================================
//
// This module provides dynamic memory allocation over a single contiguous
// byte region handed to it at initialization. Every byte of the region
// belongs to exactly one block, and each block carries its bookkeeping
// inline:
//
//   ┌────────┬─────────────┐┌────────┬──────────────────┐┌────────┬────────┐
//   │ header │   payload   ││ header │     payload      ││ header │payload │
//   │  USED  │ (caller's)  ││  FREE  │ {larger,smaller} ││  USED  │        │
//   └────────┴─────────────┘└────────┴──────────────────┘└────────┴────────┘
//
// DESIGN: Two structures over one region
// ======================================
//
// The PRIMARY structure is the address-ordered block chain. Each header
// stores a back-link to its predecessor; the successor is implicit at
// `header + HEADER_SIZE + size`, checked against the end-of-region sentinel.
// Not storing a next pointer keeps the header at three words. The chain is
// what makes coalescing cheap: a freed block can reach both neighbors
// directly.
//
// The SECONDARY structure is the free index: a doubly linked list of free
// blocks sorted by decreasing payload size, threaded through the first two
// payload words of each free block. Keeping the links in the payload costs
// nothing — a free payload belongs to nobody — but it does force a minimum
// payload size, so undersized requests are grown until the links fit.
//
// ALLOCATION ALGORITHM (worst-fit):
//   The biggest free block is always at the index head, so the search is a
//   head inspection. If the winning block is big enough to leave a useful
//   remainder, split it and index the remainder; otherwise hand the slack to
//   the caller.
//
// DEALLOCATION ALGORITHM:
//   Tag the block free, then merge with a free predecessor and a free
//   successor. Every merge changes a size, so the survivor is re-inserted
//   into the index at its new position.
//
// WHY NOT A SKIP LIST FOR THE INDEX?
//   Sorted insertion is O(n) in the number of free blocks. A skip list would
//   fix that but fatten every block's minimum footprint, and the fraction of
//   the region left for callers is the figure of merit here.
//
// THREAD SAFETY:
//   A `RegionAllocator` is a single-threaded structure. The process-wide
//   instance at the bottom of this file is wrapped in a spin `Mutex`, which
//   makes that contract enforceable; execution is cooperative, so the lock
//   is never contended.
//
// =============================================================================

use core::ptr;

use spin::Mutex;

/// Tag of a block currently owned by a caller.
const MAGIC_USED: u32 = 0x5553_4544; // "USED"

/// Tag of a block held by the free index.
const MAGIC_FREE: u32 = 0x4652_4545; // "FREE"

/// Alignment unit: request sizes are rounded up to this, so every payload
/// the allocator hands out is word-aligned.
const WORD: usize = size_of::<usize>();

/// Bookkeeping prefix of every block. Three words; the successor is implicit
/// at `self + HEADER_SIZE + size`.
#[repr(C)]
struct BlockHeader {
    /// Immediately preceding (lower-address) block, or null for the first.
    prev: *mut BlockHeader,
    /// [`MAGIC_USED`] or [`MAGIC_FREE`]. Anything else is not a header.
    magic: u32,
    /// Payload bytes (the header itself excluded). Always a multiple of
    /// [`WORD`].
    size: usize,
}

/// Free-index links, living in the first payload bytes of a free block.
#[repr(C)]
struct FreeLinks {
    /// Towards the index head (larger or equal blocks).
    larger: *mut BlockHeader,
    /// Away from the index head (smaller or equal blocks).
    smaller: *mut BlockHeader,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();
const LINKS_SIZE: usize = size_of::<FreeLinks>();

/// Smallest whole free block (header + index links) worth keeping. A split
/// that would leave less than this hands the slack to the caller instead.
const MIN_FREE_BLOCK: usize = HEADER_SIZE + LINKS_SIZE;

/// An in-place allocator over one contiguous byte region.
///
/// The region is supplied by the caller via [`init`](Self::init) and must
/// outlive every allocation made from it. All bookkeeping is stored inside
/// the region itself; the struct holds only the entry points into it.
pub struct RegionAllocator {
    /// First block of the region (lowest address), or null before `init`.
    first: *mut BlockHeader,

    /// One past the managed region; the "no successor" sentinel.
    end: *mut u8,

    /// Head of the free index: the largest free block, or null when full.
    free_head: *mut BlockHeader,

    /// Total payload bytes currently handed out (for statistics).
    allocated_bytes: usize,

    /// Managed region size in bytes.
    total_bytes: usize,
}

// SAFETY: the raw pointers all target the caller-provided region; the
// structure is only ever mutated behind the module's Mutex (or by an
// exclusive borrow).
unsafe impl Send for RegionAllocator {}

impl RegionAllocator {
    /// Creates an uninitialized allocator. Must call [`init`](Self::init)
    /// before use; until then every `alloc` reports exhaustion.
    pub const fn new() -> Self {
        Self {
            first: ptr::null_mut(),
            end: ptr::null_mut(),
            free_head: ptr::null_mut(),
            allocated_bytes: 0,
            total_bytes: 0,
        }
    }

    /// Declares the region to be managed and installs one free block
    /// spanning it (less one header). Any prior state is discarded.
    ///
    /// The managed extent is `size` floored to a multiple of [`WORD`], so
    /// block sizes stay word-aligned throughout.
    ///
    /// # Panics
    /// If `start` is not word-aligned, or the region cannot hold one header
    /// plus the minimum free block.
    ///
    /// # Safety
    /// `start..start + size` must be writable, unused by anything else, and
    /// must outlive every allocation made from this allocator.
    pub unsafe fn init(&mut self, start: *mut u8, size: usize) {
        assert!(
            start as usize % align_of::<BlockHeader>() == 0,
            "region start must be word-aligned"
        );
        let size = size & !(WORD - 1);
        assert!(
            size > HEADER_SIZE + MIN_FREE_BLOCK,
            "region too small to manage"
        );

        let first = start.cast::<BlockHeader>();
        // SAFETY: the caller vouches for the region; the header and the
        // index links both fit (asserted above).
        unsafe {
            (*first).prev = ptr::null_mut();
            (*first).magic = MAGIC_FREE;
            (*first).size = size - HEADER_SIZE;

            self.first = first;
            self.end = start.add(size);
            self.free_head = ptr::null_mut();
            self.allocated_bytes = 0;
            self.total_bytes = size;

            self.index_insert(first);
        }

        if cfg!(debug_assertions) {
            self.check_consistency();
        }
    }

    /// Allocates a block of at least `size` bytes and returns its payload
    /// address, or null if no free block is large enough.
    ///
    /// The request is first grown to the minimum payload (so the block can
    /// re-enter the free index when freed) and rounded up to [`WORD`]; the
    /// returned payload is therefore always word-aligned.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        let size = align_up(size.max(LINKS_SIZE), WORD);

        // Worst fit: the index keeps the largest free block at its head, so
        // the placement decision is a single comparison.
        let head = self.free_head;

        // SAFETY: `head` and everything reachable from it are inside the
        // managed region and uphold the chain invariants.
        unsafe {
            if head.is_null() || (*head).size < size {
                return ptr::null_mut();
            }

            let balance = (*head).size - size;
            if balance > MIN_FREE_BLOCK {
                // Carve the tail of the winner into a new free block and
                // splice it into both the chain and the index.
                let carved = payload_of(head).add(size).cast::<BlockHeader>();
                let succ = self.next_of(head);
                (*carved).prev = head;
                (*carved).magic = MAGIC_FREE;
                (*carved).size = balance - HEADER_SIZE;
                if !succ.is_null() {
                    (*succ).prev = carved;
                }
                self.index_insert(carved);
                (*head).size = size;
            }
            // Otherwise the remainder could not stand alone as a free
            // block; the caller gets the slack.

            self.index_remove(head);
            (*head).magic = MAGIC_USED;
            self.allocated_bytes += (*head).size;

            if cfg!(debug_assertions) {
                self.check_consistency();
            }
            payload_of(head)
        }
    }

    /// Releases a payload previously returned by [`alloc`](Self::alloc).
    ///
    /// A null `ptr` is a no-op. If the bytes immediately below `ptr` do not
    /// carry the in-use tag — a foreign pointer, or a second free of the
    /// same payload — the call is silently ignored.
    ///
    /// # Safety
    /// `ptr` must be null, a payload address obtained from this allocator,
    /// or a pointer with at least [`HEADER_SIZE`] readable bytes below it
    /// (those bytes are inspected by the sanity check).
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        // SAFETY: per the caller contract the header bytes are readable;
        // everything past the magic test is a genuine block of ours.
        unsafe {
            let mut block = ptr.sub(HEADER_SIZE).cast::<BlockHeader>();
            if (*block).magic != MAGIC_USED {
                return;
            }

            self.allocated_bytes -= (*block).size;
            (*block).magic = MAGIC_FREE;

            let pred = (*block).prev;
            let succ = self.next_of(block);

            if !pred.is_null() && (*pred).magic == MAGIC_FREE {
                // Merge backward: this block's header disappears into the
                // predecessor's payload.
                (*block).magic = 0;
                (*pred).size += HEADER_SIZE + (*block).size;
                if !succ.is_null() {
                    (*succ).prev = pred;
                }
                block = pred;
                // The predecessor grew; its index position is stale.
                self.index_remove(block);
                self.index_insert(block);
            } else {
                self.index_insert(block);
            }

            if !succ.is_null() && (*succ).magic == MAGIC_FREE {
                // Merge forward: the successor's header disappears.
                self.index_remove(succ);
                let succ2 = self.next_of(succ);
                (*succ).magic = 0;
                (*block).size += HEADER_SIZE + (*succ).size;
                if !succ2.is_null() {
                    (*succ2).prev = block;
                }
                self.index_remove(block);
                self.index_insert(block);
            }
        }

        if cfg!(debug_assertions) {
            self.check_consistency();
        }
    }

    /// Payload bytes currently handed out.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Managed region size in bytes.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Number of blocks in the free index.
    pub fn free_block_count(&self) -> usize {
        let mut count = 0;
        let mut node = self.free_head;
        while !node.is_null() {
            count += 1;
            // SAFETY: index nodes are valid free blocks.
            node = unsafe { (*links_of(node)).smaller };
        }
        count
    }

    /// Payload size of the largest free block, or 0 when the region is full.
    pub fn largest_free_block(&self) -> usize {
        if self.free_head.is_null() {
            0
        } else {
            // SAFETY: the index head is a valid free block.
            unsafe { (*self.free_head).size }
        }
    }

    /// Walks both the address-order chain and the free index and asserts
    /// every structural invariant. Runs automatically after each mutation in
    /// debug builds; release builds only pay for it when calling it
    /// explicitly.
    ///
    /// # Panics
    /// On any violated invariant.
    pub fn check_consistency(&self) {
        if self.first.is_null() {
            return;
        }

        // SAFETY: read-only walk over structures this allocator owns.
        unsafe {
            // Pass 1: the address-order chain covers the region exactly.
            let mut covered = 0;
            let mut chain_free = 0;
            let mut pred: *mut BlockHeader = ptr::null_mut();
            let mut block = self.first;
            while !block.is_null() {
                let magic = (*block).magic;
                let size = (*block).size;
                assert!(
                    magic == MAGIC_USED || magic == MAGIC_FREE,
                    "block {block:p}: bad magic {magic:#010x}"
                );
                assert!(size % WORD == 0, "block {block:p}: unaligned size {size}");
                assert!(size >= LINKS_SIZE, "block {block:p}: undersized payload");
                assert!(
                    (*block).prev == pred,
                    "block {block:p}: back-link does not match the chain"
                );

                covered += HEADER_SIZE + size;
                let next = self.next_of(block);
                if !next.is_null() {
                    assert!(next > block, "chain addresses must increase");
                }

                if magic == MAGIC_FREE {
                    chain_free += 1;
                    let links = links_of(block);
                    if (*links).larger.is_null() {
                        assert!(
                            self.free_head == block,
                            "free block {block:p} orphaned from the index"
                        );
                    } else {
                        assert!((*(*links).larger).magic == MAGIC_FREE);
                        assert!((*(*links).larger).size >= size);
                    }
                    if !(*links).smaller.is_null() {
                        assert!((*(*links).smaller).magic == MAGIC_FREE);
                        assert!((*(*links).smaller).size <= size);
                    }
                    // Coalescing leaves no two adjacent free blocks.
                    if !pred.is_null() {
                        assert!(
                            (*pred).magic == MAGIC_USED,
                            "adjacent free blocks at {block:p}"
                        );
                    }
                }

                pred = block;
                block = next;
            }
            assert!(
                covered == self.total_bytes,
                "blocks cover {covered} of {} managed bytes",
                self.total_bytes
            );

            // Pass 2: the free index is exactly the free blocks, in
            // non-increasing size order with consistent back-links.
            let mut index_len = 0;
            let mut larger: *mut BlockHeader = ptr::null_mut();
            let mut node = self.free_head;
            while !node.is_null() {
                index_len += 1;
                assert!((*node).magic == MAGIC_FREE, "used block in the free index");
                let links = links_of(node);
                assert!(
                    (*links).larger == larger,
                    "free index back-link astray at {node:p}"
                );
                if !larger.is_null() {
                    assert!(
                        (*larger).size >= (*node).size,
                        "free index out of order at {node:p}"
                    );
                }
                larger = node;
                node = (*links).smaller;
            }
            assert!(
                index_len == chain_free,
                "free index holds {index_len} blocks, chain has {chain_free}"
            );
        }
    }

    /// Successor of `block` in address order, or null at the region's end.
    unsafe fn next_of(&self, block: *mut BlockHeader) -> *mut BlockHeader {
        // SAFETY: headers always describe a block ending at or before the
        // sentinel, so the computed address stays in bounds.
        unsafe {
            let next = block.cast::<u8>().add(HEADER_SIZE + (*block).size);
            if next == self.end {
                ptr::null_mut()
            } else {
                next.cast::<BlockHeader>()
            }
        }
    }

    /// Inserts a free block into the index at its sorted position: just
    /// before the first node of equal or smaller size.
    unsafe fn index_insert(&mut self, block: *mut BlockHeader) {
        // SAFETY: `block` is a free block with link space; the index nodes
        // walked are valid free blocks.
        unsafe {
            let mut larger: *mut BlockHeader = ptr::null_mut();
            let mut smaller = self.free_head;
            while !smaller.is_null() && (*block).size < (*smaller).size {
                larger = smaller;
                smaller = (*links_of(smaller)).smaller;
            }

            let links = links_of(block);
            (*links).larger = larger;
            (*links).smaller = smaller;
            if larger.is_null() {
                self.free_head = block;
            } else {
                (*links_of(larger)).smaller = block;
            }
            if !smaller.is_null() {
                (*links_of(smaller)).larger = block;
            }
        }
    }

    /// Unthreads a block from the free index.
    unsafe fn index_remove(&mut self, block: *mut BlockHeader) {
        // SAFETY: `block` is threaded into the index, so its neighbors (when
        // present) are valid free blocks.
        unsafe {
            let links = links_of(block);
            let larger = (*links).larger;
            let smaller = (*links).smaller;
            if !smaller.is_null() {
                (*links_of(smaller)).larger = larger;
            }
            if larger.is_null() {
                self.free_head = smaller;
            } else {
                (*links_of(larger)).smaller = smaller;
            }
            (*links).larger = ptr::null_mut();
            (*links).smaller = ptr::null_mut();
        }
    }
}

/// First payload byte of a block.
unsafe fn payload_of(block: *mut BlockHeader) -> *mut u8 {
    // SAFETY: every block is at least header + minimum payload long.
    unsafe { block.cast::<u8>().add(HEADER_SIZE) }
}

/// View of a free block's payload head as its index links.
unsafe fn links_of(block: *mut BlockHeader) -> *mut FreeLinks {
    // SAFETY: headers are word-aligned and `HEADER_SIZE` is a multiple of
    // the word size, so the payload is aligned for `FreeLinks`; the minimum
    // payload guarantees the links fit.
    unsafe { payload_of(block).cast::<FreeLinks>() }
}

/// Aligns `value` up to the nearest multiple of `align`.
///
/// `align` must be a power of two.
#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

// =============================================================================
// The process-wide allocator
// =============================================================================

/// The region allocator the scheduler draws process records and stacks from.
///
/// Execution is cooperative and strictly serial; the Mutex exists to make
/// the single-threaded mutation contract enforceable, not because there is
/// contention.
static REGION: Mutex<RegionAllocator> = Mutex::new(RegionAllocator::new());

/// Points the process-wide allocator at a region. See
/// [`RegionAllocator::init`] for the contract.
///
/// # Safety
/// As [`RegionAllocator::init`]; additionally nothing may still hold
/// payloads from a previously managed region.
pub unsafe fn init(start: *mut u8, size: usize) {
    // SAFETY: forwarded caller contract.
    unsafe { REGION.lock().init(start, size) };
    log::debug!("region allocator managing {size} bytes at {start:p}");
}

/// Allocates from the process-wide region. Null when out of memory.
pub fn alloc(size: usize) -> *mut u8 {
    REGION.lock().alloc(size)
}

/// Frees a payload back to the process-wide region.
///
/// # Safety
/// As [`RegionAllocator::free`].
pub unsafe fn free(ptr: *mut u8) {
    // SAFETY: forwarded caller contract.
    unsafe { REGION.lock().free(ptr) }
}

/// Payload bytes currently handed out by the process-wide region.
pub fn allocated_bytes() -> usize {
    REGION.lock().allocated_bytes()
}

/// Managed size of the process-wide region.
pub fn total_bytes() -> usize {
    REGION.lock().total_bytes()
}

/// Free blocks currently indexed in the process-wide region.
pub fn free_block_count() -> usize {
    REGION.lock().free_block_count()
}

/// Largest free payload in the process-wide region.
pub fn largest_free_block() -> usize {
    REGION.lock().largest_free_block()
}

/// Runs the sanity validator against the process-wide region.
pub fn check_consistency() {
    REGION.lock().check_consistency()
}

// =============================================================================
// Tests
// =============================================================================
