//! The buddy allocator for sub-chunk blocks, which is how front-end
//! metadata gets its odd sizes.  There is no pagemap entry at this
//! granularity, so the tree links live inside the free block itself:
//! left child at word zero, right child at word one, and the colour
//! bit tucked into the low bit of the left link (the minimum block is
//! two words, so links always have that bit to spare).
//!
//! Chunk-sized and larger requests pass straight through to the
//! parent; sub-blocks that coalesce back into a whole chunk are
//! returned to it.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use crate::bits;
use crate::buddy::{Buddy, BuddyRep};
use crate::capptr::{CapPtr, ChunkPtr};
use crate::config::{MIN_CHUNK_SIZE, MIN_SMALL_SIZE, SMALL_MAX_BITS, SMALL_MIN_BITS};
use crate::range::Range;
use crate::rbtree::TreeRep;

const RED_BIT: usize = 1;

/// Links stored in-band, in the first two words of the free block.
///
/// Every node handed to the tree is a free block owned by exactly one
/// buddy instance on one thread, committed and at least two words
/// long, so the raw reads and writes below are exclusive.
#[derive(Clone, Copy, Default)]
pub(crate) struct InbandRep;

impl InbandRep {
    #[inline]
    fn word(node: usize, index: usize) -> *mut usize {
        debug_assert!(bits::is_aligned(node, MIN_SMALL_SIZE));
        (node as *mut usize).wrapping_add(index)
    }
}

impl TreeRep for InbandRep {
    fn left(&self, node: usize) -> usize {
        unsafe { *Self::word(node, 0) & !RED_BIT }
    }
    fn right(&self, node: usize) -> usize {
        unsafe { *Self::word(node, 1) }
    }
    fn set_left(&self, node: usize, link: usize) {
        debug_assert!(link & RED_BIT == 0);
        unsafe {
            let word = Self::word(node, 0);
            *word = link | (*word & RED_BIT);
        }
    }
    fn set_right(&self, node: usize, link: usize) {
        unsafe { *Self::word(node, 1) = link }
    }
    fn is_red(&self, node: usize) -> bool {
        unsafe { *Self::word(node, 0) & RED_BIT != 0 }
    }
    fn set_red(&self, node: usize, red: bool) {
        unsafe {
            let word = Self::word(node, 0);
            if red {
                *word |= RED_BIT;
            } else {
                *word &= !RED_BIT;
            }
        }
    }
}

impl BuddyRep for InbandRep {
    fn can_consolidate(&self, _block: usize, _size: usize) -> bool {
        // Reservation edges are chunk-granular; they cannot fall
        // inside a chunk.
        true
    }
}

pub struct SmallBuddyRange<R: Range> {
    parent: R,
    buddy: Buddy<InbandRep, SMALL_MIN_BITS, SMALL_MAX_BITS>,
}

impl<R: Range> SmallBuddyRange<R> {
    pub fn new(parent: R) -> Self {
        Self {
            parent,
            buddy: Buddy::new(InbandRep),
        }
    }

    fn add_sub_range(&mut self, base: usize, len: usize) {
        let Self { buddy, parent } = self;
        buddy.add_range(base, len, &mut |spill, spill_size| {
            // Sub-blocks reassembled a whole chunk; give it back.
            let spill = CapPtr::from_address(spill).expect("spill blocks are non-null");
            parent.dealloc_range(spill, spill_size);
        });
    }

    /// Allocates `size` bytes, where `size` need not be a power of
    /// two: the block is rounded up, the first `size` bytes (at word
    /// granularity) are returned, and the tail goes back into the
    /// trees.  This is what keeps odd-sized metadata from wasting half
    /// a power of two.
    #[requires(size > 0, "Zero-sized blocks do not exist.")]
    #[ensures(ret.is_some() -> ret.as_ref().unwrap().address() % MIN_SMALL_SIZE == 0,
              "Blocks are at least word-pair aligned.")]
    pub fn alloc_range_with_leftover(&mut self, size: usize) -> Option<ChunkPtr> {
        let rounded = bits::align_up(size.max(MIN_SMALL_SIZE), MIN_SMALL_SIZE);
        let block = bits::next_pow2(rounded);

        let base = self.alloc_range(block)?;
        self.add_sub_range(base.address() + rounded, block - rounded);
        Some(base)
    }

    /// The inverse of `alloc_range_with_leftover`.
    #[requires(size > 0, "Zero-sized blocks do not exist.")]
    #[requires(base.address() % MIN_SMALL_SIZE == 0,
               "Only blocks this stage handed out come back.")]
    pub fn dealloc_range_with_leftover(&mut self, base: ChunkPtr, size: usize) {
        let rounded = bits::align_up(size.max(MIN_SMALL_SIZE), MIN_SMALL_SIZE);
        self.add_sub_range(base.address(), rounded);
    }

    #[cfg(test)]
    pub(crate) fn free_blocks(&self) -> Vec<(usize, usize)> {
        self.buddy.free_blocks()
    }
}

impl<R: Range> Range for SmallBuddyRange<R> {
    const ALIGNED: bool = true;
    const CONCURRENCY_SAFE: bool = false;

    fn alloc_range(&mut self, size: usize) -> Option<ChunkPtr> {
        debug_assert!(size.is_power_of_two());
        debug_assert!(size >= MIN_SMALL_SIZE);

        if size >= MIN_CHUNK_SIZE {
            return self.parent.alloc_range(size);
        }

        if let Some(addr) = self.buddy.remove_block(size) {
            return CapPtr::from_address(addr);
        }

        // Carve a fresh chunk: serve the head, shelve the rest.
        let chunk = self.parent.alloc_range(MIN_CHUNK_SIZE)?;
        self.add_sub_range(chunk.address() + size, MIN_CHUNK_SIZE - size);
        Some(chunk)
    }

    fn dealloc_range(&mut self, base: ChunkPtr, size: usize) {
        debug_assert!(bits::is_aligned(base.address(), size));

        if size >= MIN_CHUNK_SIZE {
            return self.parent.dealloc_range(base, size);
        }

        let Self { buddy, parent } = self;
        if let Some(spill) = buddy.add_block(base.address(), size) {
            let spill = CapPtr::from_address(spill).expect("spill blocks are non-null");
            parent.dealloc_range(spill, MIN_CHUNK_SIZE);
        }
    }

    fn flush(&mut self) {
        // Partially carved chunks cannot be reassembled on demand, so
        // sub-chunk blocks stay where they are; only the parents get
        // flushed.
        self.parent.flush()
    }
}
