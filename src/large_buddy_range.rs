//! The buddy allocator for chunk-sized and larger blocks.  Tree links
//! and colours live in the pagemap entries of the free chunks
//! themselves, so a free block costs no memory beyond the entry every
//! chunk already has.
//!
//! The same type serves two jobs: the process-wide pool at the bottom
//! of the shared tail (large `REFILL_BITS`, refilling from the PAL)
//! and the per-thread cache above the global lock (small
//! `REFILL_BITS`, low `MAX_BITS`, refilling from the shared pool in
//! batches to amortise locking).
use crate::bits;
use crate::buddy::{Buddy, BuddyRep};
use crate::capptr::{CapPtr, ChunkPtr};
use crate::config::{COALESCE_ACROSS_RESERVATIONS, MIN_CHUNK_BITS, MIN_CHUNK_SIZE};
use crate::pagemap::FlatPagemap;
use crate::range::Range;
use crate::rbtree::TreeRep;

/// Node storage in pagemap entries, keyed by chunk address.
#[derive(Clone, Copy)]
pub(crate) struct PagemapRep {
    pagemap: &'static FlatPagemap,
}

impl PagemapRep {
    pub(crate) fn new(pagemap: &'static FlatPagemap) -> Self {
        Self { pagemap }
    }
}

// SAFETY of the `entry_mut` calls below: tree nodes are free chunks,
// each present in exactly one tree, and a tree is only ever touched by
// its owning stage (per-thread, or under the global lock), so no two
// threads write one entry concurrently.
impl TreeRep for PagemapRep {
    fn left(&self, node: usize) -> usize {
        self.pagemap.get(node).link_left()
    }
    fn right(&self, node: usize) -> usize {
        self.pagemap.get(node).link_right()
    }
    fn set_left(&self, node: usize, link: usize) {
        unsafe { self.pagemap.entry_mut(node) }.set_link_left(link)
    }
    fn set_right(&self, node: usize, link: usize) {
        unsafe { self.pagemap.entry_mut(node) }.set_link_right(link)
    }
    fn is_red(&self, node: usize) -> bool {
        self.pagemap.get(node).is_red()
    }
    fn set_red(&self, node: usize, red: bool) {
        unsafe { self.pagemap.entry_mut(node) }.set_red(red)
    }
}

impl BuddyRep for PagemapRep {
    fn can_consolidate(&self, block: usize, size: usize) -> bool {
        // The higher half of the pair is `block | size`; merging the
        // pair crosses that chunk's left edge, so its boundary flag is
        // the one that matters.  The lenient read matters too: the
        // buddy of an edge block may lie outside the registered range.
        COALESCE_ACROSS_RESERVATIONS
            || !self.pagemap.get_or_default(block | size).is_boundary()
    }
}

pub struct LargeBuddyRange<R: Range, const REFILL_BITS: u32, const MAX_BITS: u32> {
    parent: R,
    buddy: Buddy<PagemapRep, MIN_CHUNK_BITS, MAX_BITS>,
    pagemap: &'static FlatPagemap,
    /// Whether each refill from the parent is an independent
    /// reservation whose first chunk must carry the boundary flag.
    /// True for the instance sitting on the PAL chain; false for
    /// caches refilling from the shared pool, whose refill edges are
    /// not reservation edges and must stay mergeable.
    flag_refills: bool,
}

impl<R: Range, const REFILL_BITS: u32, const MAX_BITS: u32>
    LargeBuddyRange<R, REFILL_BITS, MAX_BITS>
{
    /// A cache instance: refills are slices of an existing pool.
    pub fn new(parent: R, pagemap: &'static FlatPagemap) -> Self {
        Self {
            parent,
            buddy: Buddy::new(PagemapRep::new(pagemap)),
            pagemap,
            flag_refills: false,
        }
    }

    /// The pool instance: every refill is a fresh reservation, so its
    /// first chunk is flagged to stop coalescing across it.
    pub fn new_reservation_backed(parent: R, pagemap: &'static FlatPagemap) -> Self {
        Self {
            flag_refills: true,
            ..Self::new(parent, pagemap)
        }
    }

    /// Seeds the pool with an extent that did not come through the
    /// parent (the bounded-init heap).  The caller has already marked
    /// the reservation edge.
    pub(crate) fn add_seed(&mut self, base: usize, len: usize) {
        let Self { buddy, parent, .. } = self;
        buddy.add_range(base, len, &mut |addr, size| {
            let spill = CapPtr::from_address(addr).expect("spill blocks are non-null");
            parent.dealloc_range(spill, size);
        });
    }

    /// Everything currently free in this instance, for the state-hash
    /// tests and shape checks.
    #[cfg(test)]
    pub(crate) fn free_blocks(&self) -> Vec<(usize, usize)> {
        self.buddy.free_blocks()
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        self.buddy.check_invariants()
    }

    /// Pulls a batch from the parent and returns the first `size`
    /// bytes of it, shelving the rest.
    fn refill(&mut self, size: usize) -> Option<ChunkPtr> {
        if R::ALIGNED {
            // Prefer a full refill batch, but an exhausted parent may
            // still have smaller blocks: fall back towards the bare
            // request.
            let mut refill = size.max(1usize << REFILL_BITS);
            loop {
                if let Some(base) = self.parent.alloc_range(refill) {
                    let addr = base.address();

                    // First chunk of a fresh reservation: never merge
                    // left.
                    if self.flag_refills {
                        unsafe { self.pagemap.entry_mut(addr) }.set_boundary();
                    }

                    log::debug!("large buddy: refilled {} bytes at {:#x}", refill, addr);

                    let Self { buddy, parent, .. } = self;
                    buddy.add_range(addr + size, refill - size, &mut |spill, spill_size| {
                        let spill =
                            CapPtr::from_address(spill).expect("spill blocks are non-null");
                        parent.dealloc_range(spill, spill_size);
                    });
                    return Some(base);
                }

                if refill == size {
                    return None;
                }
                refill = (refill >> 1).max(size);
            }
        }

        // Unaligned parent: over-allocate so that an aligned `size`
        // block survives trimming, dissect, and serve from the trees.
        // On failure fall back to successively smaller requests.
        let mut refill = size.max(1usize << REFILL_BITS) << 1;
        loop {
            if let Some(base) = self.parent.alloc_range(refill) {
                let raw = base.address();
                let begin = bits::align_up(raw, MIN_CHUNK_SIZE);
                let end = bits::align_down(raw + refill, MIN_CHUNK_SIZE);

                if self.flag_refills {
                    unsafe { self.pagemap.entry_mut(begin) }.set_boundary();
                }

                log::debug!(
                    "large buddy: dissected unaligned refill [{:#x}, {:#x})",
                    begin,
                    end
                );

                let Self { buddy, parent, .. } = self;
                buddy.add_range(begin, end - begin, &mut |spill, spill_size| {
                    let spill = CapPtr::from_address(spill).expect("spill blocks are non-null");
                    parent.dealloc_range(spill, spill_size);
                });
                return self
                    .buddy
                    .remove_block(size)
                    .and_then(CapPtr::from_address);
            }

            if refill == size << 1 {
                return None;
            }
            refill = (refill >> 1).max(size << 1);
        }
    }
}

impl<R: Range, const REFILL_BITS: u32, const MAX_BITS: u32> Range
    for LargeBuddyRange<R, REFILL_BITS, MAX_BITS>
{
    const ALIGNED: bool = true;
    const CONCURRENCY_SAFE: bool = false;

    fn alloc_range(&mut self, size: usize) -> Option<ChunkPtr> {
        debug_assert!(size.is_power_of_two());
        debug_assert!(size >= MIN_CHUNK_SIZE);

        if size >= (1usize << MAX_BITS) - 1 {
            // Too large to track here.  An unaligned parent would hand
            // back a block we cannot fix up, so that is an exhaustion.
            if !R::ALIGNED {
                return None;
            }
            return self.parent.alloc_range(size);
        }

        if let Some(addr) = self.buddy.remove_block(size) {
            return CapPtr::from_address(addr);
        }

        self.refill(size)
    }

    fn dealloc_range(&mut self, base: ChunkPtr, size: usize) {
        debug_assert!(bits::is_aligned(base.address(), size));

        if size >= (1usize << MAX_BITS) - 1 {
            return self.parent.dealloc_range(base, size);
        }

        let Self { buddy, parent, .. } = self;
        if let Some(spill) = buddy.add_block(base.address(), size) {
            // Coalesced beyond what this instance tracks; pass the
            // whole block down.
            let spill = CapPtr::from_address(spill).expect("spill blocks are non-null");
            parent.dealloc_range(spill, 1usize << MAX_BITS);
        }
    }

    fn flush(&mut self) {
        let Self { buddy, parent, .. } = self;
        buddy.drain(&mut |addr, size| {
            let base = CapPtr::from_address(addr).expect("free blocks are non-null");
            parent.dealloc_range(base, size);
        });
        self.parent.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pal::Pal;
    use crate::pal_posix::PosixPal;
    use std::cell::RefCell;

    fn test_pagemap() -> &'static FlatPagemap {
        let pagemap = Box::leak(Box::new(FlatPagemap::new()));
        pagemap.init::<PosixPal>();
        pagemap
    }

    /// A parent serving disjoint aligned reservations, mimicking
    /// `PalRange` over an aligned PAL, with every handout recorded.
    struct AlignedParent {
        handed_out: RefCell<Vec<(usize, usize)>>,
        pagemap: &'static FlatPagemap,
        fail: bool,
    }

    impl AlignedParent {
        fn new(pagemap: &'static FlatPagemap) -> Self {
            Self {
                handed_out: RefCell::new(Vec::new()),
                pagemap,
                fail: false,
            }
        }
    }

    impl Range for AlignedParent {
        const ALIGNED: bool = true;
        const CONCURRENCY_SAFE: bool = false;

        fn alloc_range(&mut self, size: usize) -> Option<ChunkPtr> {
            if self.fail {
                return None;
            }
            let base = PosixPal::reserve_aligned(size)?;
            self.pagemap.register_range::<PosixPal>(base, size);
            self.handed_out.borrow_mut().push((base, size));
            CapPtr::from_address(base)
        }

        fn dealloc_range(&mut self, _base: ChunkPtr, _size: usize) {
            panic!("nothing should fall past the parent in these tests");
        }
    }

    /// Same, but page-aligned only, mimicking a PAL without aligned
    /// reservation.
    struct UnalignedParent {
        pagemap: &'static FlatPagemap,
    }

    impl Range for UnalignedParent {
        const ALIGNED: bool = false;
        const CONCURRENCY_SAFE: bool = false;

        fn alloc_range(&mut self, size: usize) -> Option<ChunkPtr> {
            // Reserve with page alignment and deliberately knock the
            // base off chunk alignment when possible.
            let base = PosixPal::reserve(size + PosixPal::PAGE_SIZE)?;
            let skewed = base + PosixPal::PAGE_SIZE;
            self.pagemap
                .register_range::<PosixPal>(bits::align_down(skewed, MIN_CHUNK_SIZE), size);
            CapPtr::from_address(skewed)
        }

        fn dealloc_range(&mut self, _base: ChunkPtr, _size: usize) {
            panic!("nothing should fall past the parent in these tests");
        }
    }

    const REFILL: usize = 1 << 18;

    type TestRange = LargeBuddyRange<AlignedParent, 18, 24>;

    #[test]
    fn refill_serves_aligned_blocks() {
        let pagemap = test_pagemap();
        let mut range = TestRange::new_reservation_backed(AlignedParent::new(pagemap), pagemap);

        let chunk = range.alloc_range(MIN_CHUNK_SIZE).expect("alloc should succeed");
        assert!(bits::is_aligned(chunk.address(), MIN_CHUNK_SIZE));

        // One parent refill serves many chunks.
        let more: Vec<_> = (0..7)
            .map(|_| range.alloc_range(MIN_CHUNK_SIZE).expect("alloc should succeed"))
            .collect();
        assert_eq!(range.parent.handed_out.borrow().len(), 1);
        assert_eq!(range.parent.handed_out.borrow()[0].1, REFILL);

        for block in more {
            range.dealloc_range(block, MIN_CHUNK_SIZE);
        }
        range.dealloc_range(chunk, MIN_CHUNK_SIZE);
        range.check_invariants();

        // Everything freed: the refill coalesced back into one block.
        assert_eq!(
            range.free_blocks(),
            vec![(range.parent.handed_out.borrow()[0].0, REFILL)]
        );
    }

    #[test]
    fn buddy_pairs_recombine_across_alloc() {
        let pagemap = test_pagemap();
        let mut range = TestRange::new_reservation_backed(AlignedParent::new(pagemap), pagemap);

        let a = range.alloc_range(MIN_CHUNK_SIZE).expect("alloc should succeed");
        let b = range.alloc_range(MIN_CHUNK_SIZE).expect("alloc should succeed");
        assert_eq!(b.address(), a.address() ^ MIN_CHUNK_SIZE, "buddies come out together");

        range.dealloc_range(a, MIN_CHUNK_SIZE);
        range.dealloc_range(b, MIN_CHUNK_SIZE);

        let merged = range
            .alloc_range(2 * MIN_CHUNK_SIZE)
            .expect("alloc should succeed");
        assert_eq!(merged.address(), a.address() & !(2 * MIN_CHUNK_SIZE - 1));
    }

    #[test]
    fn separate_reservations_never_merge() {
        let pagemap = test_pagemap();
        // Refill exactly one chunk at a time: every chunk is its own
        // PAL reservation.
        let mut range: LargeBuddyRange<AlignedParent, 14, 24> =
            LargeBuddyRange::new_reservation_backed(AlignedParent::new(pagemap), pagemap);

        let a = range.alloc_range(MIN_CHUNK_SIZE).expect("alloc should succeed");
        let b = range.alloc_range(MIN_CHUNK_SIZE).expect("alloc should succeed");

        range.dealloc_range(a, MIN_CHUNK_SIZE);
        range.dealloc_range(b, MIN_CHUNK_SIZE);
        range.check_invariants();

        // Both chunks are free; even if the kernel made them adjacent
        // buddies, the boundary flags keep them apart.
        assert_eq!(range.free_blocks().len(), 2);
    }

    #[test]
    fn oversized_requests_delegate() {
        let pagemap = test_pagemap();
        let mut range = TestRange::new_reservation_backed(AlignedParent::new(pagemap), pagemap);

        let huge = 1usize << 24;
        let block = range.alloc_range(huge).expect("alloc should succeed");
        assert!(bits::is_aligned(block.address(), huge));
        // Straight from the parent, not from the trees.
        assert_eq!(range.parent.handed_out.borrow().len(), 1);
        assert!(range.free_blocks().is_empty());
    }

    #[test]
    fn parent_exhaustion_propagates() {
        let pagemap = test_pagemap();
        let mut range = TestRange::new_reservation_backed(AlignedParent::new(pagemap), pagemap);
        range.parent.fail = true;

        assert!(range.alloc_range(MIN_CHUNK_SIZE).is_none());
    }

    #[test]
    fn unaligned_parent_is_dissected() {
        let pagemap = test_pagemap();
        let mut range: LargeBuddyRange<UnalignedParent, 18, 24> =
            LargeBuddyRange::new_reservation_backed(UnalignedParent { pagemap }, pagemap);

        for _ in 0..8 {
            let size = 1usize << 16;
            let block = range.alloc_range(size).expect("alloc should succeed");
            assert!(
                bits::is_aligned(block.address(), size),
                "alignment must be restored by dissection"
            );
        }
        range.check_invariants();
    }

    #[test]
    fn flush_returns_the_cache_to_the_parent() {
        use std::collections::HashMap;

        /// Records deallocations, serving from a fixed aligned pool.
        struct PoolParent {
            pagemap: &'static FlatPagemap,
            returned: RefCell<HashMap<usize, usize>>,
        }

        impl Range for PoolParent {
            const ALIGNED: bool = true;
            const CONCURRENCY_SAFE: bool = false;

            fn alloc_range(&mut self, size: usize) -> Option<ChunkPtr> {
                let base = PosixPal::reserve_aligned(size)?;
                self.pagemap.register_range::<PosixPal>(base, size);
                CapPtr::from_address(base)
            }

            fn dealloc_range(&mut self, base: ChunkPtr, size: usize) {
                self.returned.borrow_mut().insert(base.address(), size);
            }
        }

        let pagemap = test_pagemap();
        let mut range: LargeBuddyRange<PoolParent, 18, 24> = LargeBuddyRange::new(
            PoolParent {
                pagemap,
                returned: RefCell::new(HashMap::new()),
            },
            pagemap,
        );

        let block = range.alloc_range(MIN_CHUNK_SIZE).expect("alloc should succeed");
        range.dealloc_range(block, MIN_CHUNK_SIZE);
        range.flush();

        assert!(range.free_blocks().is_empty());
        let returned: usize = range.parent.returned.borrow().values().sum();
        assert_eq!(returned, REFILL, "the whole refill went back");
    }
}
