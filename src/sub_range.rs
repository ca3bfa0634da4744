//! Serves each request from a random slice of a much larger parent
//! allocation.  Metadata allocated through this stage ends up
//! scattered inside its arena with unmapped space around it, which
//! takes adjacent-overflow corruption of metadata off the table.
use std::marker::PhantomData;

use crate::capptr::ChunkPtr;
use crate::config::SUB_RANGE_RATIO_BITS;
use crate::pal::Pal;
use crate::range::Range;

pub struct SubRange<R: Range, P: Pal> {
    parent: R,
    _pal: PhantomData<P>,
}

impl<R: Range, P: Pal> SubRange<R, P> {
    pub fn new(parent: R) -> Self {
        Self {
            parent,
            _pal: PhantomData,
        }
    }
}

impl<R: Range + Clone, P: Pal> Clone for SubRange<R, P> {
    fn clone(&self) -> Self {
        Self {
            parent: self.parent.clone(),
            _pal: PhantomData,
        }
    }
}

impl<R: Range + Copy, P: Pal> Copy for SubRange<R, P> {}

impl<R: Range, P: Pal> Range for SubRange<R, P> {
    const ALIGNED: bool = true;
    const CONCURRENCY_SAFE: bool = R::CONCURRENCY_SAFE;

    fn alloc_range(&mut self, size: usize) -> Option<ChunkPtr> {
        debug_assert!(size.is_power_of_two());
        debug_assert!(R::ALIGNED, "sub-range slicing needs an aligned parent");

        let parent_size = size.checked_shl(SUB_RANGE_RATIO_BITS)?;
        let base = self.parent.alloc_range(parent_size)?;

        // Pick a size-aligned slot, excluding the first and the last:
        // the slice always has dead space on both sides.
        let slots = (1usize << SUB_RANGE_RATIO_BITS) - 2;
        let slot = 1 + (P::get_entropy64() as usize) % slots;

        Some(base.offset_bytes(slot * size))
    }

    /// Blocks coalesced back out of the child stages are donated to
    /// the parent pool; they no longer correspond to any slice this
    /// stage picked, but they are committed, registered memory and
    /// the pool can serve them like any other block.
    fn dealloc_range(&mut self, base: ChunkPtr, size: usize) {
        self.parent.dealloc_range(base, size)
    }

    fn flush(&mut self) {
        self.parent.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capptr::CapPtr;
    use crate::config::MIN_CHUNK_SIZE;
    use crate::pal::{Pal, PalFeatures};

    struct FakeEntropyPal;

    static ENTROPY_FEED: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

    impl Pal for FakeEntropyPal {
        const FEATURES: PalFeatures = PalFeatures::ENTROPY;
        const PAGE_SIZE: usize = 4096;

        fn reserve(_size: usize) -> Option<usize> {
            None
        }
        fn notify_using(_base: usize, _size: usize, _zero: bool) {}
        fn notify_not_using(_base: usize, _size: usize) {}
        fn get_entropy64() -> u64 {
            ENTROPY_FEED.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        }
    }

    struct BumpParent {
        next: usize,
        last_size: usize,
    }

    impl Range for BumpParent {
        const ALIGNED: bool = true;
        const CONCURRENCY_SAFE: bool = false;

        fn alloc_range(&mut self, size: usize) -> Option<ChunkPtr> {
            self.last_size = size;
            let base = crate::bits::align_up(self.next, size);
            self.next = base + size;
            CapPtr::from_address(base)
        }

        fn dealloc_range(&mut self, _base: ChunkPtr, _size: usize) {}
    }

    #[test]
    fn slices_stay_inside_and_avoid_the_edges() {
        let mut range: SubRange<BumpParent, FakeEntropyPal> = SubRange::new(BumpParent {
            next: 1 << 26,
            last_size: 0,
        });

        let size = MIN_CHUNK_SIZE;
        let ratio = 1usize << SUB_RANGE_RATIO_BITS;

        for _ in 0..64 {
            let slice = range.alloc_range(size).expect("alloc should succeed");
            let parent_size = size * ratio;
            assert_eq!(range.parent.last_size, parent_size);

            let parent_base = crate::bits::align_down(slice.address(), parent_size);
            let offset = slice.address() - parent_base;

            assert_eq!(offset % size, 0, "slice must stay size-aligned");
            assert!(offset >= size, "the first slot is excluded");
            assert!(
                offset <= parent_size - 2 * size,
                "the last slot is excluded"
            );
        }
    }
}
