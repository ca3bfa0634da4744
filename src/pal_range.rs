//! The leaf of every pipeline: fresh address space straight from the
//! PAL.  Stateless; reservations are forever (the backend returns
//! commitment, never address space).
use std::marker::PhantomData;

use crate::capptr::{ArenaPtr, CapPtr, ChunkPtr};
use crate::config::MIN_CHUNK_SIZE;
use crate::pal::{Pal, PalFeatures};
use crate::range::Range;

pub struct PalRange<P: Pal> {
    _pal: PhantomData<P>,
}

impl<P: Pal> PalRange<P> {
    pub fn new() -> Self {
        Self { _pal: PhantomData }
    }
}

impl<P: Pal> Range for PalRange<P> {
    const ALIGNED: bool = P::FEATURES.contains(PalFeatures::ALIGNED_ALLOCATION);
    const CONCURRENCY_SAFE: bool = true;

    fn alloc_range(&mut self, size: usize) -> Option<ChunkPtr> {
        debug_assert!(size.is_power_of_two());
        debug_assert!(size >= MIN_CHUNK_SIZE);
        debug_assert!(size % P::PAGE_SIZE == 0);

        if P::FEATURES.contains(PalFeatures::NO_ALLOCATION) {
            return None;
        }

        let base = if Self::ALIGNED {
            P::reserve_aligned(size)?
        } else {
            P::reserve(size)?
        };

        log::debug!("pal range: reserved {} bytes at {:#x}", size, base);

        let arena: ArenaPtr = CapPtr::from_address(base)?;
        Some(arena.shrink())
    }

    fn dealloc_range(&mut self, base: ChunkPtr, size: usize) {
        // Address space flows in one direction only; nothing above
        // this stage may push blocks back into the PAL.
        let _ = (base, size);
        P::error("address space cannot be returned to the platform")
    }
}
