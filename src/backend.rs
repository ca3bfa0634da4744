//! The top of the backend: owns the pagemap, the shared pool, and the
//! decay bookkeeping, and exposes the chunk allocation interface the
//! front end builds slabs out of.  Each thread brings a `LocalState`
//! with its private object and metadata pipelines; everything the
//! threads share sits behind the global range's lock or is atomic.
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

use std::ptr::NonNull;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::debug_chunk_map;

use crate::bits;
use crate::capptr::{AllocPtr, CapPtr, ChunkPtr};
use crate::commit_range::CommitRange;
use crate::config::{
    GLOBAL_REFILL_BITS, LOCAL_MAX_BITS, LOCAL_REFILL_BITS, MAX_SIZE_BITS, MIN_CHUNK_SIZE,
    MIN_SMALL_SIZE,
};
use crate::decay_range::{self, DecayRange, DecayState, EpochControl};
use crate::global_range::GlobalRange;
use crate::large_buddy_range::LargeBuddyRange;
use crate::pagemap::FlatPagemap;
use crate::pal::{set_oom_errno, Pal};
use crate::pal_range::PalRange;
use crate::range::Range;
use crate::register_range::PagemapRegisterRange;
use crate::small_buddy_range::SmallBuddyRange;
use crate::stats_range::{AllocStats, StatsRange};
#[cfg(feature = "isolate_metadata")]
use crate::sub_range::SubRange;

/// What the backend knows about the front end's per-chunk record: it
/// can point it at its chunk and ask for that chunk back.  Everything
/// else in the type is the front end's business.
pub trait SlabMeta: Default + 'static {
    fn set_chunk(&mut self, chunk: usize);
    fn chunk(&self) -> usize;
}

/// The shared tail under the global lock: stats over the process-wide
/// buddy pool, refilled from the PAL with every fresh interval
/// registered in the pagemap.
type SharedTail<P> = StatsRange<
    LargeBuddyRange<PagemapRegisterRange<PalRange<P>, P>, GLOBAL_REFILL_BITS, MAX_SIZE_BITS>,
>;

type SharedPool<P> = GlobalRange<SharedTail<P>>;
type PoolHandle<P> = &'static SharedPool<P>;
type CommittedPool<P> = CommitRange<PoolHandle<P>, P>;

/// A thread's object pipeline: sub-chunk carving over a local large
/// cache over the decay stage, all feeding the committed view of the
/// shared pool.
type ObjectRange<P> = SmallBuddyRange<
    LargeBuddyRange<DecayRange<CommittedPool<P>, P>, LOCAL_REFILL_BITS, LOCAL_MAX_BITS>,
>;

/// A thread's metadata pipeline.  With `isolate_metadata` on, refills
/// come from randomised slices of much larger reservations, committed
/// only where the slice landed.
#[cfg(feature = "isolate_metadata")]
type MetaRange<P> = SmallBuddyRange<
    LargeBuddyRange<
        CommitRange<SubRange<PoolHandle<P>, P>, P>,
        LOCAL_REFILL_BITS,
        LOCAL_MAX_BITS,
    >,
>;
#[cfg(not(feature = "isolate_metadata"))]
type MetaRange<P> = SmallBuddyRange<
    LargeBuddyRange<CommittedPool<P>, LOCAL_REFILL_BITS, LOCAL_MAX_BITS>,
>;

/// Per-thread backend state.  Creating one is cheap apart from the
/// (immortal) decay state; the caches fill on first use.
pub struct LocalState<P: Pal> {
    object: ObjectRange<P>,
    meta: MetaRange<P>,
}

pub struct Backend<P: Pal> {
    pagemap: &'static FlatPagemap,
    stats: &'static AllocStats,
    pool: SharedPool<P>,
    epochs: EpochControl,
}

impl<P: Pal> Backend<P> {
    /// Builds an immortal backend.  `init` (or `init_range`) must run
    /// before the first allocation.
    pub fn new() -> &'static Backend<P> {
        let pagemap: &'static FlatPagemap = Box::leak(Box::new(FlatPagemap::new()));
        let stats: &'static AllocStats = Box::leak(Box::new(AllocStats::new()));

        let tail = StatsRange::new(
            LargeBuddyRange::new_reservation_backed(
                PagemapRegisterRange::new(PalRange::new(), pagemap),
                pagemap,
            ),
            stats,
        );

        Box::leak(Box::new(Backend {
            pagemap,
            stats,
            pool: GlobalRange::new(tail),
            epochs: EpochControl::new(),
        }))
    }

    /// Initialises the pagemap over the whole address space; the heap
    /// grows through the PAL on demand.
    pub fn init(&'static self) {
        self.pagemap.init::<P>();
    }

    /// Initialises the backend over one pre-reserved range: the
    /// pagemap takes the front of it and the rest seeds the shared
    /// pool.  With a `NO_ALLOCATION` platform this is the whole heap
    /// the process will ever have.
    pub fn init_range(&'static self, base: usize, length: usize) {
        let (heap_base, heap_length) = self.pagemap.init_bounded::<P>(base, length);
        let heap_length = bits::align_down(heap_length, MIN_CHUNK_SIZE);

        unsafe { self.pagemap.entry_mut(heap_base) }.set_boundary();
        self.pool.with_inner(|tail| {
            tail.parent_mut().add_seed(heap_base, heap_length);
        });

        log::debug!(
            "backend: seeded [{:#x}, {:#x}) into the shared pool",
            heap_base,
            heap_base + heap_length
        );
    }

    /// The table behind `get_metaentry`-style queries: the front end
    /// reads ownership straight out of it.
    #[inline]
    pub fn pagemap(&self) -> &'static FlatPagemap {
        self.pagemap
    }

    #[inline]
    pub fn get_current_usage(&self) -> usize {
        self.stats.current()
    }

    #[inline]
    pub fn get_peak_usage(&self) -> usize {
        self.stats.peak()
    }

    /// One decay tick: advance the epoch and return every thread's
    /// oldest cached chunks to the pool.  The PAL timer calls this;
    /// tests and low-memory handlers may too.
    pub fn decay_tick(&'static self) {
        let mut pool: CommittedPool<P> = CommitRange::new(&self.pool);
        decay_range::advance_and_flush(&self.epochs, &mut pool);
    }

    /// Allocates a block for front-end metadata.  Without a local
    /// state this falls back to the (concurrency-safe) committed pool
    /// at chunk granularity.
    pub fn alloc_meta_data<T>(
        &'static self,
        local: Option<&mut LocalState<P>>,
        size: usize,
    ) -> Option<NonNull<T>> {
        let bytes = size
            .max(std::mem::size_of::<T>())
            .max(std::mem::align_of::<T>())
            .max(1);

        let block = match local {
            Some(local) => local.meta.alloc_range_with_leftover(bytes),
            None => {
                let rounded = bits::next_pow2(bytes.max(MIN_CHUNK_SIZE));
                let mut pool: CommittedPool<P> = CommitRange::new(&self.pool);
                pool.alloc_range(rounded)
            }
        };

        match block {
            Some(block) => NonNull::new(block.as_ptr() as *mut T),
            None => {
                set_oom_errno();
                None
            }
        }
    }

    /// Returns a metadata block.  `local` and `size` must match the
    /// allocating call.
    pub fn dealloc_meta_data<T>(
        &'static self,
        local: Option<&mut LocalState<P>>,
        block: NonNull<T>,
        size: usize,
    ) {
        let bytes = size
            .max(std::mem::size_of::<T>())
            .max(std::mem::align_of::<T>())
            .max(1);
        let base = CapPtr::from_address(block.as_ptr() as usize).expect("blocks are non-null");

        match local {
            Some(local) => local.meta.dealloc_range_with_leftover(base, bytes),
            None => {
                let rounded = bits::next_pow2(bytes.max(MIN_CHUNK_SIZE));
                let mut pool: CommittedPool<P> = CommitRange::new(&self.pool);
                pool.dealloc_range(base, rounded);
            }
        }
    }

    /// Allocates `size` bytes of chunk-aligned space plus a slab
    /// metadata record, wires the two together, and publishes the
    /// ownership in the pagemap for every covered chunk.  Returns the
    /// pair, or nothing (with `errno` set) on exhaustion.
    #[ensures(ret.is_some() ->
              debug_chunk_map::mark_allocated(ret.as_ref().unwrap().0.address(), size).is_ok(),
              "Successful handouts never overlap a live chunk.")]
    #[ensures(ret.is_some() ->
              self.pagemap.get(ret.as_ref().unwrap().0.address()).is_frontend_owned(),
              "The pagemap records the new owner.")]
    #[ensures(ret.is_some() -> ret.as_ref().unwrap().0.address() % size == 0,
              "Chunks are aligned to their size.")]
    pub fn alloc_chunk<M: SlabMeta>(
        &'static self,
        local: &mut LocalState<P>,
        size: usize,
        ras: usize,
    ) -> Option<(AllocPtr, &'static mut M)> {
        assert!(size.is_power_of_two() && size >= MIN_CHUNK_SIZE);

        let meta_block = match self.alloc_meta_block::<M>(local) {
            Some(block) => block,
            None => {
                set_oom_errno();
                return None;
            }
        };

        let chunk = match local.object.alloc_range(size) {
            Some(chunk) => chunk,
            None => {
                self.dealloc_meta_block::<M>(local, meta_block);
                set_oom_errno();
                return None;
            }
        };

        let meta = unsafe {
            meta_block.write(M::default());
            &mut *meta_block
        };
        meta.set_chunk(chunk.address());

        let mut addr = chunk.address();
        while addr < chunk.address() + size {
            // The boundary flag, if any, rides along underneath the
            // front end's words.
            unsafe { self.pagemap.entry_mut(addr) }.set_allocated(meta_block as usize, ras);
            addr += MIN_CHUNK_SIZE;
        }

        Some((chunk.bound(size).to_user(), meta))
    }

    /// Takes a chunk back from the front end: clears its pagemap
    /// entries, frees the metadata record, and returns the space to
    /// the object pipeline.
    #[requires(debug_chunk_map::mark_released(meta.chunk(), size).is_ok(),
               "Only live chunks of the recorded size come back.")]
    #[ensures(self.pagemap.get(old(meta.chunk())).is_backend_owned(),
              "The pagemap no longer names a front-end owner.")]
    #[ensures(!debug_chunk_map::is_live(old(meta.chunk())),
              "The chunk stopped being a live handout.")]
    pub fn dealloc_chunk<M: SlabMeta>(
        &'static self,
        local: &mut LocalState<P>,
        meta: &'static mut M,
        size: usize,
    ) {
        let base = meta.chunk();
        assert!(size.is_power_of_two() && size >= MIN_CHUNK_SIZE);
        assert!(base != 0 && bits::is_aligned(base, size));

        let mut addr = base;
        while addr < base + size {
            unsafe { self.pagemap.entry_mut(addr) }.set_free();
            addr += MIN_CHUNK_SIZE;
        }

        self.dealloc_meta_block::<M>(local, meta as *mut M);

        let chunk = ChunkPtr::from_address(base).expect("live chunks are non-null");
        local.object.dealloc_range(chunk, size);
    }

    fn alloc_meta_block<M: SlabMeta>(&'static self, local: &mut LocalState<P>) -> Option<*mut M> {
        let bytes = Self::meta_block_bytes::<M>();
        let block = local.meta.alloc_range_with_leftover(bytes)?;
        Some(block.as_ptr() as *mut M)
    }

    fn dealloc_meta_block<M: SlabMeta>(&'static self, local: &mut LocalState<P>, block: *mut M) {
        let bytes = Self::meta_block_bytes::<M>();
        let base = CapPtr::from_address(block as usize).expect("metadata blocks are non-null");
        local.meta.dealloc_range_with_leftover(base, bytes);
    }

    fn meta_block_bytes<M>() -> usize {
        // The leftover path hands back power-of-two aligned blocks, so
        // covering the alignment with the size is enough.
        debug_assert!(std::mem::align_of::<M>() <= MIN_CHUNK_SIZE);
        std::mem::size_of::<M>()
            .max(std::mem::align_of::<M>())
            .max(MIN_SMALL_SIZE)
    }
}

impl<P: Pal> LocalState<P> {
    pub fn new(backend: &'static Backend<P>) -> Self {
        // The decay state outlives the thread: the timer walks the
        // registration list forever.
        let decay_state: &'static DecayState = Box::leak(Box::new(DecayState::new()));

        let object = SmallBuddyRange::new(LargeBuddyRange::new(
            DecayRange::new(decay_state, &backend.epochs, CommitRange::new(&backend.pool)),
            backend.pagemap,
        ));

        #[cfg(feature = "isolate_metadata")]
        let meta = SmallBuddyRange::new(LargeBuddyRange::new(
            CommitRange::new(SubRange::new(&backend.pool)),
            backend.pagemap,
        ));
        #[cfg(not(feature = "isolate_metadata"))]
        let meta = SmallBuddyRange::new(LargeBuddyRange::new(
            CommitRange::new(&backend.pool),
            backend.pagemap,
        ));

        Self { object, meta }
    }

    /// Returns every cached block to the shared pool.  Called on
    /// orderly thread teardown, and by anything that wants the usage
    /// counters to reflect only live handouts.
    pub fn flush(&mut self) {
        self.object.flush();
        self.meta.flush();
    }
}
