//! Time-delayed return of freed chunks.  Each thread keeps freed
//! blocks in per-size-class, per-epoch stacks; a periodic tick
//! advances the global epoch and returns every thread's oldest-epoch
//! blocks to the shared pool.  Freed memory therefore stays warm for
//! `NUM_EPOCHS` ticks before its commitment is given back.
//!
//! The stage itself is single-threaded, but its timer callback
//! deallocates into the parent from whatever thread the timer uses,
//! so the parent must be concurrency-safe (in the standard pipeline it
//! is the committed view of the global range).
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::bits;
use crate::capptr::{CapPtr, ChunkPtr};
use crate::config::{
    DECAY_PERIOD_MS, MIN_CHUNK_BITS, MIN_CHUNK_SIZE, NUM_DECAY_CLASSES, NUM_EPOCHS,
};
use crate::free_stack::FreeStack;
use crate::pal::{Pal, PalFeatures};
use crate::range::Range;

const EMPTY_STACK: FreeStack = FreeStack::EMPTY;
const EPOCH_ROW: [FreeStack; NUM_EPOCHS] = [EMPTY_STACK; NUM_EPOCHS];

/// One thread's decay cache.  Immortal: once the state is registered
/// on the global list it is never unlinked, so the struct must outlive
/// its thread (the backend leaks one per `LocalState`).
pub struct DecayState {
    stacks: [[FreeStack; NUM_EPOCHS]; NUM_DECAY_CLASSES],
    registered: AtomicBool,
    /// Intrusive link in the registration list.
    next: AtomicUsize,
}

impl DecayState {
    pub const fn new() -> Self {
        Self {
            stacks: [EPOCH_ROW; NUM_DECAY_CLASSES],
            registered: AtomicBool::new(false),
            next: AtomicUsize::new(0),
        }
    }
}

/// Shared decay bookkeeping: the epoch counter and the list of every
/// thread's state.  One per backend.
pub struct EpochControl {
    epoch: AtomicUsize,
    head: AtomicUsize,
    timer_armed: AtomicBool,
}

impl EpochControl {
    pub const fn new() -> Self {
        Self {
            epoch: AtomicUsize::new(0),
            head: AtomicUsize::new(0),
            timer_armed: AtomicBool::new(false),
        }
    }
}

#[inline]
fn class_of(size: usize) -> Option<usize> {
    let class = (bits::log2(size) - MIN_CHUNK_BITS) as usize;
    if class < NUM_DECAY_CLASSES {
        Some(class)
    } else {
        None
    }
}

/// Advances the epoch and drains every registered thread's
/// oldest-epoch stacks into `parent`.  This is both the timer tick and
/// the forced flush the exhaustion path uses.
pub(crate) fn advance_and_flush(epochs: &EpochControl, parent: &mut impl Range) {
    let advanced = epochs.epoch.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
    let oldest = advanced & (NUM_EPOCHS - 1);

    log::trace!("decay: tick to epoch {}", advanced);

    let mut cursor = epochs.head.load(Ordering::Acquire);
    while cursor != 0 {
        let state = unsafe { &*(cursor as *const DecayState) };
        for class in 0..NUM_DECAY_CLASSES {
            let size = MIN_CHUNK_SIZE << class;
            for addr in state.stacks[class][oldest].pop_all() {
                let base = CapPtr::from_address(addr).expect("cached blocks are non-null");
                parent.dealloc_range(base, size);
            }
        }
        cursor = state.next.load(Ordering::Acquire);
    }
}

pub struct DecayRange<R, P>
where
    R: Range + Copy + Send + Sync + 'static,
    P: Pal,
{
    state: &'static DecayState,
    epochs: &'static EpochControl,
    parent: R,
    _pal: std::marker::PhantomData<P>,
}

impl<R, P> DecayRange<R, P>
where
    R: Range + Copy + Send + Sync + 'static,
    P: Pal,
{
    pub fn new(state: &'static DecayState, epochs: &'static EpochControl, parent: R) -> Self {
        Self {
            state,
            epochs,
            parent,
            _pal: std::marker::PhantomData,
        }
    }

    /// First deallocation on this thread: link the state into the
    /// global list; first deallocation process-wide: arm the periodic
    /// timer, if the platform has one.
    #[cold]
    fn register(&self) {
        let node = self.state as *const DecayState as usize;
        let mut head = self.epochs.head.load(Ordering::Acquire);
        loop {
            self.state.next.store(head, Ordering::Relaxed);
            match self.epochs.head.compare_exchange_weak(
                head,
                node,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        if P::FEATURES.contains(PalFeatures::TIME)
            && !self.epochs.timer_armed.swap(true, Ordering::AcqRel)
        {
            let epochs = self.epochs;
            let parent = self.parent;
            let armed = P::register_timer(
                DECAY_PERIOD_MS,
                Box::new(move || {
                    let mut parent = parent;
                    advance_and_flush(epochs, &mut parent);
                }),
            );
            log::debug!("decay: timer armed = {}", armed);
        }
    }
}

impl<R, P> Range for DecayRange<R, P>
where
    R: Range + Copy + Send + Sync + 'static,
    P: Pal,
{
    const ALIGNED: bool = R::ALIGNED;
    // The local stacks belong to one thread; only the parent side is
    // shared.
    const CONCURRENCY_SAFE: bool = false;

    fn alloc_range(&mut self, size: usize) -> Option<ChunkPtr> {
        debug_assert!(size.is_power_of_two());

        if let Some(class) = class_of(size) {
            // Newest epoch first: those blocks are most likely still
            // in cache and furthest from being reclaimed.
            let current = self.epochs.epoch.load(Ordering::Relaxed);
            for age in 0..NUM_EPOCHS {
                let epoch = current.wrapping_sub(age) & (NUM_EPOCHS - 1);
                if let Some(addr) = self.state.stacks[class][epoch].pop() {
                    return CapPtr::from_address(addr);
                }
            }
        }

        if let Some(base) = self.parent.alloc_range(size) {
            return Some(base);
        }

        // Exhaustion: force ticks so siblings' caches drain into the
        // parent, and retry.
        for _ in 0..NUM_EPOCHS {
            advance_and_flush(self.epochs, &mut self.parent);
            if let Some(base) = self.parent.alloc_range(size) {
                return Some(base);
            }
        }
        None
    }

    fn dealloc_range(&mut self, base: ChunkPtr, size: usize) {
        debug_assert!(size.is_power_of_two());
        debug_assert!(bits::is_aligned(base.address(), size));

        let class = match class_of(size) {
            Some(class) => class,
            None => return self.parent.dealloc_range(base, size),
        };

        if !self.state.registered.swap(true, Ordering::AcqRel) {
            self.register();
        }

        let epoch = self.epochs.epoch.load(Ordering::Relaxed) & (NUM_EPOCHS - 1);
        // The block is committed and ours until someone pops it.
        unsafe { self.state.stacks[class][epoch].push(base.address()) };
    }

    fn flush(&mut self) {
        for class in 0..NUM_DECAY_CLASSES {
            let size = MIN_CHUNK_SIZE << class;
            for epoch in 0..NUM_EPOCHS {
                for addr in self.state.stacks[class][epoch].pop_all() {
                    let base = CapPtr::from_address(addr).expect("cached blocks are non-null");
                    self.parent.dealloc_range(base, size);
                }
            }
        }
        self.parent.flush()
    }
}
