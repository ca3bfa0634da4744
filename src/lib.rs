//! Quarry is the address-space backend of a slab allocator: it carves
//! the process's virtual address space into power-of-two, naturally
//! aligned chunks, tracks a two-word record per chunk in a flat
//! pagemap, and serves chunks to a front end through a pipeline of
//! composable range transformers: buddy allocation over the pagemap,
//! per-thread caching, epoch-based decay, commit tracking, and byte
//! accounting, all over a pluggable platform layer.
mod backend;
mod bits;
mod buddy;
mod capptr;
mod commit_range;
mod config;
mod decay_range;
mod free_stack;
mod global_range;
mod large_buddy_range;
mod meta_entry;
mod pagemap;
mod pal;
mod pal_range;
mod range;
mod rbtree;
mod register_range;
mod small_buddy_range;
mod stats_range;
mod sub_range;

#[cfg(unix)]
mod pal_file_backed;
#[cfg(unix)]
mod pal_posix;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod debug_chunk_map;

pub use backend::{Backend, LocalState, SlabMeta};
pub use capptr::{
    Alloc, AllocPtr, Arena, ArenaPtr, CapPtr, Chunk, ChunkPtr, Control, Full, Refines, Spatial,
    Tame, User, Wild, Wildness,
};
pub use config::{MIN_CHUNK_BITS, MIN_CHUNK_SIZE};
pub use meta_entry::{MetaEntry, META_BOUNDARY_BIT, REMOTE_BACKEND_MARKER};
pub use pagemap::FlatPagemap;
pub use pal::{Pal, PalFeatures};
pub use range::Range;

// The building blocks and individual stages, for anyone composing a
// custom pipeline.
pub use buddy::{Buddy, BuddyRep};
pub use rbtree::{RBTree, TreeRep};

pub use commit_range::CommitRange;
pub use decay_range::{DecayRange, DecayState, EpochControl};
pub use global_range::GlobalRange;
pub use large_buddy_range::LargeBuddyRange;
pub use pal_range::PalRange;
pub use register_range::PagemapRegisterRange;
pub use small_buddy_range::SmallBuddyRange;
pub use stats_range::{AllocStats, StatsRange};
pub use sub_range::SubRange;

#[cfg(unix)]
pub use pal_file_backed::{set_file_backed_chunk_directory, FileBackedPal};
#[cfg(unix)]
pub use pal_posix::PosixPal;

/// Returns the process-wide backend over the POSIX platform,
/// initialising it on first use.
#[cfg(unix)]
pub fn get_default_backend() -> &'static Backend<PosixPal> {
    lazy_static::lazy_static! {
        static ref DEFAULT_BACKEND: &'static Backend<PosixPal> = {
            let backend = Backend::<PosixPal>::new();
            backend.init();
            backend
        };
    }

    &DEFAULT_BACKEND
}

#[cfg(all(test, unix))]
mod default_backend_tests {
    use super::*;

    #[derive(Default)]
    struct SmokeMeta {
        chunk: usize,
    }

    impl SlabMeta for SmokeMeta {
        fn set_chunk(&mut self, chunk: usize) {
            self.chunk = chunk;
        }
        fn chunk(&self) -> usize {
            self.chunk
        }
    }

    #[test]
    fn smoke_test() {
        let backend = get_default_backend();
        let mut local = LocalState::new(backend);

        let (chunk, meta) = backend
            .alloc_chunk::<SmokeMeta>(&mut local, MIN_CHUNK_SIZE, 0x20)
            .expect("alloc should succeed");

        // The chunk is writable, zero-demand memory.
        unsafe {
            let p = chunk.as_ptr() as *mut u8;
            std::ptr::write_bytes(p, 0x5a, MIN_CHUNK_SIZE);
            assert_eq!(*p, 0x5a);
        }

        backend.dealloc_chunk::<SmokeMeta>(&mut local, meta, MIN_CHUNK_SIZE);
        local.flush();
    }
}
