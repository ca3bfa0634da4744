//! A flat table mapping every chunk-aligned address to its
//! `MetaEntry`.  Lookups are one shift, one add, and one load; there
//! is no tree to walk and no lock to take.
//!
//! The table is reserved up front for the whole covered address range
//! and committed lazily (or page by page in `register_range` on
//! platforms that cannot demand-commit).  Reads of addresses the
//! backend was never told about return a shared default entry, so
//! read-only queries are safe on arbitrary pointers.
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::bits;
use crate::config::{ADDRESS_BITS, MIN_CHUNK_BITS, MIN_CHUNK_SIZE};
use crate::meta_entry::MetaEntry;
use crate::pal::{Pal, PalFeatures};

/// What every unknown address reads as.
static DEFAULT_ENTRY: MetaEntry = MetaEntry::DEFAULT;

/// The process-wide address-to-metadata table.  One instance per
/// backend; all fields are plain atomics so the struct can live in a
/// shared `'static` and be read without synchronisation.
#[derive(Debug)]
pub struct FlatPagemap {
    /// Address of the `MetaEntry` array, or zero before `init`.
    body: AtomicUsize,
    /// First address the table covers.
    base: AtomicUsize,
    /// Exclusive end of the covered range.
    top: AtomicUsize,
}

impl FlatPagemap {
    pub const fn new() -> Self {
        Self {
            body: AtomicUsize::new(0),
            base: AtomicUsize::new(0),
            top: AtomicUsize::new(0),
        }
    }

    /// Reserves a table covering the whole `ADDRESS_BITS` address
    /// space and commits just the first page, so the default entry is
    /// readable before any range is registered.
    pub fn init<P: Pal>(&self) {
        let entries = 1usize << (ADDRESS_BITS - MIN_CHUNK_BITS);
        let bytes = entries * std::mem::size_of::<MetaEntry>();

        let body = P::reserve(bytes)
            .unwrap_or_else(|| P::error("cannot reserve the pagemap"));
        P::notify_using(body, P::PAGE_SIZE, true);

        self.base.store(0, Ordering::Relaxed);
        self.top.store(1 << ADDRESS_BITS, Ordering::Relaxed);
        let prev = self.body.swap(body, Ordering::Release);
        assert_eq!(prev, 0, "the pagemap must only be initialised once");

        log::debug!(
            "pagemap: reserved {} bytes for {} entries at {:#x}",
            bytes,
            entries,
            body
        );
    }

    /// Places the table at the start of `[base, base + length)` and
    /// returns the remaining heap as `(heap_base, heap_length)`.  Used
    /// when the backend lives off one pre-reserved range instead of
    /// growing through the PAL.
    pub fn init_bounded<P: Pal>(&self, base: usize, length: usize) -> (usize, usize) {
        assert!(bits::is_aligned(base, MIN_CHUNK_SIZE));
        assert!(length >= 2 * MIN_CHUNK_SIZE);

        let entries = length >> MIN_CHUNK_BITS;
        let table_bytes = entries * std::mem::size_of::<MetaEntry>();
        let heap_base = bits::align_up(base + table_bytes, MIN_CHUNK_SIZE);
        assert!(heap_base < base + length, "range too small for its own pagemap");

        P::notify_using(base, bits::align_up(table_bytes, P::PAGE_SIZE), true);

        self.base.store(base, Ordering::Relaxed);
        self.top.store(base + length, Ordering::Relaxed);
        let prev = self.body.swap(base, Ordering::Release);
        assert_eq!(prev, 0, "the pagemap must only be initialised once");

        log::debug!(
            "pagemap: bounded at {:#x}, {} entries, heap starts at {:#x}",
            base,
            entries,
            heap_base
        );

        (heap_base, base + length - heap_base)
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.body.load(Ordering::Acquire) != 0
    }

    /// Ensures the table is backed for every chunk-aligned address in
    /// `[addr, addr + size)`.  Idempotent; concurrent calls for
    /// overlapping ranges are safe because page commits commute.
    pub fn register_range<P: Pal>(&self, addr: usize, size: usize) {
        let body = self.body.load(Ordering::Acquire);
        assert!(body != 0, "registering a range before pagemap init");

        let base = self.base.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Relaxed);
        assert!(
            addr >= base && addr <= top && size <= top - addr,
            "range outside the pagemap"
        );

        if P::FEATURES.contains(PalFeatures::LAZY_COMMIT) {
            return;
        }

        let first = bits::align_down(addr, MIN_CHUNK_SIZE);
        let last = bits::align_up(addr + size, MIN_CHUNK_SIZE);
        let entry_size = std::mem::size_of::<MetaEntry>();
        let begin = body + ((first - base) >> MIN_CHUNK_BITS) * entry_size;
        let end = body + ((last - base) >> MIN_CHUNK_BITS) * entry_size;

        P::notify_using(
            bits::align_down(begin, P::PAGE_SIZE),
            bits::align_up(end, P::PAGE_SIZE) - bits::align_down(begin, P::PAGE_SIZE),
            false,
        );
    }

    /// Index arithmetic shared by the accessors.  Returns null for
    /// addresses the table does not cover.
    #[inline]
    fn entry_ptr(&self, addr: usize) -> *mut MetaEntry {
        let body = self.body.load(Ordering::Acquire);
        if body == 0 {
            return std::ptr::null_mut();
        }

        let base = self.base.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Relaxed);
        if addr < base || addr >= top {
            return std::ptr::null_mut();
        }

        let index = (addr - base) >> MIN_CHUNK_BITS;
        (body + index * std::mem::size_of::<MetaEntry>()) as *mut MetaEntry
    }

    /// Returns the entry for `addr`.  Out-of-range addresses are a
    /// fatal internal error; null always reads as the default entry.
    #[inline]
    pub fn get(&self, addr: usize) -> &MetaEntry {
        if addr == 0 {
            return &DEFAULT_ENTRY;
        }

        let p = self.entry_ptr(addr);
        assert!(!p.is_null(), "pagemap read outside the registered range: {:#x}", addr);
        unsafe { &*p }
    }

    /// Returns the entry for `addr`, or the default entry when the
    /// address is outside the covered range.  This is the form the
    /// front end uses for size-of-unknown-pointer queries.
    #[inline]
    pub fn get_or_default(&self, addr: usize) -> &MetaEntry {
        let p = self.entry_ptr(addr);
        if p.is_null() {
            &DEFAULT_ENTRY
        } else {
            unsafe { &*p }
        }
    }

    /// Overwrites the entry for `addr`.  In-bounds required.
    #[inline]
    pub fn set(&self, addr: usize, entry: MetaEntry) {
        let p = self.entry_ptr(addr);
        assert!(!p.is_null(), "pagemap write outside the registered range: {:#x}", addr);
        unsafe { *p = entry };
    }

    /// Mutable access to a single entry, for the buddy representation
    /// and the chunk (de)allocation paths.
    ///
    /// # Safety
    ///
    /// Entry writes are not atomic.  The caller must be the unique
    /// owner of the chunk at `addr` (a free chunk lives in exactly one
    /// buddy tree, an in-use chunk belongs to exactly one front-end
    /// caller), so no two threads ever race on one entry.
    #[inline]
    pub(crate) unsafe fn entry_mut(&self, addr: usize) -> &mut MetaEntry {
        let p = self.entry_ptr(addr);
        assert!(!p.is_null(), "pagemap write outside the registered range: {:#x}", addr);
        &mut *p
    }
}
