//! A `MetaEntry` is the two-word record the pagemap keeps for every
//! chunk-granular address.  The same two words serve two masters: for
//! an in-use chunk they hold the front end's slab-metadata pointer and
//! its packed owner/size-class word; for a backend-owned chunk they
//! hold the large buddy allocator's tree links.  A marker bit at a
//! fixed position says which reading is current.
use crate::config::MIN_CHUNK_SIZE;

/// Low bit of `meta`: this chunk begins a separately-reserved PAL
/// region and must never be coalesced with its predecessor.
pub const META_BOUNDARY_BIT: usize = 1 << 0;

/// Bit of `ras` at the reserved position: the chunk is owned by the
/// backend, and the entry words are tree links, not front-end state.
/// Front-end remote/size-class packing keeps this bit clear.
pub const REMOTE_BACKEND_MARKER: usize = 1 << 7;

/// Tree tags tucked into `ras` while the chunk is backend-owned.  The
/// link stored there is chunk-aligned, so its low bits are free.
const RAS_RED_BIT: usize = 1 << 1;
const RAS_TAG_MASK: usize = REMOTE_BACKEND_MARKER | RAS_RED_BIT | (1 << 2);

/// Mask that recovers a chunk-aligned link from either word.
const LINK_MASK: usize = !(MIN_CHUNK_SIZE - 1);

/// One pagemap slot.  Zero-filled memory is a valid (default) entry,
/// which is what makes lazily-committed pagemap pages safe to read.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct MetaEntry {
    meta: usize,
    ras: usize,
}

#[allow(unused)]
extern "C" {
    fn unused_meta_entry_is_zero_safe() -> MetaEntry;
}

impl MetaEntry {
    /// The entry every unregistered or null address reads as.
    pub const DEFAULT: MetaEntry = MetaEntry { meta: 0, ras: 0 };

    /// Returns the slab-metadata pointer for an in-use chunk, as an
    /// address.  Zero when no front end owns the chunk.
    #[inline]
    pub fn slab_meta(&self) -> usize {
        self.meta & !META_BOUNDARY_BIT
    }

    /// Returns the packed owner/size-class word, with the backend
    /// marker masked off.
    #[inline]
    pub fn remote_and_sizeclass(&self) -> usize {
        self.ras & !REMOTE_BACKEND_MARKER
    }

    /// True iff the chunk is currently owned by the backend (free, or
    /// cached in some stage).
    #[inline]
    pub fn is_backend_owned(&self) -> bool {
        self.ras & REMOTE_BACKEND_MARKER != 0
    }

    /// True iff the chunk is owned by the front end.
    #[inline]
    pub fn is_frontend_owned(&self) -> bool {
        !self.is_backend_owned() && self.slab_meta() != 0
    }

    #[inline]
    pub fn is_boundary(&self) -> bool {
        self.meta & META_BOUNDARY_BIT != 0
    }

    /// Marks this chunk as the first of an independent PAL
    /// reservation.  The flag survives both ownership transitions.
    #[inline]
    pub fn set_boundary(&mut self) {
        self.meta |= META_BOUNDARY_BIT;
    }

    /// Hands the chunk to the front end: records the slab metadata
    /// address and the caller's packed word, clears the backend
    /// marker, and preserves the boundary flag.
    #[inline]
    pub fn set_allocated(&mut self, slab_meta: usize, ras: usize) {
        debug_assert!(slab_meta & META_BOUNDARY_BIT == 0);
        self.meta = slab_meta | (self.meta & META_BOUNDARY_BIT);
        self.ras = ras & !REMOTE_BACKEND_MARKER;
    }

    /// Returns the chunk to the backend: drops the slab metadata, sets
    /// the marker, and preserves the boundary flag.  The words are now
    /// clean link storage for the buddy tree.
    #[inline]
    pub fn set_free(&mut self) {
        self.meta &= META_BOUNDARY_BIT;
        self.ras = REMOTE_BACKEND_MARKER;
    }

    // Link and colour storage for the large buddy tree.  Only
    // meaningful while the chunk is backend-owned; the links are
    // chunk-aligned addresses, so they coexist with the tag bits.

    #[inline]
    pub(crate) fn link_left(&self) -> usize {
        self.meta & LINK_MASK
    }

    #[inline]
    pub(crate) fn set_link_left(&mut self, link: usize) {
        debug_assert!(link & !LINK_MASK == 0);
        self.meta = link | (self.meta & META_BOUNDARY_BIT);
    }

    #[inline]
    pub(crate) fn link_right(&self) -> usize {
        self.ras & LINK_MASK
    }

    #[inline]
    pub(crate) fn set_link_right(&mut self, link: usize) {
        debug_assert!(link & !LINK_MASK == 0);
        self.ras = link | (self.ras & RAS_TAG_MASK);
    }

    #[inline]
    pub(crate) fn is_red(&self) -> bool {
        self.ras & RAS_RED_BIT != 0
    }

    #[inline]
    pub(crate) fn set_red(&mut self, red: bool) {
        if red {
            self.ras |= RAS_RED_BIT;
        } else {
            self.ras &= !RAS_RED_BIT;
        }
    }
}

/// Entries compare by what they say about ownership; the tag bits
/// (boundary, marker, tree colour) are ignored.
impl PartialEq for MetaEntry {
    fn eq(&self, other: &Self) -> bool {
        self.slab_meta() == other.slab_meta()
            && (self.ras & !RAS_TAG_MASK) == (other.ras & !RAS_TAG_MASK)
    }
}

impl Eq for MetaEntry {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_unowned() {
        let entry = MetaEntry::default();
        assert!(!entry.is_backend_owned());
        assert!(!entry.is_frontend_owned());
        assert_eq!(entry.slab_meta(), 0);
        assert!(!entry.is_boundary());
    }

    #[test]
    fn allocation_round_trip() {
        let mut entry = MetaEntry::default();
        entry.set_boundary();

        entry.set_allocated(0x5000_0000, 0xbeef_0000 | 0x42);
        assert!(entry.is_frontend_owned());
        assert_eq!(entry.slab_meta(), 0x5000_0000);
        assert_eq!(entry.remote_and_sizeclass(), 0xbeef_0000 | 0x42);
        assert!(entry.is_boundary(), "boundary survives allocation");

        entry.set_free();
        assert!(entry.is_backend_owned());
        assert_eq!(entry.slab_meta(), 0);
        assert!(entry.is_boundary(), "boundary survives release");
    }

    #[test]
    fn marker_cannot_be_smuggled_in() {
        let mut entry = MetaEntry::default();
        entry.set_allocated(0x4000, 0x1234 | REMOTE_BACKEND_MARKER);
        assert!(!entry.is_backend_owned());
        assert_eq!(entry.remote_and_sizeclass(), 0x1234);
    }

    #[test]
    fn links_coexist_with_flags() {
        let mut entry = MetaEntry::default();
        entry.set_boundary();
        entry.set_free();

        entry.set_link_left(0xdead_c000);
        entry.set_link_right(0xfeed_8000);
        entry.set_red(true);

        assert_eq!(entry.link_left(), 0xdead_c000);
        assert_eq!(entry.link_right(), 0xfeed_8000);
        assert!(entry.is_red());
        assert!(entry.is_boundary());
        assert!(entry.is_backend_owned());

        entry.set_red(false);
        assert!(!entry.is_red());
        assert_eq!(entry.link_right(), 0xfeed_8000);
    }

    #[test]
    fn comparison_ignores_tags() {
        let mut a = MetaEntry::default();
        let mut b = MetaEntry::default();
        a.set_allocated(0x4000, 0x99);
        b.set_allocated(0x4000, 0x99);
        b.set_boundary();
        assert_eq!(a, b);
    }
}
