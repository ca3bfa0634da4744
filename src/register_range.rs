//! Marks freshly reserved intervals as backed in the pagemap, so that
//! every chunk the backend will ever speak about has an entry before
//! anything else sees its address.
use std::marker::PhantomData;

use crate::capptr::ChunkPtr;
use crate::pagemap::FlatPagemap;
use crate::pal::Pal;
use crate::range::Range;

pub struct PagemapRegisterRange<R: Range, P: Pal> {
    parent: R,
    pagemap: &'static FlatPagemap,
    _pal: PhantomData<P>,
}

impl<R: Range, P: Pal> PagemapRegisterRange<R, P> {
    pub fn new(parent: R, pagemap: &'static FlatPagemap) -> Self {
        Self {
            parent,
            pagemap,
            _pal: PhantomData,
        }
    }
}

impl<R: Range, P: Pal> Range for PagemapRegisterRange<R, P> {
    const ALIGNED: bool = R::ALIGNED;
    const CONCURRENCY_SAFE: bool = false;

    fn alloc_range(&mut self, size: usize) -> Option<ChunkPtr> {
        let base = self.parent.alloc_range(size)?;
        self.pagemap.register_range::<P>(base.address(), size);
        Some(base)
    }

    fn dealloc_range(&mut self, base: ChunkPtr, size: usize) {
        self.parent.dealloc_range(base, size)
    }

    fn flush(&mut self) {
        self.parent.flush()
    }
}
