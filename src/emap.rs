//! The extent map: page-aligned address to page descriptor.
//!
//! One process-wide registry maps every page of every live extent to a
//! descriptor pointing at its metadata. Lookups of unmapped addresses
//! return the zero descriptor, which is how the conservative scanner and
//! the free path reject non-heap pointers.

use crate::extent::Extent;
use crate::sizeclass::{LG_PAGE_SIZE, PAGE_SIZE};

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

/// What the extent map knows about one page. Copyable; `extent == null`
/// means the page is not ours.
#[derive(Clone, Copy)]
pub struct PageDescriptor {
    extent: *mut Extent,
}

unsafe impl Send for PageDescriptor {}
unsafe impl Sync for PageDescriptor {}

impl PageDescriptor {
    pub const fn null() -> Self {
        Self {
            extent: core::ptr::null_mut(),
        }
    }

    pub fn new(extent: *mut Extent) -> Self {
        Self { extent }
    }

    pub fn is_mapped(&self) -> bool {
        !self.extent.is_null()
    }

    pub fn extent_ptr(&self) -> *mut Extent {
        self.extent
    }

    /// # Safety
    ///
    /// The descriptor must be mapped and the extent still live.
    pub unsafe fn extent<'a>(&self) -> &'a Extent {
        debug_assert!(self.is_mapped());
        &*self.extent
    }

    pub fn is_slab(&self) -> bool {
        unsafe { self.extent().is_slab() }
    }

    pub fn size_class(&self) -> usize {
        unsafe { self.extent().size_class() }
    }

    pub fn arena_index(&self) -> usize {
        unsafe { self.extent().arena_index() }
    }

    pub fn contains_pointers(&self) -> bool {
        unsafe { self.extent().contains_pointers() }
    }
}

pub struct ExtentMap {
    pages: RwLock<HashMap<usize, PageDescriptor>>,
}

static EXTENT_MAP: OnceLock<ExtentMap> = OnceLock::new();

impl ExtentMap {
    fn new() -> Self {
        Self {
            pages: RwLock::new(HashMap::new()),
        }
    }

    pub fn global() -> &'static ExtentMap {
        EXTENT_MAP.get_or_init(ExtentMap::new)
    }

    /// Look up the page containing `address`; the zero descriptor if it is
    /// not part of any extent.
    pub fn lookup(&self, address: usize) -> PageDescriptor {
        let page = address & !(PAGE_SIZE - 1);
        self.pages
            .read()
            .unwrap()
            .get(&page)
            .copied()
            .unwrap_or(PageDescriptor::null())
    }

    pub fn register_range(&self, extent: *mut Extent, address: usize, pages: usize) {
        debug_assert!(address % PAGE_SIZE == 0);
        let mut map = self.pages.write().unwrap();
        for i in 0..pages {
            let previous = map.insert(address + (i << LG_PAGE_SIZE), PageDescriptor::new(extent));
            debug_assert!(previous.map_or(true, |pd| !pd.is_mapped()));
        }
    }

    pub fn unregister_range(&self, address: usize, pages: usize) {
        debug_assert!(address % PAGE_SIZE == 0);
        let mut map = self.pages.write().unwrap();
        for i in 0..pages {
            map.remove(&(address + (i << LG_PAGE_SIZE)));
        }
    }

    pub fn register(&self, extent: *mut Extent) {
        let (address, pages) = unsafe { ((*extent).address(), (*extent).pages()) };
        self.register_range(extent, address, pages);
    }

    pub fn unregister(&self, extent: *mut Extent) {
        let (address, pages) = unsafe { ((*extent).address(), (*extent).pages()) };
        self.unregister_range(address, pages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockDescriptor;
    use core::ptr::NonNull;

    #[test]
    fn lookup_of_unmapped_address_is_null() {
        let map = ExtentMap::new();
        let pd = map.lookup(0x7000_0000);
        assert!(!pd.is_mapped());
        assert!(pd.extent_ptr().is_null());
    }

    #[test]
    fn every_page_of_an_extent_resolves() {
        let map = ExtentMap::new();
        let block = NonNull::from(Box::leak(Box::new(BlockDescriptor::unbound())));
        let base = 0x10_0000_0000usize;
        let extent = Box::into_raw(Box::new(Extent::large(base, block, 7, 4, false)));

        map.register(extent);
        for i in 0..4 {
            let pd = map.lookup(base + i * PAGE_SIZE + 123);
            assert!(pd.is_mapped());
            assert_eq!(pd.extent_ptr(), extent);
            assert_eq!(pd.arena_index(), 7);
            assert!(!pd.is_slab());
        }
        assert!(!map.lookup(base + 4 * PAGE_SIZE).is_mapped());
        assert!(!map.lookup(base - 1).is_mapped());

        map.unregister(extent);
        assert!(!map.lookup(base).is_mapped());
        drop(unsafe { Box::from_raw(extent) });
    }
}
