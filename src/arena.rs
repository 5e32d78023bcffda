//! Arenas.
//!
//! An arena owns blocks and serves one (cpu, pointerness) class. Small
//! allocations come from per-class slab bins; large allocations reserve a
//! page run directly. All arena state is guarded by one mutex; the fast
//! per-thread routing happens in the thread cache above us.
//!
//! Block acquisition policy: the priority heap first (best fit by packed
//! key), then the oldest mapped-but-unused block, then a fresh mapping
//! from the OS. Fully released blocks are parked in the unused heap and
//! only unmapped past a small watermark, so a free/alloc flutter does not
//! turn into mmap traffic.

use crate::block::{BlockDescriptor, PriorityBlockHeap, UnusedBlockHeap};
use crate::emap::{ExtentMap, PageDescriptor};
use crate::extent::{BinAdapter, Extent};
use crate::options::{self, Opt};
use crate::os;
use crate::sizeclass::{
    get_size_class, is_large_size, is_small_size, pages_for_size, slab_pages, BLOCK_SIZE,
    LG_PAGE_SIZE, PAGES_IN_BLOCK, PAGE_SIZE, SMALL_CLASS_COUNT,
};
use crate::stats;

use core::ptr::NonNull;
use intrusive_collections::{LinkedList, UnsafeRef};
use log::debug;
use std::sync::{Mutex, OnceLock};

/// 128 CPU shards times two pointerness classes.
pub const MAX_ARENAS: usize = 256;

/// Mapped, fully released blocks kept around per arena.
const UNUSED_BLOCKS_MAX: usize = 32;

static ARENAS: [OnceLock<Arena>; MAX_ARENAS] = [const { OnceLock::new() }; MAX_ARENAS];

pub struct Arena {
    index: usize,
    contains_pointers: bool,
    inner: Mutex<ArenaInner>,
}

struct ArenaInner {
    priority: PriorityBlockHeap,
    unused: UnusedBlockHeap,
    free_descriptors: Vec<NonNull<BlockDescriptor>>,
    bins: Vec<LinkedList<BinAdapter>>,
}

// The raw descriptor and extent pointers inside are only dereferenced
// under the mutex.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub(crate) fn new(index: usize) -> Self {
        debug!("arena {} initialized", index);
        Self {
            index,
            contains_pointers: index & 1 != 0,
            inner: Mutex::new(ArenaInner {
                priority: PriorityBlockHeap::new(),
                unused: UnusedBlockHeap::new(),
                free_descriptors: Vec::new(),
                bins: (0..SMALL_CLASS_COUNT)
                    .map(|_| LinkedList::new(BinAdapter::new()))
                    .collect(),
            }),
        }
    }

    /// The arena for slot `index = (cpu << 1) | contains_pointers`,
    /// initialized on first use. The CPU part wraps modulo the shard count,
    /// preserving the pointerness bit.
    pub fn get_or_initialize(index: usize) -> &'static Arena {
        let index = index & (MAX_ARENAS - 1);
        ARENAS[index].get_or_init(|| Arena::new(index))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn contains_pointers(&self) -> bool {
        self.contains_pointers
    }

    /* -----------------------------------------------------------
       Small allocation
    ----------------------------------------------------------- */

    pub fn alloc_small(&self, emap: &ExtentMap, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(is_small_size(size));
        let class = get_size_class(size);
        let mut inner = self.inner.lock().unwrap();

        let cached = inner.bins[class].front().get().map(NonNull::from);
        let extent: NonNull<Extent> = match cached {
            Some(extent) => extent,
            None => self.refill_bin(&mut inner, emap, class)?,
        };
        let e = unsafe { extent.as_ref() };
        let slot = e.allocate_slot();
        if e.is_full() {
            let mut cursor = unsafe { inner.bins[class].cursor_mut_from_ptr(extent.as_ptr()) };
            cursor.remove();
        }
        stats::stats().small.increase(e.slot_size() as i64);
        NonNull::new(e.slot_address(slot) as *mut u8)
    }

    /// Carve a new slab for `class` and put it at the head of the bin.
    fn refill_bin(
        &self,
        inner: &mut ArenaInner,
        emap: &ExtentMap,
        class: usize,
    ) -> Option<NonNull<Extent>> {
        let pages = slab_pages(class);
        let (block, index) = self.alloc_pages(inner, pages)?;
        let address = unsafe { block.as_ref() }.address() + (index << LG_PAGE_SIZE);
        let extent = Box::into_raw(Box::new(Extent::slab(
            address,
            block,
            self.index as u16,
            class,
            self.contains_pointers,
        )));
        emap.register(extent);
        inner.bins[class].push_front(unsafe { UnsafeRef::from_raw(extent) });
        NonNull::new(extent)
    }

    /* -----------------------------------------------------------
       Large allocation
    ----------------------------------------------------------- */

    pub fn alloc_large(&self, emap: &ExtentMap, size: usize, zero: bool) -> Option<NonNull<u8>> {
        debug_assert!(is_large_size(size));
        let pages = pages_for_size(size);
        let mut inner = self.inner.lock().unwrap();
        let (block, index) = self.alloc_pages(&mut inner, pages)?;
        let address = unsafe { block.as_ref() }.address() + (index << LG_PAGE_SIZE);
        let extent = Box::into_raw(Box::new(Extent::large(
            address,
            block,
            self.index as u16,
            pages,
            self.contains_pointers,
        )));
        emap.register(extent);
        drop(inner);

        if zero {
            unsafe { core::ptr::write_bytes(address as *mut u8, 0, pages << LG_PAGE_SIZE) };
        }
        stats::stats().large.increase((pages << LG_PAGE_SIZE) as i64);
        NonNull::new(address as *mut u8)
    }

    /// Grow or shrink a large extent in place. Returns true iff the extent
    /// now has `new_size` bytes at its old address; on failure nothing has
    /// changed.
    pub fn resize_large(&self, emap: &ExtentMap, extent: *mut Extent, new_size: usize) -> bool {
        let e = unsafe { &*extent };
        debug_assert!(!e.is_slab());
        debug_assert!(is_large_size(new_size));
        let old_pages = e.pages();
        let new_pages = pages_for_size(new_size);
        if new_pages == old_pages {
            return true;
        }

        let block = e.block();
        let mut inner = self.inner.lock().unwrap();
        let b = unsafe { &mut *block.as_ptr() };
        // The key is about to change; the heap may not observe that.
        unsafe { inner.priority.remove(block) };
        let resized = if new_pages > old_pages {
            b.grow_at(e.page_index() + old_pages, new_pages - old_pages)
        } else {
            b.clear(e.page_index() + new_pages, old_pages - new_pages);
            true
        };
        unsafe { inner.priority.insert(block) };
        if !resized {
            return false;
        }

        let boundary = e.address() + (old_pages.min(new_pages) << LG_PAGE_SIZE);
        if new_pages > old_pages {
            emap.register_range(extent, boundary, new_pages - old_pages);
        } else {
            emap.unregister_range(boundary, old_pages - new_pages);
        }
        e.set_pages(new_pages);
        stats::stats()
            .large
            .increase(((new_pages as i64) - (old_pages as i64)) << LG_PAGE_SIZE);
        true
    }

    /* -----------------------------------------------------------
       Free
    ----------------------------------------------------------- */

    pub fn free(&self, emap: &ExtentMap, pd: PageDescriptor, ptr: NonNull<u8>) {
        let extent = pd.extent_ptr();
        let e = unsafe { &*extent };
        debug_assert!(e.arena_index() == self.index);
        let mut inner = self.inner.lock().unwrap();

        if e.is_slab() {
            let slot = e.slot_index(ptr.as_ptr() as usize);
            debug_assert!(ptr.as_ptr() as usize == e.slot_address(slot));
            let was_full = e.is_full();
            e.free_slot(slot);
            stats::stats().small.decrease(e.slot_size() as i64);
            if e.is_empty() {
                if !was_full {
                    let mut cursor =
                        unsafe { inner.bins[e.size_class()].cursor_mut_from_ptr(extent) };
                    cursor.remove();
                }
                emap.unregister(extent);
                self.release_pages(&mut inner, e.block(), e.page_index(), e.pages());
                drop(unsafe { Box::from_raw(extent) });
            } else if was_full {
                inner.bins[e.size_class()].push_front(unsafe { UnsafeRef::from_raw(extent) });
            }
        } else {
            debug_assert!(ptr.as_ptr() as usize == e.address());
            emap.unregister(extent);
            stats::stats().large.decrease(e.size() as i64);
            self.release_pages(&mut inner, e.block(), e.page_index(), e.pages());
            drop(unsafe { Box::from_raw(extent) });
        }
    }

    /* -----------------------------------------------------------
       Block layer
    ----------------------------------------------------------- */

    fn alloc_pages(
        &self,
        inner: &mut ArenaInner,
        pages: usize,
    ) -> Option<(NonNull<BlockDescriptor>, usize)> {
        debug_assert!(pages >= 1 && pages <= PAGES_IN_BLOCK);

        if let Some(block) = inner.priority.extract_for_run(pages) {
            let index = unsafe { &mut *block.as_ptr() }.reserve(pages);
            unsafe { inner.priority.insert(block) };
            return Some((block, index));
        }

        if let Some(block) = inner.unused.pop_oldest() {
            let b = unsafe { &mut *block.as_ptr() };
            debug!("arena {} recycles block {:#x}", self.index, b.address());
            b.recycle();
            let index = b.reserve(pages);
            unsafe { inner.priority.insert(block) };
            return Some((block, index));
        }

        let memory = os::map_block()?;
        let block = match self.take_descriptor(inner) {
            Some(block) => block,
            None => {
                os::unmap_block(memory.as_ptr());
                return None;
            }
        };
        let b = unsafe { &mut *block.as_ptr() };
        b.bind(memory.as_ptr() as usize);
        debug!("arena {} maps block {:#x}", self.index, b.address());
        let index = b.reserve(pages);
        unsafe { inner.priority.insert(block) };
        Some((block, index))
    }

    fn release_pages(
        &self,
        inner: &mut ArenaInner,
        block: NonNull<BlockDescriptor>,
        index: usize,
        pages: usize,
    ) {
        let b = unsafe { &mut *block.as_ptr() };
        debug_assert!(b.is_linked());
        unsafe { inner.priority.remove(block) };
        b.release(index, pages);

        if b.used_count() > 0 {
            unsafe { inner.priority.insert(block) };
            return;
        }

        // The block is empty. Purge it if asked to, park it for reuse, and
        // beyond the watermark return the oldest one to the OS.
        if options::is_enabled(Opt::PurgePages) && b.dirty_count() > 0 {
            os::purge(b.address() as *mut u8, BLOCK_SIZE);
            b.note_purged();
        }
        if inner.unused.len() >= UNUSED_BLOCKS_MAX {
            if let Some(oldest) = inner.unused.pop_oldest() {
                let ob = unsafe { &mut *oldest.as_ptr() };
                debug!("arena {} unmaps block {:#x}", self.index, ob.address());
                os::unmap_block(ob.address() as *mut u8);
                inner.free_descriptors.push(oldest);
            }
        }
        unsafe { inner.unused.insert(block) };
    }

    fn take_descriptor(&self, inner: &mut ArenaInner) -> Option<NonNull<BlockDescriptor>> {
        if inner.free_descriptors.is_empty() {
            let page = os::map_pages(PAGE_SIZE)?;
            unsafe { BlockDescriptor::from_page(page, &mut inner.free_descriptors) };
        }
        inner.free_descriptors.pop()
    }
}
