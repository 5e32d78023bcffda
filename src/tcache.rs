//! The per-thread allocator front end.
//!
//! Every thread owns a `ThreadCache` that routes allocations to the arena
//! for (current cpu, pointerness), resolves frees and reallocs through the
//! extent map, implements the appendable-slice contract, runs finalizers,
//! and drives conservative scanning for the collector.
//!
//! An allocation is appendable only while the end of the slice in hand
//! coincides with its live used capacity; aliasing slices can therefore
//! never both extend the same tail.

use crate::arena::Arena;
use crate::emap::ExtentMap;
use crate::extent::{Finalizer, SlabAllocInfo};
use crate::sizeclass::{
    align_up, get_alloc_size, get_size_class, is_allocatable_size, is_large_size, is_small_size,
    pages_for_size, size_class_supports_metadata, ADDRESS_SPACE, POINTER_SIZE, QUANTUM,
};
use crate::sys;

use core::cmp::min;
use core::ptr::{self, NonNull};
use log::warn;
use std::cell::RefCell;

#[derive(Clone, Copy)]
struct AddressRange {
    start: usize,
    end: usize,
}

/// Mutator-registered ranges scanned by every collection. The backing
/// array lives in this same heap, in pointer-bearing storage.
struct RootSet {
    ranges: *mut AddressRange,
    length: usize,
    capacity: usize,
}

pub struct ThreadCache {
    emap: Option<&'static ExtentMap>,
    stack_bottom: usize,
    roots: RootSet,
}

impl ThreadCache {
    pub const fn new() -> Self {
        Self {
            emap: None,
            stack_bottom: 0,
            roots: RootSet {
                ranges: ptr::null_mut(),
                length: 0,
                capacity: 0,
            },
        }
    }

    /// Bind the process-wide extent map (and this thread's stack bounds)
    /// on first use.
    fn emap(&mut self) -> &'static ExtentMap {
        match self.emap {
            Some(emap) => emap,
            None => {
                let emap = ExtentMap::global();
                self.emap = Some(emap);
                self.stack_bottom = sys::stack_bottom();
                emap
            }
        }
    }

    fn arena_for(&self, contains_pointers: bool) -> &'static Arena {
        Arena::get_or_initialize((sys::current_cpu() << 1) | contains_pointers as usize)
    }

    /* -----------------------------------------------------------
       Allocation
    ----------------------------------------------------------- */

    pub fn alloc(&mut self, size: usize, contains_pointers: bool) -> *mut u8 {
        if !is_allocatable_size(size) {
            return ptr::null_mut();
        }
        let emap = self.emap();
        let arena = self.arena_for(contains_pointers);
        let allocated = if is_small_size(size) {
            arena.alloc_small(emap, size)
        } else {
            arena.alloc_large(emap, size, false)
        };
        allocated.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Allocate `size` bytes with a live used-capacity watermark, making
    /// the result extendable in place, and optionally a finalizer run on
    /// `destroy`. A finalizer claims the pointer-sized tail of the storage.
    pub fn alloc_appendable(
        &mut self,
        size: usize,
        contains_pointers: bool,
        finalizer: Option<Finalizer>,
    ) -> *mut u8 {
        let finalizer_bytes = if finalizer.is_some() { POINTER_SIZE } else { 0 };
        let needed = align_up(size + finalizer_bytes, 2 * QUANTUM);
        if !is_allocatable_size(needed) {
            return ptr::null_mut();
        }
        let asize = get_alloc_size(needed);
        let emap = self.emap();
        let arena = self.arena_for(contains_pointers);

        if is_small_size(asize) {
            assert!(size_class_supports_metadata(get_size_class(asize)));
            let Some(p) = arena.alloc_small(emap, asize) else {
                return ptr::null_mut();
            };
            let address = p.as_ptr() as usize;
            let pd = emap.lookup(address);
            let extent = unsafe { pd.extent() };
            extent.initialize_slot_metadata(extent.slot_index(address), size, finalizer);
            p.as_ptr()
        } else {
            let Some(p) = arena.alloc_large(emap, asize, false) else {
                return ptr::null_mut();
            };
            let extent = unsafe { emap.lookup(p.as_ptr() as usize).extent() };
            extent.set_used_capacity(size);
            extent.set_finalizer(finalizer);
            p.as_ptr()
        }
    }

    /* -----------------------------------------------------------
       Free and destroy
    ----------------------------------------------------------- */

    pub fn free(&mut self, ptr: *mut u8) {
        let Some(p) = NonNull::new(ptr) else { return };
        let emap = self.emap();
        let pd = emap.lookup(p.as_ptr() as usize);
        debug_assert!(pd.is_mapped(), "free of a foreign pointer");
        if !pd.is_mapped() {
            return;
        }
        Arena::get_or_initialize(pd.arena_index()).free(emap, pd, p);
    }

    /// Run the allocation's finalizer, if any, then free it. Must be
    /// called with the allocation's base pointer.
    pub fn destroy(&mut self, ptr: *mut u8) {
        let Some(p) = NonNull::new(ptr) else { return };
        let address = p.as_ptr() as usize;
        let emap = self.emap();
        let pd = emap.lookup(address);
        debug_assert!(pd.is_mapped(), "destroy of a foreign pointer");
        if !pd.is_mapped() {
            return;
        }
        let extent = unsafe { pd.extent() };
        if extent.is_slab() {
            let si = unsafe { SlabAllocInfo::new(NonNull::new_unchecked(pd.extent_ptr()), address) };
            assert!(address == si.address(), "destroy through an interior pointer");
            if let Some(finalizer) = si.finalizer() {
                unsafe { finalizer(si.address() as *mut u8, si.used_capacity()) };
            }
        } else if let Some(finalizer) = extent.finalizer() {
            unsafe { finalizer(extent.address() as *mut u8, extent.used_capacity()) };
        }
        Arena::get_or_initialize(pd.arena_index()).free(emap, pd, p);
    }

    /* -----------------------------------------------------------
       Realloc
    ----------------------------------------------------------- */

    pub fn realloc(&mut self, ptr: *mut u8, size: usize, contains_pointers: bool) -> *mut u8 {
        if size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }
        if !is_allocatable_size(size) {
            return ptr::null_mut();
        }
        let Some(p) = NonNull::new(ptr) else {
            return self.alloc(size, contains_pointers);
        };
        let address = p.as_ptr() as usize;
        let emap = self.emap();
        let pd = emap.lookup(address);
        debug_assert!(pd.is_mapped(), "realloc of a foreign pointer");
        if !pd.is_mapped() {
            return ptr::null_mut();
        }
        let extent = unsafe { pd.extent() };
        let same_pointerness = extent.contains_pointers() == contains_pointers;

        let copy_size;
        let old_used;
        if extent.is_slab() {
            let si = unsafe { SlabAllocInfo::new(NonNull::new_unchecked(pd.extent_ptr()), address) };
            debug_assert!(address == si.address(), "realloc through an interior pointer");
            if same_pointerness
                && is_small_size(size)
                && get_size_class(size) == extent.size_class()
            {
                if !si.has_metadata() {
                    return ptr;
                }
                if size <= si.capacity() {
                    // The new watermark still fits beside the metadata.
                    si.set_used_capacity(size);
                    return ptr;
                }
                // It no longer fits; move the allocation.
            }
            copy_size = min(size, si.capacity());
            old_used = si.used_capacity();
        } else {
            if same_pointerness && is_large_size(size) {
                let arena = Arena::get_or_initialize(pd.arena_index());
                let in_place = pages_for_size(size) == extent.pages()
                    || arena.resize_large(emap, pd.extent_ptr(), size);
                if in_place {
                    if extent.used_capacity() > 0 {
                        extent.set_used_capacity(size);
                    }
                    return ptr;
                }
            }
            let used = extent.used_capacity();
            copy_size = min(size, if used > 0 { used } else { extent.size() });
            old_used = used;
        }

        // Move: allocate, copy, carry the watermark to a large replacement,
        // release the original. Finalizers are deliberately not carried.
        let new_ptr = self.alloc(size, contains_pointers);
        if new_ptr.is_null() {
            return ptr::null_mut();
        }
        unsafe { ptr::copy_nonoverlapping(ptr as *const u8, new_ptr, copy_size) };
        if old_used > 0 {
            let new_pd = emap.lookup(new_ptr as usize);
            if !new_pd.is_slab() {
                unsafe { new_pd.extent() }.set_used_capacity(min(old_used, size));
            }
        }
        self.free(ptr);
        new_ptr
    }

    /* -----------------------------------------------------------
       Appendable slices
    ----------------------------------------------------------- */

    fn slice_info(&mut self, address: usize) -> Option<(usize, usize, usize)> {
        let emap = self.emap();
        let pd = emap.lookup(address);
        if !pd.is_mapped() {
            return None;
        }
        let extent = unsafe { pd.extent() };
        if extent.is_slab() {
            let si = unsafe { SlabAllocInfo::new(NonNull::new_unchecked(pd.extent_ptr()), address) };
            Some((si.address(), si.capacity(), si.used_capacity()))
        } else {
            Some((extent.address(), extent.size(), extent.used_capacity()))
        }
    }

    /// The bytes available past `[ptr, ptr + length)`, or zero unless the
    /// slice's end is exactly the allocation's live used capacity.
    pub fn get_capacity(&mut self, ptr: *const u8, length: usize) -> usize {
        if ptr.is_null() {
            return 0;
        }
        let Some((base, storage, used)) = self.slice_info(ptr as usize) else {
            return 0;
        };
        let start = ptr as usize - base;
        let stop = start + length;
        if stop > 0 && stop == used {
            storage - start
        } else {
            0
        }
    }

    /// Grow the allocation under `[ptr, ptr + length)` by `delta` bytes in
    /// place. `delta == 0` always succeeds; otherwise the slice must own
    /// the tail (`get_capacity > 0`) and the new watermark must fit.
    pub fn extend(&mut self, ptr: *const u8, length: usize, delta: usize) -> bool {
        if delta == 0 {
            return true;
        }
        if ptr.is_null() {
            return false;
        }
        let address = ptr as usize;
        let emap = self.emap();
        let pd = emap.lookup(address);
        if !pd.is_mapped() {
            return false;
        }
        let extent = unsafe { pd.extent() };

        if extent.is_slab() {
            let si = unsafe { SlabAllocInfo::new(NonNull::new_unchecked(pd.extent_ptr()), address) };
            let used = si.used_capacity();
            let stop = address - si.address() + length;
            if stop == 0 || stop != used {
                return false;
            }
            if used + delta > si.capacity() {
                return false;
            }
            si.set_used_capacity(used + delta);
            true
        } else {
            let used = extent.used_capacity();
            let stop = address - extent.address() + length;
            if stop == 0 || stop != used {
                return false;
            }
            let new_used = used + delta;
            if !is_allocatable_size(new_used) {
                return false;
            }
            if new_used > extent.size() {
                let arena = Arena::get_or_initialize(pd.arena_index());
                if !arena.resize_large(emap, pd.extent_ptr(), new_used) {
                    return false;
                }
            }
            extent.set_used_capacity(new_used);
            true
        }
    }

    /* -----------------------------------------------------------
       Roots and scanning
    ----------------------------------------------------------- */

    /// Register `[start, start + length)` to be scanned by every
    /// collection.
    pub fn add_roots(&mut self, start: *const u8, length: usize) {
        if self.roots.length == self.roots.capacity {
            let capacity = (self.roots.capacity * 2).max(4);
            // The array itself lives in pointer-bearing storage so the
            // registered ranges stay visible to the collector.
            let grown =
                self.alloc(capacity * core::mem::size_of::<AddressRange>(), true) as *mut AddressRange;
            if grown.is_null() {
                warn!("could not grow the root set; dropping the range");
                return;
            }
            let old = self.roots.ranges;
            if !old.is_null() {
                unsafe {
                    ptr::copy_nonoverlapping(old, grown, self.roots.length);
                }
            }
            self.roots.ranges = grown;
            self.roots.capacity = capacity;
            if !old.is_null() {
                self.free(old as *mut u8);
            }
        }
        unsafe {
            self.roots.ranges.add(self.roots.length).write(AddressRange {
                start: start as usize,
                end: start as usize + length,
            });
        }
        self.roots.length += 1;
    }

    /// Conservatively scan one word range, marking every allocation it
    /// points into. Newly marked pointer-bearing memory goes onto `work`.
    fn scan_words(&self, range: AddressRange, work: &mut Vec<AddressRange>) -> bool {
        let emap = self.emap.expect("extent map must be bound before scanning");
        let mut found = false;
        let mut cursor = align_up(range.start, POINTER_SIZE);
        while cursor + POINTER_SIZE <= range.end {
            let value = unsafe { (cursor as *const usize).read() };
            cursor += POINTER_SIZE;
            // Anything with bits above the address space is not a pointer.
            if value == 0 || value & !(ADDRESS_SPACE - 1) != 0 {
                continue;
            }
            let pd = emap.lookup(value);
            if !pd.is_mapped() {
                continue;
            }
            let extent = unsafe { pd.extent() };
            if extent.is_slab() {
                let index = extent.slot_index(value);
                if !extent.is_slot_allocated(index) || !extent.mark_slot(index) {
                    continue;
                }
                found = true;
                if extent.contains_pointers() {
                    let start = extent.slot_address(index);
                    work.push(AddressRange {
                        start,
                        end: start + extent.slot_size(),
                    });
                }
            } else {
                if !extent.mark_large() {
                    continue;
                }
                found = true;
                if extent.contains_pointers() {
                    work.push(AddressRange {
                        start: extent.address(),
                        end: extent.address() + extent.size(),
                    });
                }
            }
        }
        found
    }

    /// Conservatively scan `[start, start + length)` and everything newly
    /// reachable from it. Returns whether any new allocation was marked.
    pub fn scan(&mut self, start: *const u8, length: usize) -> bool {
        self.emap();
        let mut work = Vec::new();
        let mut found = self.scan_words(
            AddressRange {
                start: start as usize,
                end: start as usize + length,
            },
            &mut work,
        );
        while let Some(range) = work.pop() {
            found |= self.scan_words(range, &mut work);
        }
        found
    }

    /// Mark everything reachable from the registers, the stack, and the
    /// registered roots. Callers coordinate their own safe point; sweeping
    /// is left to the embedder.
    pub fn collect(&mut self) {
        self.emap();
        let bottom = self.stack_bottom;
        let mut work = Vec::new();
        sys::push_registers(|| {
            let top = sys::stack_pointer();
            self.scan_words(AddressRange { start: top, end: bottom }, &mut work);
        });
        for i in 0..self.roots.length {
            let range = unsafe { self.roots.ranges.add(i).read() };
            self.scan_words(range, &mut work);
        }
        while let Some(range) = work.pop() {
            self.scan_words(range, &mut work);
        }
    }
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static THREAD_CACHE: RefCell<ThreadCache> = const { RefCell::new(ThreadCache::new()) };
}

/// Run `f` against the calling thread's cache.
pub fn with<R>(f: impl FnOnce(&mut ThreadCache) -> R) -> R {
    THREAD_CACHE.with(|cache| f(&mut cache.borrow_mut()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sizeclass::{BLOCK_SIZE, MAX_ALLOCATION_SIZE, PAGE_SIZE};
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, MutexGuard};

    fn tc() -> ThreadCache {
        ThreadCache::new()
    }

    // These tests share the per-CPU arenas and a couple of globals; run
    // them one at a time regardless of the harness's thread count.
    static SERIAL: Mutex<()> = Mutex::new(());

    fn serial() -> MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[test]
    fn rejects_unallocatable_sizes() {
        let _guard = serial();
        let mut cache = tc();
        assert!(cache.alloc(0, false).is_null());
        assert!(cache.alloc(MAX_ALLOCATION_SIZE + 1, false).is_null());
        let p = cache.alloc(MAX_ALLOCATION_SIZE, false);
        assert!(!p.is_null());
        cache.free(p);
    }

    #[test]
    fn free_and_destroy_of_null_are_noops() {
        let mut cache = tc();
        cache.free(ptr::null_mut());
        cache.destroy(ptr::null_mut());
    }

    #[test]
    fn small_allocation_is_writable() {
        let _guard = serial();
        let mut cache = tc();
        let p = cache.alloc(100, false);
        assert!(!p.is_null());
        unsafe {
            ptr::write_bytes(p, 0xcd, 100);
            assert_eq!(*p.add(99), 0xcd);
        }
        cache.free(p);
    }

    #[test]
    fn appendable_capacity_reflects_the_finalizer_tail() {
        let _guard = serial();
        let mut cache = tc();
        let p = cache.alloc_appendable(45, false, Some(noop_finalizer));
        assert!(!p.is_null());
        assert_eq!(cache.get_capacity(p, 45), 56);
        cache.destroy(p);

        let q = cache.alloc_appendable(45, false, None);
        assert_eq!(cache.get_capacity(q, 45), 64);
        cache.free(q);
    }

    #[test]
    fn capacity_is_zero_off_the_watermark() {
        let _guard = serial();
        let mut cache = tc();
        let p = cache.alloc_appendable(100, false, None);
        let used = 100;
        // Only the slice ending exactly at the watermark owns the tail.
        assert!(cache.get_capacity(p, used) > 0);
        assert_eq!(cache.get_capacity(p, used - 1), 0);
        assert_eq!(cache.get_capacity(p, used + 1), 0);
        assert_eq!(cache.get_capacity(ptr::null(), 0), 0);
        // A pointer we never allocated has no capacity.
        let foreign = [0u8; 16];
        assert_eq!(cache.get_capacity(foreign.as_ptr(), 16), 0);
        cache.free(p);
    }

    #[test]
    fn capacity_of_a_large_appendable_slice() {
        let _guard = serial();
        let mut cache = tc();
        let p = cache.alloc_appendable(16384, false, None);
        assert!(!p.is_null());
        let extent = unsafe { ExtentMap::global().lookup(p as usize).extent() };
        assert_eq!(extent.size(), 16384);
        extent.set_used_capacity(100);

        assert_eq!(cache.get_capacity(p, 100), 16384);
        assert_eq!(cache.get_capacity(unsafe { p.add(50) }, 50), 16334);
        assert_eq!(cache.get_capacity(p, 99), 0);
        cache.free(p);
    }

    #[test]
    fn extend_moves_the_watermark() {
        let _guard = serial();
        let mut cache = tc();
        let p = cache.alloc_appendable(40, false, None);
        // Capacity 64: slot class for 40 rounded to 2 * QUANTUM.
        assert_eq!(cache.get_capacity(p, 40), 64);
        assert!(cache.extend(p, 40, 10));
        assert_eq!(cache.get_capacity(p, 50), 64);
        // The old watermark no longer owns the tail.
        assert!(!cache.extend(p, 40, 4));
        // Beyond capacity fails without moving the watermark.
        assert!(!cache.extend(p, 50, 15));
        assert!(cache.extend(p, 50, 14));
        assert_eq!(cache.get_capacity(p, 64), 64);
        // Zero-delta extends succeed anywhere.
        assert!(cache.extend(p, 1, 0));
        assert!(cache.extend(ptr::null(), 0, 0));
        let foreign = [0u8; 8];
        assert!(cache.extend(foreign.as_ptr(), 8, 0));
        assert!(!cache.extend(foreign.as_ptr(), 8, 1));
        cache.free(p);
    }

    #[test]
    fn extend_grows_a_large_extent_in_place() {
        let _guard = serial();
        let mut cache = tc();
        let p = cache.alloc_appendable(3 * PAGE_SIZE, false, None);
        assert!(!p.is_null());
        let extent = unsafe { ExtentMap::global().lookup(p as usize).extent() };
        assert_eq!(extent.size(), 3 * PAGE_SIZE);

        // Crossing the extent boundary asks the arena to grow the page run
        // in place; a neighbouring allocation may legitimately block that.
        if cache.extend(p, 3 * PAGE_SIZE, 2 * PAGE_SIZE) {
            assert_eq!(extent.size(), 5 * PAGE_SIZE);
            assert_eq!(extent.used_capacity(), 5 * PAGE_SIZE);
        } else {
            // Failure must leave the extent untouched.
            assert_eq!(extent.size(), 3 * PAGE_SIZE);
            assert_eq!(extent.used_capacity(), 3 * PAGE_SIZE);
        }
        cache.free(p);
    }

    static FINALIZED: AtomicUsize = AtomicUsize::new(0);

    unsafe fn noop_finalizer(_ptr: *mut u8, _used: usize) {}

    unsafe fn counting_finalizer(_ptr: *mut u8, used: usize) {
        FINALIZED.fetch_add(used, Ordering::SeqCst);
    }

    #[test]
    fn destroy_runs_the_finalizer_with_the_watermark() {
        let _guard = serial();
        let mut cache = tc();
        FINALIZED.store(0, Ordering::SeqCst);
        let p = cache.alloc_appendable(45, false, Some(counting_finalizer));
        cache.destroy(p);
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 45);

        // Large allocations keep theirs in the extent header.
        FINALIZED.store(0, Ordering::SeqCst);
        let q = cache.alloc_appendable(3 * PAGE_SIZE, true, Some(counting_finalizer));
        cache.destroy(q);
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 3 * PAGE_SIZE);
    }

    #[test]
    fn realloc_away_from_a_finalized_slot_drops_the_finalizer() {
        let _guard = serial();
        let mut cache = tc();
        FINALIZED.store(0, Ordering::SeqCst);
        let p = cache.alloc_appendable(45, false, Some(counting_finalizer));
        assert_eq!(cache.get_capacity(p, 45), 56);
        unsafe { ptr::write_bytes(p, 0x7e, 45) };

        // 75 bytes no longer share the 64-byte class; the allocation moves
        // and the finalizer stays behind, unrun.
        let q = cache.realloc(p, 75, false);
        assert!(!q.is_null());
        assert_ne!(q, p);
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 0);
        unsafe {
            assert!(core::slice::from_raw_parts(q, 45).iter().all(|&b| b == 0x7e));
        }
        cache.destroy(q);
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn realloc_decision_table() {
        let _guard = serial();
        let mut cache = tc();

        // R0: zero size frees and returns null.
        let p = cache.alloc(64, false);
        assert!(cache.realloc(p, 0, false).is_null());

        // R1: unallocatable sizes return null without touching the input.
        let p = cache.alloc(64, false);
        assert!(cache.realloc(p, MAX_ALLOCATION_SIZE + 1, false).is_null());

        // R2: realloc of null is an alloc.
        let q = cache.realloc(ptr::null_mut(), 32, false);
        assert!(!q.is_null());
        cache.free(q);

        // R3/R4: same class stays put; a class change copies.
        unsafe { ptr::write_bytes(p, 0x11, 64) };
        assert_eq!(cache.realloc(p, 50, false), p);
        let moved = cache.realloc(p, 20, false);
        assert_ne!(moved, p);
        unsafe {
            assert!(core::slice::from_raw_parts(moved, 20).iter().all(|&b| b == 0x11));
        }
        cache.free(moved);

        // R5: a large allocation grows when its block has room (content
        // survives either way) and always shrinks in place.
        let big = cache.alloc(4 * PAGE_SIZE, false);
        unsafe { ptr::write_bytes(big, 0x22, 4 * PAGE_SIZE) };
        let grown = cache.realloc(big, 6 * PAGE_SIZE, false);
        assert!(!grown.is_null());
        unsafe {
            assert!(core::slice::from_raw_parts(grown, 4 * PAGE_SIZE)
                .iter()
                .all(|&b| b == 0x22));
        }
        let shrunk = cache.realloc(grown, 3 * PAGE_SIZE, false);
        assert_eq!(shrunk, grown);
        unsafe {
            assert!(core::slice::from_raw_parts(shrunk, 3 * PAGE_SIZE)
                .iter()
                .all(|&b| b == 0x22));
        }

        // R7: changing pointerness always moves.
        let relocated = cache.realloc(shrunk, 3 * PAGE_SIZE, true);
        assert_ne!(relocated, shrunk);
        unsafe {
            assert!(core::slice::from_raw_parts(relocated, 3 * PAGE_SIZE)
                .iter()
                .all(|&b| b == 0x22));
        }
        assert!(ExtentMap::global()
            .lookup(relocated as usize)
            .contains_pointers());
        cache.free(relocated);
    }

    #[test]
    fn realloc_shrink_within_class_returns_the_same_pointer() {
        let _guard = serial();
        let mut cache = tc();
        let p = cache.alloc(120, false);
        assert_eq!(cache.realloc(p, 115, false), p);
        cache.free(p);

        let big = cache.alloc(16384, false);
        assert_eq!(cache.realloc(big, 16000, false), big);
        cache.free(big);
    }

    #[test]
    fn scan_marks_reachable_allocations_transitively() {
        let _guard = serial();
        let mut cache = tc();
        let emap = ExtentMap::global();

        // a (pointer-bearing) -> b (plain). Zero a's slot so the
        // transitive scan sees exactly one candidate word.
        let b = cache.alloc(200, false);
        let a = cache.alloc(64, true) as *mut usize;
        unsafe {
            ptr::write_bytes(a as *mut u8, 0, 64);
            a.write(b as usize);
        }

        let root: [usize; 1] = [a as usize];
        assert!(cache.scan(root.as_ptr() as *const u8, core::mem::size_of_val(&root)));

        let pa = emap.lookup(a as usize);
        let ea = unsafe { pa.extent() };
        assert!(ea.is_slot_marked(ea.slot_index(a as usize)));
        let pb = emap.lookup(b as usize);
        let eb = unsafe { pb.extent() };
        assert!(eb.is_slot_marked(eb.slot_index(b as usize)));

        // A second scan finds nothing new.
        assert!(!cache.scan(root.as_ptr() as *const u8, core::mem::size_of_val(&root)));

        ea.clear_marks();
        eb.clear_marks();
        cache.free(a as *mut u8);
        cache.free(b);
    }

    #[test]
    fn interior_pointers_mark_the_containing_slot() {
        let _guard = serial();
        let mut cache = tc();
        let emap = ExtentMap::global();
        let p = cache.alloc(3 * PAGE_SIZE + 10, false);
        let interior = [p as usize + 2 * PAGE_SIZE + 17];
        assert!(cache.scan(interior.as_ptr() as *const u8, POINTER_SIZE));
        let extent = unsafe { emap.lookup(p as usize).extent() };
        assert!(extent.is_large_marked());
        extent.clear_marks();
        cache.free(p);
    }

    #[test]
    fn scan_ignores_non_pointer_words() {
        let _guard = serial();
        let mut cache = tc();
        let junk: [usize; 4] = [usize::MAX, 1 << 60, 0, 3];
        assert!(!cache.scan(junk.as_ptr() as *const u8, core::mem::size_of_val(&junk)));
    }

    #[test]
    fn collect_scans_stack_and_roots() {
        let _guard = serial();
        let mut cache = tc();
        let emap = ExtentMap::global();

        let rooted = cache.alloc(128, false);
        let root_slot = Box::new([rooted as usize]);
        cache.add_roots(root_slot.as_ptr() as *const u8, POINTER_SIZE);

        // Live on this very stack frame.
        let on_stack = cache.alloc(96, false);

        cache.collect();

        let er = unsafe { emap.lookup(rooted as usize).extent() };
        assert!(er.is_slot_marked(er.slot_index(rooted as usize)));
        let es = unsafe { emap.lookup(on_stack as usize).extent() };
        assert!(es.is_slot_marked(es.slot_index(on_stack as usize)));

        er.clear_marks();
        es.clear_marks();
        cache.free(on_stack);
        cache.free(rooted);
        drop(root_slot);
    }

    #[test]
    fn root_set_growth_survives_reallocation() {
        let _guard = serial();
        let mut cache = tc();
        let slots: Vec<Box<[usize; 1]>> = (0..20)
            .map(|_| Box::new([cache.alloc(48, false) as usize]))
            .collect();
        for slot in &slots {
            cache.add_roots(slot.as_ptr() as *const u8, POINTER_SIZE);
        }
        cache.collect();
        let emap = ExtentMap::global();
        for slot in &slots {
            let p = slot[0];
            let extent = unsafe { emap.lookup(p).extent() };
            assert!(extent.is_slot_marked(extent.slot_index(p)));
            extent.clear_marks();
            cache.free(p as *mut u8);
        }
    }

    #[test]
    fn allocations_go_to_the_matching_pointerness_arena() {
        let _guard = serial();
        let mut cache = tc();
        let emap = ExtentMap::global();
        let scanned = cache.alloc(64, true);
        let plain = cache.alloc(64, false);
        assert!(emap.lookup(scanned as usize).contains_pointers());
        assert!(!emap.lookup(plain as usize).contains_pointers());
        assert_ne!(
            emap.lookup(scanned as usize).arena_index() & 1,
            emap.lookup(plain as usize).arena_index() & 1
        );
        cache.free(scanned);
        cache.free(plain);
    }

    #[test]
    fn whole_block_allocation_round_trip() {
        let _guard = serial();
        let mut cache = tc();
        let p = cache.alloc(BLOCK_SIZE, false);
        assert!(!p.is_null());
        assert_eq!(p as usize % BLOCK_SIZE, 0);
        unsafe {
            *p = 0xab;
            *p.add(BLOCK_SIZE - 1) = 0xba;
        }
        // A block-sized allocation still shrinks in place.
        let q = cache.realloc(p, BLOCK_SIZE / 2, false);
        assert_eq!(q, p);
        assert_eq!(unsafe { *q }, 0xab);
        cache.free(q);
    }
}
