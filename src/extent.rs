//! Extent metadata.
//!
//! A slab extent is a page run carved into fixed-size slots of one size
//! class; a large extent is a page run serving a single allocation. Both
//! keep their bookkeeping here, off to the side of the user memory, except
//! for slab finalizers which live in the tail of their slot.
//!
//! Extents are reached concurrently through the extent map (lookups,
//! conservative scanning) while the owning arena mutates them under its
//! lock, so every mutable field is atomic and all methods take `&self`.

use crate::bits::Bitmap;
use crate::block::BlockDescriptor;
use crate::sizeclass::{
    get_size_from_class, size_class_supports_metadata, slab_pages, slab_slot_count,
    BLOCK_SIZE, LG_PAGE_SIZE, MAX_SLOTS_PER_SLAB, POINTER_SIZE, SLAB_WORDS,
};

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use intrusive_collections::{intrusive_adapter, LinkedListLink, UnsafeRef};

/// A user callback run when an allocation is destroyed. Receives the base
/// address and the allocation's used capacity.
pub type Finalizer = unsafe fn(*mut u8, usize);

pub struct Extent {
    address: usize,
    block: NonNull<BlockDescriptor>,
    pages: AtomicUsize,
    arena_index: u16,
    class: u8,
    is_slab: bool,
    contains_pointers: bool,

    // Large-extent state.
    used_capacity: AtomicUsize,
    finalizer: AtomicUsize,

    // Slab state; slot `i` of the mark bitmap doubles as the single mark
    // bit of a large extent when `i == 0`.
    occupancy: Bitmap<MAX_SLOTS_PER_SLAB, SLAB_WORDS>,
    appendable: Bitmap<MAX_SLOTS_PER_SLAB, SLAB_WORDS>,
    finalizable: Bitmap<MAX_SLOTS_PER_SLAB, SLAB_WORDS>,
    marks: Bitmap<MAX_SLOTS_PER_SLAB, SLAB_WORDS>,
    used_caps: [AtomicU16; MAX_SLOTS_PER_SLAB],
    used_slots: AtomicU16,

    pub(crate) bin_link: LinkedListLink,
}

// The intrusive link is only touched under the owning arena's lock; every
// other mutable field is atomic.
unsafe impl Send for Extent {}
unsafe impl Sync for Extent {}

intrusive_adapter!(pub BinAdapter = UnsafeRef<Extent>: Extent { bin_link: LinkedListLink });

fn new_used_caps() -> [AtomicU16; MAX_SLOTS_PER_SLAB] {
    core::array::from_fn(|_| AtomicU16::new(0))
}

impl Extent {
    pub fn slab(
        address: usize,
        block: NonNull<BlockDescriptor>,
        arena_index: u16,
        class: usize,
        contains_pointers: bool,
    ) -> Self {
        Self {
            address,
            block,
            pages: AtomicUsize::new(slab_pages(class)),
            arena_index,
            class: class as u8,
            is_slab: true,
            contains_pointers,
            used_capacity: AtomicUsize::new(0),
            finalizer: AtomicUsize::new(0),
            occupancy: Bitmap::new(),
            appendable: Bitmap::new(),
            finalizable: Bitmap::new(),
            marks: Bitmap::new(),
            used_caps: new_used_caps(),
            used_slots: AtomicU16::new(0),
            bin_link: LinkedListLink::new(),
        }
    }

    pub fn large(
        address: usize,
        block: NonNull<BlockDescriptor>,
        arena_index: u16,
        pages: usize,
        contains_pointers: bool,
    ) -> Self {
        Self {
            address,
            block,
            pages: AtomicUsize::new(pages),
            arena_index,
            class: 0,
            is_slab: false,
            contains_pointers,
            used_capacity: AtomicUsize::new(0),
            finalizer: AtomicUsize::new(0),
            occupancy: Bitmap::new(),
            appendable: Bitmap::new(),
            finalizable: Bitmap::new(),
            marks: Bitmap::new(),
            used_caps: new_used_caps(),
            used_slots: AtomicU16::new(0),
            bin_link: LinkedListLink::new(),
        }
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn block(&self) -> NonNull<BlockDescriptor> {
        self.block
    }

    pub fn arena_index(&self) -> usize {
        self.arena_index as usize
    }

    pub fn is_slab(&self) -> bool {
        self.is_slab
    }

    pub fn contains_pointers(&self) -> bool {
        self.contains_pointers
    }

    pub fn pages(&self) -> usize {
        self.pages.load(Ordering::Relaxed)
    }

    pub(crate) fn set_pages(&self, pages: usize) {
        self.pages.store(pages, Ordering::Relaxed);
    }

    pub fn size(&self) -> usize {
        self.pages() << LG_PAGE_SIZE
    }

    pub fn page_index(&self) -> usize {
        (self.address & (BLOCK_SIZE - 1)) >> LG_PAGE_SIZE
    }

    /* -----------------------------------------------------------
       Slab slots
    ----------------------------------------------------------- */

    pub fn size_class(&self) -> usize {
        debug_assert!(self.is_slab);
        self.class as usize
    }

    pub fn slot_size(&self) -> usize {
        get_size_from_class(self.size_class())
    }

    pub fn slot_count(&self) -> usize {
        slab_slot_count(self.size_class())
    }

    pub fn slot_index(&self, ptr: usize) -> usize {
        debug_assert!(ptr >= self.address && ptr < self.address + self.size());
        (ptr - self.address) / self.slot_size()
    }

    pub fn slot_address(&self, index: usize) -> usize {
        debug_assert!(index < self.slot_count());
        self.address + index * self.slot_size()
    }

    pub fn used_slot_count(&self) -> usize {
        self.used_slots.load(Ordering::Relaxed) as usize
    }

    pub fn is_full(&self) -> bool {
        self.used_slot_count() == self.slot_count()
    }

    pub fn is_empty(&self) -> bool {
        self.used_slot_count() == 0
    }

    /// Take the lowest free slot. The caller holds the arena lock and has
    /// checked the slab is not full.
    pub fn allocate_slot(&self) -> usize {
        debug_assert!(!self.is_full());
        let index = self.occupancy.set_first_atomic();
        self.used_slots.fetch_add(1, Ordering::Relaxed);
        index
    }

    pub fn free_slot(&self, index: usize) {
        let was_allocated = self.occupancy.clear_bit_atomic(index);
        debug_assert!(was_allocated, "freeing a free slot");
        self.appendable.clear_bit_atomic(index);
        self.finalizable.clear_bit_atomic(index);
        // A recycled slot must not inherit a stale mark.
        self.marks.clear_bit_atomic(index);
        self.used_slots.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn is_slot_allocated(&self, index: usize) -> bool {
        self.occupancy.value_at_atomic(index)
    }

    /* -----------------------------------------------------------
       Per-slot metadata
    ----------------------------------------------------------- */

    /// Bytes of the slot usable by the application; the tail of a
    /// finalizable slot holds the finalizer pointer.
    pub fn slot_capacity(&self, index: usize) -> usize {
        let finalizer_bytes = if self.finalizable.value_at_atomic(index) {
            POINTER_SIZE
        } else {
            0
        };
        self.slot_size() - finalizer_bytes
    }

    /// Zero when the slot carries no metadata, which disables appendable
    /// semantics for it.
    pub fn slot_used_capacity(&self, index: usize) -> usize {
        if !self.appendable.value_at_atomic(index) {
            return 0;
        }
        self.used_caps[index].load(Ordering::Relaxed) as usize
    }

    pub fn set_slot_used_capacity(&self, index: usize, used: usize) {
        debug_assert!(self.appendable.value_at_atomic(index));
        debug_assert!(used <= self.slot_capacity(index));
        self.used_caps[index].store(used as u16, Ordering::Relaxed);
    }

    /// Attach appendable metadata (and optionally a finalizer) to a slot.
    pub fn initialize_slot_metadata(
        &self,
        index: usize,
        used: usize,
        finalizer: Option<Finalizer>,
    ) {
        debug_assert!(size_class_supports_metadata(self.size_class()));
        if let Some(f) = finalizer {
            self.finalizable.set_bit_atomic(index);
            let tail = (self.slot_address(index) + self.slot_size() - POINTER_SIZE) as *mut usize;
            unsafe { tail.write(f as usize) };
        }
        self.appendable.set_bit_atomic(index);
        self.set_slot_used_capacity(index, used);
    }

    pub fn slot_finalizer(&self, index: usize) -> Option<Finalizer> {
        if !self.finalizable.value_at_atomic(index) {
            return None;
        }
        let tail = (self.slot_address(index) + self.slot_size() - POINTER_SIZE) as *const usize;
        let raw = unsafe { tail.read() };
        debug_assert!(raw != 0);
        Some(unsafe { core::mem::transmute::<usize, Finalizer>(raw) })
    }

    /* -----------------------------------------------------------
       Large-extent metadata
    ----------------------------------------------------------- */

    pub fn used_capacity(&self) -> usize {
        debug_assert!(!self.is_slab);
        self.used_capacity.load(Ordering::Relaxed)
    }

    pub fn set_used_capacity(&self, used: usize) {
        debug_assert!(!self.is_slab);
        debug_assert!(used <= self.size());
        self.used_capacity.store(used, Ordering::Relaxed);
    }

    pub fn finalizer(&self) -> Option<Finalizer> {
        debug_assert!(!self.is_slab);
        let raw = self.finalizer.load(Ordering::Relaxed);
        if raw == 0 {
            return None;
        }
        Some(unsafe { core::mem::transmute::<usize, Finalizer>(raw) })
    }

    pub fn set_finalizer(&self, finalizer: Option<Finalizer>) {
        debug_assert!(!self.is_slab);
        self.finalizer
            .store(finalizer.map_or(0, |f| f as usize), Ordering::Relaxed);
    }

    /* -----------------------------------------------------------
       Marking
    ----------------------------------------------------------- */

    /// Mark a slab slot; true if it was not marked before.
    pub fn mark_slot(&self, index: usize) -> bool {
        !self.marks.set_bit_atomic(index)
    }

    /// Mark a large extent; true if it was not marked before.
    pub fn mark_large(&self) -> bool {
        debug_assert!(!self.is_slab);
        !self.marks.set_bit_atomic(0)
    }

    pub fn is_slot_marked(&self, index: usize) -> bool {
        self.marks.value_at_atomic(index)
    }

    pub fn is_large_marked(&self) -> bool {
        self.marks.value_at_atomic(0)
    }

    pub fn clear_marks(&self) {
        self.marks.clear_all();
    }
}

/// Everything needed to service one slab allocation, resolved once from a
/// page descriptor and a pointer.
pub struct SlabAllocInfo {
    extent: NonNull<Extent>,
    index: usize,
}

impl SlabAllocInfo {
    /// # Safety
    ///
    /// `extent` must be a live slab extent and `ptr` must point into it.
    pub unsafe fn new(extent: NonNull<Extent>, ptr: usize) -> Self {
        let index = extent.as_ref().slot_index(ptr);
        Self { extent, index }
    }

    fn extent(&self) -> &Extent {
        unsafe { self.extent.as_ref() }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn address(&self) -> usize {
        self.extent().slot_address(self.index)
    }

    pub fn slot_size(&self) -> usize {
        self.extent().slot_size()
    }

    pub fn capacity(&self) -> usize {
        self.extent().slot_capacity(self.index)
    }

    pub fn used_capacity(&self) -> usize {
        self.extent().slot_used_capacity(self.index)
    }

    pub fn set_used_capacity(&self, used: usize) {
        self.extent().set_slot_used_capacity(self.index, used);
    }

    pub fn has_metadata(&self) -> bool {
        self.used_capacity() > 0
    }

    pub fn finalizer(&self) -> Option<Finalizer> {
        self.extent().slot_finalizer(self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sizeclass::{get_size_class, PAGE_SIZE};
    use core::sync::atomic::AtomicUsize as TestCounter;

    fn dummy_block() -> NonNull<BlockDescriptor> {
        NonNull::from(Box::leak(Box::new(BlockDescriptor::unbound())))
    }

    fn slab_with_memory(class: usize) -> (Extent, Vec<u64>) {
        let words = slab_pages(class) * PAGE_SIZE / 8;
        let memory = vec![0u64; words];
        let extent = Extent::slab(memory.as_ptr() as usize, dummy_block(), 0, class, false);
        (extent, memory)
    }

    static DESTROYED: TestCounter = TestCounter::new(0);

    unsafe fn count_destroy(_ptr: *mut u8, used: usize) {
        DESTROYED.fetch_add(used, Ordering::SeqCst);
    }

    #[test]
    fn slot_allocation_fills_lowest_first() {
        let (extent, _memory) = slab_with_memory(3);
        assert_eq!(extent.slot_size(), 64);
        assert_eq!(extent.allocate_slot(), 0);
        assert_eq!(extent.allocate_slot(), 1);
        extent.free_slot(0);
        assert_eq!(extent.allocate_slot(), 0);
        assert_eq!(extent.used_slot_count(), 2);
        assert!(!extent.is_full());
        assert!(!extent.is_empty());
    }

    #[test]
    fn slot_addresses_round_trip() {
        let (extent, _memory) = slab_with_memory(2);
        let a = extent.slot_address(5);
        assert_eq!(extent.slot_index(a), 5);
        assert_eq!(extent.slot_index(a + 47), 5);
        assert_eq!(extent.slot_index(a + 48), 6);
    }

    #[test]
    fn finalizer_consumes_the_slot_tail() {
        let class = get_size_class(53);
        let (extent, _memory) = slab_with_memory(class);
        let index = extent.allocate_slot();
        assert_eq!(extent.slot_capacity(index), 64);
        extent.initialize_slot_metadata(index, 45, Some(count_destroy));
        assert_eq!(extent.slot_capacity(index), 56);
        assert_eq!(extent.slot_used_capacity(index), 45);

        let f = extent.slot_finalizer(index).expect("finalizer stored");
        DESTROYED.store(0, Ordering::SeqCst);
        unsafe { f(extent.slot_address(index) as *mut u8, 45) };
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 45);

        // Freeing the slot strips its metadata.
        extent.free_slot(index);
        let index = extent.allocate_slot();
        assert_eq!(extent.slot_used_capacity(index), 0);
        assert!(extent.slot_finalizer(index).is_none());
        assert_eq!(extent.slot_capacity(index), 64);
    }

    #[test]
    fn plain_slots_report_no_metadata() {
        let (extent, _memory) = slab_with_memory(4);
        let index = extent.allocate_slot();
        assert_eq!(extent.slot_used_capacity(index), 0);
        assert!(extent.slot_finalizer(index).is_none());
        assert_eq!(extent.slot_capacity(index), extent.slot_size());
    }

    #[test]
    fn large_extent_metadata() {
        let block = dummy_block();
        let extent = Extent::large(BLOCK_SIZE, block, 0, 4, true);
        assert_eq!(extent.size(), 16384);
        assert_eq!(extent.page_index(), 0);
        assert!(extent.contains_pointers());
        assert_eq!(extent.used_capacity(), 0);
        extent.set_used_capacity(100);
        assert_eq!(extent.used_capacity(), 100);
        assert!(extent.finalizer().is_none());
        extent.set_finalizer(Some(count_destroy));
        assert!(extent.finalizer().is_some());
        extent.set_finalizer(None);
        assert!(extent.finalizer().is_none());
    }

    #[test]
    fn marking_reports_first_mark_only() {
        let (extent, _memory) = slab_with_memory(1);
        assert!(extent.mark_slot(7));
        assert!(!extent.mark_slot(7));
        assert!(extent.is_slot_marked(7));
        assert!(!extent.is_slot_marked(8));
        extent.clear_marks();
        assert!(!extent.is_slot_marked(7));
    }
}
