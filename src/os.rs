//! OS page backing.
//!
//! Blocks are 2 MiB regions aligned to 2 MiB, matching one huge page on the
//! reference platform. We first ask the kernel for a real huge page and fall
//! back to an overallocate-and-trim scheme that carves an aligned region out
//! of an ordinary mapping. Metadata is backed by plain page-granularity
//! mappings.

use crate::options::{self, Opt};
use crate::sizeclass::{BLOCK_SIZE, PAGE_SIZE};
use crate::stats;

use core::ptr::NonNull;
use log::warn;

/* -----------------------------------------------------------
   Unix: mmap / munmap / madvise
----------------------------------------------------------- */

#[cfg(unix)]
mod imp {
    use super::*;
    use core::ptr::null_mut;

    unsafe fn mmap_anon(size: usize, extra_flags: libc::c_int) -> *mut u8 {
        let p = libc::mmap(
            null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags,
            -1,
            0,
        );
        if p == libc::MAP_FAILED {
            null_mut()
        } else {
            p as *mut u8
        }
    }

    #[cfg(target_os = "linux")]
    fn huge_flags() -> libc::c_int {
        libc::MAP_HUGETLB
    }

    #[cfg(not(target_os = "linux"))]
    fn huge_flags() -> libc::c_int {
        0
    }

    pub fn map_block() -> Option<NonNull<u8>> {
        unsafe {
            if !options::is_enabled(Opt::NoHugePages) {
                let flags = huge_flags();
                if flags != 0 {
                    let p = mmap_anon(BLOCK_SIZE, flags);
                    if !p.is_null() {
                        debug_assert!(p as usize % BLOCK_SIZE == 0);
                        return NonNull::new(p);
                    }
                    // Exhausted huge-page pool or no permission; use small pages.
                }
            }

            // Overallocate and unmap the misaligned head and tail.
            let over_size = BLOCK_SIZE * 2;
            let p = mmap_anon(over_size, 0);
            if p.is_null() {
                warn!(
                    "mmap failed: {}, size {:#x}",
                    errno::errno(),
                    over_size
                );
                return None;
            }
            let aligned = (p as usize + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1);
            let pre = aligned - p as usize;
            let post = over_size - pre - BLOCK_SIZE;
            if pre > 0 {
                unmap(p, pre);
            }
            if post > 0 {
                unmap((aligned + BLOCK_SIZE) as *mut u8, post);
            }
            NonNull::new(aligned as *mut u8)
        }
    }

    pub fn map_pages(size: usize) -> Option<NonNull<u8>> {
        debug_assert!(size > 0 && size % PAGE_SIZE == 0);
        unsafe {
            let p = mmap_anon(size, 0);
            if p.is_null() {
                warn!("mmap failed: {}, size {:#x}", errno::errno(), size);
            }
            NonNull::new(p)
        }
    }

    pub fn unmap(addr: *mut u8, size: usize) {
        unsafe {
            if libc::munmap(addr as *mut _, size) == -1 {
                warn!(
                    "munmap failed: {}, addr {:p}, size {:#x}",
                    errno::errno(),
                    addr,
                    size
                );
            }
        }
    }

    /// Tell the kernel the range is no longer in use. The mapping stays
    /// valid; the next write faults in zero pages.
    pub fn purge(addr: *mut u8, size: usize) {
        debug_assert!(addr as usize % PAGE_SIZE == 0 && size % PAGE_SIZE == 0);
        unsafe {
            if libc::madvise(addr as *mut _, size, libc::MADV_DONTNEED) != 0 {
                warn!(
                    "madvise failed: {}, addr {:p}, size {:#x}",
                    errno::errno(),
                    addr,
                    size
                );
            }
        }
    }
}

/* -----------------------------------------------------------
   Windows: VirtualAlloc / VirtualFree
----------------------------------------------------------- */

#[cfg(windows)]
mod imp {
    use super::*;
    use core::ptr::null_mut;
    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
    use winapi::um::winnt::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, MEM_RESET, PAGE_READWRITE,
    };

    pub fn map_block() -> Option<NonNull<u8>> {
        unsafe {
            // VirtualAlloc has 64 KiB granularity; reserve double and retry
            // at the aligned address inside the reservation.
            for _ in 0..3 {
                let p = VirtualAlloc(
                    null_mut(),
                    BLOCK_SIZE * 2,
                    MEM_RESERVE,
                    PAGE_READWRITE,
                ) as usize;
                if p == 0 {
                    return None;
                }
                let aligned = (p + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1);
                VirtualFree(p as *mut _, 0, MEM_RELEASE);
                let q = VirtualAlloc(
                    aligned as *mut _,
                    BLOCK_SIZE,
                    MEM_RESERVE | MEM_COMMIT,
                    PAGE_READWRITE,
                ) as usize;
                if q == aligned {
                    return NonNull::new(q as *mut u8);
                }
                if q != 0 {
                    VirtualFree(q as *mut _, 0, MEM_RELEASE);
                }
                // Another thread took the address; retry.
            }
            warn!("VirtualAlloc could not produce an aligned block");
            None
        }
    }

    pub fn map_pages(size: usize) -> Option<NonNull<u8>> {
        debug_assert!(size > 0 && size % PAGE_SIZE == 0);
        unsafe {
            let p = VirtualAlloc(null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE);
            NonNull::new(p as *mut u8)
        }
    }

    pub fn unmap(addr: *mut u8, _size: usize) {
        unsafe {
            if VirtualFree(addr as *mut _, 0, MEM_RELEASE) == 0 {
                warn!("VirtualFree failed, addr {:p}", addr);
            }
        }
    }

    pub fn purge(addr: *mut u8, size: usize) {
        unsafe {
            let p = VirtualAlloc(addr as *mut _, size, MEM_RESET, PAGE_READWRITE);
            if p.is_null() {
                warn!("MEM_RESET failed, addr {:p}, size {:#x}", addr, size);
            }
        }
    }
}

/// Map one zero-filled block, aligned to `BLOCK_SIZE`.
pub fn map_block() -> Option<NonNull<u8>> {
    let p = imp::map_block();
    if p.is_some() {
        stats::stats().blocks.increase(1);
    }
    p
}

/// Map `size` bytes of zero-filled metadata storage.
pub fn map_pages(size: usize) -> Option<NonNull<u8>> {
    let p = imp::map_pages(size);
    if p.is_some() {
        stats::stats().metadata.increase(size as i64);
    }
    p
}

/// Unmap a block previously returned by `map_block`.
pub fn unmap_block(addr: *mut u8) {
    debug_assert!(addr as usize % BLOCK_SIZE == 0);
    imp::unmap(addr, BLOCK_SIZE);
    stats::stats().blocks.decrease(1);
}

/// Release the physical pages behind a range while keeping it mapped.
pub fn purge(addr: *mut u8, size: usize) {
    imp::purge(addr, size);
    stats::stats().purged.increase(size as i64);
}
