//! Platform hooks: per-CPU id, stack discovery, register spilling.
//!
//! None of these need to be exact for correctness. The CPU id only picks an
//! arena shard, and the stack bounds only need to cover every live frame; a
//! conservative over-approximation is always acceptable.

/* -----------------------------------------------------------
   Per-CPU id
----------------------------------------------------------- */

/// A small non-negative integer identifying the current CPU.
#[inline]
pub fn current_cpu() -> usize {
    #[cfg(target_os = "linux")]
    {
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu >= 0 {
            return cpu as usize;
        }
    }
    #[cfg(windows)]
    {
        return unsafe { winapi::um::processthreadsapi::GetCurrentProcessorNumber() } as usize;
    }
    #[allow(unreachable_code)]
    0
}

/* -----------------------------------------------------------
   Stack bounds
----------------------------------------------------------- */

/// An address at or below the deepest live frame of the caller.
#[inline(never)]
pub fn stack_pointer() -> usize {
    let mut marker = 0usize;
    let p = core::ptr::addr_of_mut!(marker);
    // Keep the local observable so it is actually materialized on the stack.
    unsafe { core::ptr::write_volatile(p, p as usize) };
    p as usize
}

/// The highest stack address of the calling thread.
///
/// On linux this is the exact top of the pthread stack; elsewhere it falls
/// back to the current stack pointer, which is correct as long as the thread
/// registers itself near its entry point.
pub fn stack_bottom() -> usize {
    #[cfg(target_os = "linux")]
    unsafe {
        let mut attr: libc::pthread_attr_t = core::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) == 0 {
            let mut addr: *mut libc::c_void = core::ptr::null_mut();
            let mut size: libc::size_t = 0;
            let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
            libc::pthread_attr_destroy(&mut attr);
            if rc == 0 {
                return addr as usize + size;
            }
        }
    }
    stack_pointer()
}

/* -----------------------------------------------------------
   Register spilling
----------------------------------------------------------- */

/// Force the callee-saved registers onto the current frame, then run `f`.
///
/// Declaring the registers clobbered makes the compiler save any incoming
/// value they hold into this function's frame, so a conservative stack scan
/// started inside `f` observes heap pointers that were live only in
/// callee-saved registers of a caller.
#[inline(never)]
pub fn push_registers<R>(f: impl FnOnce() -> R) -> R {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        // rbx cannot be named as an asm operand; capture it by hand and pin
        // the copy in memory across the call.
        let rbx: usize;
        core::arch::asm!(
            "mov {0}, rbx",
            out(reg) rbx,
            out("r12") _,
            out("r13") _,
            out("r14") _,
            out("r15") _,
        );
        let spill = [rbx];
        core::hint::black_box(&spill);
        let r = f();
        core::hint::black_box(&spill);
        return r;
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!(
            "",
            out("x19") _, out("x20") _, out("x21") _, out("x22") _, out("x23") _,
            out("x24") _, out("x25") _, out("x26") _, out("x27") _, out("x28") _,
        );
        return f();
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        f()
    }
}
