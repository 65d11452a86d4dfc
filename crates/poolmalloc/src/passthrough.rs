//! System-allocator passthrough.
//!
//! The crate exports the malloc family itself, so reaching the platform
//! allocator has to go through dlsym(RTLD_NEXT): calling `libc::malloc`
//! here would loop straight back into our own exports. Resolved addresses
//! live in atomic slots, filled eagerly at init and re-checked lazily for
//! traffic that arrives before the constructor runs. Failure to resolve a
//! symbol the platform must provide is fatal -- without the system
//! allocator underneath, foreign traffic cannot be served at all.

use crate::diag;
use core::ffi::{c_void, CStr};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type PosixMemalignFn = unsafe extern "C" fn(*mut *mut c_void, usize, usize) -> libc::c_int;
type SizeFn = unsafe extern "C" fn(*mut c_void) -> usize;

static REAL_MALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_FREE: AtomicUsize = AtomicUsize::new(0);
static REAL_REALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_CALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_POSIX_MEMALIGN: AtomicUsize = AtomicUsize::new(0);
static REAL_USABLE_SIZE: AtomicUsize = AtomicUsize::new(0);
static REAL_MALLOC_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Every slot the interceptor may need, keyed by the symbol that fills it.
/// malloc_size is Darwin-only and simply stays unresolved elsewhere.
static SYMBOLS: [(&AtomicUsize, &CStr); 7] = [
    (&REAL_MALLOC, c"malloc"),
    (&REAL_FREE, c"free"),
    (&REAL_REALLOC, c"realloc"),
    (&REAL_CALLOC, c"calloc"),
    (&REAL_POSIX_MEMALIGN, c"posix_memalign"),
    (&REAL_USABLE_SIZE, c"malloc_usable_size"),
    (&REAL_MALLOC_SIZE, c"malloc_size"),
];

/// Fill every slot via dlsym(RTLD_NEXT). Symbols the platform lacks stay
/// at zero; only an actual use of one is fatal (see `lazy_resolve`).
///
/// # Safety
/// Must be called from single-threaded context during init.
pub unsafe fn resolve_real_functions() {
    for (slot, name) in SYMBOLS.iter() {
        let addr = libc::dlsym(libc::RTLD_NEXT, name.as_ptr());
        if !addr.is_null() {
            slot.store(addr as usize, Ordering::Release);
        }
    }
}

/// Set while a thread is inside dlsym below. dlsym may itself allocate;
/// that nested request must fall through to the bump buffer instead of
/// re-entering the resolver.
static RESOLVING: AtomicBool = AtomicBool::new(false);

/// Cold path for traffic that beat the constructor: resolve one symbol on
/// demand. Returns 0 only while a nested resolve is in flight; dlsym
/// returning NULL for a required symbol aborts the process.
#[cold]
#[inline(never)]
unsafe fn lazy_resolve(slot: &AtomicUsize, name: &CStr) -> usize {
    if RESOLVING.swap(true, Ordering::Acquire) {
        return 0;
    }
    let addr = libc::dlsym(libc::RTLD_NEXT, name.as_ptr());
    RESOLVING.store(false, Ordering::Release);
    if addr.is_null() {
        diag::fatal("poolmalloc: cannot resolve system allocator symbol\n");
    }
    // Another thread may have resolved first; everyone converges on the
    // value that landed.
    let _ = slot.compare_exchange(0, addr as usize, Ordering::Release, Ordering::Acquire);
    slot.load(Ordering::Acquire)
}

/// Load a slot, resolving it on first use. 0 means "serve from the bump
/// buffer".
#[inline]
unsafe fn real(slot: &AtomicUsize, name: &CStr) -> usize {
    let addr = slot.load(Ordering::Acquire);
    if addr != 0 {
        addr
    } else {
        lazy_resolve(slot, name)
    }
}

// ============================================================================
// Bootstrap bump buffer
// ============================================================================

/// Backs the handful of allocations dlsym makes while the real allocator
/// is still unknown. Bump-only; nothing here is ever reclaimed.
const BOOTSTRAP_CAPACITY: usize = 65536;
static BOOTSTRAP_USED: AtomicUsize = AtomicUsize::new(0);
static mut BOOTSTRAP: [u8; BOOTSTRAP_CAPACITY] = [0u8; BOOTSTRAP_CAPACITY];

unsafe fn bootstrap_alloc(size: usize) -> *mut u8 {
    let take = (size + 15) & !15;
    let mut used = BOOTSTRAP_USED.load(Ordering::Relaxed);
    loop {
        if used + take > BOOTSTRAP_CAPACITY {
            return ptr::null_mut();
        }
        // CAS keeps a failed reservation from burning buffer space.
        match BOOTSTRAP_USED.compare_exchange_weak(
            used,
            used + take,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return core::ptr::addr_of_mut!(BOOTSTRAP).cast::<u8>().add(used),
            Err(observed) => used = observed,
        }
    }
}

/// Whether `ptr` came out of the bump buffer. Such pointers must never
/// reach the system free.
pub unsafe fn is_bootstrap_ptr(ptr: *const u8) -> bool {
    let start = core::ptr::addr_of!(BOOTSTRAP) as usize;
    let addr = ptr as usize;
    addr >= start && addr < start + BOOTSTRAP_CAPACITY
}

/// Bump allocations cannot grow in place and their length is not recorded;
/// copy up to the end of the buffer, which covers whatever the allocation
/// could have held.
unsafe fn bootstrap_realloc(old: *mut u8, size: usize) -> *mut u8 {
    let fresh = malloc(size);
    if !fresh.is_null() {
        let start = core::ptr::addr_of!(BOOTSTRAP) as usize;
        let available = BOOTSTRAP_CAPACITY - (old as usize - start);
        ptr::copy_nonoverlapping(old, fresh, size.min(available));
    }
    fresh
}

// ============================================================================
// Forwarding wrappers
// ============================================================================

/// # Safety
/// Caller must ensure `size` is valid.
#[inline]
pub unsafe fn malloc(size: usize) -> *mut u8 {
    match real(&REAL_MALLOC, c"malloc") {
        0 => bootstrap_alloc(size),
        addr => {
            let f: MallocFn = core::mem::transmute(addr);
            f(size) as *mut u8
        }
    }
}

/// # Safety
/// `ptr` must be null or a valid allocation pointer.
#[inline]
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() || is_bootstrap_ptr(ptr) {
        return;
    }
    match real(&REAL_FREE, c"free") {
        0 => {} // mid-resolve; the pointer cannot be system-owned yet
        addr => {
            let f: FreeFn = core::mem::transmute(addr);
            f(ptr as *mut c_void);
        }
    }
}

/// # Safety
/// `ptr` must be null or a valid allocation pointer.
#[inline]
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
        return malloc(size);
    }
    if is_bootstrap_ptr(ptr) {
        return bootstrap_realloc(ptr, size);
    }
    match real(&REAL_REALLOC, c"realloc") {
        0 => ptr::null_mut(),
        addr => {
            let f: ReallocFn = core::mem::transmute(addr);
            f(ptr as *mut c_void, size) as *mut u8
        }
    }
}

/// # Safety
/// Caller must ensure `nmemb` and `size` are valid.
#[inline]
pub unsafe fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    match real(&REAL_CALLOC, c"calloc") {
        0 => {
            let total = match nmemb.checked_mul(size) {
                Some(t) => t,
                None => return ptr::null_mut(),
            };
            let p = bootstrap_alloc(total);
            if !p.is_null() {
                ptr::write_bytes(p, 0, total);
            }
            p
        }
        addr => {
            let f: CallocFn = core::mem::transmute(addr);
            f(nmemb, size) as *mut u8
        }
    }
}

/// Over-aligned allocation, via posix_memalign (glibc and Darwin both
/// export it). No bump fallback: these requests only come from the
/// GlobalAlloc hook, well after init.
///
/// # Safety
/// `alignment` must be a power of two.
#[inline]
pub unsafe fn memalign(alignment: usize, size: usize) -> *mut u8 {
    match real(&REAL_POSIX_MEMALIGN, c"posix_memalign") {
        0 => ptr::null_mut(),
        addr => {
            let f: PosixMemalignFn = core::mem::transmute(addr);
            let mut out: *mut c_void = ptr::null_mut();
            if f(&mut out, alignment, size) == 0 {
                out as *mut u8
            } else {
                ptr::null_mut()
            }
        }
    }
}

/// # Safety
/// `ptr` must be a valid allocation pointer.
#[inline]
pub unsafe fn malloc_usable_size(ptr: *mut u8) -> usize {
    if is_bootstrap_ptr(ptr) {
        return 0;
    }
    match real(&REAL_USABLE_SIZE, c"malloc_usable_size") {
        0 => 0,
        addr => {
            let f: SizeFn = core::mem::transmute(addr);
            f(ptr as *mut c_void)
        }
    }
}

/// # Safety
/// `ptr` must be a valid allocation pointer.
#[cfg(target_os = "macos")]
#[inline]
pub unsafe fn malloc_size(ptr: *mut u8) -> usize {
    if is_bootstrap_ptr(ptr) {
        return 0;
    }
    match real(&REAL_MALLOC_SIZE, c"malloc_size") {
        0 => 0,
        addr => {
            let f: SizeFn = core::mem::transmute(addr);
            f(ptr as *mut c_void)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_and_forwards() {
        unsafe {
            resolve_real_functions();
            let p = malloc(256);
            assert!(!p.is_null());
            assert!(malloc_usable_size(p) >= 256);
            free(p);
        }
    }

    #[test]
    fn bootstrap_range_is_detected() {
        unsafe {
            let inside = bootstrap_alloc(16);
            assert!(!inside.is_null());
            assert!(is_bootstrap_ptr(inside));
            let local = 0u8;
            assert!(!is_bootstrap_ptr(&local));
            // Freeing bump memory is a silent no-op.
            free(inside);
        }
    }
}
