use crate::diag;
use crate::init::{self, STATE_DISABLED, STATE_READY};
use crate::passthrough;
use crate::pool::in_engine;
use core::ffi::c_void;
use core::ptr;

/// Requests arriving while the engine (or init) is mid-operation must not
/// re-enter the pool: the engine's own containers allocate through these
/// entry points.
#[inline]
fn forward_to_system() -> bool {
    in_engine() || init::initializing()
}

/// Dispatch macro: check the reentrancy flag and init state, then route to
/// the pool or the system allocator.
macro_rules! dispatch {
    ($pool_fn:expr, $system_fn:expr) => {{
        if forward_to_system() {
            $system_fn
        } else {
            match init::state() {
                STATE_READY => $pool_fn,
                STATE_DISABLED => $system_fn,
                _ => {
                    init::ensure_initialized();
                    match init::state() {
                        STATE_READY => $pool_fn,
                        _ => $system_fn,
                    }
                }
            }
        }
    }};
}

unsafe fn set_errno(value: libc::c_int) {
    #[cfg(target_os = "linux")]
    {
        *libc::__errno_location() = value;
    }
    #[cfg(target_os = "macos")]
    {
        *libc::__error() = value;
    }
}

// ============================================================================
// Shared implementations (also used by the GlobalAlloc hook)
// ============================================================================

pub(crate) unsafe fn malloc_impl(size: usize) -> *mut u8 {
    // Engine-internal bookkeeping traffic is not counted.
    if !forward_to_system() {
        diag::note_alloc("malloc", size);
    }
    dispatch!(init::pool().allocate(size), passthrough::malloc(size))
}

/// Classification order: null, engine-internal call, arena range, header
/// token. The in-engine test comes first (nested frees from the index's own
/// containers must not re-enter the engine), and the range check comes
/// strictly before the token read -- dereferencing the would-be header of a
/// foreign pointer could fault.
pub(crate) unsafe fn free_impl(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    if forward_to_system() || init::state() != STATE_READY {
        passthrough::free(ptr);
        return;
    }
    let pool = init::pool();
    if !pool.owns(ptr as usize) {
        passthrough::free(ptr);
        return;
    }
    match pool.allocated_size(ptr) {
        Some(size) => {
            diag::note_free(size);
            pool.release(ptr);
        }
        None => {
            // In range but no token: origin unknown, neither reclaimed nor
            // forwarded.
            diag::write_stderr(
                "poolmalloc: free of in-pool pointer without header token, ignored\n",
            );
        }
    }
}

pub(crate) unsafe fn realloc_impl(ptr: *mut u8, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
        return malloc_impl(new_size);
    }
    if forward_to_system() || init::state() != STATE_READY {
        return passthrough::realloc(ptr, new_size);
    }
    let pool = init::pool();
    if !pool.owns(ptr as usize) {
        return passthrough::realloc(ptr, new_size);
    }
    diag::note_alloc("realloc", new_size);
    // Token validation happens inside resize; a corrupt header fails the
    // call closed rather than handing an in-pool pointer to the system
    // allocator.
    pool.resize(ptr, new_size)
}

pub(crate) unsafe fn calloc_impl(count: usize, size: usize) -> *mut u8 {
    let total = match count.checked_mul(size) {
        Some(t) => t,
        None => {
            set_errno(libc::ENOMEM);
            return ptr::null_mut();
        }
    };
    if !forward_to_system() {
        diag::note_alloc("calloc", total);
    }
    dispatch!(
        init::pool().zeroed_allocate(count, size),
        passthrough::calloc(count, size)
    )
}

pub(crate) unsafe fn usable_size_impl(ptr: *mut u8) -> usize {
    if ptr.is_null() {
        return 0;
    }
    if forward_to_system() || init::state() != STATE_READY {
        return passthrough::malloc_usable_size(ptr);
    }
    let pool = init::pool();
    if !pool.owns(ptr as usize) {
        return passthrough::malloc_usable_size(ptr);
    }
    match pool.allocated_size(ptr) {
        Some(size) => size,
        None => {
            diag::write_stderr(
                "poolmalloc: size query for in-pool pointer without header token\n",
            );
            0
        }
    }
}

// ============================================================================
// Standard C allocator API
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    malloc_impl(size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    free_impl(ptr as *mut u8);
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    realloc_impl(ptr as *mut u8, size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    calloc_impl(nmemb, size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    usable_size_impl(ptr as *mut u8)
}

/// Darwin's size query; same classification, forwarded to the system
/// malloc_size for foreign pointers.
#[cfg(target_os = "macos")]
#[no_mangle]
pub unsafe extern "C" fn malloc_size(ptr: *const c_void) -> usize {
    let ptr = ptr as *mut u8;
    if ptr.is_null() {
        return 0;
    }
    if forward_to_system() || init::state() != STATE_READY {
        return passthrough::malloc_size(ptr);
    }
    let pool = init::pool();
    if !pool.owns(ptr as usize) {
        return passthrough::malloc_size(ptr);
    }
    match pool.allocated_size(ptr) {
        Some(size) => size,
        None => {
            diag::write_stderr(
                "poolmalloc: size query for in-pool pointer without header token\n",
            );
            0
        }
    }
}

/// Zero the instrumentation counters. Diagnostic only.
#[no_mangle]
pub unsafe extern "C" fn pool_reset_counters() {
    diag::reset_counters();
}
