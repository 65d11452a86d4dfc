use crate::util::{DEFAULT_GROW_BYTES, DEFAULT_POOL_BYTES, DEFAULT_PRINT_THRESHOLD};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Cached config values (read once at init, never allocate).
static POOL_BYTES: AtomicUsize = AtomicUsize::new(DEFAULT_POOL_BYTES);
static GROW_BYTES: AtomicUsize = AtomicUsize::new(DEFAULT_GROW_BYTES);
static GROWABLE: AtomicBool = AtomicBool::new(false);
static PRINT_THRESHOLD: AtomicUsize = AtomicUsize::new(DEFAULT_PRINT_THRESHOLD);
static BREAK_THRESHOLD: AtomicUsize = AtomicUsize::new(0);

/// Read configuration from environment variables.
/// Must be called during init, before any allocations.
///
/// # Safety
/// Must be called from single-threaded context (init).
pub unsafe fn read_config() {
    if let Some(val) = getenv_usize(b"POOLMALLOC_POOL_BYTES\0") {
        if val != 0 {
            POOL_BYTES.store(val, Ordering::Relaxed);
        }
    }
    if let Some(val) = getenv_usize(b"POOLMALLOC_GROW_BYTES\0") {
        if val != 0 {
            GROW_BYTES.store(val, Ordering::Relaxed);
        }
    }
    if let Some(val) = getenv_usize(b"POOLMALLOC_GROWABLE\0") {
        GROWABLE.store(val != 0, Ordering::Relaxed);
    }
    if let Some(val) = getenv_usize(b"POOLMALLOC_PRINT_THRESHOLD\0") {
        PRINT_THRESHOLD.store(val, Ordering::Relaxed);
    }
    if let Some(val) = getenv_usize(b"POOLMALLOC_BREAK_THRESHOLD\0") {
        BREAK_THRESHOLD.store(val, Ordering::Relaxed);
    }
}

/// Check if the allocator is disabled via env var.
///
/// # Safety
/// Calls libc::getenv which is not thread-safe, so must be called during init.
pub unsafe fn is_disabled() -> bool {
    let key = b"POOLMALLOC_DISABLE\0".as_ptr() as *const libc::c_char;
    !libc::getenv(key).is_null()
}

pub fn pool_bytes() -> usize {
    POOL_BYTES.load(Ordering::Relaxed)
}

pub fn grow_bytes() -> usize {
    GROW_BYTES.load(Ordering::Relaxed)
}

pub fn growable() -> bool {
    GROWABLE.load(Ordering::Relaxed)
}

/// Requests at or above this emit a diagnostic line. 0 disables printing.
pub fn print_threshold() -> usize {
    PRINT_THRESHOLD.load(Ordering::Relaxed)
}

/// Requests at or above this raise SIGINT. 0 (the default) disables.
pub fn break_threshold() -> usize {
    BREAK_THRESHOLD.load(Ordering::Relaxed)
}

/// Parse an environment variable as a usize.
///
/// # Safety
/// Calls libc::getenv.
unsafe fn getenv_usize(key: &[u8]) -> Option<usize> {
    let val = libc::getenv(key.as_ptr() as *const libc::c_char);
    if val.is_null() {
        return None;
    }

    // Parse manually (no std allocation)
    let mut result: usize = 0;
    let mut ptr = val as *const u8;
    loop {
        let byte = *ptr;
        if byte == 0 {
            break;
        }
        if !byte.is_ascii_digit() {
            return None; // Invalid
        }
        result = result.checked_mul(10)?.checked_add((byte - b'0') as usize)?;
        ptr = ptr.add(1);
    }
    Some(result)
}
