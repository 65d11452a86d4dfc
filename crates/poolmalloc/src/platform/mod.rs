#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as sys;

/// Map anonymous read-write memory. Returns null on failure.
///
/// # Safety
/// Caller must ensure `size` is page-aligned and non-zero.
#[inline]
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    sys::map_anonymous(size)
}

/// Unmap previously mapped memory.
///
/// # Safety
/// `ptr` must have been returned by `map_anonymous` and `size` must match.
#[inline]
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    sys::unmap(ptr, size);
}

/// Grow a mapping from `old_size` to `new_size` bytes, relocating it if the
/// address space demands it. Returns the (possibly moved) base, or null on
/// failure with the original mapping left intact.
///
/// # Safety
/// `ptr` must have been returned by `map_anonymous` with `old_size`, both
/// sizes page-aligned, `new_size > old_size`, and no other thread may touch
/// the mapping for the duration of the call.
#[inline]
pub unsafe fn remap(ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
    sys::remap(ptr, old_size, new_size)
}
