use core::ptr;

pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}

/// macOS has no mremap; grow by mapping a fresh region, copying, and
/// unmapping the old one. Always relocates.
///
/// # Safety
/// See `platform::remap`.
pub unsafe fn remap(ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
    let fresh = map_anonymous(new_size);
    if fresh.is_null() {
        return ptr::null_mut();
    }
    ptr::copy_nonoverlapping(ptr, fresh, old_size);
    unmap(ptr, old_size);
    fresh
}
