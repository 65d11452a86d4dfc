#![no_main]

use libfuzzer_sys::fuzz_target;
use poolmalloc::api;

// Fuzz target that exercises size boundaries and alignment.
// Interprets input as a series of u32 sizes, allocates each, writes the
// full extent, checks the pool's alignment and size-query contracts, frees.

fuzz_target!(|data: &[u8]| {
    let mut i = 0;
    while i + 4 <= data.len() {
        let raw_size = u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        i += 4;

        // Cap size to prevent OOM
        let size = (raw_size as usize) % (1024 * 1024); // Max 1 MiB

        let ptr = unsafe { api::malloc(size) } as *mut u8;
        if size == 0 {
            if !ptr.is_null() {
                unsafe { api::free(ptr as *mut _) };
            }
            continue;
        }

        if ptr.is_null() {
            continue; // OOM is ok
        }

        // The pool hands out cache-line-aligned pointers.
        assert_eq!(
            (ptr as usize) % 64,
            0,
            "malloc({}) returned unaligned pointer {:p}",
            size,
            ptr
        );

        // Write to full extent -- this should not crash
        unsafe {
            std::ptr::write_bytes(ptr, 0xBB, size);
        }

        // Read back and verify
        for j in 0..size {
            assert_eq!(unsafe { *ptr.add(j) }, 0xBB);
        }

        let usable = unsafe { api::malloc_usable_size(ptr as *mut _) };
        assert!(
            usable >= size,
            "malloc_usable_size({}) = {} < requested {}",
            size,
            usable,
            size
        );
        // Aligned request plus at most one absorbed quantum.
        assert!(usable <= size.div_ceil(64) * 64 + 64);

        unsafe { api::free(ptr as *mut _) };

        // Test calloc for the same size
        if size < 65536 {
            let cptr = unsafe { api::calloc(1, size) } as *mut u8;
            if !cptr.is_null() {
                // Verify zero-fill
                for j in 0..std::cmp::min(size, 4096) {
                    assert_eq!(unsafe { *cptr.add(j) }, 0, "calloc not zeroed at {}", j);
                }
                unsafe { api::free(cptr as *mut _) };
            }
        }
    }
});
