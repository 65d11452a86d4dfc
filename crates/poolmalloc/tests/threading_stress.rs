//! Thread stress tests: the single engine lock must serialize concurrent
//! malloc/free traffic without corruption, lost blocks, or deadlock.

use core::ffi::c_void;
use poolmalloc::api;
use std::ptr;
use std::sync::{Arc, Barrier};
use std::thread;

// ---------------------------------------------------------------------------
// N threads doing rapid malloc/free cycles
// ---------------------------------------------------------------------------

fn stress_malloc_free_n_threads(num_threads: usize) {
    const ITERATIONS: usize = 10_000;
    const ALLOC_SIZE: usize = 128;

    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                unsafe {
                    for _ in 0..ITERATIONS {
                        let p = api::malloc(ALLOC_SIZE) as *mut u8;
                        assert!(!p.is_null(), "malloc returned NULL under contention");
                        ptr::write_bytes(p, 0xCC, ALLOC_SIZE);
                        api::free(p as *mut c_void);
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked during malloc/free stress");
    }
}

#[test]
fn stress_malloc_free_4_threads() {
    stress_malloc_free_n_threads(4);
}

#[test]
fn stress_malloc_free_8_threads() {
    stress_malloc_free_n_threads(8);
}

// ---------------------------------------------------------------------------
// Mixed sizes: churn across many size classes at once
// ---------------------------------------------------------------------------

#[test]
fn stress_mixed_sizes() {
    const SIZES: [usize; 8] = [8, 64, 200, 512, 1000, 4096, 10_000, 65_536];

    let handles: Vec<_> = (0..4)
        .map(|t| {
            thread::spawn(move || unsafe {
                let mut live: Vec<(*mut u8, usize)> = Vec::new();
                for i in 0..4_000 {
                    let size = SIZES[(i + t) % SIZES.len()];
                    let p = api::malloc(size) as *mut u8;
                    assert!(!p.is_null());
                    p.write(0xA5);
                    live.push((p, size));
                    if live.len() > 16 {
                        let (q, _) = live.remove(0);
                        assert_eq!(q.read(), 0xA5, "payload byte clobbered");
                        api::free(q as *mut c_void);
                    }
                }
                for (q, _) in live {
                    api::free(q as *mut c_void);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked during mixed-size stress");
    }
}

// ---------------------------------------------------------------------------
// Cross-thread free: thread A allocates, thread B frees
// ---------------------------------------------------------------------------

/// Wrapper to allow sending `*mut u8` across thread boundaries.
/// Safety: the pointers are pool allocations and the engine is thread-safe;
/// exactly one thread frees each pointer.
#[derive(Clone, Copy)]
struct SendPtr(*mut u8);
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

#[test]
fn cross_thread_free() {
    const COUNT: usize = 1_000;
    const SIZE: usize = 64;

    let shared: Arc<std::sync::Mutex<Vec<SendPtr>>> =
        Arc::new(std::sync::Mutex::new(Vec::with_capacity(COUNT)));
    let barrier = Arc::new(Barrier::new(2));

    let producer = {
        let shared = Arc::clone(&shared);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..COUNT {
                let p = unsafe { api::malloc(SIZE) } as *mut u8;
                assert!(!p.is_null());
                unsafe { ptr::write_bytes(p, 0xDD, SIZE) };
                shared.lock().unwrap().push(SendPtr(p));
            }
        })
    };

    let consumer = {
        let shared = Arc::clone(&shared);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            let mut freed = 0;
            while freed < COUNT {
                let batch: Vec<SendPtr> = shared.lock().unwrap().drain(..).collect();
                for SendPtr(p) in batch {
                    unsafe {
                        assert_eq!(p.read(), 0xDD);
                        api::free(p as *mut c_void);
                    }
                    freed += 1;
                }
                thread::yield_now();
            }
        })
    };

    producer.join().expect("producer panicked");
    consumer.join().expect("consumer panicked");
}
