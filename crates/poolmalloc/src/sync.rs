use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};

/// Sleep the calling thread for `micros` microseconds without allocating.
#[inline]
fn sleep_micros(micros: u64) {
    let ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: (micros * 1000) as libc::c_long,
    };
    unsafe {
        libc::nanosleep(&ts, core::ptr::null_mut());
    }
}

/// The engine's top-level lock: a CAS spin lock with staged back-off.
/// We cannot use std::sync::Mutex because it may allocate, and the lock
/// guards code that itself runs inside malloc.
///
/// Contended acquisitions fall back to sched_yield, then short timed waits,
/// then exponentially growing waits capped at 200 microseconds. The slow
/// path keeps a counter so contention is observable in the field.
pub struct RawMutex {
    /// 0 = unlocked, 1 = locked
    state: AtomicI32,
    contended: AtomicU64,
}

unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicI32::new(0),
            contended: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn lock(&self) {
        // Fast path: uncontended
        if self
            .state
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        self.contended.fetch_add(1, Ordering::Relaxed);
        let mut attempts: u64 = 0;
        loop {
            if self
                .state
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            attempts += 1;
            if attempts < 5 {
                unsafe {
                    libc::sched_yield();
                }
            } else if attempts < 20 {
                sleep_micros(5);
            } else {
                // Bounded exponential back-off
                sleep_micros((5 * attempts).min(200));
            }
        }
    }

    #[inline]
    pub fn unlock(&self) {
        self.state.store(0, Ordering::Release);
    }

    /// Try to lock without blocking. Returns true if the lock was acquired.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Number of acquisitions that hit the slow path.
    pub fn contention_count(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }
}

/// A mutex that wraps data, similar to std::sync::Mutex but allocation-free.
pub struct Mutex<T> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawMutex::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.lock();
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> core::ops::Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> core::ops::DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}

/// Counting semaphore on a single atomic. wait() consumes a permit, post()
/// releases one. Waiters park on a futex on Linux and fall back to the same
/// staged back-off as the mutex elsewhere.
pub struct Semaphore {
    count: AtomicI32,
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub const fn new(permits: i32) -> Self {
        Self {
            count: AtomicI32::new(permits),
        }
    }

    pub fn post(&self) {
        self.count.fetch_add(1, Ordering::Release);
        #[cfg(target_os = "linux")]
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.count as *const AtomicI32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
            );
        }
    }

    pub fn wait(&self) {
        #[cfg(not(target_os = "linux"))]
        let mut attempts: u64 = 0;
        loop {
            let current = self.count.load(Ordering::Acquire);
            if current > 0 {
                if self
                    .count
                    .compare_exchange_weak(
                        current,
                        current - 1,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            #[cfg(target_os = "linux")]
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    &self.count as *const AtomicI32,
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    current,
                    core::ptr::null::<libc::timespec>(),
                );
            }
            #[cfg(not(target_os = "linux"))]
            {
                attempts += 1;
                if attempts < 5 {
                    unsafe {
                        libc::sched_yield();
                    }
                } else {
                    sleep_micros((5 * attempts).min(200));
                }
            }
        }
    }

    pub fn try_wait(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        while current > 0 {
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
        false
    }

    pub fn available(&self) -> i32 {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn mutex_guards_data() {
        let m = Arc::new(Mutex::new(0usize));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = Arc::clone(&m);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *m.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), 8000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let m = Mutex::new(());
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn semaphore_counts_permits() {
        let s = Semaphore::new(2);
        assert!(s.try_wait());
        assert!(s.try_wait());
        assert!(!s.try_wait());
        s.post();
        assert!(s.try_wait());
    }

    #[test]
    fn semaphore_wakes_waiter() {
        let s = Arc::new(Semaphore::new(0));
        let s2 = Arc::clone(&s);
        let h = thread::spawn(move || {
            s2.wait();
        });
        thread::sleep(std::time::Duration::from_millis(10));
        s.post();
        h.join().unwrap();
        assert_eq!(s.available(), 0);
    }
}
