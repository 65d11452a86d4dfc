use crate::platform;
use crate::util::{align_up, PAGE_SIZE};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// One contiguous byte region backing the pool.
///
/// The arena deals in offsets; the base address leaves this module only as
/// raw slices handed to the engine and, at the very edge, as user pointers.
/// Base and capacity are atomics because the interceptor range-checks
/// pointers without taking the engine lock. All writes happen under that
/// lock; a racing range check against a stale base can only misclassify a
/// pool pointer as foreign, which the classification order tolerates.
pub struct Arena {
    base: AtomicUsize,
    capacity: AtomicUsize,
    growable: AtomicBool,
}

impl Arena {
    pub const fn new() -> Self {
        Arena {
            base: AtomicUsize::new(0),
            capacity: AtomicUsize::new(0),
            growable: AtomicBool::new(false),
        }
    }

    /// Map the initial region. Returns false if the mapping fails.
    ///
    /// # Safety
    /// Must be called once, before any other operation, with no concurrent
    /// access.
    pub unsafe fn init(&self, capacity: usize, growable: bool) -> bool {
        let capacity = align_up(capacity.max(PAGE_SIZE), PAGE_SIZE);
        let base = platform::map_anonymous(capacity);
        if base.is_null() {
            return false;
        }
        self.base.store(base as usize, Ordering::Release);
        self.capacity.store(capacity, Ordering::Release);
        self.growable.store(growable, Ordering::Relaxed);
        true
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_growable(&self) -> bool {
        self.growable.load(Ordering::Relaxed)
    }

    /// Whether `addr` falls inside the mapped region. This is the necessary
    /// condition checked before any header byte is dereferenced.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base();
        base != 0 && addr >= base && addr < base + self.capacity()
    }

    /// Borrow `len` bytes at `offset` as a raw pointer.
    ///
    /// # Safety
    /// `offset + len` must not exceed the capacity and the caller must not
    /// create aliasing writes to the same bytes. The pointer is invalidated
    /// by `grow`.
    #[inline]
    pub unsafe fn at(&self, offset: usize, len: usize) -> *mut u8 {
        debug_assert!(offset + len <= self.capacity());
        (self.base() + offset) as *mut u8
    }

    /// Grow the region by at least `extra` bytes, relocating if necessary.
    /// Returns the number of bytes actually added (0 on refusal/failure).
    /// Refused for the fixed-capacity variant.
    ///
    /// # Safety
    /// Caller must hold the engine lock; relocation invalidates every raw
    /// slice previously returned by `at`.
    pub unsafe fn grow(&self, extra: usize) -> usize {
        if !self.is_growable() {
            return 0;
        }
        let old_capacity = self.capacity();
        let new_capacity = match old_capacity
            .checked_add(extra)
            .and_then(|c| c.checked_add(PAGE_SIZE - 1))
        {
            Some(c) => c & !(PAGE_SIZE - 1),
            None => return 0,
        };
        let old_base = self.base() as *mut u8;
        let new_base = platform::remap(old_base, old_capacity, new_capacity);
        if new_base.is_null() {
            return 0;
        }
        self.base.store(new_base as usize, Ordering::Release);
        self.capacity.store(new_capacity, Ordering::Release);
        new_capacity - old_capacity
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let base = self.base();
        if base != 0 {
            unsafe {
                platform::unmap(base as *mut u8, self.capacity());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_rounds_capacity_to_pages() {
        let arena = Arena::new();
        assert!(unsafe { arena.init(100, false) });
        assert_eq!(arena.capacity(), PAGE_SIZE);
        assert!(arena.base() != 0);
    }

    #[test]
    fn fixed_arena_refuses_growth() {
        let arena = Arena::new();
        assert!(unsafe { arena.init(PAGE_SIZE, false) });
        assert_eq!(unsafe { arena.grow(PAGE_SIZE) }, 0);
        assert_eq!(arena.capacity(), PAGE_SIZE);
    }

    #[test]
    fn growable_arena_extends_and_keeps_contents() {
        let arena = Arena::new();
        assert!(unsafe { arena.init(PAGE_SIZE, true) });
        unsafe {
            *arena.at(0, 1) = 0xA5;
            *arena.at(PAGE_SIZE - 1, 1) = 0x5A;
        }
        let added = unsafe { arena.grow(PAGE_SIZE) };
        assert!(added >= PAGE_SIZE);
        assert_eq!(arena.capacity(), PAGE_SIZE + added);
        unsafe {
            assert_eq!(*arena.at(0, 1), 0xA5);
            assert_eq!(*arena.at(PAGE_SIZE - 1, 1), 0x5A);
        }
    }

    #[test]
    fn contains_rejects_outside_and_unmapped() {
        let arena = Arena::new();
        assert!(!arena.contains(0x1000));
        assert!(unsafe { arena.init(PAGE_SIZE, false) });
        let base = arena.base();
        assert!(arena.contains(base));
        assert!(arena.contains(base + PAGE_SIZE - 1));
        assert!(!arena.contains(base + PAGE_SIZE));
        assert!(!arena.contains(base.wrapping_sub(1)));
    }
}
