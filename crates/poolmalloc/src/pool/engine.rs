//! The block engine: carves aligned blocks out of the arena, tracks the
//! free space in the index, and recovers blocks from raw user pointers via
//! the inline header.

use crate::config;
use crate::diag;
use crate::pool::arena::Arena;
use crate::pool::index::FreeIndex;
use crate::sync::RawMutex;
use crate::util::{checked_align_up, ALIGNMENT, TOKEN_ID};
use core::cell::{Cell, UnsafeCell};
use core::ptr;

/// Per-block metadata, ending exactly at the user pointer: token at p-8,
/// size at p-16, owning offset at p-24. The layout is what lets a bare
/// pointer be classified (one word read) and released (two more).
#[repr(C)]
struct BlockHeader {
    /// Offset of the block (not the header word) within the arena.
    offset: u64,
    /// Payload span in bytes: the aligned request plus any absorbed slack.
    size: u64,
    token: u64,
}

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();
/// The header sits at the tail of one alignment quantum so the user pointer
/// right after it stays A-aligned.
const HEADER_RESERVE: usize = ALIGNMENT;

thread_local! {
    /// Number of engine sections open on the current thread. Cached in TLS
    /// the same way the cheap thread id is: a plain Cell, no allocation on
    /// first touch.
    static ENGINE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Is the engine in an internal call on the current thread? The index's
/// containers allocate and free through the interceptor; every entry point
/// consults this before anything else so those nested calls go straight to
/// the system allocator, which breaks the recursion. Tracked per thread:
/// the flag describes the caller's own call stack, and another thread's
/// open section says nothing about the pointer this thread is presenting.
#[inline]
pub fn in_engine() -> bool {
    ENGINE_DEPTH.try_with(|depth| depth.get() > 0).unwrap_or(false)
}

/// Lock + reentrancy scope for one engine operation. Dropping lowers the
/// depth and releases the lock on every exit path.
struct Section<'a> {
    lock: &'a RawMutex,
}

impl<'a> Section<'a> {
    fn enter(lock: &'a RawMutex) -> Self {
        lock.lock();
        let _ = ENGINE_DEPTH.try_with(|depth| depth.set(depth.get() + 1));
        Section { lock }
    }
}

impl Drop for Section<'_> {
    fn drop(&mut self) {
        let _ = ENGINE_DEPTH.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
        self.lock.unlock();
    }
}

struct PoolInner {
    index: FreeIndex,
    free_size: usize,
    /// Set on the first release (including resize tails). Growth relocates
    /// the arena, so it is refused from then on.
    ever_released: bool,
}

/// The pool: one arena, one index, one lock.
pub struct Pool {
    arena: Arena,
    lock: RawMutex,
    inner: UnsafeCell<PoolInner>,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    pub const fn new() -> Self {
        Pool {
            arena: Arena::new(),
            lock: RawMutex::new(),
            inner: UnsafeCell::new(PoolInner {
                index: FreeIndex::new(),
                free_size: 0,
                ever_released: false,
            }),
        }
    }

    /// Map the arena and seed the index with the single maximal region.
    ///
    /// # Safety
    /// Must be called once before any allocation.
    pub unsafe fn init(&self, capacity: usize, growable: bool) -> bool {
        let _section = Section::enter(&self.lock);
        if !self.arena.init(capacity, growable) {
            return false;
        }
        let inner = &mut *self.inner.get();
        let capacity = self.arena.capacity();
        inner.index.insert(0, capacity);
        inner.free_size = capacity;
        true
    }

    /// Standalone pool for embedding and tests.
    pub fn with_capacity(capacity: usize, growable: bool) -> Option<Pool> {
        let pool = Pool::new();
        if unsafe { pool.init(capacity, growable) } {
            Some(pool)
        } else {
            None
        }
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate `size` bytes. Null on exhaustion.
    ///
    /// # Safety
    /// The pool must be initialized.
    pub unsafe fn allocate(&self, size: usize) -> *mut u8 {
        let _section = Section::enter(&self.lock);
        let inner = &mut *self.inner.get();
        self.alloc_locked(inner, size)
    }

    unsafe fn alloc_locked(&self, inner: &mut PoolInner, size: usize) -> *mut u8 {
        let payload = match checked_align_up(size, ALIGNMENT) {
            Some(p) if p <= isize::MAX as usize => p,
            _ => {
                self.note_exhausted(inner, size);
                return ptr::null_mut();
            }
        };
        let footprint = HEADER_RESERVE + payload;

        let region = match inner.index.remove_fit(footprint) {
            Some(r) => r,
            None => {
                if !self.grow_locked(inner, footprint) {
                    self.note_exhausted(inner, size);
                    return ptr::null_mut();
                }
                match inner.index.remove_fit(footprint) {
                    Some(r) => r,
                    None => {
                        self.note_exhausted(inner, size);
                        return ptr::null_mut();
                    }
                }
            }
        };

        // Split when the remainder is worth tracking; absorb it otherwise.
        // Region sizes are A-quantized, so absorbed slack is 0 or A bytes.
        let block_size = if region.size - footprint >= 2 * ALIGNMENT {
            inner.index.insert(region.offset + footprint, region.size - footprint);
            footprint
        } else {
            region.size
        };

        let user_offset = region.offset + HEADER_RESERVE;
        let header = self.arena.at(user_offset - HEADER_SIZE, HEADER_SIZE) as *mut BlockHeader;
        header.write(BlockHeader {
            offset: region.offset as u64,
            size: (block_size - HEADER_RESERVE) as u64,
            token: TOKEN_ID,
        });

        inner.free_size -= block_size;
        self.arena.at(user_offset, 0)
    }

    /// Allocate `count * size` zero-filled bytes. Null on overflow or
    /// exhaustion.
    ///
    /// # Safety
    /// The pool must be initialized.
    pub unsafe fn zeroed_allocate(&self, count: usize, size: usize) -> *mut u8 {
        let total = match count.checked_mul(size) {
            Some(t) => t,
            None => return ptr::null_mut(),
        };
        let p = self.allocate(total);
        if !p.is_null() {
            // Arena bytes are recycled, so zero explicitly.
            ptr::write_bytes(p, 0, total);
        }
        p
    }

    /// Out-of-space diagnostic: one line with the request and the pool's
    /// used/capacity figures in MiB.
    #[cold]
    fn note_exhausted(&self, inner: &PoolInner, request: usize) {
        diag::Line::new()
            .push("poolmalloc: out of space allocating ")
            .push_mib(request)
            .push(", used ")
            .push_mib(self.arena.capacity() - inner.free_size)
            .push(" of ")
            .push_mib(self.arena.capacity())
            .emit();
    }

    /// Grow the arena per policy: the increment plus enough for the request
    /// on top of what is already used. Refused in fixed mode and after the
    /// first release (relocation would invalidate pointers callers hold).
    unsafe fn grow_locked(&self, inner: &mut PoolInner, footprint: usize) -> bool {
        if inner.ever_released {
            return false;
        }
        let used = self.arena.capacity() - inner.free_size;
        let extra = match used
            .checked_add(footprint)
            .and_then(|e| e.checked_add(config::grow_bytes()))
        {
            Some(e) => e,
            None => return false,
        };
        let old_capacity = self.arena.capacity();
        let added = self.arena.grow(extra);
        if added == 0 {
            return false;
        }
        diag::Line::new()
            .push("poolmalloc: expanding pool to ")
            .push_mib(self.arena.capacity())
            .emit();
        inner.index.insert(old_capacity, added);
        inner.free_size += added;
        true
    }

    // ========================================================================
    // Release
    // ========================================================================

    /// Return a block to the index, coalescing with free neighbors.
    /// The pointer must lie inside the arena; the token is re-validated and
    /// a mismatch aborts the release (the block is leaked, never the index
    /// corrupted).
    ///
    /// # Safety
    /// `ptr` must lie inside the arena range.
    pub unsafe fn release(&self, ptr: *mut u8) {
        let _section = Section::enter(&self.lock);
        let inner = &mut *self.inner.get();
        self.release_locked(inner, ptr);
    }

    unsafe fn release_locked(&self, inner: &mut PoolInner, ptr: *mut u8) {
        let user_offset = ptr as usize - self.arena.base();
        let header = self.arena.at(user_offset - HEADER_SIZE, HEADER_SIZE) as *mut BlockHeader;
        let head = header.read();
        if head.token != TOKEN_ID {
            diag::write_stderr("poolmalloc: release of pointer with corrupted header, ignored\n");
            return;
        }
        let offset = head.offset as usize;
        debug_assert_eq!(offset + HEADER_RESERVE, user_offset);
        let footprint = head.size as usize + HEADER_RESERVE;

        // Clear the token so a second release of the same pointer is
        // diagnosed instead of double-inserting the region.
        (*header).token = 0;

        inner.index.insert(offset, footprint);
        inner.free_size += footprint;
        inner.ever_released = true;
    }

    // ========================================================================
    // Resize
    // ========================================================================

    /// Resize a block. Shrinks are in-place and return `ptr` unchanged with
    /// the freed tail handed back to the index; growth allocates, copies,
    /// and releases the old block. Null when growth fails (the old block
    /// stays valid) or the header is corrupt.
    ///
    /// # Safety
    /// `ptr` must lie inside the arena range.
    pub unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        let _section = Section::enter(&self.lock);
        let inner = &mut *self.inner.get();

        let user_offset = ptr as usize - self.arena.base();
        let header = self.arena.at(user_offset - HEADER_SIZE, HEADER_SIZE) as *mut BlockHeader;
        let head = header.read();
        if head.token != TOKEN_ID {
            diag::write_stderr("poolmalloc: resize of pointer with corrupted header, ignored\n");
            return ptr::null_mut();
        }

        let old_payload = head.size as usize;
        let new_payload = match checked_align_up(new_size, ALIGNMENT) {
            Some(p) if p <= isize::MAX as usize => p,
            _ => return ptr::null_mut(),
        };

        if new_payload <= old_payload {
            // In-place shrink. Callers may rely on the pointer identity.
            if new_payload < old_payload {
                let offset = head.offset as usize;
                (*header).size = new_payload as u64;
                let tail_offset = offset + HEADER_RESERVE + new_payload;
                let tail = old_payload - new_payload;
                inner.index.insert(tail_offset, tail);
                inner.free_size += tail;
                inner.ever_released = true;
            }
            return ptr;
        }

        let new_ptr = self.alloc_locked(inner, new_size);
        if new_ptr.is_null() {
            return ptr::null_mut();
        }
        ptr::copy_nonoverlapping(ptr, new_ptr, old_payload);
        self.release_locked(inner, ptr);
        new_ptr
    }

    // ========================================================================
    // Classification and size query
    // ========================================================================

    /// Range check: does `addr` point at a possible pool payload? This is
    /// the necessary condition before any header byte may be read, and it
    /// runs without the lock so foreign traffic forwards cheaply.
    #[inline]
    pub fn owns(&self, addr: usize) -> bool {
        let base = self.arena.base();
        if base == 0 {
            return false;
        }
        addr >= base + HEADER_RESERVE && addr < base + self.arena.capacity()
    }

    /// Tag check: only valid after `owns` returned true.
    ///
    /// # Safety
    /// `ptr` must lie inside the arena range.
    #[inline]
    pub unsafe fn has_token(&self, ptr: *const u8) -> bool {
        let token = (ptr as *const u64).sub(1).read();
        token == TOKEN_ID
    }

    /// Payload span of a pool block. None when the header is corrupt.
    ///
    /// # Safety
    /// `ptr` must lie inside the arena range.
    pub unsafe fn allocated_size(&self, ptr: *const u8) -> Option<usize> {
        if !self.has_token(ptr) {
            return None;
        }
        let size = (ptr as *const u64).sub(2).read();
        Some(size as usize)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    pub fn free_size(&self) -> usize {
        self.lock.lock();
        let free = unsafe { (*self.inner.get()).free_size };
        self.lock.unlock();
        free
    }

    pub fn used_size(&self) -> usize {
        self.capacity() - self.free_size()
    }

    pub fn is_empty(&self) -> bool {
        self.free_size() == self.capacity()
    }

    pub fn is_full(&self) -> bool {
        self.free_size() == 0
    }

    pub fn free_block_count(&self) -> usize {
        self.lock.lock();
        let count = unsafe { (*self.inner.get()).index.region_count() };
        self.lock.unlock();
        count
    }

    pub fn largest_free_block(&self) -> usize {
        self.lock.lock();
        let largest = unsafe { (*self.inner.get()).index.largest() };
        self.lock.unlock();
        largest
    }

    /// Snapshot of the by-offset map, address-ordered. The collecting Vec
    /// allocates, so this runs as a full engine section.
    pub fn free_regions(&self) -> Vec<(usize, usize)> {
        let _section = Section::enter(&self.lock);
        unsafe { (*self.inner.get()).index.regions().collect() }
    }

    /// Slow-path acquisitions of the engine lock.
    pub fn lock_contention(&self) -> u64 {
        self.lock.contention_count()
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}
