use crate::config;
use crate::passthrough;
use crate::pool::Pool;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;
const DISABLED: u8 = 3;

pub static INIT_STATE: AtomicU8 = AtomicU8::new(UNINIT);

/// Raised for the whole init body: anything init allocates (the index seeds
/// its containers) must route to the system allocator.
static INIT_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

static POOL: Pool = Pool::new();

/// Library constructor -- called before main().
#[used]
#[cfg_attr(target_os = "linux", link_section = ".init_array")]
#[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_init_func")]
static CTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn init() {
        poolmalloc_init();
    }
    init
};

pub unsafe fn poolmalloc_init() {
    match INIT_STATE.compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {}
        Err(INITIALIZING) => {
            while INIT_STATE.load(Ordering::Acquire) == INITIALIZING {
                core::hint::spin_loop();
            }
            return;
        }
        Err(_) => return,
    }

    INIT_IN_PROGRESS.store(true, Ordering::Release);

    // Resolve the real libc functions first (needed for passthrough and for
    // everything the init path itself allocates).
    passthrough::resolve_real_functions();

    // Read config from env vars
    config::read_config();

    // Check kill-switch
    if config::is_disabled() {
        INIT_IN_PROGRESS.store(false, Ordering::Release);
        INIT_STATE.store(DISABLED, Ordering::Release);
        return;
    }

    // Map the arena and seed the free-region index
    if !POOL.init(config::pool_bytes(), config::growable()) {
        INIT_IN_PROGRESS.store(false, Ordering::Release);
        INIT_STATE.store(DISABLED, Ordering::Release);
        return;
    }

    INIT_IN_PROGRESS.store(false, Ordering::Release);
    INIT_STATE.store(READY, Ordering::Release);
}

#[cold]
#[inline(never)]
pub unsafe fn ensure_initialized() {
    poolmalloc_init();
}

#[inline(always)]
pub fn pool() -> &'static Pool {
    &POOL
}

#[inline(always)]
pub fn state() -> u8 {
    INIT_STATE.load(Ordering::Acquire)
}

/// True while the initializing thread is inside the init body.
#[inline(always)]
pub fn initializing() -> bool {
    INIT_IN_PROGRESS.load(Ordering::Acquire)
}

pub const STATE_READY: u8 = READY;
pub const STATE_DISABLED: u8 = DISABLED;
