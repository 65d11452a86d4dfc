//! Allocation-free diagnostics.
//!
//! Everything here must be callable from inside malloc: messages are
//! assembled into a fixed stack buffer and written to stderr with a single
//! `libc::write`. No `format!`, no locks.

use crate::config;
use crate::util::MBYTE;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Bytes requested through the entry points and still notionally live.
static TOTAL_ALLOC: AtomicUsize = AtomicUsize::new(0);
/// High-water mark of TOTAL_ALLOC.
static TOTAL_MAX_ALLOC: AtomicUsize = AtomicUsize::new(0);

/// A single diagnostic line, assembled on the stack.
pub struct Line {
    buf: [u8; 192],
    len: usize,
}

impl Line {
    pub fn new() -> Self {
        Line {
            buf: [0; 192],
            len: 0,
        }
    }

    pub fn push(&mut self, s: &str) -> &mut Self {
        let bytes = s.as_bytes();
        let n = bytes.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        self
    }

    /// Append a decimal number.
    pub fn push_usize(&mut self, mut v: usize) -> &mut Self {
        let mut digits = [0u8; 20];
        let mut i = digits.len();
        loop {
            i -= 1;
            digits[i] = b'0' + (v % 10) as u8;
            v /= 10;
            if v == 0 {
                break;
            }
        }
        let n = (digits.len() - i).min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&digits[i..i + n]);
        self.len += n;
        self
    }

    /// Append a byte count rendered in whole MiB.
    pub fn push_mib(&mut self, bytes: usize) -> &mut Self {
        self.push_usize(bytes / MBYTE).push(" MiB")
    }

    /// Write the line (plus a trailing newline) to stderr in one syscall.
    pub fn emit(&mut self) {
        if self.len < self.buf.len() {
            self.buf[self.len] = b'\n';
            self.len += 1;
        } else {
            self.buf[self.len - 1] = b'\n';
        }
        unsafe {
            libc::write(2, self.buf.as_ptr() as *const libc::c_void, self.len);
        }
        self.len = 0;
    }
}

impl Default for Line {
    fn default() -> Self {
        Self::new()
    }
}

/// Write a fixed message to stderr.
pub fn write_stderr(msg: &str) {
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
    }
}

/// Abort with a diagnostic message. Used when the process cannot continue,
/// e.g. the system allocator symbols cannot be resolved.
#[cold]
#[inline(never)]
pub fn fatal(msg: &str) -> ! {
    write_stderr(msg);
    unsafe {
        libc::abort();
    }
}

// ============================================================================
// Instrumentation counters
// ============================================================================

/// Record `bytes` entering through an allocation entry point. Emits a
/// diagnostic line when the request crosses the print threshold and raises
/// SIGINT when it crosses the (default-disabled) break threshold.
pub fn note_alloc(label: &str, bytes: usize) {
    let total = TOTAL_ALLOC.fetch_add(bytes, Ordering::Relaxed) + bytes;
    TOTAL_MAX_ALLOC.fetch_max(total, Ordering::Relaxed);

    let print_at = config::print_threshold();
    if print_at != 0 && bytes >= print_at {
        let mut line = Line::new();
        line.push("poolmalloc: ")
            .push(label)
            .push("( ")
            .push_mib(bytes)
            .push(" ) : in use ")
            .push_mib(total)
            .push(" peak ")
            .push_mib(TOTAL_MAX_ALLOC.load(Ordering::Relaxed))
            .emit();
    }

    let break_at = config::break_threshold();
    if break_at != 0 && bytes >= break_at {
        unsafe {
            libc::raise(libc::SIGINT);
        }
    }
}

/// Record `bytes` leaving through a release entry point.
pub fn note_free(bytes: usize) {
    // Saturate rather than wrap: foreign frees report sizes we never counted.
    let mut current = TOTAL_ALLOC.load(Ordering::Relaxed);
    loop {
        let next = current.saturating_sub(bytes);
        match TOTAL_ALLOC.compare_exchange_weak(
            current,
            next,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

/// Zero the instrumentation counters. Diagnostic only.
pub fn reset_counters() {
    TOTAL_ALLOC.store(0, Ordering::Relaxed);
    TOTAL_MAX_ALLOC.store(0, Ordering::Relaxed);
}

/// Current (live, peak) byte counters.
pub fn counters() -> (usize, usize) {
    (
        TOTAL_ALLOC.load(Ordering::Relaxed),
        TOTAL_MAX_ALLOC.load(Ordering::Relaxed),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_formats_numbers() {
        let mut line = Line::new();
        line.push("x=").push_usize(40960);
        assert_eq!(&line.buf[..line.len], b"x=40960");
    }

    #[test]
    fn line_truncates_instead_of_overflowing() {
        let mut line = Line::new();
        for _ in 0..64 {
            line.push("0123456789");
        }
        assert_eq!(line.len, 192);
        line.push_usize(7);
        assert_eq!(line.len, 192);
    }

    #[test]
    fn counters_saturate_on_untracked_free() {
        reset_counters();
        note_free(12345);
        assert_eq!(counters().0, 0);
    }
}
