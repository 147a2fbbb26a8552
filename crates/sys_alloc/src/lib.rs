//! Aligned allocation straight from the platform C allocator.
//!
//! The collector allocates every heap node through this crate. Failure is
//! reported as a null pointer and never panics, so the caller decides whether to
//! collect and retry or to abort.

use std::ptr;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

/// Smallest alignment handed to the platform allocator.
///
/// `posix_memalign` rejects alignments below the pointer size.
pub const MIN_ALIGNMENT: usize = std::mem::size_of::<usize>();

/// Allocates `size` bytes aligned to `alignment`.
///
/// Returns null if the platform allocator is exhausted or `alignment` is not a
/// power of two. A zero `size` still yields a unique, freeable pointer.
#[must_use]
pub fn alloc(size: usize, alignment: usize) -> *mut u8 {
    if !alignment.is_power_of_two() {
        return ptr::null_mut();
    }
    let alignment = alignment.max(MIN_ALIGNMENT);
    let size = size.max(1);
    // SAFETY: alignment is a power of two no smaller than the pointer size and
    // size is non-zero.
    unsafe { os::aligned_alloc(size, alignment) }
}

/// Releases memory obtained from [`alloc`].
///
/// # Safety
///
/// `ptr` must have been returned by [`alloc`] and not freed since. Null is
/// ignored.
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    // SAFETY: caller guarantees ptr came from `alloc`.
    unsafe { os::aligned_free(ptr) }
}
