//! The byte allocator behind every heap node.

use std::ptr::NonNull;

/// A source of raw, aligned memory for heap nodes.
///
/// The functions are associated (no `self`) so that nodes can be freed from any
/// thread without carrying an allocator handle around: the collector thread
/// frees unmarked nodes, the finalizer thread frees finalized ones.
pub trait ByteAllocator: Send + Sync + 'static {
    /// Allocates `size` bytes aligned to `alignment`, or returns `None` when the
    /// allocator is exhausted.
    fn alloc(size: usize, alignment: usize) -> Option<NonNull<u8>>;

    /// Releases memory returned by [`ByteAllocator::alloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc` of the same allocator and must not be used
    /// afterwards.
    unsafe fn free(ptr: NonNull<u8>);
}

/// The platform aligned allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlignedAllocator;

impl ByteAllocator for AlignedAllocator {
    #[inline]
    fn alloc(size: usize, alignment: usize) -> Option<NonNull<u8>> {
        NonNull::new(sys_alloc::alloc(size, alignment))
    }

    #[inline]
    unsafe fn free(ptr: NonNull<u8>) {
        // SAFETY: caller guarantees ptr came from `sys_alloc::alloc`.
        unsafe { sys_alloc::free(ptr.as_ptr()) }
    }
}

/// Returns `true` for a usable alignment: a non-zero power of two.
#[must_use]
pub const fn is_valid_alignment(alignment: usize) -> bool {
    alignment.is_power_of_two()
}

/// Rounds `size` up to a multiple of `alignment`.
#[must_use]
pub const fn align_up(size: usize, alignment: usize) -> usize {
    (size + alignment - 1) & !(alignment - 1)
}

/// Returns `true` if `ptr` is aligned to `alignment`.
#[must_use]
pub fn is_aligned(ptr: *const u8, alignment: usize) -> bool {
    (ptr as usize) & (alignment - 1) == 0
}
