/// # Safety
///
/// `alignment` must be a power of two.
pub unsafe fn aligned_alloc(size: usize, alignment: usize) -> *mut u8 {
    // SAFETY: _aligned_malloc accepts any power-of-two alignment.
    unsafe { libc::aligned_malloc(size, alignment).cast::<u8>() }
}

/// # Safety
///
/// `ptr` must come from `aligned_alloc`.
pub unsafe fn aligned_free(ptr: *mut u8) {
    // SAFETY: memory from _aligned_malloc must be released with _aligned_free.
    unsafe { libc::aligned_free(ptr.cast::<libc::c_void>()) }
}
