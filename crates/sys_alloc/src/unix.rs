use std::ptr;

/// # Safety
///
/// `alignment` must be a power of two and a multiple of the pointer size.
pub unsafe fn aligned_alloc(size: usize, alignment: usize) -> *mut u8 {
    let mut out: *mut libc::c_void = ptr::null_mut();
    // SAFETY: caller upholds the posix_memalign alignment contract.
    let rc = unsafe { libc::posix_memalign(&mut out, alignment, size) };
    if rc != 0 {
        return ptr::null_mut();
    }
    out.cast::<u8>()
}

/// # Safety
///
/// `ptr` must come from `aligned_alloc`.
pub unsafe fn aligned_free(ptr: *mut u8) {
    // SAFETY: memory from posix_memalign is released with free.
    unsafe { libc::free(ptr.cast::<libc::c_void>()) }
}
