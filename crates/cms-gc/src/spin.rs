//! Spinlock guarding the global allocation list.
//!
//! Critical sections under this lock are a handful of pointer writes (publish)
//! or one sweep pass by the collector thread, so spinning with backoff beats
//! parking.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::utils::Backoff;
use parking_lot::lock_api::{self, GuardSend};

/// Raw test-and-test-and-set lock.
pub struct RawSpinLock {
    locked: AtomicBool,
}

// SAFETY: `lock` only returns once the flag was flipped from false to true with
// acquire ordering, and `unlock` releases it, so at most one holder exists.
unsafe impl lock_api::RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = GuardSend;

    fn lock(&self) {
        let backoff = Backoff::new();
        while !self.try_lock() {
            while self.locked.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// Spinlock-protected value.
pub type SpinLock<T> = lock_api::Mutex<RawSpinLock, T>;

/// Guard returned by [`SpinLock::lock`].
pub type SpinLockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;
