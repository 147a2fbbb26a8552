//! Thread registry and the stop-the-world handshake.
//!
//! Each attached mutator owns a [`ThreadControlBlock`] with its state and
//! allocation queue. The GC thread stops the world by raising the suspension
//! flag and waiting until no registered thread is [`ThreadState::Runnable`].
//! Mutators observe the flag at safepoints and park until it drops. A thread
//! blocked outside managed code marks itself [`ThreadState::Native`] so the
//! collector does not wait for it.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::alloc::ByteAllocator;
use crate::factory::ThreadQueue;

/// Scheduling state of a mutator thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Running managed code; may touch the heap.
    Runnable = 0,
    /// Outside managed code; will not touch the heap until it is runnable.
    Native = 1,
    /// Parked at a safepoint.
    Suspended = 2,
}

impl ThreadState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Runnable,
            1 => Self::Native,
            _ => Self::Suspended,
        }
    }
}

/// Per-thread control block shared between a mutator and the collector.
pub(crate) struct ThreadControlBlock<A: ByteAllocator> {
    state: AtomicU8,
    /// Owned by the mutator while it is runnable, by the collector while the
    /// world is stopped.
    queue: UnsafeCell<ThreadQueue<A>>,
}

// SAFETY: `queue` is only accessed by the owning mutator while runnable and by
// the GC thread while the mutator is not runnable; the registry lock orders
// these hand-offs.
unsafe impl<A: ByteAllocator> Sync for ThreadControlBlock<A> {}
// SAFETY: `ThreadQueue` is `Send`.
unsafe impl<A: ByteAllocator> Send for ThreadControlBlock<A> {}

impl<A: ByteAllocator> ThreadControlBlock<A> {
    fn new(queue: ThreadQueue<A>) -> Self {
        Self {
            state: AtomicU8::new(ThreadState::Runnable as u8),
            queue: UnsafeCell::new(queue),
        }
    }

    pub(crate) fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// # Safety
    ///
    /// The caller is the owning mutator and it is runnable, or the caller is
    /// the collector and the owner is not runnable. No other reference to the
    /// queue may exist.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn queue(&self) -> &mut ThreadQueue<A> {
        // SAFETY: guaranteed by the caller.
        unsafe { &mut *self.queue.get() }
    }
}

struct RegistryInner<A: ByteAllocator> {
    threads: Vec<Arc<ThreadControlBlock<A>>>,
    suspension_requested: bool,
}

/// All attached mutator threads of one runtime.
pub(crate) struct ThreadRegistry<A: ByteAllocator> {
    inner: Mutex<RegistryInner<A>>,
    /// Mirror of `inner.suspension_requested` for the safepoint fast path.
    suspension_requested: AtomicBool,
    cond: Condvar,
}

impl<A: ByteAllocator> ThreadRegistry<A> {
    pub(crate) const fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                threads: Vec::new(),
                suspension_requested: false,
            }),
            suspension_requested: AtomicBool::new(false),
            cond: Condvar::new(),
        }
    }

    /// Registers a new runnable thread. Waits out a suspension in progress.
    pub(crate) fn register(&self, queue: ThreadQueue<A>) -> Arc<ThreadControlBlock<A>> {
        let tcb = Arc::new(ThreadControlBlock::new(queue));
        let mut inner = self.inner.lock();
        while inner.suspension_requested {
            self.cond.wait(&mut inner);
        }
        inner.threads.push(Arc::clone(&tcb));
        tcb
    }

    pub(crate) fn unregister(&self, tcb: &Arc<ThreadControlBlock<A>>) {
        let mut inner = self.inner.lock();
        inner.threads.retain(|t| !Arc::ptr_eq(t, tcb));
        self.cond.notify_all();
    }

    /// Number of attached threads.
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().threads.len()
    }

    #[inline]
    pub(crate) fn is_suspension_requested(&self) -> bool {
        self.suspension_requested.load(Ordering::Acquire)
    }

    /// Parks a runnable thread until the current suspension ends.
    pub(crate) fn suspend(&self, tcb: &ThreadControlBlock<A>) {
        debug_assert_eq!(tcb.state(), ThreadState::Runnable);
        let mut inner = self.inner.lock();
        if !inner.suspension_requested {
            return;
        }
        tcb.set_state(ThreadState::Suspended);
        self.cond.notify_all();
        while inner.suspension_requested {
            self.cond.wait(&mut inner);
        }
        tcb.set_state(ThreadState::Runnable);
    }

    pub(crate) fn switch_to_native(&self, tcb: &ThreadControlBlock<A>) {
        debug_assert_eq!(tcb.state(), ThreadState::Runnable);
        let _inner = self.inner.lock();
        tcb.set_state(ThreadState::Native);
        self.cond.notify_all();
    }

    /// Returns to managed code, waiting out a suspension in progress.
    pub(crate) fn switch_to_runnable(&self, tcb: &ThreadControlBlock<A>) {
        debug_assert_eq!(tcb.state(), ThreadState::Native);
        let mut inner = self.inner.lock();
        while inner.suspension_requested {
            self.cond.wait(&mut inner);
        }
        tcb.set_state(ThreadState::Runnable);
    }

    /// Raises the suspension flag. Returns `false` if it was already raised.
    pub(crate) fn request_suspension(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.suspension_requested {
            return false;
        }
        inner.suspension_requested = true;
        self.suspension_requested.store(true, Ordering::Release);
        true
    }

    /// Blocks until no registered thread is runnable. Returns the number of
    /// registered threads.
    pub(crate) fn wait_for_suspension(&self) -> usize {
        let mut inner = self.inner.lock();
        debug_assert!(inner.suspension_requested);
        while inner
            .threads
            .iter()
            .any(|t| t.state() == ThreadState::Runnable)
        {
            self.cond.wait(&mut inner);
        }
        inner.threads.len()
    }

    /// Publishes the allocation queue of every registered thread.
    ///
    /// # Safety
    ///
    /// The world must be stopped (`wait_for_suspension` returned and
    /// `resume_threads` was not called since).
    pub(crate) unsafe fn publish_all(&self) {
        let inner = self.inner.lock();
        for tcb in &inner.threads {
            assert_ne!(tcb.state(), ThreadState::Runnable, "publishing a running thread");
            // SAFETY: the owner is not runnable and waits on the registry
            // before touching its queue again.
            unsafe { tcb.queue() }.publish();
        }
    }

    pub(crate) fn resume_threads(&self) {
        let mut inner = self.inner.lock();
        inner.suspension_requested = false;
        self.suspension_requested.store(false, Ordering::Release);
        self.cond.notify_all();
    }
}
