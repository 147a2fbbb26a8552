//! A native runtime heap with a concurrent mark and sweep collector.
//!
//! `cms-gc` manages memory for a language runtime whose objects are described
//! by [`TypeInfo`] descriptors. Mutator threads allocate without locking into
//! thread-local queues; a dedicated GC thread periodically stops them at
//! safepoints, marks everything reachable from the roots reported by an
//! [`ObjectGraph`], lets them run again, and sweeps the heap concurrently.
//! Garbage that needs finalization is handed, per cycle epoch, to a separate
//! finalizer thread.
//!
//! # Layout
//!
//! - [`storage`]: intrusive node lists (producer, global storage, consumer)
//! - [`object`]: type descriptors, headers and references
//! - [`factory`]: typed allocation, node recovery, locked heap iteration
//! - [`gc`]: the collector
//! - [`MutatorThread`]: what an attached thread uses to allocate and poll
//!
//! # Quick Start
//!
//! ```
//! use std::mem::size_of;
//! use std::sync::Arc;
//! use cms_gc::{GcConfig, GcRuntime, ObjHeader, RootSet, TypeInfo};
//!
//! const NEXT: usize = size_of::<ObjHeader>();
//! const LINK_REFS: &[usize] = &[NEXT];
//! static LINK: TypeInfo = TypeInfo::object("Link", NEXT + 8).with_references(LINK_REFS);
//!
//! let roots = Arc::new(RootSet::new());
//! let runtime = GcRuntime::new(GcConfig::manual(), roots.clone());
//! let mut mutator = runtime.attach_thread();
//!
//! let head = mutator.create_object(&LINK);
//! let tail = mutator.create_object(&LINK);
//! unsafe { head.set_field(NEXT, Some(tail)) };
//! roots.add(head);
//! mutator.create_object(&LINK); // garbage
//!
//! mutator.schedule_and_wait_full_gc();
//! assert_eq!(runtime.alive_objects(), vec![head, tail]);
//! ```
//!
//! # Thread Safety
//!
//! [`MutatorThread`] is `!Send`: each thread attaches on its own. References
//! ([`ObjRef`]) are plain addresses; keeping an object alive is the job of the
//! roots reported to the collector.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod alloc;
pub mod config;
pub mod factory;
pub mod gc;
pub mod metrics;
mod mutator;
pub mod object;
mod spin;
pub mod storage;
mod tracing;

pub use alloc::{AlignedAllocator, ByteAllocator};
pub use config::GcConfig;
pub use factory::{FinalizerQueue, NodeRef, ObjectFactory, ThreadQueue};
pub use gc::{
    CollectorPhase, Epoch, FinalizerHooks, FinalizerProcessor, GcRuntime, GcStateHolder,
    ObjectGraph, RootSet, ThreadState, TypeFinalizers,
};
pub use metrics::{GcMetrics, GlobalMetrics};
pub use mutator::MutatorThread;
pub use object::{
    ArrayHeader, ArrayRef, Color, FinalizerFn, InstanceLayout, ObjHeader, ObjRef, ObjectData,
    TypeInfo, OBJECT_ALIGNMENT,
};

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::alloc::{AlignedAllocator, ByteAllocator};

    static FAILURES_LEFT: AtomicUsize = AtomicUsize::new(0);
    static FAILURES_SEEN: AtomicUsize = AtomicUsize::new(0);

    /// Platform allocator that can be told to fail the next few requests.
    ///
    /// The failure budget is process-wide: tests using it must not run in
    /// parallel with each other.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct FailingAllocator;

    impl FailingAllocator {
        /// Fails the next `count` allocations.
        pub fn fail_next(count: usize) {
            FAILURES_LEFT.store(count, Ordering::SeqCst);
        }

        /// Allocations refused so far.
        pub fn failures() -> usize {
            FAILURES_SEEN.load(Ordering::SeqCst)
        }

        /// Clears both counters.
        pub fn reset() {
            FAILURES_LEFT.store(0, Ordering::SeqCst);
            FAILURES_SEEN.store(0, Ordering::SeqCst);
        }
    }

    impl ByteAllocator for FailingAllocator {
        fn alloc(size: usize, alignment: usize) -> Option<NonNull<u8>> {
            let refused = FAILURES_LEFT
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if refused {
                FAILURES_SEEN.fetch_add(1, Ordering::SeqCst);
                return None;
            }
            AlignedAllocator::alloc(size, alignment)
        }

        unsafe fn free(ptr: NonNull<u8>) {
            // SAFETY: forwarded from the caller.
            unsafe { AlignedAllocator::free(ptr) };
        }
    }
}
