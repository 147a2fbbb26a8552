//! Per-thread handle of an attached mutator.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::alloc::{AlignedAllocator, ByteAllocator};
use crate::factory::{NodeRef, ThreadQueue};
use crate::gc::cms::GcShared;
use crate::gc::safepoint::ThreadControlBlock;
use crate::gc::scheduler::{
    SchedulerThreadData, EXCEPTION_UNWIND_WEIGHT, FUNCTION_PROLOGUE_WEIGHT, LOOP_BODY_WEIGHT,
};
use crate::object::{ArrayRef, ObjRef, TypeInfo};

/// A thread attached to a [`GcRuntime`](crate::GcRuntime).
///
/// Allocation goes to a thread-local queue that becomes visible to the
/// collector when published: explicitly, at a cycle, or when the handle is
/// dropped. The thread must poll one of the `safepoint_*` methods regularly;
/// a cycle cannot mark until every attached thread has reached one.
///
/// Not `Send`: the handle belongs to the thread that attached.
pub struct MutatorThread<A: ByteAllocator = AlignedAllocator> {
    shared: Arc<GcShared<A>>,
    tcb: Arc<ThreadControlBlock<A>>,
    scheduler: SchedulerThreadData,
    _not_send: PhantomData<*const ()>,
}

impl<A: ByteAllocator> MutatorThread<A> {
    pub(crate) fn attach(shared: Arc<GcShared<A>>) -> Self {
        let tcb = shared.threads.register(ThreadQueue::new(&shared.factory));
        let scheduler = SchedulerThreadData::new(shared.config);
        Self {
            shared,
            tcb,
            scheduler,
            _not_send: PhantomData,
        }
    }

    fn queue(&mut self) -> &mut ThreadQueue<A> {
        // SAFETY: this thread is runnable whenever it holds `&mut self`
        // outside `in_native`, so the collector does not touch the queue.
        unsafe { self.tcb.queue() }
    }

    /// Allocates an object.
    ///
    /// Passes an allocation safepoint first. If the allocator is exhausted,
    /// runs a full cycle and retries once; a second failure aborts.
    ///
    /// # Panics
    ///
    /// Panics if `type_info` describes an array.
    pub fn create_object(&mut self, type_info: &'static TypeInfo) -> ObjRef {
        let size = ThreadQueue::<A>::object_allocated_size(type_info);
        self.safepoint_allocation(size);
        if let Some(object) = self.queue().try_create_object(type_info) {
            return object;
        }
        self.on_oom(size);
        self.queue().create_object(type_info)
    }

    /// Allocates an array of `count` elements. Same failure handling as
    /// [`MutatorThread::create_object`].
    ///
    /// # Panics
    ///
    /// Panics if `type_info` does not describe an array.
    pub fn create_array(&mut self, type_info: &'static TypeInfo, count: u32) -> ArrayRef {
        let size = ThreadQueue::<A>::array_allocated_size(type_info, count);
        self.safepoint_allocation(size);
        if let Some(array) = self.queue().try_create_array(type_info, count) {
            return array;
        }
        self.on_oom(size);
        self.queue().create_array(type_info, count)
    }

    /// Makes this thread's allocations visible to the collector.
    pub fn publish(&mut self) {
        self.queue().publish();
    }

    /// Safepoint at a function prologue.
    pub fn safepoint_function_prologue(&mut self) {
        self.safepoint_regular(FUNCTION_PROLOGUE_WEIGHT);
    }

    /// Safepoint at a loop back-edge.
    pub fn safepoint_loop_body(&mut self) {
        self.safepoint_regular(LOOP_BODY_WEIGHT);
    }

    /// Safepoint while unwinding an exception.
    pub fn safepoint_exception_unwind(&mut self) {
        self.safepoint_regular(EXCEPTION_UNWIND_WEIGHT);
    }

    /// Safepoint before allocating `size` bytes.
    pub fn safepoint_allocation(&mut self, size: usize) {
        if self.scheduler.on_safepoint_allocation(size) {
            self.shared.state.schedule();
        }
        self.suspend_if_requested();
    }

    fn safepoint_regular(&mut self, weight: usize) {
        if self.scheduler.on_safepoint_regular(weight) {
            self.shared.state.schedule();
        }
        self.suspend_if_requested();
    }

    #[inline]
    fn suspend_if_requested(&self) {
        if self.shared.threads.is_suspension_requested() {
            self.shared.threads.suspend(&self.tcb);
        }
    }

    /// Requests a cycle and blocks until it has swept.
    ///
    /// Requests made while another caller's cycle is still pending share it.
    pub fn schedule_and_wait_full_gc(&mut self) {
        self.publish();
        let epoch = self.shared.state.schedule();
        self.scheduler.on_gc_requested();
        self.in_native(|shared| shared.state.wait_epoch_finished(epoch));
    }

    /// Requests a cycle and blocks until its finalizers have run.
    pub fn schedule_and_wait_full_gc_with_finalizers(&mut self) {
        self.publish();
        let epoch = self.shared.state.schedule();
        self.scheduler.on_gc_requested();
        self.in_native(|shared| shared.state.wait_epoch_finalized(epoch));
    }

    /// Reacts to the allocator failing to provide `size` bytes: runs a full
    /// cycle so the caller can retry.
    pub fn on_oom(&mut self, size: usize) {
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_oom_retry(size);
        #[cfg(not(feature = "tracing"))]
        let _ = size;
        self.shared.metrics.record_oom();
        self.schedule_and_wait_full_gc();
    }

    /// Drains and stops the finalizer thread.
    #[cfg(any(test, feature = "test-util"))]
    pub fn stop_finalizer_thread_for_tests(&mut self) {
        self.in_native(|shared| shared.finalizer.stop_finalizer_thread());
    }

    /// Allocations not yet published, oldest first.
    pub fn local_objects(&mut self) -> Vec<ObjRef> {
        self.queue().iter().map(|node: NodeRef<'_>| node.as_obj()).collect()
    }

    /// Frees this thread's unpublished allocations without finalization.
    #[cfg(any(test, feature = "test-util"))]
    pub fn clear_for_tests(&mut self) {
        self.queue().clear_for_tests();
    }

    /// Runs `f` outside managed code: the collector may run a whole cycle
    /// meanwhile, and publishes this thread's queue itself.
    fn in_native<R>(&mut self, f: impl FnOnce(&GcShared<A>) -> R) -> R {
        struct NativeScope<'a, A: ByteAllocator> {
            shared: &'a GcShared<A>,
            tcb: &'a ThreadControlBlock<A>,
        }

        impl<A: ByteAllocator> Drop for NativeScope<'_, A> {
            fn drop(&mut self) {
                self.shared.threads.switch_to_runnable(self.tcb);
            }
        }

        self.shared.threads.switch_to_native(&self.tcb);
        let scope = NativeScope {
            shared: &self.shared,
            tcb: &self.tcb,
        };
        f(scope.shared)
    }
}

impl<A: ByteAllocator> Drop for MutatorThread<A> {
    fn drop(&mut self) {
        self.publish();
        self.shared.threads.unregister(&self.tcb);
    }
}
