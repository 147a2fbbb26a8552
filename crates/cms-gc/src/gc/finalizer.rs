//! Finalizer thread.
//!
//! The collector hands each cycle's finalizable garbage to a
//! [`FinalizerProcessor`] tagged with the cycle's epoch. A dedicated thread,
//! started on the first non-empty batch, runs finalizers in the order batches
//! arrived, frees the memory, and reports each completed epoch through a
//! callback. Batches that arrive while a previous one is running are merged,
//! so one callback may cover several epochs: it is always called with the
//! newest.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::alloc::ByteAllocator;
use crate::factory::FinalizerQueue;
use crate::gc::state::Epoch;
use crate::object::ObjRef;

/// Decides which dying objects need finalization, and runs it.
///
/// Finalizers run on the finalizer thread, after the object became
/// unreachable. They must not resurrect the object.
pub trait FinalizerHooks: Send + Sync + 'static {
    /// Returns `true` if `object` must be finalized before it is freed.
    fn has_finalizer(&self, object: ObjRef) -> bool;

    /// Runs the finalizer of `object`.
    fn run_finalizer(&self, object: ObjRef);
}

/// Finalizers declared on [`TypeInfo`](crate::TypeInfo).
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeFinalizers;

impl FinalizerHooks for TypeFinalizers {
    fn has_finalizer(&self, object: ObjRef) -> bool {
        // SAFETY: the collector only asks about objects still in the heap.
        unsafe { object.type_info() }.has_finalizer()
    }

    fn run_finalizer(&self, object: ObjRef) {
        // SAFETY: finalization happens before the node is freed.
        if let Some(finalizer) = unsafe { object.type_info() }.finalizer() {
            finalizer(object);
        }
    }
}

/// Called with the newest epoch whose finalizers have all run.
pub type EpochDoneCallback = Box<dyn Fn(Epoch) + Send + Sync>;

struct Tasks<A: ByteAllocator> {
    queue: FinalizerQueue<A>,
    epoch: Epoch,
    shutdown: bool,
    new_tasks_allowed: bool,
    thread: Option<JoinHandle<()>>,
}

struct Shared<A: ByteAllocator> {
    tasks: Mutex<Tasks<A>>,
    cond: Condvar,
    running: AtomicBool,
    hooks: Arc<dyn FinalizerHooks>,
    epoch_done: EpochDoneCallback,
    on_finalized: Box<dyn Fn(usize) + Send + Sync>,
}

/// Owner of the finalizer thread.
pub struct FinalizerProcessor<A: ByteAllocator> {
    shared: Arc<Shared<A>>,
}

impl<A: ByteAllocator> FinalizerProcessor<A> {
    /// Creates a processor. No thread is started until work arrives.
    pub fn new(hooks: Arc<dyn FinalizerHooks>, epoch_done: EpochDoneCallback) -> Self {
        Self::with_counter(hooks, epoch_done, Box::new(|_| {}))
    }

    pub(crate) fn with_counter(
        hooks: Arc<dyn FinalizerHooks>,
        epoch_done: EpochDoneCallback,
        on_finalized: Box<dyn Fn(usize) + Send + Sync>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                tasks: Mutex::new(Tasks {
                    queue: FinalizerQueue::new(),
                    epoch: 0,
                    shutdown: false,
                    new_tasks_allowed: true,
                    thread: None,
                }),
                cond: Condvar::new(),
                running: AtomicBool::new(false),
                hooks,
                epoch_done,
                on_finalized,
            }),
        }
    }

    /// Hands `tasks` produced by `epoch` to the finalizer thread.
    ///
    /// With nothing to finalize and no thread running, the epoch is reported
    /// done immediately. While the thread is being stopped this waits for the
    /// stop to complete, then restarts it.
    pub fn schedule_tasks(&self, tasks: FinalizerQueue<A>, epoch: Epoch) {
        let mut guard = self.shared.tasks.lock();
        while !guard.new_tasks_allowed {
            self.shared.cond.wait(&mut guard);
        }
        if tasks.is_empty() && guard.thread.is_none() {
            drop(guard);
            (self.shared.epoch_done)(epoch);
            return;
        }
        if guard.thread.is_none() {
            guard.thread = Some(self.spawn());
        }
        guard.queue.merge_with(tasks);
        guard.epoch = epoch;
        self.shared.cond.notify_all();
    }

    /// Drains every scheduled task, then joins the thread. A later
    /// [`FinalizerProcessor::schedule_tasks`] starts a new one.
    ///
    /// A concurrent caller returns once the stop in progress has drained.
    pub fn stop_finalizer_thread(&self) {
        let handle = {
            let mut guard = self.shared.tasks.lock();
            loop {
                if let Some(handle) = guard.thread.take() {
                    guard.shutdown = true;
                    guard.new_tasks_allowed = false;
                    self.shared.cond.notify_all();
                    break handle;
                }
                if guard.new_tasks_allowed {
                    return;
                }
                self.shared.cond.wait(&mut guard);
            }
        };

        let joined = handle.join();

        let mut guard = self.shared.tasks.lock();
        let drained = guard.queue.is_empty();
        guard.shutdown = false;
        guard.new_tasks_allowed = true;
        self.shared.running.store(false, Ordering::Release);
        self.shared.cond.notify_all();
        drop(guard);

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_finalizer_thread(false);

        match joined {
            Ok(()) => assert!(drained, "finalizer thread exited with pending tasks"),
            Err(payload) => {
                if !thread::panicking() {
                    std::panic::resume_unwind(payload);
                }
            }
        }
    }

    /// Returns `true` while the finalizer thread exists. Never blocks.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn spawn(&self) -> JoinHandle<()> {
        self.shared.running.store(true, Ordering::Release);
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_finalizer_thread(true);

        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("cms-gc-finalizer".into())
            .spawn(move || finalizer_loop(&shared))
            .unwrap_or_else(|err| panic!("failed to spawn the finalizer thread: {err}"))
    }
}

impl<A: ByteAllocator> Drop for FinalizerProcessor<A> {
    fn drop(&mut self) {
        self.stop_finalizer_thread();
    }
}

fn finalizer_loop<A: ByteAllocator>(shared: &Shared<A>) {
    let mut finalizers_epoch: Epoch = 0;
    loop {
        let mut guard = shared.tasks.lock();
        while guard.queue.is_empty() && guard.epoch == finalizers_epoch && !guard.shutdown {
            shared.cond.wait(&mut guard);
        }
        if guard.queue.is_empty() && guard.epoch == finalizers_epoch {
            debug_assert!(guard.shutdown);
            return;
        }

        let queue = mem::take(&mut guard.queue);
        let epoch = guard.epoch;
        drop(guard);

        let finalized = queue.finalize(&*shared.hooks);
        drop(queue);
        (shared.on_finalized)(finalized);

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_finalizers_done(epoch, finalized);

        (shared.epoch_done)(epoch);
        finalizers_epoch = epoch;
    }
}
