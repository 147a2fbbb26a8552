//! Collector: epoch state, safepoints, scheduling, marking, sweeping and
//! finalization.
//!
//! - [`state`]: epochs and the phase they imply
//! - [`safepoint`]: thread registry and the stop-the-world handshake
//! - [`scheduler`]: per-thread triggers
//! - [`mark`]: roots and graph traversal
//! - [`finalizer`]: the finalizer thread
//! - [`cms`]: the GC thread tying it together

pub mod cms;
pub mod finalizer;
pub mod mark;
pub mod safepoint;
pub mod scheduler;
pub mod state;

pub use cms::GcRuntime;
pub use finalizer::{EpochDoneCallback, FinalizerHooks, FinalizerProcessor, TypeFinalizers};
pub use mark::{MarkStats, ObjectGraph, RootSet};
pub use safepoint::ThreadState;
pub use state::{CollectorPhase, Epoch, GcStateHolder};
