//! Per-thread accounting that decides when a mutator requests a cycle.

use crate::config::GcConfig;

/// Weight of a function prologue safepoint.
pub const FUNCTION_PROLOGUE_WEIGHT: usize = 1;
/// Weight of a loop back-edge safepoint.
pub const LOOP_BODY_WEIGHT: usize = 1;
/// Weight of an exception unwind safepoint.
pub const EXCEPTION_UNWIND_WEIGHT: usize = 1;

/// Counters of one mutator thread.
#[derive(Debug)]
pub(crate) struct SchedulerThreadData {
    config: GcConfig,
    safepoint_weight: usize,
    allocated_bytes: usize,
}

impl SchedulerThreadData {
    pub(crate) const fn new(config: GcConfig) -> Self {
        Self {
            config,
            safepoint_weight: 0,
            allocated_bytes: 0,
        }
    }

    /// Accounts a regular safepoint. Returns `true` if a cycle should be
    /// requested.
    pub(crate) fn on_safepoint_regular(&mut self, weight: usize) -> bool {
        if !self.config.auto_gc {
            return false;
        }
        self.safepoint_weight = self.safepoint_weight.saturating_add(weight);
        if self.safepoint_weight >= self.config.safepoint_weight_threshold {
            self.on_gc_requested();
            true
        } else {
            false
        }
    }

    /// Accounts an allocation of `size` bytes. Returns `true` if a cycle
    /// should be requested.
    pub(crate) fn on_safepoint_allocation(&mut self, size: usize) -> bool {
        if !self.config.auto_gc {
            return false;
        }
        self.allocated_bytes = self.allocated_bytes.saturating_add(size);
        if self.allocated_bytes >= self.config.allocation_threshold_bytes {
            self.on_gc_requested();
            true
        } else {
            false
        }
    }

    /// Restarts accounting after this thread requested a cycle.
    pub(crate) fn on_gc_requested(&mut self) {
        self.safepoint_weight = 0;
        self.allocated_bytes = 0;
    }

    #[cfg(test)]
    pub(crate) const fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }
}
