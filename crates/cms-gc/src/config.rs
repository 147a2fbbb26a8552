//! Collector configuration.

use std::time::Duration;

/// Tuning knobs for a [`GcRuntime`](crate::GcRuntime).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use cms_gc::GcConfig;
///
/// let mut config = GcConfig::default();
/// config.set_allocation_threshold_bytes(1 << 20);
/// config.set_regular_gc_interval(Some(Duration::from_millis(50)));
/// assert!(config.auto_gc);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcConfig {
    /// Whether the scheduler may request cycles on its own. Explicit requests
    /// work either way.
    pub auto_gc: bool,
    /// Accumulated safepoint weight after which a thread requests a cycle.
    pub safepoint_weight_threshold: usize,
    /// Bytes allocated by one thread after which it requests a cycle.
    pub allocation_threshold_bytes: usize,
    /// The GC thread schedules a cycle itself if no request arrives within
    /// this interval.
    pub regular_gc_interval: Option<Duration>,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl GcConfig {
    /// Default configuration: automatic collection every 8 MiB per thread or
    /// every 100 000 safepoints, and at least every 10 seconds.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            auto_gc: true,
            safepoint_weight_threshold: 100_000,
            allocation_threshold_bytes: 8 * 1024 * 1024,
            regular_gc_interval: Some(Duration::from_secs(10)),
        }
    }

    /// A configuration that only collects on explicit request.
    #[must_use]
    pub const fn manual() -> Self {
        Self {
            auto_gc: false,
            ..Self::new()
        }
    }

    /// Enable or disable scheduler-driven collection.
    pub const fn set_auto_gc(&mut self, enabled: bool) {
        self.auto_gc = enabled;
    }

    /// Set the safepoint weight threshold. Zero is treated as one.
    pub const fn set_safepoint_weight_threshold(&mut self, weight: usize) {
        self.safepoint_weight_threshold = if weight < 1 { 1 } else { weight };
    }

    /// Set the per-thread allocation threshold. Zero is treated as one.
    pub const fn set_allocation_threshold_bytes(&mut self, bytes: usize) {
        self.allocation_threshold_bytes = if bytes < 1 { 1 } else { bytes };
    }

    /// Set or clear the regular collection interval.
    pub const fn set_regular_gc_interval(&mut self, interval: Option<Duration>) {
        self.regular_gc_interval = interval;
    }

    /// Interval the GC thread waits before scheduling on its own, if any.
    #[must_use]
    pub const fn effective_regular_interval(&self) -> Option<Duration> {
        if self.auto_gc {
            self.regular_gc_interval
        } else {
            None
        }
    }
}
