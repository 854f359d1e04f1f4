//! Telemetry seams.
//!
//! The core reports progress through injected sinks so it stays decoupled
//! from whatever monitoring stack a deployment wires in. The default
//! implementations are plain relaxed atomics, which is also what the tests
//! read back.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic event counter.
pub trait CounterSink: Send + Sync {
    /// Records one event.
    fn increment(&self);
}

/// Last-value gauge.
pub trait GaugeSink: Send + Sync {
    /// Replaces the current value.
    fn set(&self, value: u64);
}

/// Counter backed by a relaxed atomic.
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Current count.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl CounterSink for AtomicCounter {
    fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// Gauge backed by a relaxed atomic.
#[derive(Debug, Default)]
pub struct AtomicGauge(AtomicU64);

impl AtomicGauge {
    /// Current value.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl GaugeSink for AtomicGauge {
    fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }
}
