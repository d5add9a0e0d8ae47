//! Atomic f64 built on `AtomicU64` bit casts.

use std::sync::atomic::{AtomicU64, Ordering};

/// An `f64` that can be shared between the producer and audio threads.
///
/// All accesses go through bit casts; ordering is the caller's choice, but
/// plain `Relaxed` is enough everywhere this is used since the values are
/// tuning knobs and cursors that tolerate staleness.
#[derive(Debug)]
pub(crate) struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub(crate) const fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub(crate) fn load(&self, order: Ordering) -> f64 {
        f64::from_bits(self.0.load(order))
    }

    pub(crate) fn store(&self, value: f64, order: Ordering) {
        self.0.store(value.to_bits(), order);
    }
}
