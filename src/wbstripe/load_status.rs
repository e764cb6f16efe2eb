//! Outstanding-copy tracking for the replay stripe loader

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tracing::error;

/// Counts stripe copies in flight during replay loading.
///
/// The loader marks each issued copy with `load_started`; the write
/// completion callback marks `load_ended`. `is_done` holds once every
/// issued copy has completed.
#[derive(Debug, Default)]
pub struct StripeLoadStatus {
    in_flight: AtomicU32,
    total_loaded: AtomicU64,
}

impl StripeLoadStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear state before a new load pass.
    pub fn reset(&self) {
        self.in_flight.store(0, Ordering::SeqCst);
    }

    pub fn load_started(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn load_ended(&self) {
        let prev = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        if prev.is_err() {
            error!("stripe load completion without a matching start");
            debug_assert!(false, "stripe load completion without a matching start");
            return;
        }
        self.total_loaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_done(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
    }

    /// Stripes loaded over the lifetime of this status object.
    pub fn total_loaded(&self) -> u64 {
        self.total_loaded.load(Ordering::Relaxed)
    }
}
