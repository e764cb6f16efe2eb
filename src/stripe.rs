//! The per-stripe handle
//!
//! A `Stripe` tracks one in-flight write-buffer stripe from assignment
//! through fill, flush and release. The handle is shared: the registry slot
//! owns one `Arc` clone and concurrent readers hold their own, so a stripe
//! stays alive past its slot being freed.
//!
//! State machine per stripe:
//!
//! ```text
//! assign → (block fills & refcount traffic) → active flush target
//!        → flush armed → finished → slot freed
//! ```
//!
//! `blks_remaining` counts blocks not yet durably written and only ever
//! decreases. `finished` is published with release ordering after the
//! user-area write and reverse-map persist complete, so a reader that
//! observes it acquires every prior reverse-map store.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use crate::addr::{
    BlkOffset, Rba, StripeId, VolumeId, INVALID_RBA, INVALID_VOLUME, UNMAP_STRIPE,
};
use crate::error::{Error, Result};
use crate::ports::{EventPtr, EventScheduler};

/// Shared handle to a stripe.
pub type StripePtr = Arc<Stripe>;

/// One reverse-map slot: the RBA that wrote a block and its volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReverseMapEntry {
    pub rba: Rba,
    pub volume_id: VolumeId,
}

impl ReverseMapEntry {
    /// The sentinel entry carried by unwritten blocks.
    pub const INVALID: ReverseMapEntry = ReverseMapEntry {
        rba: INVALID_RBA,
        volume_id: INVALID_VOLUME,
    };
}

// =============================================================================
// FlushIo
// =============================================================================

/// Participation handle for a caller-driven flush operation.
///
/// A volume flush attaches one `FlushIo` to every write-buffer stripe it
/// covers; each stripe completion decrements the outstanding count and the
/// caller awaits `is_done`.
#[derive(Debug)]
pub struct FlushIo {
    volume_id: VolumeId,
    outstanding: AtomicU32,
}

impl FlushIo {
    pub fn new(volume_id: VolumeId) -> Arc<Self> {
        Arc::new(Self {
            volume_id,
            outstanding: AtomicU32::new(0),
        })
    }

    pub fn volume_id(&self) -> VolumeId {
        self.volume_id
    }

    pub fn stripe_started(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    pub fn stripe_completed(&self) {
        let prev = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        if prev.is_err() {
            error!(volume_id = self.volume_id, "flush io completion underflow");
            debug_assert!(false, "flush io completion underflow");
        }
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.outstanding() == 0
    }
}

// =============================================================================
// Stripe
// =============================================================================

/// An in-flight write-buffer stripe.
#[derive(Debug)]
pub struct Stripe {
    vsid: StripeId,
    wb_lsid: StripeId,
    user_lsid: StripeId,
    volume_id: VolumeId,

    blks_remaining: AtomicU32,
    ref_count: AtomicU32,
    finished: AtomicBool,
    active_flush_target: AtomicBool,
    flush_armed: AtomicBool,

    flush_io: Mutex<Option<Arc<FlushIo>>>,
    rev_map_pack: RwLock<Vec<ReverseMapEntry>>,
}

impl Stripe {
    /// Construct a fresh, unassigned stripe with all blocks remaining.
    pub fn new(blks_per_stripe: u32) -> Self {
        Self {
            vsid: UNMAP_STRIPE,
            wb_lsid: UNMAP_STRIPE,
            user_lsid: UNMAP_STRIPE,
            volume_id: INVALID_VOLUME,
            blks_remaining: AtomicU32::new(blks_per_stripe),
            ref_count: AtomicU32::new(0),
            finished: AtomicBool::new(false),
            active_flush_target: AtomicBool::new(false),
            flush_armed: AtomicBool::new(false),
            flush_io: Mutex::new(None),
            rev_map_pack: RwLock::new(vec![
                ReverseMapEntry::INVALID;
                blks_per_stripe as usize
            ]),
        }
    }

    /// One-shot identity initialization, before the stripe is shared.
    pub fn assign(
        &mut self,
        vsid: StripeId,
        wb_lsid: StripeId,
        user_lsid: StripeId,
        volume_id: VolumeId,
    ) {
        self.vsid = vsid;
        self.wb_lsid = wb_lsid;
        self.user_lsid = user_lsid;
        self.volume_id = volume_id;
    }

    // -------------------------------------------------------------------------
    // Reference counting
    // -------------------------------------------------------------------------

    /// Register one reader holding this stripe through its LSA.
    pub fn refer(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop `block_count` block references.
    pub fn derefer(&self, block_count: u32) {
        let prev = self.ref_count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            v.checked_sub(block_count)
        });
        if prev.is_err() {
            error!(
                wb_lsid = self.wb_lsid,
                block_count, "stripe dereference underflow"
            );
            debug_assert!(false, "stripe dereference underflow");
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Fill accounting
    // -------------------------------------------------------------------------

    /// Atomically subtract `count` unwritten blocks, returning the new value.
    ///
    /// Subtracting more than the current count is a caller bug; it is logged
    /// and leaves the counter at zero.
    pub fn decrease_blks_remaining(&self, count: u32) -> u32 {
        match self
            .blks_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(count))
        {
            Ok(prev) => prev - count,
            Err(prev) => {
                error!(
                    wb_lsid = self.wb_lsid,
                    remaining = prev,
                    count,
                    "blks_remaining underflow"
                );
                debug_assert!(false, "blks_remaining underflow");
                self.blks_remaining.store(0, Ordering::Release);
                0
            }
        }
    }

    pub fn blks_remaining(&self) -> u32 {
        self.blks_remaining.load(Ordering::Acquire)
    }

    /// Write one reverse-map slot for a block of this stripe.
    ///
    /// Callers serialize writes per stripe through the active-tail mutex or
    /// run single-threaded during replay.
    pub fn update_reverse_map_entry(&self, offset: BlkOffset, rba: Rba, volume_id: VolumeId) {
        let mut pack = self.rev_map_pack.write();
        let idx = offset as usize;
        if idx >= pack.len() {
            error!(
                wb_lsid = self.wb_lsid,
                offset, "reverse map offset out of range"
            );
            debug_assert!(false, "reverse map offset out of range");
            return;
        }
        pack[idx] = ReverseMapEntry { rba, volume_id };
    }

    /// Run `f` against the mutable reverse-map pack.
    pub fn with_rev_map_pack_mut<R>(&self, f: impl FnOnce(&mut [ReverseMapEntry]) -> R) -> R {
        let mut pack = self.rev_map_pack.write();
        f(&mut pack)
    }

    /// Snapshot of one reverse-map entry.
    pub fn rev_map_entry(&self, offset: BlkOffset) -> Option<ReverseMapEntry> {
        self.rev_map_pack.read().get(offset as usize).copied()
    }

    // -------------------------------------------------------------------------
    // Flush lifecycle
    // -------------------------------------------------------------------------

    /// Mark the stripe as committed for flush. Idempotent; once set, no
    /// further block allocations land on this stripe.
    pub fn set_active_flush_target(&self) {
        self.active_flush_target.store(true, Ordering::Release);
    }

    pub fn is_active_flush_target(&self) -> bool {
        self.active_flush_target.load(Ordering::Acquire)
    }

    /// Arm the flush and enqueue its submission event.
    ///
    /// Rejected when the stripe still has unwritten blocks or when a flush
    /// was already armed; the completion side of `event` is expected to call
    /// [`Stripe::set_finished`].
    pub fn flush(&self, event: EventPtr, scheduler: &dyn EventScheduler) -> Result<()> {
        let remaining = self.blks_remaining();
        if remaining != 0 {
            return Err(Error::StripeNotFull {
                wb_lsid: self.wb_lsid,
                remaining,
            });
        }

        if self
            .flush_armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::FlushAlreadyRequested {
                wb_lsid: self.wb_lsid,
            });
        }

        scheduler.enqueue_event(event);
        Ok(())
    }

    /// Publish flush completion.
    ///
    /// Called after the user-area write and reverse-map persist are both
    /// durable. Completes any attached flush-io participation.
    pub fn set_finished(&self) {
        self.finished.store(true, Ordering::Release);

        let mut slot = self.flush_io.lock();
        if let Some(flush_io) = slot.take() {
            flush_io.stripe_completed();
            debug!(
                wb_lsid = self.wb_lsid,
                volume_id = flush_io.volume_id(),
                "stripe flush completion reported to flush io"
            );
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Attach a caller's flush-io handle so this stripe's completion
    /// participates in it. A no-op on an already finished stripe.
    ///
    /// At most one flush operation is outstanding per volume, so an attach
    /// never races another attach on the same stripe.
    pub fn update_flush_io(&self, flush_io: Arc<FlushIo>) {
        let mut slot = self.flush_io.lock();
        if self.is_finished() {
            return;
        }
        flush_io.stripe_started();
        *slot = Some(flush_io);
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn vsid(&self) -> StripeId {
        self.vsid
    }

    pub fn wb_lsid(&self) -> StripeId {
        self.wb_lsid
    }

    pub fn user_lsid(&self) -> StripeId {
        self.user_lsid
    }

    pub fn volume_id(&self) -> VolumeId {
        self.volume_id
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::InlineEventScheduler;

    struct NoopEvent;

    impl crate::ports::Event for NoopEvent {
        fn execute(&self) -> bool {
            true
        }
    }

    fn assigned_stripe(blks: u32) -> Stripe {
        let mut stripe = Stripe::new(blks);
        stripe.assign(100, 3, 100, 7);
        stripe
    }

    #[test]
    fn test_assign_sets_identity() {
        let stripe = assigned_stripe(8);
        assert_eq!(stripe.vsid(), 100);
        assert_eq!(stripe.wb_lsid(), 3);
        assert_eq!(stripe.user_lsid(), 100);
        assert_eq!(stripe.volume_id(), 7);
        assert_eq!(stripe.blks_remaining(), 8);
        assert!(!stripe.is_finished());
    }

    #[test]
    fn test_refer_derefer() {
        let stripe = assigned_stripe(8);

        stripe.refer();
        stripe.refer();
        assert_eq!(stripe.ref_count(), 2);

        stripe.derefer(2);
        assert_eq!(stripe.ref_count(), 0);
    }

    #[test]
    fn test_decrease_blks_remaining() {
        let stripe = assigned_stripe(8);

        assert_eq!(stripe.decrease_blks_remaining(5), 3);
        assert_eq!(stripe.decrease_blks_remaining(3), 0);
        assert_eq!(stripe.blks_remaining(), 0);
    }

    #[test]
    fn test_decrease_zero_is_noop() {
        let stripe = assigned_stripe(8);
        assert_eq!(stripe.decrease_blks_remaining(0), 8);
    }

    #[test]
    fn test_reverse_map_entries_start_invalid() {
        let stripe = assigned_stripe(4);
        for offset in 0..4 {
            assert_eq!(stripe.rev_map_entry(offset), Some(ReverseMapEntry::INVALID));
        }
        assert_eq!(stripe.rev_map_entry(4), None);
    }

    #[test]
    fn test_update_reverse_map_entry() {
        let stripe = assigned_stripe(4);
        stripe.update_reverse_map_entry(1, 0x1000, 7);

        assert_eq!(
            stripe.rev_map_entry(1),
            Some(ReverseMapEntry {
                rba: 0x1000,
                volume_id: 7
            })
        );
        assert_eq!(stripe.rev_map_entry(0), Some(ReverseMapEntry::INVALID));
    }

    #[test]
    fn test_set_active_flush_target_idempotent() {
        let stripe = assigned_stripe(4);
        assert!(!stripe.is_active_flush_target());

        stripe.set_active_flush_target();
        stripe.set_active_flush_target();
        assert!(stripe.is_active_flush_target());
    }

    #[test]
    fn test_flush_rejects_unfilled_stripe() {
        let stripe = assigned_stripe(4);
        let scheduler = InlineEventScheduler::default();

        let result = stripe.flush(Arc::new(NoopEvent), &scheduler);
        assert!(matches!(result, Err(Error::StripeNotFull { remaining: 4, .. })));
    }

    #[test]
    fn test_flush_rejects_double_arm() {
        let stripe = assigned_stripe(4);
        stripe.decrease_blks_remaining(4);
        let scheduler = InlineEventScheduler::default();

        assert!(stripe.flush(Arc::new(NoopEvent), &scheduler).is_ok());
        let second = stripe.flush(Arc::new(NoopEvent), &scheduler);
        assert!(matches!(second, Err(Error::FlushAlreadyRequested { .. })));
    }

    #[test]
    fn test_flush_io_participation() {
        let stripe = Arc::new(assigned_stripe(4));
        let flush_io = FlushIo::new(7);

        stripe.update_flush_io(flush_io.clone());
        assert_eq!(flush_io.outstanding(), 1);
        assert!(!flush_io.is_done());

        stripe.set_finished();
        assert!(flush_io.is_done());
    }

    #[test]
    fn test_flush_io_not_attached_after_finish() {
        let stripe = Arc::new(assigned_stripe(4));
        stripe.set_finished();

        let flush_io = FlushIo::new(7);
        stripe.update_flush_io(flush_io.clone());
        assert!(flush_io.is_done());
    }
}
