//! Write-buffer stripe manager
//!
//! Owns the lifecycle of in-flight write-buffer stripes: registration,
//! reverse-map maintenance, reader reference counting, flush triggering,
//! quiescing for volume operations, and replay-time reconstruction plus
//! reloading of stripes that were in the NVM region at shutdown.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        WbStripeManager                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                   │
//! │  writer paths ──▶ finish_stripe ─────────┐                        │
//! │                                          ▼                        │
//! │  admin ─────────▶ finish_active_stripe ─▶ fill tail + flush       │
//! │                                          │                        │
//! │  readers ───────▶ refer / derefer        ▼                        │
//! │                  ┌──────────────────────────────┐                 │
//! │                  │ registry: slots[0..N) by     │                 │
//! │                  │ write-buffer LSID            │                 │
//! │                  └──────────────────────────────┘                 │
//! │                                          │                        │
//! │  replay ────────▶ reconstruct + load ────┘                        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A stripe slot goes from empty to populated only through
//! [`WbStripeManager::assign_stripe`], and back to empty only through
//! [`WbStripeManager::free_wb_stripe_id`] once the stripe is finished.
//! Readers that looked a stripe up through its LSA keep it alive through
//! the shared handle even while the slot is being freed.

pub mod events;
pub mod load_status;

#[cfg(test)]
mod proptest;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::addr::{
    AddressInfo, AsTailArrayIdx, BlkOffset, Rba, StripeAddr, StripeId, StripeLoc, VirtualBlkAddr,
    VirtualBlks, VolumeId, INVALID_RBA, INVALID_VOLUME, UNMAP_OFFSET, UNMAP_STRIPE, UNMAP_VSA,
};
use crate::buffer::BufferPool;
use crate::error::{Error, Result};
use crate::ports::{
    AllocatorContext, EventPtr, EventScheduler, QosManager, ReverseMapService, StripeIo,
    StripeMapService, VolumeInfoService, VolumeMountStatus,
};
use crate::stripe::{FlushIo, Stripe, StripePtr};

use events::{FlushSubmission, ReadStripe, ReadStripeCompletion, WriteStripeCompletion};
use load_status::StripeLoadStatus;

/// Poll period for the drain and load waits.
const WAIT_POLL: Duration = Duration::from_micros(1);

// =============================================================================
// Collaborators and stats
// =============================================================================

/// The collaborator handles the manager is constructed with.
#[derive(Clone)]
pub struct WbStripeServices {
    pub stripe_map: Arc<dyn StripeMapService>,
    pub reverse_map: Arc<dyn ReverseMapService>,
    pub volume_info: Arc<dyn VolumeInfoService>,
    pub allocator_ctx: Arc<dyn AllocatorContext>,
    pub qos: Arc<dyn QosManager>,
    pub event_scheduler: Arc<dyn EventScheduler>,
    pub stripe_io: Arc<dyn StripeIo>,
}

/// Operation counters.
#[derive(Debug, Default)]
pub struct WbStripeStats {
    pub stripes_assigned: AtomicU64,
    pub stripes_freed: AtomicU64,
    pub flushes_requested: AtomicU64,
    pub flush_failures: AtomicU64,
    pub stripe_loads: AtomicU64,
}

// =============================================================================
// Manager
// =============================================================================

/// Manages the fixed table of in-flight write-buffer stripes.
pub struct WbStripeManager {
    addr_info: AddressInfo,
    array_name: String,
    array_id: u32,
    services: WbStripeServices,

    /// One slot per write-buffer LSID; never resized after construction.
    slots: Vec<RwLock<Option<StripePtr>>>,

    /// Chunk buffers for the replay copy pipeline, sized for every slot.
    buffer_pool: RwLock<Option<Arc<BufferPool>>>,

    load_status: Arc<StripeLoadStatus>,
    stats: WbStripeStats,
}

impl WbStripeManager {
    /// Build a manager for `array_name`, creating the write-buffer pool and
    /// an empty registry sized to the configured stripe count.
    pub fn new(
        addr_info: AddressInfo,
        array_name: impl Into<String>,
        array_id: u32,
        services: WbStripeServices,
    ) -> Result<Arc<Self>> {
        addr_info.validate()?;

        let array_name = array_name.into();
        let pool = BufferPool::new(
            format!("wbstripe-{array_name}"),
            addr_info.chunk_size,
            addr_info.total_chunks(),
        )?;

        let slots = (0..addr_info.total_nvm_stripes)
            .map(|_| RwLock::new(None))
            .collect();

        Ok(Arc::new(Self {
            addr_info,
            array_name,
            array_id,
            services,
            slots,
            buffer_pool: RwLock::new(Some(Arc::new(pool))),
            load_status: Arc::new(StripeLoadStatus::new()),
            stats: WbStripeStats::default(),
        }))
    }

    pub fn addr_info(&self) -> &AddressInfo {
        &self.addr_info
    }

    pub fn stats(&self) -> &WbStripeStats {
        &self.stats
    }

    /// Tear down: empty every slot, reset load tracking, drop the pool.
    /// Idempotent.
    pub fn dispose(&self) {
        for slot in &self.slots {
            *slot.write() = None;
        }
        self.load_status.reset();
        *self.buffer_pool.write() = None;
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Place a stripe into the slot named by its write-buffer LSID.
    ///
    /// The slot must be empty; a double assign is a caller bug.
    pub fn assign_stripe(&self, stripe: StripePtr) {
        let wb_lsid = stripe.wb_lsid();
        let Some(slot) = self.slots.get(wb_lsid as usize) else {
            error!(wb_lsid, "cannot assign stripe outside the write buffer");
            debug_assert!(false, "stripe slot out of range");
            return;
        };

        let mut guard = slot.write();
        if guard.is_some() {
            error!(wb_lsid, "stripe slot already occupied");
            debug_assert!(false, "stripe slot already occupied");
            return;
        }
        *guard = Some(stripe);
        self.stats.stripes_assigned.fetch_add(1, Ordering::Relaxed);
    }

    /// Current occupant of a slot, if any.
    pub fn get_stripe(&self, wb_lsid: StripeId) -> Option<StripePtr> {
        self.slots
            .get(wb_lsid as usize)
            .and_then(|slot| slot.read().clone())
    }

    /// Release a finished stripe's slot and give its write-buffer stripe id
    /// back to the allocator and QoS accounting.
    pub fn free_wb_stripe_id(&self, wb_lsid: StripeId) {
        if wb_lsid == UNMAP_STRIPE {
            error!("cannot free the unmap stripe id");
            debug_assert!(false, "cannot free the unmap stripe id");
            return;
        }
        let Some(slot) = self.slots.get(wb_lsid as usize) else {
            error!(wb_lsid, "cannot free a slot outside the write buffer");
            debug_assert!(false, "stripe slot out of range");
            return;
        };

        {
            let mut guard = slot.write();
            match guard.as_ref() {
                None => {
                    error!(wb_lsid, "freeing an empty stripe slot");
                    debug_assert!(false, "freeing an empty stripe slot");
                    return;
                }
                Some(stripe) if !stripe.is_finished() => {
                    error!(wb_lsid, "freeing a stripe that is not finished");
                    debug_assert!(false, "freeing a stripe that is not finished");
                    return;
                }
                Some(_) => {}
            }
            *guard = None;
        }

        self.services.allocator_ctx.release_wb_stripe(wb_lsid);
        self.services.qos.decrease_used_stripe_cnt(&self.array_name);
        self.stats.stripes_freed.fetch_add(1, Ordering::Relaxed);
    }

    /// Resolve an LSA to its registered stripe. User-area addresses have no
    /// write-buffer stripe and resolve to none.
    fn stripe_by_lsa(&self, lsa: &StripeAddr) -> Option<StripePtr> {
        if self.services.stripe_map.is_in_user_data_area(lsa) {
            return None;
        }
        self.get_stripe(lsa.stripe_id)
    }

    // =========================================================================
    // Reader reference counting
    // =========================================================================

    /// Pin the stripe behind `lsa` for a reader. Returns false when the
    /// data already lives in the user area.
    pub fn refer_lsid(&self, lsa: &StripeAddr) -> bool {
        match self.stripe_by_lsa(lsa) {
            Some(stripe) => {
                stripe.refer();
                true
            }
            None => false,
        }
    }

    /// Drop `block_count` reader references from the stripe behind `lsa`.
    pub fn derefer_lsid(&self, lsa: &StripeAddr, block_count: u32) {
        if let Some(stripe) = self.stripe_by_lsa(lsa) {
            stripe.derefer(block_count);
        }
    }

    // =========================================================================
    // Flush coordination
    // =========================================================================

    /// Writer-path stripe finalization: fill the unwritten tail with
    /// sentinel reverse-map entries and commit the stripe for flush.
    ///
    /// Flush submission itself is left to the writer's machinery or to
    /// [`WbStripeManager::flush_all_pending_stripes`].
    pub fn finish_stripe(&self, wb_lsid: StripeId, tail: VirtualBlkAddr) {
        if wb_lsid >= self.addr_info.total_nvm_stripes {
            error!(wb_lsid, "requested to finish stripe with wrong wb lsid");
            return;
        }

        let Some(stripe) = self.get_stripe(wb_lsid) else {
            error!(wb_lsid, "requested to finish an unassigned stripe");
            debug_assert!(false, "requested to finish an unassigned stripe");
            return;
        };

        let range = self.remaining_blocks(tail);
        let flush_required =
            self.fill_blocks_to_stripe(&stripe, range.start_vsa.offset, range.num_blks);
        if flush_required {
            info!(wb_lsid, "stripe is ready to be flushed");
        }
    }

    /// Sweep the open stripe of one active-tail index, filling whatever the
    /// writer left unwritten and submitting the flush when that drains the
    /// stripe. Returns the swept stripe, or none when no stripe was open.
    pub fn finish_active_stripe(&self, index: AsTailArrayIdx) -> Option<StripePtr> {
        let lock = self.services.allocator_ctx.active_stripe_tail_lock(index);
        let guard = lock.lock();

        let tail = self.services.allocator_ctx.active_stripe_tail(index);
        if tail.is_unmap() {
            debug!(index, "no active stripe for index");
            return None;
        }

        let lsa = self.services.stripe_map.lsa(tail.stripe_id);
        if lsa.stripe_loc == StripeLoc::InUserArea || lsa.is_unmap() {
            debug!(index, "active stripe has already left the write buffer");
            return None;
        }

        let wb_lsid = lsa.stripe_id;
        let range = self.remaining_blocks(tail);
        self.services
            .allocator_ctx
            .set_active_stripe_tail(index, UNMAP_VSA);
        drop(guard);

        if range.start_vsa.is_unmap() {
            debug!(index, wb_lsid, "active stripe has no blocks left to fill");
            return None;
        }

        debug!(
            index,
            wb_lsid,
            start_offset = range.start_vsa.offset,
            num_blks = range.num_blks,
            "finishing active stripe"
        );
        self.finish_remaining_blocks(wb_lsid, range.start_vsa.offset, range.num_blks)
    }

    /// Submit a flush for every registered stripe that is full but not yet
    /// finished. The last failure wins; the scan always completes.
    ///
    /// Replay withholds flushes until the array can take I/O, then calls
    /// this once. It takes no per-slot locks against concurrent fills, so
    /// it must not run beside live writers.
    pub fn flush_all_pending_stripes(&self) -> Result<()> {
        let mut last_err = None;

        for slot in &self.slots {
            let Some(stripe) = slot.read().clone() else {
                continue;
            };
            if stripe.blks_remaining() != 0 || stripe.is_finished() {
                continue;
            }

            match self.request_stripe_flush(&stripe) {
                Ok(()) => {
                    debug!(
                        vsid = stripe.vsid(),
                        wb_lsid = stripe.wb_lsid(),
                        "requested stripe flush"
                    );
                }
                Err(e) => {
                    error!(
                        vsid = stripe.vsid(),
                        wb_lsid = stripe.wb_lsid(),
                        error = %e,
                        "request stripe flush failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Block until every write-buffer stripe has drained and flushed,
    /// sweeping each volume's open stripe first.
    pub fn flush_all_wb_stripes(&self) -> Result<()> {
        for volume_id in 0..self.addr_info.num_volumes {
            self.finish_active_stripe(volume_id);
        }

        for slot in &self.slots {
            if let Some(stripe) = slot.read().clone() {
                self.wait_for_stripe_flush_complete(&stripe);
            }
        }

        Ok(())
    }

    /// Block until every stripe of one volume has drained and flushed.
    pub fn flush_all_pending_stripes_in_volume(&self, volume_id: VolumeId) -> Result<()> {
        self.finish_active_stripe(volume_id);

        for slot in &self.slots {
            let Some(stripe) = slot.read().clone() else {
                continue;
            };
            if stripe.volume_id() != volume_id {
                continue;
            }
            self.wait_for_stripe_flush_complete(&stripe);
        }

        Ok(())
    }

    /// Attach a caller's flush operation to every stripe of a mounted
    /// volume instead of waiting here; the caller awaits `flush_io`.
    pub fn flush_all_pending_stripes_in_volume_with_io(
        &self,
        volume_id: VolumeId,
        flush_io: Arc<FlushIo>,
    ) -> Result<()> {
        if self.services.volume_info.mount_status(volume_id) == VolumeMountStatus::Mounted {
            if let Some(active) = self.finish_active_stripe(volume_id) {
                info!(
                    volume_id,
                    wb_lsid = active.wb_lsid(),
                    vsid = active.vsid(),
                    remaining = active.blks_remaining(),
                    "picked active stripe"
                );
            }

            for slot in &self.slots {
                let Some(stripe) = slot.read().clone() else {
                    continue;
                };
                if stripe.volume_id() != volume_id {
                    continue;
                }
                stripe.update_flush_io(flush_io.clone());
            }
        }

        Ok(())
    }

    fn wait_for_stripe_flush_complete(&self, stripe: &StripePtr) {
        while stripe.blks_remaining() > 0 {
            thread::sleep(WAIT_POLL);
        }
        while !stripe.is_finished() {
            thread::sleep(WAIT_POLL);
        }
    }

    /// Tail range policy:
    ///
    /// - an unmapped offset carries no work
    /// - an offset past the stripe end is a caller error, logged, no work
    /// - otherwise the range runs from the tail to the end of the stripe,
    ///   and a zero-length range is normalized to the empty run
    fn remaining_blocks(&self, tail: VirtualBlkAddr) -> VirtualBlks {
        if tail.offset == UNMAP_OFFSET {
            return VirtualBlks::EMPTY;
        }
        let blks_per_stripe = u64::from(self.addr_info.blks_per_stripe);
        if tail.offset > blks_per_stripe {
            error!(
                offset = tail.offset,
                blks_per_stripe, "tail offset beyond stripe end"
            );
            return VirtualBlks::EMPTY;
        }

        let num_blks = (blks_per_stripe - tail.offset) as u32;
        if num_blks == 0 {
            VirtualBlks::EMPTY
        } else {
            VirtualBlks {
                start_vsa: tail,
                num_blks,
            }
        }
    }

    /// Write sentinel reverse-map entries over `[start_offset, start_offset
    /// + num_blks)`, commit the stripe for flush and drop the remaining
    /// count. True when the stripe is now fully drained.
    fn fill_blocks_to_stripe(
        &self,
        stripe: &StripePtr,
        start_offset: BlkOffset,
        num_blks: u32,
    ) -> bool {
        if num_blks > 0 {
            for offset in start_offset..start_offset + u64::from(num_blks) {
                stripe.update_reverse_map_entry(offset, INVALID_RBA, INVALID_VOLUME);
            }
        }
        stripe.set_active_flush_target();
        stripe.decrease_blks_remaining(num_blks) == 0
    }

    /// Arbiter-side tail completion: fill and, when that drains the stripe,
    /// submit the flush immediately.
    fn finish_remaining_blocks(
        &self,
        wb_lsid: StripeId,
        start_offset: BlkOffset,
        num_blks: u32,
    ) -> Option<StripePtr> {
        let Some(stripe) = self.get_stripe(wb_lsid) else {
            warn!(wb_lsid, "active stripe vanished before tail completion");
            return None;
        };

        let flush_required = self.fill_blocks_to_stripe(&stripe, start_offset, num_blks);
        if flush_required {
            match self.request_stripe_flush(&stripe) {
                Ok(()) => {
                    debug!(vsid = stripe.vsid(), wb_lsid, "flushing stripe");
                }
                Err(e) => {
                    error!(
                        vsid = stripe.vsid(),
                        wb_lsid,
                        error = %e,
                        "request stripe flush failed"
                    );
                }
            }
        }

        Some(stripe)
    }

    /// Build a flush-submission event for the stripe and arm it.
    fn request_stripe_flush(&self, stripe: &StripePtr) -> Result<()> {
        self.stats.flushes_requested.fetch_add(1, Ordering::Relaxed);

        let event: EventPtr = Arc::new(FlushSubmission::new(
            stripe.clone(),
            self.services.stripe_io.clone(),
            self.array_id,
        ));
        let result = stripe.flush(event, self.services.event_scheduler.as_ref());
        if result.is_err() {
            self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    // =========================================================================
    // Replay
    // =========================================================================

    /// Rebuild the in-memory stripe for a tail found in the journal and
    /// re-register it at `wb_lsid`, then rebuild its reverse-map pack from
    /// the replayed block infos.
    pub fn reconstruct_active_stripe(
        &self,
        volume_id: VolumeId,
        wb_lsid: StripeId,
        tail_vsa: VirtualBlkAddr,
        rev_map_infos: &BTreeMap<u64, Rba>,
    ) -> Result<()> {
        let vsid = tail_vsa.stripe_id;
        let user_lsid = self.addr_info.vsid_to_user_lsid(vsid);

        let mut stripe = Stripe::new(self.addr_info.blks_per_stripe);
        stripe.assign(vsid, wb_lsid, user_lsid, volume_id);
        let stripe = Arc::new(stripe);
        self.assign_stripe(stripe.clone());

        self.reconstruct_as(&stripe, tail_vsa.offset)?;

        let volume_bytes = self.services.volume_info.volume_size(volume_id)?;
        let total_rba_num = volume_bytes.div_ceil(self.addr_info.block_size);
        stripe.with_rev_map_pack_mut(|pack| {
            self.services.reverse_map.reconstruct_reverse_map(
                volume_id,
                total_rba_num,
                wb_lsid,
                vsid,
                tail_vsa.offset,
                rev_map_infos,
                pack,
            )
        })
    }

    fn reconstruct_as(&self, stripe: &StripePtr, block_count: BlkOffset) -> Result<()> {
        if block_count == 0 {
            error!(block_count, "wrong block count");
            return Err(Error::WrongBlockCount { block_count });
        }

        debug!(
            vsid = stripe.vsid(),
            wb_lsid = stripe.wb_lsid(),
            block_count,
            "reconstructed active stripe"
        );

        let remaining = stripe.decrease_blks_remaining(block_count as u32);
        if remaining == 0 {
            debug!(
                vsid = stripe.vsid(),
                wb_lsid = stripe.wb_lsid(),
                "replayed stripe is full and waiting to be flushed"
            );
        }

        Ok(())
    }

    /// Copy every reconstructed stripe that still maps into the write
    /// buffer back from the user area into its NVM slot, then wait for all
    /// copies to land.
    pub fn load_pending_stripes_to_write_buffer(&self) -> Result<()> {
        self.load_status.reset();

        for slot in &self.slots {
            let Some(stripe) = slot.read().clone() else {
                continue;
            };

            let addr = self.services.stripe_map.lsa(stripe.vsid());
            if addr.is_unmap() {
                continue;
            }
            if addr.stripe_loc != StripeLoc::InWriteBufferArea {
                continue;
            }

            let from = StripeAddr::new(StripeLoc::InUserArea, stripe.user_lsid());
            let to = StripeAddr::new(StripeLoc::InWriteBufferArea, stripe.wb_lsid());

            self.load_status.load_started();
            self.load_stripe(from, to);
            self.stats.stripe_loads.fetch_add(1, Ordering::Relaxed);

            info!(
                vsid = stripe.vsid(),
                wb_lsid = stripe.wb_lsid(),
                user_lsid = stripe.user_lsid(),
                "started loading stripe into the write buffer"
            );
        }

        while !self.load_status.is_done() {
            thread::sleep(WAIT_POLL);
        }

        Ok(())
    }

    /// Issue one asynchronous stripe copy. The pool is sized for every slot
    /// at once, so exhaustion here is a broken process invariant and fatal.
    fn load_stripe(&self, from: StripeAddr, to: StripeAddr) {
        let pool = self.buffer_pool.read().clone();
        let Some(pool) = pool else {
            error!("stripe load requested after dispose");
            panic!("write-buffer pool is gone");
        };

        let chunk_cnt = self.addr_info.chunks_per_stripe as usize;
        let mut buffers = Vec::with_capacity(chunk_cnt);
        for _ in 0..chunk_cnt {
            match pool.try_get() {
                Some(buf) => buffers.push(buf),
                None => {
                    error!(
                        from_stripe = from.stripe_id,
                        to_stripe = to.stripe_id,
                        "failed to allocate buffer for stripe load"
                    );
                    panic!("write-buffer pool exhausted during stripe load");
                }
            }
        }

        let write_done = WriteStripeCompletion::new(pool, self.load_status.clone());
        let read_done = ReadStripeCompletion::new(
            to,
            self.services.stripe_io.clone(),
            write_done,
            self.array_id,
        );
        let read: EventPtr = Arc::new(ReadStripe::new(
            from,
            buffers,
            read_done,
            self.services.stripe_io.clone(),
            self.array_id,
        ));

        self.services.event_scheduler.enqueue_event(read);
    }
}

// =============================================================================
// Tests
// =============================================================================
