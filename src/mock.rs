//! Mock collaborators for testing the stripe manager without an engine
//!
//! These mirror the production ports with programmable, in-memory behavior:
//! lookup tables for the mapping services, a tail array for the allocator
//! context, an in-memory stripe store for the data path, and two event
//! schedulers (inline for determinism, threaded to exercise the polling
//! waits).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::addr::{
    AsTailArrayIdx, BlkOffset, Rba, StripeAddr, StripeId, StripeLoc, VirtualBlkAddr, VolumeId,
    UNMAP_STRIPE, UNMAP_VSA,
};
use crate::buffer::ChunkBuf;
use crate::error::{Error, Result};
use crate::ports::{
    AllocatorContext, EventPtr, EventScheduler, QosManager, ReverseMapService, StripeIo,
    StripeMapService, VolumeInfoService, VolumeMountStatus,
};
use crate::stripe::{ReverseMapEntry, StripePtr};

// =============================================================================
// Stripe map
// =============================================================================

/// Programmable vsid-to-LSA table. Unknown stripes resolve to an unmapped
/// user-area address.
#[derive(Debug, Default)]
pub struct MockStripeMap {
    table: RwLock<HashMap<StripeId, StripeAddr>>,
}

impl MockStripeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_lsa(&self, vsid: StripeId, lsa: StripeAddr) {
        self.table.write().insert(vsid, lsa);
    }

    pub fn clear_lsa(&self, vsid: StripeId) {
        self.table.write().remove(&vsid);
    }
}

impl StripeMapService for MockStripeMap {
    fn lsa(&self, vsid: StripeId) -> StripeAddr {
        self.table
            .read()
            .get(&vsid)
            .copied()
            .unwrap_or_else(|| StripeAddr::new(StripeLoc::InUserArea, UNMAP_STRIPE))
    }
}

// =============================================================================
// Reverse map
// =============================================================================

/// Arguments of one recorded reconstruction call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconstructCall {
    pub volume_id: VolumeId,
    pub total_rba_num: u64,
    pub wb_lsid: StripeId,
    pub vsid: StripeId,
    pub offset: BlkOffset,
}

/// Records reconstruction calls and fills the pack from the journal infos.
#[derive(Debug, Default)]
pub struct MockReverseMap {
    calls: Mutex<Vec<ReconstructCall>>,
}

impl MockReverseMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ReconstructCall> {
        self.calls.lock().clone()
    }
}

impl ReverseMapService for MockReverseMap {
    fn reconstruct_reverse_map(
        &self,
        volume_id: VolumeId,
        total_rba_num: u64,
        wb_lsid: StripeId,
        vsid: StripeId,
        offset: BlkOffset,
        rev_map_infos: &std::collections::BTreeMap<u64, Rba>,
        pack: &mut [ReverseMapEntry],
    ) -> Result<()> {
        for (&blk_offset, &rba) in rev_map_infos {
            if let Some(entry) = pack.get_mut(blk_offset as usize) {
                *entry = ReverseMapEntry { rba, volume_id };
            }
        }

        self.calls.lock().push(ReconstructCall {
            volume_id,
            total_rba_num,
            wb_lsid,
            vsid,
            offset,
        });
        Ok(())
    }
}

// =============================================================================
// Volume info
// =============================================================================

/// Mount states and sizes keyed by volume id. Unknown volumes report
/// unmounted and fail size lookups.
#[derive(Debug, Default)]
pub struct MockVolumeInfo {
    mounts: RwLock<HashMap<VolumeId, VolumeMountStatus>>,
    sizes: RwLock<HashMap<VolumeId, u64>>,
}

impl MockVolumeInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mount_status(&self, volume_id: VolumeId, status: VolumeMountStatus) {
        self.mounts.write().insert(volume_id, status);
    }

    pub fn set_volume_size(&self, volume_id: VolumeId, bytes: u64) {
        self.sizes.write().insert(volume_id, bytes);
    }
}

impl VolumeInfoService for MockVolumeInfo {
    fn mount_status(&self, volume_id: VolumeId) -> VolumeMountStatus {
        self.mounts
            .read()
            .get(&volume_id)
            .copied()
            .unwrap_or(VolumeMountStatus::Unmounted)
    }

    fn volume_size(&self, volume_id: VolumeId) -> Result<u64> {
        self.sizes
            .read()
            .get(&volume_id)
            .copied()
            .ok_or(Error::VolumeNotFound { volume_id })
    }
}

// =============================================================================
// Allocator context
// =============================================================================

/// Tail array plus per-index locks and a released-stripe log.
#[derive(Debug)]
pub struct MockAllocatorContext {
    tails: Vec<RwLock<VirtualBlkAddr>>,
    locks: Vec<Arc<Mutex<()>>>,
    released: Mutex<Vec<StripeId>>,
}

impl MockAllocatorContext {
    pub fn new(num_indexes: u32) -> Self {
        Self {
            tails: (0..num_indexes).map(|_| RwLock::new(UNMAP_VSA)).collect(),
            locks: (0..num_indexes).map(|_| Arc::new(Mutex::new(()))).collect(),
            released: Mutex::new(Vec::new()),
        }
    }

    /// Write-buffer stripe ids released back to the free list, in order.
    pub fn released(&self) -> Vec<StripeId> {
        self.released.lock().clone()
    }
}

impl AllocatorContext for MockAllocatorContext {
    fn active_stripe_tail(&self, index: AsTailArrayIdx) -> VirtualBlkAddr {
        *self.tails[index as usize].read()
    }

    fn set_active_stripe_tail(&self, index: AsTailArrayIdx, tail: VirtualBlkAddr) {
        *self.tails[index as usize].write() = tail;
    }

    fn active_stripe_tail_lock(&self, index: AsTailArrayIdx) -> Arc<Mutex<()>> {
        self.locks[index as usize].clone()
    }

    fn release_wb_stripe(&self, wb_lsid: StripeId) {
        self.released.lock().push(wb_lsid);
    }
}

// =============================================================================
// QoS
// =============================================================================

/// Counts used-stripe decrements.
#[derive(Debug, Default)]
pub struct MockQosManager {
    decrements: AtomicU32,
}

impl MockQosManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decrements(&self) -> u32 {
        self.decrements.load(Ordering::SeqCst)
    }
}

impl QosManager for MockQosManager {
    fn decrease_used_stripe_cnt(&self, _array_name: &str) {
        self.decrements.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Event schedulers
// =============================================================================

/// Executes every event synchronously on the enqueueing thread.
#[derive(Debug, Default)]
pub struct InlineEventScheduler;

impl InlineEventScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl EventScheduler for InlineEventScheduler {
    fn enqueue_event(&self, event: EventPtr) {
        if !event.execute() {
            warn!("inline event did not complete");
        }
    }
}

/// Executes events on a dedicated worker thread.
///
/// Useful for exercising the manager's polling waits; drop joins the
/// worker after draining the queue.
pub struct ThreadedEventScheduler {
    tx: Mutex<Option<mpsc::Sender<EventPtr>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadedEventScheduler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<EventPtr>();
        let worker = std::thread::spawn(move || {
            for event in rx.iter() {
                if !event.execute() {
                    warn!("scheduled event did not complete");
                }
            }
        });

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }
}

impl Default for ThreadedEventScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventScheduler for ThreadedEventScheduler {
    fn enqueue_event(&self, event: EventPtr) {
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    warn!("event worker is gone, dropping event");
                }
            }
            None => warn!("scheduler shut down, dropping event"),
        }
    }
}

impl Drop for ThreadedEventScheduler {
    fn drop(&mut self) {
        self.tx.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

// =============================================================================
// Stripe I/O backend
// =============================================================================

/// In-memory stripe store keyed by logical stripe address.
///
/// Flushes copy the write-buffer image to the stripe's user-area address;
/// reads and writes move whole chunk lists.
#[derive(Debug, Default)]
pub struct MemStripeIo {
    stripes: Mutex<HashMap<StripeAddr, Vec<Vec<u8>>>>,
    flushed: Mutex<Vec<StripeId>>,
    reads: Mutex<Vec<StripeAddr>>,
    writes: Mutex<Vec<StripeAddr>>,
    fail_flush: AtomicBool,
}

impl MemStripeIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent flushes fail.
    pub fn fail_flushes(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::SeqCst);
    }

    /// Place stripe data at an address.
    pub fn seed(&self, addr: StripeAddr, chunks: Vec<Vec<u8>>) {
        self.stripes.lock().insert(addr, chunks);
    }

    /// Data currently stored at an address.
    pub fn stored(&self, addr: StripeAddr) -> Option<Vec<Vec<u8>>> {
        self.stripes.lock().get(&addr).cloned()
    }

    /// Vsids flushed so far, in completion order.
    pub fn flushed(&self) -> Vec<StripeId> {
        self.flushed.lock().clone()
    }

    pub fn reads(&self) -> Vec<StripeAddr> {
        self.reads.lock().clone()
    }

    pub fn writes(&self) -> Vec<StripeAddr> {
        self.writes.lock().clone()
    }
}

impl StripeIo for MemStripeIo {
    fn flush_stripe(&self, stripe: &StripePtr) -> Result<()> {
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(Error::StripeIoFailed {
                reason: "injected flush failure".into(),
            });
        }

        let mut stripes = self.stripes.lock();
        let image = stripes
            .get(&StripeAddr::new(StripeLoc::InWriteBufferArea, stripe.wb_lsid()))
            .cloned()
            .unwrap_or_default();
        stripes.insert(
            StripeAddr::new(StripeLoc::InUserArea, stripe.user_lsid()),
            image,
        );
        drop(stripes);

        self.flushed.lock().push(stripe.vsid());
        Ok(())
    }

    fn read_stripe(&self, from: StripeAddr, buffers: &mut [ChunkBuf]) -> Result<()> {
        self.reads.lock().push(from);

        if let Some(chunks) = self.stripes.lock().get(&from) {
            for (buf, chunk) in buffers.iter_mut().zip(chunks.iter()) {
                let n = buf.len().min(chunk.len());
                buf[..n].copy_from_slice(&chunk[..n]);
            }
        }
        Ok(())
    }

    fn write_stripe(&self, to: StripeAddr, buffers: &[ChunkBuf]) -> Result<()> {
        self.writes.lock().push(to);
        self.stripes
            .lock()
            .insert(to, buffers.iter().map(|b| b.to_vec()).collect());
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stripe_map_defaults_to_unmapped() {
        let map = MockStripeMap::new();
        let lsa = map.lsa(5);
        assert!(lsa.is_unmap());
        assert!(map.is_in_user_data_area(&lsa));
    }

    #[test]
    fn test_stripe_map_programmed_entry() {
        let map = MockStripeMap::new();
        map.set_lsa(5, StripeAddr::new(StripeLoc::InWriteBufferArea, 2));

        let lsa = map.lsa(5);
        assert_eq!(lsa.stripe_id, 2);
        assert!(!map.is_in_user_data_area(&lsa));
    }

    #[test]
    fn test_allocator_context_tails() {
        let ctx = MockAllocatorContext::new(2);
        assert!(ctx.active_stripe_tail(0).is_unmap());

        ctx.set_active_stripe_tail(0, VirtualBlkAddr::new(9, 3));
        assert_eq!(ctx.active_stripe_tail(0), VirtualBlkAddr::new(9, 3));
        assert!(ctx.active_stripe_tail(1).is_unmap());

        ctx.release_wb_stripe(4);
        assert_eq!(ctx.released(), vec![4]);
    }

    #[test]
    fn test_mem_stripe_io_roundtrip() {
        let io = MemStripeIo::new();
        let addr = StripeAddr::new(StripeLoc::InUserArea, 1);
        io.seed(addr, vec![vec![7u8; 64]]);

        let mut bufs = vec![ChunkBuf::new(64).unwrap()];
        io.read_stripe(addr, &mut bufs).unwrap();
        assert!(bufs[0].iter().all(|&b| b == 7));

        let dst = StripeAddr::new(StripeLoc::InWriteBufferArea, 2);
        io.write_stripe(dst, &bufs).unwrap();
        assert_eq!(io.stored(dst).unwrap()[0], vec![7u8; 64]);
    }

    #[test]
    fn test_threaded_scheduler_runs_events() {
        use std::sync::atomic::AtomicBool;

        struct Flag(Arc<AtomicBool>);
        impl crate::ports::Event for Flag {
            fn execute(&self) -> bool {
                self.0.store(true, Ordering::SeqCst);
                true
            }
        }

        let fired = Arc::new(AtomicBool::new(false));
        {
            let scheduler = ThreadedEventScheduler::new();
            scheduler.enqueue_event(Arc::new(Flag(fired.clone())));
        }
        assert!(fired.load(Ordering::SeqCst));
    }
}
