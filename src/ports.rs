//! Collaborator ports for the write-buffer stripe subsystem
//!
//! The stripe manager sits between volume write ingestion and the
//! persistent user area, and talks to the rest of the engine through the
//! traits defined here. Infrastructure implements these; the manager takes
//! every collaborator at construction and never falls back to globals.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WbStripeManager                          │
//! └──────┬───────┬──────────┬──────────┬──────────┬─────────────┘
//!        │       │          │          │          │
//!        ▼       ▼          ▼          ▼          ▼
//!   StripeMap ReverseMap VolumeInfo Allocator  EventScheduler
//!   Service   Service    Service    Context    + StripeIo + Qos
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::addr::{
    AsTailArrayIdx, BlkOffset, Rba, StripeAddr, StripeId, StripeLoc, VirtualBlkAddr, VolumeId,
};
use crate::buffer::ChunkBuf;
use crate::error::Result;
use crate::stripe::{ReverseMapEntry, StripePtr};

// =============================================================================
// Events
// =============================================================================

/// A unit of deferred work handed to the engine's event scheduler.
///
/// `execute` returns `true` when the event is complete and `false` when the
/// scheduler should retry it later.
pub trait Event: Send + Sync {
    fn execute(&self) -> bool;
}

/// Shared handle to a schedulable event.
pub type EventPtr = Arc<dyn Event>;

/// Port to the engine's event scheduler.
pub trait EventScheduler: Send + Sync {
    fn enqueue_event(&self, event: EventPtr);
}

// =============================================================================
// Mapping services
// =============================================================================

/// Port to the stripe-map service (virtual stripe id to current residence).
pub trait StripeMapService: Send + Sync {
    /// Current logical stripe address of a virtual stripe.
    fn lsa(&self, vsid: StripeId) -> StripeAddr;

    /// Whether the address designates the persistent user area.
    fn is_in_user_data_area(&self, lsa: &StripeAddr) -> bool {
        lsa.stripe_loc == StripeLoc::InUserArea
    }
}

/// Port to the reverse-map service.
pub trait ReverseMapService: Send + Sync {
    /// Rebuild the reverse-map pack of a reconstructed stripe.
    ///
    /// `rev_map_infos` maps block offsets within the stripe to the RBAs
    /// recovered from the journal; `pack` is the stripe's in-memory pack,
    /// sized `blks_per_stripe`.
    #[allow(clippy::too_many_arguments)]
    fn reconstruct_reverse_map(
        &self,
        volume_id: VolumeId,
        total_rba_num: u64,
        wb_lsid: StripeId,
        vsid: StripeId,
        offset: BlkOffset,
        rev_map_infos: &BTreeMap<u64, Rba>,
        pack: &mut [ReverseMapEntry],
    ) -> Result<()>;
}

// =============================================================================
// Volume information
// =============================================================================

/// Mount state of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeMountStatus {
    Mounted,
    Unmounted,
    Offline,
}

/// Port to the volume information service.
pub trait VolumeInfoService: Send + Sync {
    fn mount_status(&self, volume_id: VolumeId) -> VolumeMountStatus;

    /// Volume size in bytes.
    fn volume_size(&self, volume_id: VolumeId) -> Result<u64>;
}

// =============================================================================
// Allocator context
// =============================================================================

/// Port to the allocator context that owns the per-volume active stripe
/// tails and the write-buffer stripe id free list.
///
/// The tail read-modify-write that finishes an active stripe must run under
/// the mutex returned by `active_stripe_tail_lock` for that index.
pub trait AllocatorContext: Send + Sync {
    fn active_stripe_tail(&self, index: AsTailArrayIdx) -> VirtualBlkAddr;

    fn set_active_stripe_tail(&self, index: AsTailArrayIdx, tail: VirtualBlkAddr);

    fn active_stripe_tail_lock(&self, index: AsTailArrayIdx) -> Arc<Mutex<()>>;

    /// Return a write-buffer stripe id to the allocator's free list.
    fn release_wb_stripe(&self, wb_lsid: StripeId);
}

// =============================================================================
// QoS accounting
// =============================================================================

/// Port to the QoS manager's per-array stripe accounting.
pub trait QosManager: Send + Sync {
    fn decrease_used_stripe_cnt(&self, array_name: &str);
}

// =============================================================================
// Backend stripe I/O
// =============================================================================

/// Port to the backend data path.
///
/// Flush submission and the replay-time copy pipeline drive whole-stripe
/// reads and writes through this seam; the engine's I/O dispatcher sits
/// behind it in production.
pub trait StripeIo: Send + Sync {
    /// Persist a full stripe to the user area and its reverse map to disk.
    fn flush_stripe(&self, stripe: &StripePtr) -> Result<()>;

    /// Read a whole stripe at `from` into the chunk buffers.
    fn read_stripe(&self, from: StripeAddr, buffers: &mut [ChunkBuf]) -> Result<()>;

    /// Write the chunk buffers as a whole stripe at `to`.
    fn write_stripe(&self, to: StripeAddr, buffers: &[ChunkBuf]) -> Result<()>;
}
