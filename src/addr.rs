//! Address types and geometry for the write-buffer area
//!
//! The engine addresses data at three levels:
//!
//! - **VSA** (`VirtualBlkAddr`): a virtual stripe id plus a block offset
//!   within that stripe. Writer paths track their open stripe tail as a VSA.
//! - **LSA** (`StripeAddr`): where a virtual stripe currently lives, either
//!   a slot in the non-volatile write buffer or a stripe in the persistent
//!   user area.
//! - **RBA**: the logical block address a volume write originated from,
//!   recorded per block in the stripe's reverse map.
//!
//! All sentinels are bit-exact all-ones values so they survive raw
//! persistence of map entries.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Stripe identifier, used for virtual, user-area and write-buffer stripes.
pub type StripeId = u32;

/// Block offset within a stripe.
pub type BlkOffset = u64;

/// Logical block address of a volume write.
pub type Rba = u64;

/// Volume identifier.
pub type VolumeId = u32;

/// Index into the per-volume active-stripe-tail array.
pub type AsTailArrayIdx = u32;

/// Sentinel for an unmapped stripe id.
pub const UNMAP_STRIPE: StripeId = StripeId::MAX;

/// Sentinel for an unmapped block offset.
pub const UNMAP_OFFSET: BlkOffset = BlkOffset::MAX;

/// Sentinel RBA written into unused reverse-map entries.
pub const INVALID_RBA: Rba = Rba::MAX;

/// Sentinel volume id paired with [`INVALID_RBA`].
pub const INVALID_VOLUME: VolumeId = VolumeId::MAX;

/// Upper bound on configurable volume count.
pub const MAX_VOLUME_COUNT: u32 = 256;

/// Sentinel VSA signalling "no open stripe".
pub const UNMAP_VSA: VirtualBlkAddr = VirtualBlkAddr {
    stripe_id: UNMAP_STRIPE,
    offset: UNMAP_OFFSET,
};

// =============================================================================
// Virtual block addressing
// =============================================================================

/// A virtual block address: stripe id plus offset within the stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualBlkAddr {
    pub stripe_id: StripeId,
    pub offset: BlkOffset,
}

impl VirtualBlkAddr {
    pub fn new(stripe_id: StripeId, offset: BlkOffset) -> Self {
        Self { stripe_id, offset }
    }

    /// Whether this address is the unmap sentinel.
    #[inline]
    pub fn is_unmap(&self) -> bool {
        *self == UNMAP_VSA
    }
}

/// A contiguous run of virtual blocks starting at `start_vsa`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualBlks {
    pub start_vsa: VirtualBlkAddr,
    pub num_blks: u32,
}

impl VirtualBlks {
    /// The empty run, used when a tail carries no unfilled blocks.
    pub const EMPTY: VirtualBlks = VirtualBlks {
        start_vsa: UNMAP_VSA,
        num_blks: 0,
    };
}

// =============================================================================
// Logical stripe addressing
// =============================================================================

/// Which area a stripe currently resides in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StripeLoc {
    InWriteBufferArea,
    InUserArea,
}

/// A logical stripe address: residence area plus stripe id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StripeAddr {
    pub stripe_loc: StripeLoc,
    pub stripe_id: StripeId,
}

impl StripeAddr {
    pub fn new(stripe_loc: StripeLoc, stripe_id: StripeId) -> Self {
        Self {
            stripe_loc,
            stripe_id,
        }
    }

    /// Whether the mapped stripe id is the unmap sentinel.
    #[inline]
    pub fn is_unmap(&self) -> bool {
        self.stripe_id == UNMAP_STRIPE
    }
}

// =============================================================================
// Geometry
// =============================================================================

/// Write-buffer geometry, read once at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressInfo {
    /// Logical block size in bytes
    pub block_size: u64,

    /// Size of one write-buffer chunk in bytes
    pub chunk_size: usize,

    /// Number of logical blocks per stripe
    pub blks_per_stripe: u32,

    /// Number of chunks per stripe
    pub chunks_per_stripe: u32,

    /// Number of stripe slots in the non-volatile write buffer
    pub total_nvm_stripes: u32,

    /// Number of volumes the engine serves
    pub num_volumes: u32,
}

impl Default for AddressInfo {
    fn default() -> Self {
        Self {
            block_size: 4096,
            chunk_size: 256 * 1024,
            blks_per_stripe: 128,
            chunks_per_stripe: 2,
            total_nvm_stripes: 64,
            num_volumes: 4,
        }
    }
}

impl AddressInfo {
    /// Validate the geometry.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::InvalidConfig("block_size must be > 0".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be > 0".into()));
        }
        if self.blks_per_stripe == 0 {
            return Err(Error::InvalidConfig("blks_per_stripe must be > 0".into()));
        }
        if self.chunks_per_stripe == 0 {
            return Err(Error::InvalidConfig("chunks_per_stripe must be > 0".into()));
        }
        if self.total_nvm_stripes == 0 {
            return Err(Error::InvalidConfig("total_nvm_stripes must be > 0".into()));
        }
        if self.num_volumes == 0 || self.num_volumes > MAX_VOLUME_COUNT {
            return Err(Error::InvalidConfig(format!(
                "num_volumes must be in 1..={}",
                MAX_VOLUME_COUNT
            )));
        }
        Ok(())
    }

    /// Map a virtual stripe id to its user-area stripe id.
    ///
    /// User-area stripes are addressed by their virtual stripe id, so this
    /// is an identity mapping kept as a named seam.
    #[inline]
    pub fn vsid_to_user_lsid(&self, vsid: StripeId) -> StripeId {
        vsid
    }

    /// Total write-buffer chunk count backing all stripe slots.
    pub fn total_chunks(&self) -> usize {
        self.total_nvm_stripes as usize * self.chunks_per_stripe as usize
    }
}

// =============================================================================
// Tests
// =============================================================================
