//! logstripe - Write-Buffer Stripe Management
//!
//! The write-buffer stripe subsystem of a log-structured block storage
//! engine. Incoming volume writes accumulate into fixed-size stripes held
//! in a non-volatile write buffer; full stripes are flushed as a unit to
//! the persistent user area.
//!
//! # Architecture
//!
//! ```text
//! writer paths ──┐                          ┌── stripe-map service
//!                ▼                          │
//!        ┌──────────────────┐    ports      ├── reverse-map service
//!        │ WbStripeManager  │◀──────────────┤
//!        └──────────────────┘               ├── volume info service
//!                │                          │
//!                ▼                          ├── allocator context
//!        ┌──────────────────┐               │
//!        │ stripe registry  │               ├── event scheduler
//!        │ (one slot per    │               │
//!        │  write-buffer    │               └── backend stripe I/O
//!        │  LSID)           │
//!        └──────────────────┘
//! ```
//!
//! The manager tracks each in-flight stripe through assignment, fill,
//! flush and release, rebuilds stripes from on-disk maps during crash
//! replay, and copies pending stripes back into the NVM region before the
//! I/O path re-enables.
//!
//! # Modules
//!
//! - [`addr`] - Address value types, sentinels and write-buffer geometry
//! - [`buffer`] - Aligned chunk buffers and the write-buffer pool
//! - [`error`] - Error types
//! - [`mock`] - In-memory collaborators for tests
//! - [`ports`] - Collaborator traits the engine implements
//! - [`stripe`] - The per-stripe handle and flush participation
//! - [`wbstripe`] - The stripe manager itself

pub mod addr;
pub mod buffer;
pub mod error;
pub mod mock;
pub mod ports;
pub mod stripe;
pub mod wbstripe;

pub use addr::{
    AddressInfo, AsTailArrayIdx, BlkOffset, Rba, StripeAddr, StripeId, StripeLoc, VirtualBlkAddr,
    VirtualBlks, VolumeId, INVALID_RBA, INVALID_VOLUME, MAX_VOLUME_COUNT, UNMAP_OFFSET,
    UNMAP_STRIPE, UNMAP_VSA,
};
pub use buffer::{BufferPool, ChunkBuf};
pub use error::{Error, Result};
pub use ports::{
    AllocatorContext, Event, EventPtr, EventScheduler, QosManager, ReverseMapService, StripeIo,
    StripeMapService, VolumeInfoService, VolumeMountStatus,
};
pub use stripe::{FlushIo, ReverseMapEntry, Stripe, StripePtr};
pub use wbstripe::load_status::StripeLoadStatus;
pub use wbstripe::{WbStripeManager, WbStripeServices, WbStripeStats};
