//! Error types for the write-buffer stripe subsystem

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing write-buffer stripes
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid geometry or configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A reconstruction or fill request carried an impossible block count
    #[error("wrong block count: {block_count}")]
    WrongBlockCount { block_count: u64 },

    /// Flush was requested for a stripe that still has unwritten blocks
    #[error("stripe wbLsid {wb_lsid} is not full, {remaining} blocks remaining")]
    StripeNotFull { wb_lsid: u32, remaining: u32 },

    /// Flush was requested twice for the same stripe
    #[error("flush already requested for stripe wbLsid {wb_lsid}")]
    FlushAlreadyRequested { wb_lsid: u32 },

    /// Volume lookup failed
    #[error("volume {volume_id} not found")]
    VolumeNotFound { volume_id: u32 },

    /// Buffer allocation failed
    #[error("buffer allocation failed for size {size}: {reason}")]
    BufferAllocationFailed { size: usize, reason: String },

    /// Backend stripe I/O failed
    #[error("stripe I/O failed: {reason}")]
    StripeIoFailed { reason: String },

    /// Reverse-map reconstruction failed
    #[error("reverse map reconstruction failed for volume {volume_id}: {reason}")]
    ReverseMapReconstructFailed { volume_id: u32, reason: String },
}
