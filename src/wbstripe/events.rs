//! Events and completion callbacks for stripe flush and replay loading
//!
//! Two pipelines run through the event scheduler:
//!
//! - flush: a [`FlushSubmission`] persists a full stripe to the user area
//!   and marks the stripe finished on success.
//! - replay load: a [`ReadStripe`] event reads a stripe image from the user
//!   area, its completion writes the image back into the write-buffer slot,
//!   and the final completion returns the buffers to the pool and advances
//!   the load status.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::addr::StripeAddr;
use crate::buffer::{BufferPool, ChunkBuf};
use crate::ports::{Event, StripeIo};
use crate::stripe::StripePtr;

use super::load_status::StripeLoadStatus;

// =============================================================================
// Flush submission
// =============================================================================

/// Persists one full stripe and publishes its completion.
pub struct FlushSubmission {
    stripe: StripePtr,
    io: Arc<dyn StripeIo>,
    array_id: u32,
}

impl FlushSubmission {
    pub fn new(stripe: StripePtr, io: Arc<dyn StripeIo>, array_id: u32) -> Self {
        Self {
            stripe,
            io,
            array_id,
        }
    }
}

impl Event for FlushSubmission {
    fn execute(&self) -> bool {
        match self.io.flush_stripe(&self.stripe) {
            Ok(()) => {
                self.stripe.set_finished();
                debug!(
                    array_id = self.array_id,
                    vsid = self.stripe.vsid(),
                    wb_lsid = self.stripe.wb_lsid(),
                    "stripe flush completed"
                );
                true
            }
            Err(e) => {
                error!(
                    array_id = self.array_id,
                    vsid = self.stripe.vsid(),
                    wb_lsid = self.stripe.wb_lsid(),
                    error = %e,
                    "stripe flush submission failed"
                );
                false
            }
        }
    }
}

// =============================================================================
// Replay load pipeline
// =============================================================================

/// Final stage of a stripe load: buffers go back to the pool and the
/// outstanding-copy count drops.
pub struct WriteStripeCompletion {
    pool: Arc<BufferPool>,
    load_status: Arc<StripeLoadStatus>,
}

impl WriteStripeCompletion {
    pub fn new(pool: Arc<BufferPool>, load_status: Arc<StripeLoadStatus>) -> Self {
        Self { pool, load_status }
    }

    pub fn complete(&self, buffers: Vec<ChunkBuf>) -> bool {
        for buf in buffers {
            self.pool.put(buf);
        }
        self.load_status.load_ended();
        true
    }
}

/// Middle stage: the read finished, write the image into the write buffer.
pub struct ReadStripeCompletion {
    to: StripeAddr,
    io: Arc<dyn StripeIo>,
    next: WriteStripeCompletion,
    array_id: u32,
}

impl ReadStripeCompletion {
    pub fn new(
        to: StripeAddr,
        io: Arc<dyn StripeIo>,
        next: WriteStripeCompletion,
        array_id: u32,
    ) -> Self {
        Self {
            to,
            io,
            next,
            array_id,
        }
    }

    pub fn complete(&self, buffers: Vec<ChunkBuf>) -> bool {
        if let Err(e) = self.io.write_stripe(self.to, &buffers) {
            error!(
                array_id = self.array_id,
                stripe_id = self.to.stripe_id,
                error = %e,
                "stripe load write failed"
            );
            // The copy cannot make progress; release resources anyway so
            // the load pass terminates.
            return self.next.complete(buffers);
        }
        self.next.complete(buffers)
    }
}

/// First stage: read a whole stripe from the user area into chunk buffers.
pub struct ReadStripe {
    from: StripeAddr,
    io: Arc<dyn StripeIo>,
    completion: ReadStripeCompletion,
    buffers: Mutex<Option<Vec<ChunkBuf>>>,
    array_id: u32,
}

impl ReadStripe {
    pub fn new(
        from: StripeAddr,
        buffers: Vec<ChunkBuf>,
        completion: ReadStripeCompletion,
        io: Arc<dyn StripeIo>,
        array_id: u32,
    ) -> Self {
        Self {
            from,
            io,
            completion,
            buffers: Mutex::new(Some(buffers)),
            array_id,
        }
    }
}

impl Event for ReadStripe {
    fn execute(&self) -> bool {
        let Some(mut buffers) = self.buffers.lock().take() else {
            warn!(
                array_id = self.array_id,
                stripe_id = self.from.stripe_id,
                "stripe read executed twice"
            );
            return true;
        };

        if let Err(e) = self.io.read_stripe(self.from, &mut buffers) {
            error!(
                array_id = self.array_id,
                stripe_id = self.from.stripe_id,
                error = %e,
                "stripe load read failed"
            );
            // Put the buffers back so the scheduler may retry this event.
            *self.buffers.lock() = Some(buffers);
            return false;
        }

        self.completion.complete(buffers)
    }
}

// =============================================================================
// Tests
// =============================================================================
