//! Property-Based Tests for the stripe registry and fill accounting
//!
//! Systematically checks the quantified invariants:
//!
//! 1. **Remaining bounds**: `0 <= blks_remaining <= blks_per_stripe` after
//!    any sequence of fills.
//! 2. **Tail policy**: the remaining-blocks computation never yields a
//!    range that runs past the stripe end.
//! 3. **Registry round trip**: assign then free leaves the slot empty.

#![cfg(test)]

use std::sync::Arc;

use proptest::prelude::*;

use crate::addr::{AddressInfo, VirtualBlkAddr, UNMAP_OFFSET};
use crate::mock::{
    InlineEventScheduler, MemStripeIo, MockAllocatorContext, MockQosManager, MockReverseMap,
    MockStripeMap, MockVolumeInfo,
};
use crate::stripe::Stripe;

use super::{WbStripeManager, WbStripeServices};

const BLKS_PER_STRIPE: u32 = 64;
const TOTAL_NVM_STRIPES: u32 = 16;

fn manager() -> Arc<WbStripeManager> {
    let addr_info = AddressInfo {
        block_size: 4096,
        chunk_size: 512,
        blks_per_stripe: BLKS_PER_STRIPE,
        chunks_per_stripe: 1,
        total_nvm_stripes: TOTAL_NVM_STRIPES,
        num_volumes: 4,
    };

    let services = WbStripeServices {
        stripe_map: Arc::new(MockStripeMap::new()),
        reverse_map: Arc::new(MockReverseMap::new()),
        volume_info: Arc::new(MockVolumeInfo::new()),
        allocator_ctx: Arc::new(MockAllocatorContext::new(4)),
        qos: Arc::new(MockQosManager::new()),
        event_scheduler: Arc::new(InlineEventScheduler::new()),
        stripe_io: Arc::new(MemStripeIo::new()),
    };

    WbStripeManager::new(addr_info, "prop-array", 0, services).unwrap()
}

/// Strategy for block counts that sum to at most one stripe.
fn fill_steps_strategy() -> impl Strategy<Value = Vec<u32>> {
    prop::collection::vec(0u32..=BLKS_PER_STRIPE, 0..8).prop_map(|mut steps| {
        let mut left = BLKS_PER_STRIPE;
        for step in steps.iter_mut() {
            *step = (*step).min(left);
            left -= *step;
        }
        steps
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Any fill sequence keeps the remaining count within bounds and
    /// consumes exactly the blocks it was given.
    #[test]
    fn prop_remaining_stays_in_bounds(steps in fill_steps_strategy()) {
        let stripe = Stripe::new(BLKS_PER_STRIPE);
        let mut expected = BLKS_PER_STRIPE;

        for step in steps {
            let remaining = stripe.decrease_blks_remaining(step);
            expected -= step;
            prop_assert_eq!(remaining, expected);
            prop_assert!(remaining <= BLKS_PER_STRIPE);
        }
    }

    /// The tail policy yields either the empty run or a range that ends
    /// exactly at the stripe boundary.
    #[test]
    fn prop_remaining_blocks_policy(offset in 0u64..(BLKS_PER_STRIPE as u64 * 2)) {
        let m = manager();
        let range = m.remaining_blocks(VirtualBlkAddr::new(1, offset));

        if offset >= BLKS_PER_STRIPE as u64 {
            prop_assert!(range.start_vsa.is_unmap());
            prop_assert_eq!(range.num_blks, 0);
        } else {
            prop_assert_eq!(range.start_vsa.offset, offset);
            prop_assert_eq!(range.num_blks as u64 + offset, BLKS_PER_STRIPE as u64);
        }
    }

    /// The unmapped offset always maps to the empty run.
    #[test]
    fn prop_unmap_offset_is_empty(stripe_id in 0u32..1000) {
        let m = manager();
        let range = m.remaining_blocks(VirtualBlkAddr::new(stripe_id, UNMAP_OFFSET));
        prop_assert!(range.start_vsa.is_unmap());
        prop_assert_eq!(range.num_blks, 0);
    }

    /// Assigning and freeing random slots always round-trips to empty.
    #[test]
    fn prop_registry_round_trip(
        wb_lsids in prop::collection::btree_set(0u32..TOTAL_NVM_STRIPES, 1..8)
    ) {
        let m = manager();

        for &wb_lsid in &wb_lsids {
            let mut stripe = Stripe::new(BLKS_PER_STRIPE);
            stripe.assign(wb_lsid + 100, wb_lsid, wb_lsid + 100, 0);
            m.assign_stripe(Arc::new(stripe));
        }

        for &wb_lsid in &wb_lsids {
            let stripe = m.get_stripe(wb_lsid).unwrap();
            prop_assert_eq!(stripe.wb_lsid(), wb_lsid);
            stripe.set_finished();
            m.free_wb_stripe_id(wb_lsid);
            prop_assert!(m.get_stripe(wb_lsid).is_none());
        }
    }

    /// Finishing a stripe at any written offset drains it completely and
    /// stamps sentinels over the unwritten tail.
    #[test]
    fn prop_finish_stripe_drains(written in 0u32..=BLKS_PER_STRIPE) {
        let m = manager();

        let mut stripe = Stripe::new(BLKS_PER_STRIPE);
        stripe.assign(7, 0, 7, 0);
        let stripe = Arc::new(stripe);
        if written > 0 {
            stripe.decrease_blks_remaining(written);
        }
        m.assign_stripe(stripe.clone());

        // Writer path finalization with the tail at the written offset.
        m.finish_stripe(0, VirtualBlkAddr::new(7, written as u64));

        prop_assert_eq!(stripe.blks_remaining(), 0);
        prop_assert!(stripe.is_active_flush_target());
        for offset in written as u64..BLKS_PER_STRIPE as u64 {
            let entry = stripe.rev_map_entry(offset).unwrap();
            prop_assert_eq!(entry, crate::stripe::ReverseMapEntry::INVALID);
        }
    }
}
