//! Read-only helpers that compute the hints `redeem` and the list insert
//! paths expect. Meant for off-chain callers simulating against a copy of
//! the slab.

use super::math::compute_nominal_ratio;
use super::{CdpEngine, MAX_POSITIONS, NONE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedemptionHints {
    /// First position with ratio >= MCR
    pub first: u16,
    /// Nominal ratio the partially redeemed position will end up with, or 0
    pub partial_nicr: u128,
    /// Largest amount up to the requested one that can be redeemed without
    /// leaving a position below the minimum debt
    pub truncated_amount: u128,
}

#[inline]
fn xorshift64(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

impl CdpEngine {
    pub fn get_redemption_hints(
        &self,
        amount: u128,
        price: u128,
        max_iterations: u32,
    ) -> RedemptionHints {
        let first = self.first_redeemable(price);
        let mut cur = first;
        let mut remaining = amount;
        let mut partial_nicr = 0;
        let mut iterations = 0u32;

        while cur != NONE && remaining > 0 {
            if max_iterations != 0 && iterations >= max_iterations {
                break;
            }
            iterations += 1;
            let next = self.positions[cur as usize].next;

            if self.position_ratio(cur, price) < self.params.mcr {
                cur = next;
                continue;
            }
            let (debt, coll) = self.synced_position(cur);
            if debt <= remaining {
                remaining -= debt;
                cur = next;
                continue;
            }

            if debt > self.params.min_net_debt {
                let redeemable = remaining.min(debt - self.params.min_net_debt);
                let coll_drawn = self.coll_for_debt(redeemable, coll, price);
                partial_nicr = compute_nominal_ratio(coll - coll_drawn, debt - redeemable);
                remaining -= redeemable;
            }
            break;
        }

        RedemptionHints {
            first,
            partial_nicr,
            truncated_amount: amount - remaining,
        }
    }

    /// Sample `trials` random slots and return the active position whose
    /// ordering key is closest to `nicr`, its distance and the final seed.
    ///
    /// The result is a starting point for `find_insert_position`, which
    /// walks from it to the exact neighbors.
    pub fn get_approx_hint(&self, nicr: u128, trials: u32, seed: u64) -> (u16, u128, u64) {
        let mut state = if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed };
        if self.list_size == 0 {
            return (NONE, 0, state);
        }

        let mut best = self.head;
        let mut best_diff = self.positions[best as usize].nicr.abs_diff(nicr);
        for _ in 0..trials {
            state = xorshift64(state);
            let idx = (state % MAX_POSITIONS as u64) as u16;
            if !self.list_contains(idx) {
                continue;
            }
            let diff = self.positions[idx as usize].nicr.abs_diff(nicr);
            if diff < best_diff {
                best = idx;
                best_diff = diff;
            }
        }
        (best, best_diff, state)
    }
}
