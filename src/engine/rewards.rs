//! Reward Accumulator.
//!
//! Liquidation shortfalls and the staking-yield fee are spread over all
//! stakes in O(1) by bumping a per-stake index. A position settles lazily:
//! its pending amount is `stake * (index - snapshot) / 1e18`, folded in the
//! next time the position is touched.

use super::math::{mul_div, mul_div_saturating, per_unit_with_error};
use super::{
    CdpEngine, CdpEvent, EngineError, EventSink, Result, DECIMAL_PRECISION, MAX_REWARD_SPLIT_BPS,
};

/// Amounts a position has accrued but not yet folded into its record
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingRewards {
    /// Redistributed debt
    pub debt: u128,
    /// Redistributed collateral
    pub coll_shares: u128,
    /// Staking-yield fee charged against the collateral
    pub fee_shares: u128,
}

impl PendingRewards {
    pub fn is_zero(&self) -> bool {
        self.debt == 0 && self.coll_shares == 0 && self.fee_shares == 0
    }
}

impl CdpEngine {
    // ========================================
    // Per-Position Settlement
    // ========================================

    pub fn pending_rewards(&self, idx: u16) -> PendingRewards {
        if !self.is_active(idx) {
            return PendingRewards::default();
        }
        let p = &self.positions[idx as usize];
        PendingRewards {
            debt: mul_div_saturating(
                p.stake,
                self.debt_index.saturating_sub(p.debt_snapshot),
                DECIMAL_PRECISION,
            ),
            coll_shares: mul_div_saturating(
                p.stake,
                self.coll_index.saturating_sub(p.coll_snapshot),
                DECIMAL_PRECISION,
            ),
            fee_shares: mul_div_saturating(
                p.stake,
                self.fee_index.saturating_sub(p.fee_snapshot),
                DECIMAL_PRECISION,
            ),
        }
    }

    /// (debt, collateral shares) with pending rewards included.
    pub fn synced_position(&self, idx: u16) -> (u128, u128) {
        if !self.is_active(idx) {
            return (0, 0);
        }
        let p = &self.positions[idx as usize];
        let pending = self.pending_rewards(idx);
        let debt = p.debt.saturating_add(pending.debt);
        let coll = p
            .coll_shares
            .saturating_add(pending.coll_shares)
            .saturating_sub(pending.fee_shares);
        (debt, coll)
    }

    pub fn synced_debt(&self, idx: u16) -> u128 {
        self.synced_position(idx).0
    }

    pub fn synced_coll(&self, idx: u16) -> u128 {
        self.synced_position(idx).1
    }

    /// Fold pending rewards into the record and re-snapshot the indices.
    ///
    /// System totals already carry the pending amounts, so they do not move.
    pub fn apply_pending_rewards(&mut self, idx: u16) {
        if !self.is_active(idx) {
            return;
        }
        let pending = self.pending_rewards(idx);
        if !pending.is_zero() {
            let p = &mut self.positions[idx as usize];
            p.debt = p.debt.saturating_add(pending.debt);
            p.coll_shares = p
                .coll_shares
                .saturating_add(pending.coll_shares)
                .saturating_sub(pending.fee_shares);
            // Floor in each pending term
            self.rounding_slack = self.rounding_slack.saturating_add(1);
        }
        self.update_snapshots(idx);
    }

    pub(crate) fn update_snapshots(&mut self, idx: u16) {
        let (debt_index, coll_index, fee_index) = (self.debt_index, self.coll_index, self.fee_index);
        let p = &mut self.positions[idx as usize];
        p.debt_snapshot = debt_index;
        p.coll_snapshot = coll_index;
        p.fee_snapshot = fee_index;
    }

    // ========================================
    // Stakes
    // ========================================

    /// Stake for `coll_shares` relative to the last liquidation snapshot.
    pub fn compute_new_stake(&self, coll_shares: u128) -> Result<u128> {
        if self.total_coll_snapshot == 0 || self.total_stakes_snapshot == 0 {
            return Ok(coll_shares);
        }
        mul_div(coll_shares, self.total_stakes_snapshot, self.total_coll_snapshot)
    }

    pub(crate) fn update_stake(&mut self, idx: u16) -> Result<()> {
        let (old, coll) = {
            let p = &self.positions[idx as usize];
            (p.stake, p.coll_shares)
        };
        let new = self.compute_new_stake(coll)?;
        self.total_stakes = self
            .total_stakes
            .saturating_sub(old)
            .checked_add(new)
            .ok_or(EngineError::Overflow)?;
        self.positions[idx as usize].stake = new;
        Ok(())
    }

    pub(crate) fn remove_stake(&mut self, idx: u16) {
        let stake = self.positions[idx as usize].stake;
        self.total_stakes = self.total_stakes.saturating_sub(stake);
        self.positions[idx as usize].stake = 0;
    }

    /// Capture the stake/collateral baseline after a liquidation changed the
    /// composition of the active set.
    pub(crate) fn update_system_snapshots(&mut self) {
        if self.total_stakes == 0 {
            self.total_stakes_snapshot = 0;
            self.total_coll_snapshot = 0;
            return;
        }
        self.total_stakes_snapshot = self.total_stakes;
        self.total_coll_snapshot = self.total_coll_shares;
    }

    // ========================================
    // Index Updates
    // ========================================

    /// Spread `debt` and `coll_shares` over every remaining stake.
    ///
    /// Division remainders are carried into the next call. Both indices are
    /// computed before anything is written.
    pub(crate) fn redistribute<S: EventSink>(
        &mut self,
        debt: u128,
        coll_shares: u128,
        sink: &mut S,
    ) -> Result<()> {
        if debt == 0 && coll_shares == 0 {
            return Ok(());
        }
        let (debt_per_unit, debt_err) =
            per_unit_with_error(debt, self.last_debt_error, self.total_stakes)?;
        let (coll_per_unit, coll_err) =
            per_unit_with_error(coll_shares, self.last_coll_error, self.total_stakes)?;

        let debt_index = self
            .debt_index
            .checked_add(debt_per_unit)
            .ok_or(EngineError::Overflow)?;
        let coll_index = self
            .coll_index
            .checked_add(coll_per_unit)
            .ok_or(EngineError::Overflow)?;
        let total_debt = self.total_debt.checked_add(debt).ok_or(EngineError::Overflow)?;
        let total_coll = self
            .total_coll_shares
            .checked_add(coll_shares)
            .ok_or(EngineError::Overflow)?;

        self.debt_index = debt_index;
        self.coll_index = coll_index;
        self.last_debt_error = debt_err;
        self.last_coll_error = coll_err;
        self.total_debt = total_debt;
        self.total_coll_shares = total_coll;
        self.rounding_slack = self
            .rounding_slack
            .saturating_add(self.total_stakes / DECIMAL_PRECISION + 1);

        sink.emit(CdpEvent::Redistributed {
            debt,
            coll_shares,
            debt_index,
            coll_index,
        });
        Ok(())
    }

    /// Record a new underlying-per-share index for the collateral.
    ///
    /// When the index rises, `staking_reward_split_bps` of the yield earned by
    /// all system collateral is moved to the protocol fee balance and charged
    /// to positions through `fee_index`. Returns the fee shares taken.
    ///
    /// A changed index is accepted at most once per
    /// `index_update_interval_secs`; an unchanged one is a no-op.
    pub fn sync_share_index<S: EventSink>(
        &mut self,
        new_index: u128,
        now: u64,
        sink: &mut S,
    ) -> Result<u128> {
        if new_index == 0 {
            return Err(EngineError::InvalidPrice);
        }
        let old = self.share_index;
        if new_index == old {
            return Ok(0);
        }
        if now < self
            .last_index_update
            .saturating_add(self.params.index_update_interval_secs)
        {
            return Err(EngineError::IndexUpdateTooFrequent);
        }

        let mut fee_shares = 0;
        if new_index > old && self.total_stakes > 0 && self.params.staking_reward_split_bps > 0 {
            let yield_shares = mul_div(self.total_coll_shares, new_index - old, new_index)?;
            fee_shares = mul_div(
                yield_shares,
                self.params.staking_reward_split_bps as u128,
                MAX_REWARD_SPLIT_BPS as u128,
            )?
            .min(self.total_coll_shares);
        }

        if fee_shares > 0 {
            let (per_unit, err) =
                per_unit_with_error(fee_shares, self.last_fee_error, self.total_stakes)?;
            let fee_index = self
                .fee_index
                .checked_add(per_unit)
                .ok_or(EngineError::Overflow)?;
            let fee_recipient = self
                .fee_recipient_shares
                .checked_add(fee_shares)
                .ok_or(EngineError::Overflow)?;

            self.fee_index = fee_index;
            self.last_fee_error = err;
            self.total_coll_shares -= fee_shares;
            self.fee_recipient_shares = fee_recipient;
            self.rounding_slack = self
                .rounding_slack
                .saturating_add(self.total_stakes / DECIMAL_PRECISION + 1);
            sink.emit(CdpEvent::StakingFeeTaken {
                fee_shares,
                fee_index,
            });
        }

        self.share_index = new_index;
        self.last_index_update = now;
        sink.emit(CdpEvent::ShareIndexUpdated {
            old,
            new: new_index,
        });
        Ok(fee_shares)
    }
}
