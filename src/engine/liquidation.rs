//! Liquidation Orchestrator.
//!
//! Every entry point plans a position's settlement read-only against freshly
//! synced values, then executes it. Batch and list variants skip what the
//! planner rejects; the single-target variant turns the rejection into an
//! error. A partial liquidation cancels part of one position's debt against
//! the reserve and leaves the rest open.

use super::math::{compute_nominal_ratio, compute_ratio, mul_div, mul_div_saturating};
use super::solvency::{Eligibility, Mode};
use super::store::PositionStatus;
use super::{
    CdpEngine, CdpEvent, CloseReason, EngineError, EventSink, Result, DECIMAL_PRECISION,
    MAX_POSITIONS, NONE,
};

/// Aggregate outcome of one liquidation call
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LiquidationTotals {
    pub liquidated: u16,
    /// Debt cancelled against the stability reserve
    pub debt_offset: u128,
    /// Collateral shares handed to the reserve for that debt
    pub coll_to_reserve: u128,
    pub debt_redistributed: u128,
    pub coll_redistributed: u128,
    /// Collateral left claimable by owners of capped liquidations
    pub surplus_shares: u128,
    /// Carve-outs owed to the caller
    pub liquidator_reward_shares: u128,
}

impl LiquidationTotals {
    fn add(&mut self, s: &Settlement) {
        self.liquidated = self.liquidated.saturating_add(1);
        self.debt_offset = self.debt_offset.saturating_add(s.debt_offset);
        self.coll_to_reserve = self.coll_to_reserve.saturating_add(s.coll_to_reserve);
        self.debt_redistributed = self.debt_redistributed.saturating_add(s.debt_redistributed);
        self.coll_redistributed = self.coll_redistributed.saturating_add(s.coll_redistributed);
        self.surplus_shares = self.surplus_shares.saturating_add(s.surplus);
        self.liquidator_reward_shares = self.liquidator_reward_shares.saturating_add(s.reward);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Rejection {
    Inactive,
    Healthy,
    GracePending,
    Immune,
    ReserveInsufficient,
    CannotRedistribute,
    LastPosition,
}

impl From<Rejection> for EngineError {
    fn from(r: Rejection) -> Self {
        match r {
            Rejection::Inactive => EngineError::NotLiquidatable,
            Rejection::Healthy | Rejection::GracePending | Rejection::Immune => {
                EngineError::AboveThreshold
            }
            Rejection::ReserveInsufficient => EngineError::ReserveInsufficient,
            Rejection::CannotRedistribute => EngineError::CannotRedistribute,
            Rejection::LastPosition => EngineError::LastPosition,
        }
    }
}

/// How one position's synced debt and collateral are split up
#[derive(Clone, Copy, Debug, Default)]
struct Settlement {
    debt: u128,
    coll: u128,
    debt_offset: u128,
    coll_to_reserve: u128,
    debt_redistributed: u128,
    coll_redistributed: u128,
    surplus: u128,
    reward: u128,
}

/// Synced view of a position the current mode allows to be liquidated
#[derive(Clone, Copy, Debug)]
struct Candidate {
    debt: u128,
    coll: u128,
    icr: u128,
    mode: Mode,
    eligibility: Eligibility,
}

impl CdpEngine {
    fn liquidation_candidate(
        &self,
        idx: u16,
        price: u128,
        now: u64,
    ) -> core::result::Result<Candidate, Rejection> {
        if !self.is_active(idx) {
            return Err(Rejection::Inactive);
        }
        let (debt, coll) = self.synced_position(idx);
        let icr = compute_ratio(self.shares_to_underlying(coll), debt, price);
        let mode = self.mode(price);
        let tcr = self.system_ratio(price);

        match self.classify(icr, tcr, mode, now) {
            Eligibility::Healthy => Err(Rejection::Healthy),
            Eligibility::GracePending => Err(Rejection::GracePending),
            Eligibility::Immune => Err(Rejection::Immune),
            eligibility => Ok(Candidate {
                debt,
                coll,
                icr,
                mode,
                eligibility,
            }),
        }
    }

    fn plan_liquidation(
        &self,
        idx: u16,
        price: u128,
        now: u64,
    ) -> core::result::Result<Settlement, Rejection> {
        let Candidate {
            debt,
            coll,
            icr,
            mode,
            eligibility,
        } = self.liquidation_candidate(idx, price, now)?;
        if self.list_size <= 1 {
            return Err(Rejection::LastPosition);
        }

        let mut s = Settlement {
            debt,
            coll,
            reward: self.positions[idx as usize].liquidator_reward_shares,
            ..Settlement::default()
        };

        match eligibility {
            Eligibility::Healthy | Eligibility::GracePending | Eligibility::Immune => {
                return Err(Rejection::Healthy)
            }
            Eligibility::BelowMcr if mode == Mode::Recovery && icr <= DECIMAL_PRECISION => {
                // Underwater: the reserve would take a loss, socialize it all
                s.debt_redistributed = debt;
                s.coll_redistributed = coll;
            }
            Eligibility::BelowMcr => {
                let offset = debt.min(self.reserve.debt);
                let coll_to_reserve = if offset == debt {
                    coll
                } else {
                    mul_div(coll, offset, debt).map_err(|_| Rejection::CannotRedistribute)?
                };
                s.debt_offset = offset;
                s.coll_to_reserve = coll_to_reserve;
                s.debt_redistributed = debt - offset;
                s.coll_redistributed = coll - coll_to_reserve;
            }
            Eligibility::RecoveryCapped => {
                if self.reserve.debt < debt {
                    return Err(Rejection::ReserveInsufficient);
                }
                let capped_value =
                    mul_div_saturating(debt, self.params.liquidation_cap_ratio, price);
                let capped = self.underlying_to_shares(capped_value).min(coll);
                s.debt_offset = debt;
                s.coll_to_reserve = capped;
                s.surplus = coll - capped;
            }
        }

        let remaining_stakes = self
            .total_stakes
            .saturating_sub(self.positions[idx as usize].stake);
        if (s.debt_redistributed > 0 || s.coll_redistributed > 0) && remaining_stakes == 0 {
            return Err(Rejection::CannotRedistribute);
        }
        Ok(s)
    }

    fn execute_liquidation<S: EventSink>(
        &mut self,
        idx: u16,
        s: &Settlement,
        sink: &mut S,
    ) -> Result<()> {
        self.apply_pending_rewards(idx);
        self.remove_stake(idx);

        self.total_debt = self.total_debt.saturating_sub(s.debt);
        self.total_coll_shares = self.total_coll_shares.saturating_sub(s.coll);
        self.total_reward_shares = self.total_reward_shares.saturating_sub(s.reward);

        if s.debt_offset > 0 {
            self.reserve.debt -= s.debt_offset;
            self.reserve.coll_gain_shares = self
                .reserve
                .coll_gain_shares
                .saturating_add(s.coll_to_reserve);
            sink.emit(CdpEvent::ReserveOffset {
                debt: s.debt_offset,
                coll_shares: s.coll_to_reserve,
            });
        }
        self.redistribute(s.debt_redistributed, s.coll_redistributed, sink)?;

        let position_id = self.positions[idx as usize].position_id;
        self.retire_position(idx, PositionStatus::ClosedByLiquidation, s.surplus);
        self.lifetime_liquidations = self.lifetime_liquidations.saturating_add(1);
        sink.emit(CdpEvent::PositionClosed {
            idx,
            position_id,
            reason: CloseReason::Liquidation,
        });
        Ok(())
    }

    fn finish_liquidation<S: EventSink>(
        &mut self,
        totals: &LiquidationTotals,
        price: u128,
        now: u64,
        sink: &mut S,
    ) {
        if totals.liquidated > 0 || totals.debt_offset > 0 {
            self.update_system_snapshots();
        }
        self.sync_grace_period(price, now, sink);
        sink.emit(CdpEvent::LiquidationCompleted {
            liquidated: totals.liquidated,
            debt_offset: totals.debt_offset,
            debt_redistributed: totals.debt_redistributed,
            reward_shares: totals.liquidator_reward_shares,
        });
    }

    /// Read-only check of whether `liquidate_one` would succeed.
    pub fn is_liquidatable(&self, idx: u16, price: u128, now: u64) -> bool {
        price != 0 && self.plan_liquidation(idx, price, now).is_ok()
    }

    // ========================================
    // Entry Points
    // ========================================

    /// Liquidate a single position.
    ///
    /// Fails with `NotLiquidatable` when the slot holds no active position and
    /// with `AboveThreshold` when the current mode's rule does not allow it.
    pub fn liquidate_one<S: EventSink>(
        &mut self,
        idx: u16,
        price: u128,
        now: u64,
        sink: &mut S,
    ) -> Result<LiquidationTotals> {
        if price == 0 {
            return Err(EngineError::InvalidPrice);
        }
        let s = self.plan_liquidation(idx, price, now)?;
        self.execute_liquidation(idx, &s, sink)?;

        let mut totals = LiquidationTotals::default();
        totals.add(&s);
        self.finish_liquidation(&totals, price, now, sink);
        Ok(totals)
    }

    /// Cancel `debt_amount` of an eligible position's debt against the
    /// reserve and leave the remainder open.
    ///
    /// Collateral leaves in proportion to the debt repaid; a capped Recovery
    /// Mode position gives up at most `debt_amount * cap / price` worth. The
    /// remaining debt must stay at or above the minimum net debt. Asking for
    /// the whole debt is a full liquidation.
    #[allow(clippy::too_many_arguments)]
    pub fn liquidate_partial<S: EventSink>(
        &mut self,
        idx: u16,
        debt_amount: u128,
        lower_hint: u16,
        upper_hint: u16,
        price: u128,
        now: u64,
        sink: &mut S,
    ) -> Result<LiquidationTotals> {
        if price == 0 {
            return Err(EngineError::InvalidPrice);
        }
        if debt_amount == 0 {
            return Err(EngineError::ZeroAmount);
        }
        let c = self.liquidation_candidate(idx, price, now)?;
        if debt_amount > c.debt {
            return Err(EngineError::InsufficientBalance);
        }
        if debt_amount == c.debt {
            return self.liquidate_one(idx, price, now, sink);
        }
        let remaining_debt = c.debt - debt_amount;
        if remaining_debt < self.params.min_net_debt {
            return Err(EngineError::BelowMinNetDebt);
        }
        if self.reserve.debt < debt_amount {
            return Err(EngineError::ReserveInsufficient);
        }

        let mut coll_taken = mul_div(c.coll, debt_amount, c.debt)?;
        if c.eligibility == Eligibility::RecoveryCapped {
            let capped_value =
                mul_div_saturating(debt_amount, self.params.liquidation_cap_ratio, price);
            coll_taken = coll_taken.min(self.underlying_to_shares(capped_value));
        }
        let remaining_coll = c.coll - coll_taken;

        self.apply_pending_rewards(idx);
        {
            let p = &mut self.positions[idx as usize];
            p.debt = remaining_debt;
            p.coll_shares = remaining_coll;
        }
        self.total_debt = self.total_debt.saturating_sub(debt_amount);
        self.total_coll_shares = self.total_coll_shares.saturating_sub(coll_taken);
        self.update_stake(idx)?;
        self.list_reinsert(
            idx,
            compute_nominal_ratio(remaining_coll, remaining_debt),
            lower_hint,
            upper_hint,
        );

        self.reserve.debt -= debt_amount;
        self.reserve.coll_gain_shares = self.reserve.coll_gain_shares.saturating_add(coll_taken);
        sink.emit(CdpEvent::ReserveOffset {
            debt: debt_amount,
            coll_shares: coll_taken,
        });
        sink.emit(CdpEvent::PartiallyLiquidated {
            idx,
            debt: debt_amount,
            coll_shares: coll_taken,
            remaining_debt,
            remaining_coll_shares: remaining_coll,
        });

        let totals = LiquidationTotals {
            debt_offset: debt_amount,
            coll_to_reserve: coll_taken,
            ..LiquidationTotals::default()
        };
        self.finish_liquidation(&totals, price, now, sink);
        Ok(totals)
    }

    /// Walk the index from the riskiest position and liquidate up to
    /// `max_count` eligible ones.
    ///
    /// Immune positions are passed over without using up the count. The walk
    /// stops at the first position that is simply not eligible.
    pub fn liquidate_batch<S: EventSink>(
        &mut self,
        max_count: u16,
        price: u128,
        now: u64,
        sink: &mut S,
    ) -> Result<LiquidationTotals> {
        if price == 0 {
            return Err(EngineError::InvalidPrice);
        }
        let mut totals = LiquidationTotals::default();
        let mut cur = self.head;
        let mut visits = 0usize;

        while cur != NONE && totals.liquidated < max_count && visits < MAX_POSITIONS {
            visits += 1;
            let next = self.positions[cur as usize].next;
            match self.plan_liquidation(cur, price, now) {
                Ok(s) => {
                    self.execute_liquidation(cur, &s, sink)?;
                    totals.add(&s);
                }
                Err(Rejection::Immune) => {}
                // A later, smaller position may still fit in what is left
                Err(Rejection::ReserveInsufficient) if self.reserve.debt > 0 => {}
                Err(_) => break,
            }
            cur = next;
        }

        if totals.liquidated == 0 {
            return Err(EngineError::NothingToLiquidate);
        }
        self.finish_liquidation(&totals, price, now, sink);
        Ok(totals)
    }

    /// Liquidate each listed slot that is currently eligible. Ids that are
    /// unknown, closed, repeated or not eligible are skipped.
    pub fn liquidate_set<S: EventSink>(
        &mut self,
        ids: &[u16],
        price: u128,
        now: u64,
        sink: &mut S,
    ) -> Result<LiquidationTotals> {
        if ids.is_empty() {
            return Err(EngineError::EmptyInput);
        }
        if price == 0 {
            return Err(EngineError::InvalidPrice);
        }
        let mut totals = LiquidationTotals::default();
        for &idx in ids {
            if let Ok(s) = self.plan_liquidation(idx, price, now) {
                self.execute_liquidation(idx, &s, sink)?;
                totals.add(&s);
            }
        }
        self.finish_liquidation(&totals, price, now, sink);
        Ok(totals)
    }
}
