//! Redemption Orchestrator.
//!
//! Debt tokens are swapped for collateral at face value, taken from the
//! lowest-ratio positions first. The whole walk is planned read-only, the fee
//! is checked against the caller's cap, and only then is anything written.

use alloc::vec::Vec;

use super::math::{compute_nominal_ratio, compute_ratio, mul_div, mul_div_saturating};
use super::store::PositionStatus;
use super::{
    CdpEngine, CdpEvent, CloseReason, EngineError, EventSink, Result, DECIMAL_PRECISION,
    MIN_REDEMPTION_FEE_FLOOR, NONE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedemptionRequest {
    /// Debt tokens offered
    pub amount: u128,
    /// Expected first position with ratio >= MCR
    pub first_hint: u16,
    /// Reinsertion hint for the partially redeemed position (ratio >= key)
    pub upper_hint: u16,
    /// Reinsertion hint for the partially redeemed position (ratio <= key)
    pub lower_hint: u16,
    /// Expected nominal ratio of the partially redeemed position afterwards
    pub partial_nicr: u128,
    /// Positions to visit at most; 0 means no limit
    pub max_iterations: u32,
    /// Highest acceptable fee rate (1e18 = 100%)
    pub max_fee_pct: u128,
    /// Caller's debt-token balance
    pub redeemer_balance: u128,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RedemptionOutcome {
    /// Debt actually redeemed; the caller burns exactly this much
    pub debt_redeemed: u128,
    /// Collateral shares taken from positions
    pub coll_drawn: u128,
    /// Part of `coll_drawn` kept as protocol fee
    pub fee: u128,
    /// `coll_drawn - fee`, paid out to the redeemer
    pub coll_to_redeemer: u128,
    pub positions_closed: u16,
    /// True when the last position was partially redeemed
    pub partial: bool,
    /// True when a partial step was abandoned because its hint was stale
    /// or it would leave less than the minimum debt
    pub cancelled_partial: bool,
}

#[derive(Clone, Copy, Debug)]
struct Step {
    idx: u16,
    debt: u128,
    coll: u128,
    debt_drawn: u128,
    coll_drawn: u128,
    full: bool,
    new_nicr: u128,
}

struct Plan {
    steps: Vec<Step>,
    debt_redeemed: u128,
    coll_drawn: u128,
    cancelled_partial: bool,
}

impl CdpEngine {
    /// A first hint is usable when it is the lowest active position at or
    /// above MCR.
    pub fn is_valid_first_redemption_hint(&self, hint: u16, price: u128) -> bool {
        if !self.list_contains(hint) || self.position_ratio(hint, price) < self.params.mcr {
            return false;
        }
        let prev = self.positions[hint as usize].prev;
        prev == NONE || self.position_ratio(prev, price) < self.params.mcr
    }

    pub(crate) fn first_redeemable(&self, price: u128) -> u16 {
        let mut cur = self.head;
        while cur != NONE && self.position_ratio(cur, price) < self.params.mcr {
            cur = self.positions[cur as usize].next;
        }
        cur
    }

    /// Collateral shares worth `debt` at `price`, capped at `coll`.
    pub(crate) fn coll_for_debt(&self, debt: u128, coll: u128, price: u128) -> u128 {
        let underlying = mul_div_saturating(debt, DECIMAL_PRECISION, price);
        self.underlying_to_shares(underlying).min(coll)
    }

    fn plan_redemption(&self, req: &RedemptionRequest, price: u128) -> Plan {
        let mut plan = Plan {
            steps: Vec::new(),
            debt_redeemed: 0,
            coll_drawn: 0,
            cancelled_partial: false,
        };

        let mut cur = if self.is_valid_first_redemption_hint(req.first_hint, price) {
            req.first_hint
        } else {
            self.first_redeemable(price)
        };
        let mut remaining = req.amount;
        let mut iterations = 0u32;

        while cur != NONE && remaining > 0 {
            if req.max_iterations != 0 && iterations >= req.max_iterations {
                break;
            }
            iterations += 1;
            let next = self.positions[cur as usize].next;

            let (debt, coll) = self.synced_position(cur);
            let icr = compute_ratio(self.shares_to_underlying(coll), debt, price);
            if icr < self.params.mcr {
                cur = next;
                continue;
            }

            let debt_drawn = remaining.min(debt);
            let coll_drawn = self.coll_for_debt(debt_drawn, coll, price);
            let new_debt = debt - debt_drawn;
            let mut step = Step {
                idx: cur,
                debt,
                coll,
                debt_drawn,
                coll_drawn,
                full: new_debt == 0,
                new_nicr: 0,
            };

            if !step.full {
                let new_nicr = compute_nominal_ratio(coll - coll_drawn, new_debt);
                if new_nicr != req.partial_nicr || new_debt < self.params.min_net_debt {
                    plan.cancelled_partial = true;
                    break;
                }
                step.new_nicr = new_nicr;
            }

            remaining -= debt_drawn;
            plan.debt_redeemed += debt_drawn;
            plan.coll_drawn += coll_drawn;
            plan.steps.push(step);

            if !step.full {
                break;
            }
            cur = next;
        }
        plan
    }

    /// Redeem `req.amount` debt tokens against the riskiest eligible
    /// positions. Returns the fee and the amounts to settle.
    pub fn redeem<S: EventSink>(
        &mut self,
        req: &RedemptionRequest,
        price: u128,
        now: u64,
        sink: &mut S,
    ) -> Result<RedemptionOutcome> {
        if req.amount == 0 {
            return Err(EngineError::ZeroAmount);
        }
        let min_fee = self.params.redemption_fee_floor.max(MIN_REDEMPTION_FEE_FLOOR);
        if req.max_fee_pct < min_fee || req.max_fee_pct > DECIMAL_PRECISION {
            return Err(EngineError::InvalidMaxFee);
        }
        if req.amount > req.redeemer_balance {
            return Err(EngineError::InsufficientBalance);
        }
        if price == 0 {
            return Err(EngineError::InvalidPrice);
        }
        if self.system_ratio(price) < self.params.mcr {
            return Err(EngineError::BelowMcr);
        }

        let plan = self.plan_redemption(req, price);
        if plan.debt_redeemed == 0 || plan.coll_drawn == 0 {
            return Err(EngineError::UnableToRedeem);
        }

        // Fee
        let drawn_value = mul_div_saturating(
            self.shares_to_underlying(plan.coll_drawn),
            price,
            DECIMAL_PRECISION,
        );
        let base_rate = self.base_rate_after_redemption(drawn_value, self.total_debt, now)?;
        let fee = mul_div(plan.coll_drawn, self.redemption_rate_with(base_rate), DECIMAL_PRECISION)?;
        if fee >= plan.coll_drawn {
            return Err(EngineError::FeeExceedsCollateral);
        }
        if mul_div(fee, DECIMAL_PRECISION, plan.coll_drawn)? > req.max_fee_pct {
            return Err(EngineError::FeeExceedsMaxFee);
        }

        // Apply
        self.commit_base_rate(base_rate, now, sink);

        let mut outcome = RedemptionOutcome {
            debt_redeemed: plan.debt_redeemed,
            coll_drawn: plan.coll_drawn,
            fee,
            coll_to_redeemer: plan.coll_drawn - fee,
            cancelled_partial: plan.cancelled_partial,
            ..RedemptionOutcome::default()
        };

        for step in plan.steps.iter() {
            self.apply_pending_rewards(step.idx);
            if step.full {
                self.remove_stake(step.idx);
                let (reward, position_id) = {
                    let p = &self.positions[step.idx as usize];
                    (p.liquidator_reward_shares, p.position_id)
                };
                self.total_debt = self.total_debt.saturating_sub(step.debt);
                self.total_coll_shares = self.total_coll_shares.saturating_sub(step.coll);
                self.total_reward_shares = self.total_reward_shares.saturating_sub(reward);

                let surplus = (step.coll - step.coll_drawn).saturating_add(reward);
                self.retire_position(step.idx, PositionStatus::ClosedByRedemption, surplus);
                outcome.positions_closed += 1;
                sink.emit(CdpEvent::PositionClosed {
                    idx: step.idx,
                    position_id,
                    reason: CloseReason::Redemption,
                });
            } else {
                let new_debt = step.debt - step.debt_drawn;
                let new_coll = step.coll - step.coll_drawn;
                {
                    let p = &mut self.positions[step.idx as usize];
                    p.debt = new_debt;
                    p.coll_shares = new_coll;
                }
                self.total_debt = self.total_debt.saturating_sub(step.debt_drawn);
                self.total_coll_shares = self.total_coll_shares.saturating_sub(step.coll_drawn);
                self.update_stake(step.idx)?;
                self.list_reinsert(step.idx, step.new_nicr, req.lower_hint, req.upper_hint);
                outcome.partial = true;
                sink.emit(CdpEvent::PositionAdjusted {
                    idx: step.idx,
                    debt: new_debt,
                    coll_shares: new_coll,
                    stake: self.positions[step.idx as usize].stake,
                });
            }
        }

        self.fee_recipient_shares = self.fee_recipient_shares.saturating_add(fee);
        self.lifetime_redemptions = self.lifetime_redemptions.saturating_add(1);
        self.sync_grace_period(price, now, sink);
        sink.emit(CdpEvent::RedemptionExecuted {
            requested: req.amount,
            debt_redeemed: outcome.debt_redeemed,
            coll_drawn: outcome.coll_drawn,
            fee,
        });
        Ok(outcome)
    }
}
