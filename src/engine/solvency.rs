//! Solvency Policy: health ratios, Normal/Recovery mode and the Recovery
//! Mode grace period.

use super::math::{compute_ratio, mul_div_saturating};
use super::{CdpEngine, CdpEvent, EventSink, DECIMAL_PRECISION, GRACE_PERIOD_UNSET};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Normal,
    Recovery,
}

/// How the liquidation rule treats a position under the current mode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Eligibility {
    /// Ratio below MCR; liquidatable in either mode
    BelowMcr,
    /// Recovery Mode, MCR <= ratio < system ratio, grace period over
    RecoveryCapped,
    /// Would be RecoveryCapped once the grace period has run
    GracePending,
    /// Recovery Mode and ratio at or above the system ratio
    Immune,
    /// Normal Mode and ratio at or above MCR
    Healthy,
}

impl Eligibility {
    pub fn is_liquidatable(self) -> bool {
        matches!(self, Eligibility::BelowMcr | Eligibility::RecoveryCapped)
    }
}

impl CdpEngine {
    // ========================================
    // Share Conversion
    // ========================================

    pub fn shares_to_underlying(&self, shares: u128) -> u128 {
        mul_div_saturating(shares, self.share_index, DECIMAL_PRECISION)
    }

    pub fn underlying_to_shares(&self, underlying: u128) -> u128 {
        if self.share_index == 0 {
            return 0;
        }
        mul_div_saturating(underlying, DECIMAL_PRECISION, self.share_index)
    }

    // ========================================
    // Ratios and Mode
    // ========================================

    /// Ratio of a position's synced collateral value to its synced debt.
    pub fn position_ratio(&self, idx: u16, price: u128) -> u128 {
        let (debt, coll) = self.synced_position(idx);
        compute_ratio(self.shares_to_underlying(coll), debt, price)
    }

    pub fn system_ratio(&self, price: u128) -> u128 {
        compute_ratio(
            self.shares_to_underlying(self.total_coll_shares),
            self.total_debt,
            price,
        )
    }

    pub fn mode(&self, price: u128) -> Mode {
        if self.system_ratio(price) < self.params.ccr {
            Mode::Recovery
        } else {
            Mode::Normal
        }
    }

    pub fn is_recovery_mode(&self, price: u128) -> bool {
        self.mode(price) == Mode::Recovery
    }

    // ========================================
    // Grace Period
    // ========================================

    /// True once Recovery Mode has been observed continuously for longer than
    /// the configured grace period.
    pub fn grace_period_elapsed(&self, now: u64) -> bool {
        if self.grace_period_start == GRACE_PERIOD_UNSET {
            return false;
        }
        now > self
            .grace_period_start
            .saturating_add(self.params.recovery_grace_period_secs)
    }

    /// Start the grace period on the first observation of Recovery Mode and
    /// clear it on the first observation of Normal Mode.
    pub fn sync_grace_period<S: EventSink>(&mut self, price: u128, now: u64, sink: &mut S) {
        let recovery = self.is_recovery_mode(price);
        if recovery && self.grace_period_start == GRACE_PERIOD_UNSET {
            self.grace_period_start = now;
            sink.emit(CdpEvent::GracePeriodStarted { at: now });
        } else if !recovery && self.grace_period_start != GRACE_PERIOD_UNSET {
            self.grace_period_start = GRACE_PERIOD_UNSET;
            sink.emit(CdpEvent::GracePeriodEnded);
        }
    }

    // ========================================
    // Liquidation Rule
    // ========================================

    pub fn classify(&self, icr: u128, tcr: u128, mode: Mode, now: u64) -> Eligibility {
        if icr < self.params.mcr {
            return Eligibility::BelowMcr;
        }
        match mode {
            Mode::Normal => Eligibility::Healthy,
            Mode::Recovery if icr >= tcr => Eligibility::Immune,
            Mode::Recovery if self.grace_period_elapsed(now) => Eligibility::RecoveryCapped,
            Mode::Recovery => Eligibility::GracePending,
        }
    }

    /// Eligibility of an active position at `price`; `None` when the slot
    /// holds no active position.
    pub fn eligibility(&self, idx: u16, price: u128, now: u64) -> Option<Eligibility> {
        if !self.is_active(idx) {
            return None;
        }
        let icr = self.position_ratio(idx, price);
        let tcr = self.system_ratio(price);
        Some(self.classify(icr, tcr, self.mode(price), now))
    }
}
