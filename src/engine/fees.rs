//! Fee/Rate Controller: a base rate that jumps on redemption volume and
//! decays per whole minute, plus the admin-gated parameter setters.

use super::math::{dec_mul, dec_pow, mul_div};
use super::{
    CdpEngine, CdpEvent, EngineError, EventSink, Result, DECIMAL_PRECISION,
    MAX_INDEX_UPDATE_INTERVAL_SECS, MAX_MINUTE_DECAY_FACTOR, MAX_REWARD_SPLIT_BPS, MIN_GRACE_PERIOD_SECS, MIN_MINUTE_DECAY_FACTOR,
    MIN_REDEMPTION_FEE_FLOOR, REDEMPTION_BETA, SECONDS_PER_MINUTE,
};

impl CdpEngine {
    // ========================================
    // Decay
    // ========================================

    pub fn minutes_passed_since_last_fee_op(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_fee_op_time) / SECONDS_PER_MINUTE
    }

    pub fn decayed_base_rate(&self, now: u64) -> u128 {
        let minutes = self.minutes_passed_since_last_fee_op(now);
        let factor = dec_pow(self.params.minute_decay_factor, minutes);
        dec_mul(self.base_rate, factor)
    }

    /// Fee rate for a given base rate: floor + base, capped at 100%.
    pub fn redemption_rate_with(&self, base_rate: u128) -> u128 {
        self.params
            .redemption_fee_floor
            .saturating_add(base_rate)
            .min(DECIMAL_PRECISION)
    }

    /// Fee rate a redemption at `now` would start from, before its own
    /// volume is added.
    pub fn redemption_rate(&self, now: u64) -> u128 {
        self.redemption_rate_with(self.decayed_base_rate(now))
    }

    /// Base rate after redeeming collateral worth `drawn_value` debt units
    /// out of `total_debt`. Pure; nothing is written.
    pub fn base_rate_after_redemption(
        &self,
        drawn_value: u128,
        total_debt: u128,
        now: u64,
    ) -> Result<u128> {
        if total_debt == 0 {
            return Err(EngineError::UnableToRedeem);
        }
        let fraction = mul_div(drawn_value, DECIMAL_PRECISION, total_debt)?;
        let decayed = self.decayed_base_rate(now);
        Ok(decayed
            .saturating_add(fraction / REDEMPTION_BETA)
            .min(DECIMAL_PRECISION))
    }

    pub(crate) fn commit_base_rate<S: EventSink>(&mut self, base_rate: u128, now: u64, sink: &mut S) {
        self.base_rate = base_rate;
        sink.emit(CdpEvent::BaseRateUpdated { base_rate });
        self.update_last_fee_op_time(now, sink);
    }

    /// Advance the fee clock by the whole minutes elapsed. A partial minute
    /// is kept for the next update.
    pub(crate) fn update_last_fee_op_time<S: EventSink>(&mut self, now: u64, sink: &mut S) {
        let minutes = self.minutes_passed_since_last_fee_op(now);
        if minutes == 0 {
            return;
        }
        self.last_fee_op_time = self
            .last_fee_op_time
            .saturating_add(minutes.saturating_mul(SECONDS_PER_MINUTE));
        sink.emit(CdpEvent::LastFeeOpTimeUpdated {
            time: self.last_fee_op_time,
        });
    }

    // ========================================
    // Admin Setters
    // ========================================

    pub fn set_redemption_fee_floor<S: EventSink>(&mut self, floor: u128, sink: &mut S) -> Result<()> {
        if !(MIN_REDEMPTION_FEE_FLOOR..=DECIMAL_PRECISION).contains(&floor) {
            return Err(EngineError::InvalidParam);
        }
        self.params.redemption_fee_floor = floor;
        sink.emit(CdpEvent::RedemptionFeeFloorSet { floor });
        Ok(())
    }

    /// Switch decay factors. Decay accrued so far is settled under the old
    /// factor first.
    pub fn set_minute_decay_factor<S: EventSink>(
        &mut self,
        factor: u128,
        now: u64,
        sink: &mut S,
    ) -> Result<()> {
        if !(MIN_MINUTE_DECAY_FACTOR..=MAX_MINUTE_DECAY_FACTOR).contains(&factor) {
            return Err(EngineError::InvalidParam);
        }
        let decayed = self.decayed_base_rate(now);
        self.commit_base_rate(decayed, now, sink);
        self.params.minute_decay_factor = factor;
        sink.emit(CdpEvent::MinuteDecayFactorSet { factor });
        Ok(())
    }

    pub fn set_grace_period<S: EventSink>(&mut self, secs: u64, sink: &mut S) -> Result<()> {
        if secs < MIN_GRACE_PERIOD_SECS {
            return Err(EngineError::InvalidParam);
        }
        self.params.recovery_grace_period_secs = secs;
        sink.emit(CdpEvent::GracePeriodDurationSet { secs });
        Ok(())
    }

    pub fn set_staking_reward_split<S: EventSink>(&mut self, bps: u64, sink: &mut S) -> Result<()> {
        if bps > MAX_REWARD_SPLIT_BPS {
            return Err(EngineError::InvalidParam);
        }
        self.params.staking_reward_split_bps = bps;
        sink.emit(CdpEvent::StakingRewardSplitSet { bps });
        Ok(())
    }

    pub fn set_index_update_interval<S: EventSink>(&mut self, secs: u64, sink: &mut S) -> Result<()> {
        if secs > MAX_INDEX_UPDATE_INTERVAL_SECS {
            return Err(EngineError::InvalidParam);
        }
        self.params.index_update_interval_secs = secs;
        sink.emit(CdpEvent::IndexUpdateIntervalSet { secs });
        Ok(())
    }
}
