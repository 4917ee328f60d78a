//! Observable engine events.
//!
//! The engine never logs on its own; every state transition worth indexing
//! is pushed through an [`EventSink`] supplied by the caller.

use alloc::vec::Vec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    Owner,
    Liquidation,
    Redemption,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CdpEvent {
    PositionOpened {
        idx: u16,
        position_id: u64,
        debt: u128,
        coll_shares: u128,
        stake: u128,
    },
    PositionAdjusted {
        idx: u16,
        debt: u128,
        coll_shares: u128,
        stake: u128,
    },
    PositionClosed {
        idx: u16,
        position_id: u64,
        reason: CloseReason,
    },
    /// Liquidated debt cancelled against the stability reserve
    ReserveOffset {
        debt: u128,
        coll_shares: u128,
    },
    /// Liquidated debt and collateral spread over the remaining stakes
    Redistributed {
        debt: u128,
        coll_shares: u128,
        debt_index: u128,
        coll_index: u128,
    },
    /// Part of a position's debt cancelled against the reserve
    PartiallyLiquidated {
        idx: u16,
        debt: u128,
        coll_shares: u128,
        remaining_debt: u128,
        remaining_coll_shares: u128,
    },
    LiquidationCompleted {
        liquidated: u16,
        debt_offset: u128,
        debt_redistributed: u128,
        reward_shares: u128,
    },
    RedemptionExecuted {
        requested: u128,
        debt_redeemed: u128,
        coll_drawn: u128,
        fee: u128,
    },
    BaseRateUpdated {
        base_rate: u128,
    },
    LastFeeOpTimeUpdated {
        time: u64,
    },
    ShareIndexUpdated {
        old: u128,
        new: u128,
    },
    StakingFeeTaken {
        fee_shares: u128,
        fee_index: u128,
    },
    GracePeriodStarted {
        at: u64,
    },
    GracePeriodEnded,
    SurplusClaimed {
        idx: u16,
        shares: u128,
    },
    ReserveToppedUp {
        amount: u128,
    },
    RedemptionFeeFloorSet {
        floor: u128,
    },
    MinuteDecayFactorSet {
        factor: u128,
    },
    GracePeriodDurationSet {
        secs: u64,
    },
    StakingRewardSplitSet {
        bps: u64,
    },
    IndexUpdateIntervalSet {
        secs: u64,
    },
}

/// Destination for engine events
pub trait EventSink {
    fn emit(&mut self, event: CdpEvent);
}

/// Discards everything
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&mut self, _event: CdpEvent) {}
}

/// Records events in order; handy for tests and off-chain simulation
impl EventSink for Vec<CdpEvent> {
    fn emit(&mut self, event: CdpEvent) {
        self.push(event);
    }
}
