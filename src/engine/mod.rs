//! CDP Engine: liquidation, loss redistribution and redemption over a
//! fixed slab of collateralized debt positions.
//!
//! The engine owns every piece of state it needs in one `#[repr(C)]` struct:
//! - Position Store (slab + bitmap + freelist)
//! - Risk-Ordered Index (intrusive doubly-linked list ordered by nominal ratio)
//! - Reward Accumulator (per-stake debt/collateral/fee indices with snapshots)
//! - Fee/Rate Controller (decaying base rate)
//!
//! All data structures are laid out in a single contiguous memory chunk,
//! suitable for a single Solana account. Nothing here knows about Solana;
//! the program wrapper feeds prices, timestamps and authorization decisions in.

#![forbid(unsafe_code)]

use alloc::boxed::Box;
use bytemuck::Zeroable;

pub mod events;
pub mod fees;
pub mod hints;
pub mod liquidation;
pub mod math;
pub mod redemption;
pub mod rewards;
pub mod solvency;
pub mod sorted;
pub mod store;

pub use events::{CdpEvent, CloseReason, EventSink, NoOpSink};
pub use hints::RedemptionHints;
pub use liquidation::LiquidationTotals;
pub use redemption::{RedemptionOutcome, RedemptionRequest};
pub use rewards::PendingRewards;
pub use solvency::{Eligibility, Mode};
pub use store::{ClosedPosition, Position, PositionAdjustment, PositionStatus};

// ============================================================================
// Constants
// ============================================================================

// MAX_POSITIONS is feature-configured, not target-configured.
// x86 and SBF builds use the same slab size for a given feature set.
#[cfg(kani)]
pub const MAX_POSITIONS: usize = 4;

#[cfg(all(feature = "test", not(kani)))]
pub const MAX_POSITIONS: usize = 64;

#[cfg(all(not(kani), not(feature = "test")))]
pub const MAX_POSITIONS: usize = 1024;

pub const BITMAP_WORDS: usize = (MAX_POSITIONS + 63) / 64;

/// Sentinel for "no slot" in list links and the freelist
pub const NONE: u16 = u16::MAX;

/// 1e18 fixed point (ratios, prices, indices)
pub const DECIMAL_PRECISION: u128 = 1_000_000_000_000_000_000;

/// Scale of the nominal collateral ratio used as the ordering key
pub const NICR_PRECISION: u128 = 100_000_000_000_000_000_000;

/// 110%
pub const DEFAULT_MCR: u128 = 1_100_000_000_000_000_000;

/// 150%
pub const DEFAULT_CCR: u128 = 1_500_000_000_000_000_000;

/// 102%; collateral value taken per unit of debt in a capped Recovery Mode
/// liquidation
pub const DEFAULT_LIQUIDATION_CAP_RATIO: u128 = 1_020_000_000_000_000_000;

/// 0.5%; the redemption fee floor and the smallest acceptable fee cap
pub const MIN_REDEMPTION_FEE_FLOOR: u128 = 5_000_000_000_000_000;

/// Half-life of 12h: 0.5 = d^720
pub const DEFAULT_MINUTE_DECAY_FACTOR: u128 = 999_037_758_833_783_000;
pub const MIN_MINUTE_DECAY_FACTOR: u128 = 1;
pub const MAX_MINUTE_DECAY_FACTOR: u128 = 999_999_999_999_999_999;

/// Redeemed fraction is divided by BETA before it is added to the base rate
pub const REDEMPTION_BETA: u128 = 2;

pub const SECONDS_PER_MINUTE: u64 = 60;

/// Shortest Recovery Mode grace period the admin may configure
pub const MIN_GRACE_PERIOD_SECS: u64 = 900;

/// `grace_period_start` value while the system is not in Recovery Mode
pub const GRACE_PERIOD_UNSET: u64 = u64::MAX;

pub const MAX_REWARD_SPLIT_BPS: u64 = 10_000;
pub const DEFAULT_STAKING_REWARD_SPLIT_BPS: u64 = 2_500;

/// Minimum spacing between two share index syncs (12h)
pub const DEFAULT_INDEX_UPDATE_INTERVAL_SECS: u64 = 43_200;
pub const MAX_INDEX_UPDATE_INTERVAL_SECS: u64 = 604_800;

/// Steps a stale insert hint may be walked before falling back to a head scan
pub const MAX_HINT_WALK: u16 = 32;

// ============================================================================
// Parameters
// ============================================================================

/// Engine parameters, fixed at init and adjusted only through the admin setters
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Zeroable)]
pub struct EngineParams {
    /// Minimum collateral ratio (1e18 = 100%)
    pub mcr: u128,

    /// Critical system ratio; below it the system is in Recovery Mode
    pub ccr: u128,

    /// Smallest debt an active position may carry
    pub min_net_debt: u128,

    /// Collateral shares set aside at open and paid to whoever liquidates
    pub liquidator_reward_shares: u128,

    /// Added to the base rate to form the redemption fee rate
    pub redemption_fee_floor: u128,

    /// Base rate multiplier applied once per elapsed minute
    pub minute_decay_factor: u128,

    /// Collateral value per unit of debt the reserve takes when liquidating
    /// a position between MCR and the system ratio; the rest is surplus
    pub liquidation_cap_ratio: u128,

    /// Seconds Recovery Mode must persist before positions between MCR and
    /// the system ratio become liquidatable
    pub recovery_grace_period_secs: u64,

    /// Share of collateral yield taken as protocol fee, in basis points
    pub staking_reward_split_bps: u64,

    /// Seconds that must pass between two share index syncs
    pub index_update_interval_secs: u64,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            mcr: DEFAULT_MCR,
            ccr: DEFAULT_CCR,
            min_net_debt: 1_000_000_000,
            liquidator_reward_shares: 10_000_000,
            redemption_fee_floor: MIN_REDEMPTION_FEE_FLOOR,
            minute_decay_factor: DEFAULT_MINUTE_DECAY_FACTOR,
            liquidation_cap_ratio: DEFAULT_LIQUIDATION_CAP_RATIO,
            recovery_grace_period_secs: MIN_GRACE_PERIOD_SECS,
            staking_reward_split_bps: DEFAULT_STAKING_REWARD_SPLIT_BPS,
            index_update_interval_secs: DEFAULT_INDEX_UPDATE_INTERVAL_SECS,
        }
    }
}

impl EngineParams {
    pub fn validate(&self) -> Result<()> {
        // Redemption at ICR >= MCR must always leave collateral behind
        if self.mcr <= DECIMAL_PRECISION || self.ccr < self.mcr {
            return Err(EngineError::InvalidParam);
        }
        if self.liquidation_cap_ratio < DECIMAL_PRECISION || self.liquidation_cap_ratio > self.mcr {
            return Err(EngineError::InvalidParam);
        }
        if self.min_net_debt == 0 {
            return Err(EngineError::InvalidParam);
        }
        if self.redemption_fee_floor < MIN_REDEMPTION_FEE_FLOOR
            || self.redemption_fee_floor > DECIMAL_PRECISION
        {
            return Err(EngineError::InvalidParam);
        }
        if self.minute_decay_factor < MIN_MINUTE_DECAY_FACTOR
            || self.minute_decay_factor > MAX_MINUTE_DECAY_FACTOR
        {
            return Err(EngineError::InvalidParam);
        }
        if self.recovery_grace_period_secs < MIN_GRACE_PERIOD_SECS {
            return Err(EngineError::InvalidParam);
        }
        if self.staking_reward_split_bps > MAX_REWARD_SPLIT_BPS {
            return Err(EngineError::InvalidParam);
        }
        if self.index_update_interval_secs > MAX_INDEX_UPDATE_INTERVAL_SECS {
            return Err(EngineError::InvalidParam);
        }
        Ok(())
    }
}

/// Backstop that absorbs liquidated debt before it is redistributed.
/// Depositor bookkeeping lives outside the engine; only the pooled
/// balance and the collateral it has earned are tracked here.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable)]
pub struct StabilityReserve {
    /// Debt tokens available to cancel liquidated debt
    pub debt: u128,

    /// Collateral shares received in exchange for cancelled debt
    pub coll_gain_shares: u128,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineError {
    /// Target position does not exist or is no longer active
    NotLiquidatable,

    /// Position ratio does not meet the current mode's liquidation rule
    AboveThreshold,

    /// Batch liquidation found nothing eligible
    NothingToLiquidate,

    /// Empty id list
    EmptyInput,

    ZeroAmount,

    /// Amount exceeds the caller's balance or the position's holdings
    InsufficientBalance,

    /// System ratio below MCR; redemptions are disabled
    BelowMcr,

    /// Fee would consume all of the drawn collateral
    FeeExceedsCollateral,

    /// Realized fee rate exceeds the caller's cap
    FeeExceedsMaxFee,

    /// Fee cap outside [floor, 100%]
    InvalidMaxFee,

    /// Redemption walk redeemed nothing
    UnableToRedeem,

    /// Reserve cannot cover a capped Recovery Mode liquidation
    ReserveInsufficient,

    /// No remaining stake to absorb a redistribution
    CannotRedistribute,

    /// The only active position is never liquidated
    LastPosition,

    /// Share index synced again before the update interval elapsed
    IndexUpdateTooFrequent,

    PositionNotFound,

    Unauthorized,

    /// Resulting ratio below MCR
    Undercollateralized,

    BelowMinNetDebt,

    NothingToClaim,

    /// No free slot left in the slab
    SlabFull,

    InvalidParam,

    InvalidPrice,

    /// Arithmetic overflow
    Overflow,
}

pub type Result<T> = core::result::Result<T, EngineError>;

// ============================================================================
// Engine State
// ============================================================================

/// Main engine state - fixed slab with bitmap, list links embedded in records
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Zeroable)]
pub struct CdpEngine {
    pub params: EngineParams,

    // ========================================
    // System Aggregates
    // ========================================
    /// Sum of synced debt over active positions, plus pending redistributions
    pub total_debt: u128,

    /// Sum of synced collateral shares over active positions, plus pending
    /// redistributions (liquidator carve-outs excluded)
    pub total_coll_shares: u128,

    pub total_stakes: u128,

    /// Stake total captured after the last liquidation
    pub total_stakes_snapshot: u128,

    /// Collateral total captured after the last liquidation
    pub total_coll_snapshot: u128,

    /// Liquidator carve-outs held for active positions
    pub total_reward_shares: u128,

    // ========================================
    // Reward Accumulator
    // ========================================
    /// Redistributed debt per unit stake (1e18); never decreases
    pub debt_index: u128,

    /// Redistributed collateral per unit stake (1e18); never decreases
    pub coll_index: u128,

    /// Staking-yield fee charged per unit stake (1e18); never decreases
    pub fee_index: u128,

    /// Division remainders carried into the next update (scaled by 1e18)
    pub last_debt_error: u128,
    pub last_coll_error: u128,
    pub last_fee_error: u128,

    /// Underlying collateral per share (1e18)
    pub share_index: u128,

    /// Upper bound on units lost to floor rounding since genesis
    pub rounding_slack: u128,

    // ========================================
    // Fee/Rate Controller
    // ========================================
    pub base_rate: u128,
    pub last_fee_op_time: u64,

    /// Time of the last accepted share index sync
    pub last_index_update: u64,

    // ========================================
    // Balances outside the positions
    // ========================================
    pub reserve: StabilityReserve,

    /// Protocol fee shares (redemption fees and staking-yield split)
    pub fee_recipient_shares: u128,

    /// Collateral owed to owners of closed positions
    pub claimable_surplus_shares: u128,

    // ========================================
    // Recovery Mode
    // ========================================
    /// Timestamp Recovery Mode was first observed, or GRACE_PERIOD_UNSET
    pub grace_period_start: u64,

    // ========================================
    // Counters
    // ========================================
    pub next_position_id: u64,
    pub lifetime_liquidations: u64,
    pub lifetime_redemptions: u64,

    // ========================================
    // Risk-Ordered Index
    // ========================================
    /// Lowest nominal ratio (riskiest)
    pub head: u16,

    /// Highest nominal ratio
    pub tail: u16,

    pub list_size: u16,

    // ========================================
    // Slab Management
    // ========================================
    pub free_head: u16,
    pub num_used: u16,
    pub _padding: [u8; 6],

    /// Occupancy bitmap (active positions and closed ones with unclaimed surplus)
    pub used: [u64; BITMAP_WORDS],

    /// Freelist next pointers
    pub next_free: [u16; MAX_POSITIONS],

    pub positions: [Position; MAX_POSITIONS],
}

impl CdpEngine {
    /// Build a fresh engine on the heap.
    ///
    /// The struct is hundreds of KB at production size; zero-allocate and
    /// initialize in place instead of moving it through the stack.
    pub fn new_boxed(params: EngineParams, now: u64) -> Box<Self> {
        let mut engine: Box<Self> = bytemuck::zeroed_box();
        engine.init_in_place(params, now);
        engine
    }

    /// Initialize an engine in place (zero-copy friendly).
    ///
    /// PREREQUISITE: the memory backing `self` MUST be zeroed. Only fields
    /// with a non-zero initial value are written.
    pub fn init_in_place(&mut self, params: EngineParams, now: u64) {
        self.params = params;
        self.share_index = DECIMAL_PRECISION;
        self.last_fee_op_time = now;
        self.last_index_update = now;
        self.grace_period_start = GRACE_PERIOD_UNSET;
        self.head = NONE;
        self.tail = NONE;

        // Freelist: 0 -> 1 -> ... -> MAX_POSITIONS-1 -> NONE
        for i in 0..MAX_POSITIONS - 1 {
            self.next_free[i] = (i + 1) as u16;
        }
        self.next_free[MAX_POSITIONS - 1] = NONE;
        for p in self.positions.iter_mut() {
            p.prev = NONE;
            p.next = NONE;
        }
    }

    // ========================================
    // Bitmap Helpers
    // ========================================

    pub fn is_used(&self, idx: usize) -> bool {
        if idx >= MAX_POSITIONS {
            return false;
        }
        let w = idx >> 6;
        let b = idx & 63;
        ((self.used[w] >> b) & 1) == 1
    }

    fn set_used(&mut self, idx: usize) {
        let w = idx >> 6;
        let b = idx & 63;
        self.used[w] |= 1u64 << b;
    }

    fn clear_used(&mut self, idx: usize) {
        let w = idx >> 6;
        let b = idx & 63;
        self.used[w] &= !(1u64 << b);
    }

    pub(crate) fn for_each_used<F: FnMut(usize, &Position)>(&self, mut f: F) {
        for (block, word) in self.used.iter().copied().enumerate() {
            let mut w = word;
            while w != 0 {
                let bit = w.trailing_zeros() as usize;
                let idx = block * 64 + bit;
                w &= w - 1;
                if idx >= MAX_POSITIONS {
                    continue;
                }
                f(idx, &self.positions[idx]);
            }
        }
    }

    // ========================================
    // Slot Allocation
    // ========================================

    /// Take a slot off the freelist and wipe whatever record it still holds.
    pub(crate) fn alloc_slot(&mut self) -> Result<u16> {
        if self.free_head == NONE {
            return Err(EngineError::SlabFull);
        }
        let idx = self.free_head;
        self.free_head = self.next_free[idx as usize];
        self.next_free[idx as usize] = NONE;
        self.set_used(idx as usize);
        self.num_used = self.num_used.saturating_add(1);

        let mut fresh = Position::zeroed();
        fresh.prev = NONE;
        fresh.next = NONE;
        self.positions[idx as usize] = fresh;
        Ok(idx)
    }

    /// Return a slot to the freelist. The record keeps its terminal status
    /// until the slot is handed out again.
    pub(crate) fn release_slot(&mut self, idx: u16) {
        if !self.is_used(idx as usize) {
            return;
        }
        self.clear_used(idx as usize);
        self.next_free[idx as usize] = self.free_head;
        self.free_head = idx;
        self.num_used = self.num_used.saturating_sub(1);
    }

    // ========================================
    // Reserve and Protocol Balances
    // ========================================

    /// Credit the stability reserve. The caller has already burned the
    /// corresponding debt tokens.
    pub fn top_up_reserve<S: EventSink>(&mut self, amount: u128, sink: &mut S) -> Result<()> {
        if amount == 0 {
            return Err(EngineError::ZeroAmount);
        }
        self.reserve.debt = self
            .reserve
            .debt
            .checked_add(amount)
            .ok_or(EngineError::Overflow)?;
        sink.emit(CdpEvent::ReserveToppedUp { amount });
        Ok(())
    }

    /// Release protocol fee shares for transfer out of the vault.
    pub fn withdraw_fee_shares(&mut self, amount: u128) -> Result<()> {
        if amount == 0 {
            return Err(EngineError::ZeroAmount);
        }
        if amount > self.fee_recipient_shares {
            return Err(EngineError::InsufficientBalance);
        }
        self.fee_recipient_shares -= amount;
        Ok(())
    }

    /// Collateral shares the vault must hold to cover every claim on it.
    pub fn vault_liability_shares(&self) -> u128 {
        self.total_coll_shares
            .saturating_add(self.total_reward_shares)
            .saturating_add(self.claimable_surplus_shares)
            .saturating_add(self.reserve.coll_gain_shares)
            .saturating_add(self.fee_recipient_shares)
    }

    // ========================================
    // Invariants
    // ========================================

    /// Check the aggregate bookkeeping against the positions.
    ///
    /// - total_stakes, total_reward_shares and claimable_surplus_shares are exact sums
    /// - total_debt / total_coll_shares match synced position sums within the
    ///   recorded rounding slack (plus one unit per active position for the
    ///   floor in their not-yet-applied rewards)
    /// - the Risk-Ordered Index holds exactly the active positions in
    ///   non-decreasing nominal-ratio order
    pub fn check_conservation(&self) -> bool {
        let mut debt_sum = 0u128;
        let mut coll_sum = 0u128;
        let mut stake_sum = 0u128;
        let mut reward_sum = 0u128;
        let mut surplus_sum = 0u128;
        let mut active = 0u128;

        self.for_each_used(|idx, p| {
            if p.is_active() {
                let (debt, coll) = self.synced_position(idx as u16);
                debt_sum = debt_sum.saturating_add(debt);
                coll_sum = coll_sum.saturating_add(coll);
                stake_sum = stake_sum.saturating_add(p.stake);
                reward_sum = reward_sum.saturating_add(p.liquidator_reward_shares);
                active += 1;
            } else {
                surplus_sum = surplus_sum.saturating_add(p.surplus_shares);
            }
        });

        if stake_sum != self.total_stakes
            || reward_sum != self.total_reward_shares
            || surplus_sum != self.claimable_surplus_shares
        {
            return false;
        }

        let tolerance = self.rounding_slack.saturating_add(active);
        if self.total_debt.abs_diff(debt_sum) > tolerance
            || self.total_coll_shares.abs_diff(coll_sum) > tolerance
        {
            return false;
        }

        active == self.list_size as u128 && self.check_ordering()
    }
}
