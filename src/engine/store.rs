//! Position Store: the slab records and the owner-side hooks that create,
//! adjust, close and settle them.

use bytemuck::{Pod, Zeroable};

use super::math::{compute_nominal_ratio, compute_ratio};
use super::{CdpEngine, CdpEvent, CloseReason, EngineError, EventSink, Result, MAX_POSITIONS};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PositionStatus {
    NonExistent = 0,
    Active = 1,
    ClosedByOwner = 2,
    ClosedByLiquidation = 3,
    ClosedByRedemption = 4,
}

impl PositionStatus {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => PositionStatus::Active,
            2 => PositionStatus::ClosedByOwner,
            3 => PositionStatus::ClosedByLiquidation,
            4 => PositionStatus::ClosedByRedemption,
            _ => PositionStatus::NonExistent,
        }
    }

    pub fn is_closed(self) -> bool {
        matches!(
            self,
            PositionStatus::ClosedByOwner
                | PositionStatus::ClosedByLiquidation
                | PositionStatus::ClosedByRedemption
        )
    }
}

/// One collateralized debt position.
///
/// Field order is part of the persisted layout that indexers read:
/// debt, collateral, stake, status, snapshots, then bookkeeping.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct Position {
    /// Debt as of the last sync
    pub debt: u128,

    /// Collateral shares as of the last sync
    pub coll_shares: u128,

    /// Weight for redistributions and the staking-yield fee
    pub stake: u128,

    /// PositionStatus as u8
    pub status: u8,
    pub _status_padding: [u8; 15],

    // ========================================
    // Reward snapshots
    // ========================================
    pub debt_snapshot: u128,
    pub coll_snapshot: u128,
    pub fee_snapshot: u128,

    // ========================================
    // Bookkeeping
    // ========================================
    /// Nominal ratio the position was inserted into the list with
    pub nicr: u128,

    /// Collateral set aside for the liquidator (outside `coll_shares`)
    pub liquidator_reward_shares: u128,

    /// Collateral the former owner may claim after closure
    pub surplus_shares: u128,

    /// Monotonic id, never recycled
    pub position_id: u64,

    /// Owner pubkey; signature checks are done by the wrapper
    pub owner: [u8; 32],

    pub prev: u16,
    pub next: u16,
    pub _padding: [u8; 4],
}

impl Position {
    pub fn status(&self) -> PositionStatus {
        PositionStatus::from_u8(self.status)
    }

    pub fn is_active(&self) -> bool {
        self.status() == PositionStatus::Active
    }
}

/// Requested change to an active position. Additions and removals are
/// given separately so the engine never has to deal with signed amounts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PositionAdjustment {
    pub coll_added: u128,
    pub coll_withdrawn: u128,
    pub debt_minted: u128,
    pub debt_repaid: u128,
}

/// What the owner settles when closing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClosedPosition {
    /// Debt the owner must repay
    pub debt: u128,
    /// Collateral returned, liquidator carve-out included
    pub coll_shares: u128,
}

impl CdpEngine {
    // ========================================
    // Read Accessors
    // ========================================

    pub fn position(&self, idx: u16) -> Option<&Position> {
        self.positions.get(idx as usize)
    }

    pub fn status(&self, idx: u16) -> PositionStatus {
        self.position(idx)
            .map(|p| p.status())
            .unwrap_or(PositionStatus::NonExistent)
    }

    pub fn is_active(&self, idx: u16) -> bool {
        (idx as usize) < MAX_POSITIONS
            && self.is_used(idx as usize)
            && self.positions[idx as usize].is_active()
    }

    pub fn stake(&self, idx: u16) -> u128 {
        if !self.is_active(idx) {
            return 0;
        }
        self.positions[idx as usize].stake
    }

    pub fn active_positions(&self) -> u16 {
        self.list_size
    }

    fn require_owner(&self, idx: u16, owner: &[u8; 32]) -> Result<()> {
        if !self.is_active(idx) {
            return Err(EngineError::PositionNotFound);
        }
        if self.positions[idx as usize].owner != *owner {
            return Err(EngineError::Unauthorized);
        }
        Ok(())
    }

    fn require_healthy(&self, coll_shares: u128, debt: u128, price: u128) -> Result<()> {
        if price == 0 {
            return Err(EngineError::InvalidPrice);
        }
        if debt < self.params.min_net_debt {
            return Err(EngineError::BelowMinNetDebt);
        }
        if coll_shares == 0 {
            return Err(EngineError::ZeroAmount);
        }
        let icr = compute_ratio(self.shares_to_underlying(coll_shares), debt, price);
        if icr < self.params.mcr {
            return Err(EngineError::Undercollateralized);
        }
        Ok(())
    }

    // ========================================
    // Position Lifecycle
    // ========================================

    /// Create an active position. The caller has already taken
    /// `coll_shares + liquidator_reward_shares` into custody and mints
    /// `debt` to the owner afterwards.
    #[allow(clippy::too_many_arguments)]
    pub fn open_position<S: EventSink>(
        &mut self,
        owner: [u8; 32],
        coll_shares: u128,
        debt: u128,
        lower_hint: u16,
        upper_hint: u16,
        price: u128,
        now: u64,
        sink: &mut S,
    ) -> Result<u16> {
        self.require_healthy(coll_shares, debt, price)?;

        let total_debt = self.total_debt.checked_add(debt).ok_or(EngineError::Overflow)?;
        let total_coll = self
            .total_coll_shares
            .checked_add(coll_shares)
            .ok_or(EngineError::Overflow)?;
        let reward = self.params.liquidator_reward_shares;
        let total_reward = self
            .total_reward_shares
            .checked_add(reward)
            .ok_or(EngineError::Overflow)?;

        let idx = self.alloc_slot()?;
        let position_id = self.next_position_id;
        self.next_position_id = self.next_position_id.saturating_add(1);

        {
            let p = &mut self.positions[idx as usize];
            p.owner = owner;
            p.position_id = position_id;
            p.debt = debt;
            p.coll_shares = coll_shares;
            p.liquidator_reward_shares = reward;
            p.status = PositionStatus::Active as u8;
        }
        self.update_snapshots(idx);
        self.total_debt = total_debt;
        self.total_coll_shares = total_coll;
        self.total_reward_shares = total_reward;
        self.update_stake(idx)?;

        let nicr = compute_nominal_ratio(coll_shares, debt);
        self.list_insert(idx, nicr, lower_hint, upper_hint);

        sink.emit(CdpEvent::PositionOpened {
            idx,
            position_id,
            debt,
            coll_shares,
            stake: self.positions[idx as usize].stake,
        });
        self.sync_grace_period(price, now, sink);
        Ok(idx)
    }

    /// Apply an owner adjustment. Pending rewards are folded in first so the
    /// checks see the true position.
    #[allow(clippy::too_many_arguments)]
    pub fn adjust_position<S: EventSink>(
        &mut self,
        idx: u16,
        owner: &[u8; 32],
        adjustment: PositionAdjustment,
        lower_hint: u16,
        upper_hint: u16,
        price: u128,
        now: u64,
        sink: &mut S,
    ) -> Result<()> {
        self.require_owner(idx, owner)?;

        let (debt, coll) = self.synced_position(idx);
        let new_coll = coll
            .checked_add(adjustment.coll_added)
            .ok_or(EngineError::Overflow)?
            .checked_sub(adjustment.coll_withdrawn)
            .ok_or(EngineError::InsufficientBalance)?;
        let new_debt = debt
            .checked_add(adjustment.debt_minted)
            .ok_or(EngineError::Overflow)?
            .checked_sub(adjustment.debt_repaid)
            .ok_or(EngineError::InsufficientBalance)?;
        self.require_healthy(new_coll, new_debt, price)?;

        self.apply_pending_rewards(idx);

        self.total_debt = self
            .total_debt
            .saturating_sub(debt)
            .checked_add(new_debt)
            .ok_or(EngineError::Overflow)?;
        self.total_coll_shares = self
            .total_coll_shares
            .saturating_sub(coll)
            .checked_add(new_coll)
            .ok_or(EngineError::Overflow)?;

        {
            let p = &mut self.positions[idx as usize];
            p.debt = new_debt;
            p.coll_shares = new_coll;
        }
        self.update_stake(idx)?;
        self.list_reinsert(idx, compute_nominal_ratio(new_coll, new_debt), lower_hint, upper_hint);

        sink.emit(CdpEvent::PositionAdjusted {
            idx,
            debt: new_debt,
            coll_shares: new_coll,
            stake: self.positions[idx as usize].stake,
        });
        self.sync_grace_period(price, now, sink);
        Ok(())
    }

    /// Close a position on the owner's behalf.
    pub fn close_position<S: EventSink>(
        &mut self,
        idx: u16,
        owner: &[u8; 32],
        price: u128,
        now: u64,
        sink: &mut S,
    ) -> Result<ClosedPosition> {
        self.require_owner(idx, owner)?;

        self.apply_pending_rewards(idx);
        self.remove_stake(idx);

        let (debt, coll, reward, position_id) = {
            let p = &self.positions[idx as usize];
            (p.debt, p.coll_shares, p.liquidator_reward_shares, p.position_id)
        };
        self.total_debt = self.total_debt.saturating_sub(debt);
        self.total_coll_shares = self.total_coll_shares.saturating_sub(coll);
        self.total_reward_shares = self.total_reward_shares.saturating_sub(reward);

        self.list_remove(idx);
        {
            let p = &mut self.positions[idx as usize];
            p.debt = 0;
            p.coll_shares = 0;
            p.liquidator_reward_shares = 0;
            p.status = PositionStatus::ClosedByOwner as u8;
        }
        self.release_slot(idx);

        sink.emit(CdpEvent::PositionClosed {
            idx,
            position_id,
            reason: CloseReason::Owner,
        });
        self.sync_grace_period(price, now, sink);

        Ok(ClosedPosition {
            debt,
            coll_shares: coll.saturating_add(reward),
        })
    }

    /// Hand the former owner whatever surplus a closure left behind and free
    /// the slot.
    pub fn claim_surplus<S: EventSink>(
        &mut self,
        idx: u16,
        owner: &[u8; 32],
        sink: &mut S,
    ) -> Result<u128> {
        if (idx as usize) >= MAX_POSITIONS || !self.is_used(idx as usize) {
            return Err(EngineError::NothingToClaim);
        }
        let p = &self.positions[idx as usize];
        if !p.status().is_closed() || p.surplus_shares == 0 {
            return Err(EngineError::NothingToClaim);
        }
        if p.owner != *owner {
            return Err(EngineError::Unauthorized);
        }

        let shares = p.surplus_shares;
        self.positions[idx as usize].surplus_shares = 0;
        self.claimable_surplus_shares = self.claimable_surplus_shares.saturating_sub(shares);
        self.release_slot(idx);

        sink.emit(CdpEvent::SurplusClaimed { idx, shares });
        Ok(shares)
    }

    /// Terminal bookkeeping shared by liquidation and redemption: zero the
    /// balances, park any surplus for the owner and drop out of the index.
    pub(crate) fn retire_position(&mut self, idx: u16, status: PositionStatus, surplus: u128) {
        self.list_remove(idx);
        {
            let p = &mut self.positions[idx as usize];
            p.debt = 0;
            p.coll_shares = 0;
            p.stake = 0;
            p.liquidator_reward_shares = 0;
            p.surplus_shares = surplus;
            p.status = status as u8;
        }
        self.claimable_surplus_shares = self.claimable_surplus_shares.saturating_add(surplus);
        if surplus == 0 {
            self.release_slot(idx);
        }
    }
}
