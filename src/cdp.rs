//! CDP: Single-file Solana program with an embedded liquidation, loss
//! redistribution and redemption engine.

#![no_std]
#![deny(unsafe_code)]

extern crate alloc;

pub mod engine;

// 1. mod constants
pub mod constants {
    use core::mem::{size_of, align_of};
    use crate::state::SystemConfig;
    use crate::engine::CdpEngine;

    pub const MAGIC: u64 = 0x4344505f534c4142; // "CDP_SLAB"
    pub const VERSION: u32 = 1;

    pub const HEADER_LEN: usize = 64;
    pub const CONFIG_LEN: usize = size_of::<SystemConfig>();
    pub const ENGINE_ALIGN: usize = align_of::<CdpEngine>();

    pub const fn align_up(x: usize, a: usize) -> usize {
        (x + (a - 1)) & !(a - 1)
    }

    pub const ENGINE_OFF: usize = align_up(HEADER_LEN + CONFIG_LEN, ENGINE_ALIGN);
    pub const ENGINE_LEN: usize = size_of::<CdpEngine>();
    pub const SLAB_LEN: usize = ENGINE_OFF + ENGINE_LEN;

    pub const VAULT_SEED: &[u8] = b"vault";

    /// Pyth price account prefix we read (through the publish slot)
    pub const PYTH_PRICE_LEN: usize = 208;
}

// 2. mod zc (Zero-Copy unsafe island)
#[allow(unsafe_code)]
pub mod zc {
    use solana_program::program_error::ProgramError;
    use crate::engine::CdpEngine;
    use crate::constants::{ENGINE_OFF, ENGINE_LEN, ENGINE_ALIGN};

    #[inline]
    pub fn engine_ref<'a>(data: &'a [u8]) -> Result<&'a CdpEngine, ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &*(ptr as *const CdpEngine) })
    }

    #[inline]
    pub fn engine_mut<'a>(data: &'a mut [u8]) -> Result<&'a mut CdpEngine, ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_mut_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &mut *(ptr as *mut CdpEngine) })
    }
}

// 3. mod error
pub mod error {
    use num_derive::FromPrimitive;
    use solana_program::{decode_error::DecodeError, program_error::ProgramError};
    use crate::engine::EngineError;

    #[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
    pub enum CdpError {
        InvalidVersion,
        AlreadyInitialized,
        NotInitialized,
        InvalidSlabLen,
        InvalidOracleKey,
        OracleStale,
        OracleConfTooWide,
        InvalidVaultAta,
        InvalidMint,
        ExpectedSigner,
        ExpectedWritable,
        OracleInvalid,
        InvalidDebtMint,
        InvalidTokenAccount,
        AdminOnly,
        // Engine errors mapped:
        EngineNotLiquidatable,
        EngineAboveThreshold,
        EngineNothingToLiquidate,
        EngineEmptyInput,
        EngineZeroAmount,
        EngineInsufficientBalance,
        EngineBelowMcr,
        EngineFeeExceedsCollateral,
        EngineFeeExceedsMaxFee,
        EngineInvalidMaxFee,
        EngineUnableToRedeem,
        EngineReserveInsufficient,
        EngineCannotRedistribute,
        EnginePositionNotFound,
        EngineUnauthorized,
        EngineUndercollateralized,
        EngineBelowMinNetDebt,
        EngineNothingToClaim,
        EngineSlabFull,
        EngineInvalidParam,
        EngineInvalidPrice,
        EngineOverflow,
        EngineLastPosition,
        EngineIndexUpdateTooFrequent,
    }

    impl From<CdpError> for ProgramError {
        fn from(e: CdpError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    impl DecodeError<CdpError> for CdpError {
        fn type_of() -> &'static str {
            "CdpError"
        }
    }

    pub fn map_engine_error(e: EngineError) -> ProgramError {
        let err = match e {
            EngineError::NotLiquidatable => CdpError::EngineNotLiquidatable,
            EngineError::AboveThreshold => CdpError::EngineAboveThreshold,
            EngineError::NothingToLiquidate => CdpError::EngineNothingToLiquidate,
            EngineError::EmptyInput => CdpError::EngineEmptyInput,
            EngineError::ZeroAmount => CdpError::EngineZeroAmount,
            EngineError::InsufficientBalance => CdpError::EngineInsufficientBalance,
            EngineError::BelowMcr => CdpError::EngineBelowMcr,
            EngineError::FeeExceedsCollateral => CdpError::EngineFeeExceedsCollateral,
            EngineError::FeeExceedsMaxFee => CdpError::EngineFeeExceedsMaxFee,
            EngineError::InvalidMaxFee => CdpError::EngineInvalidMaxFee,
            EngineError::UnableToRedeem => CdpError::EngineUnableToRedeem,
            EngineError::ReserveInsufficient => CdpError::EngineReserveInsufficient,
            EngineError::CannotRedistribute => CdpError::EngineCannotRedistribute,
            EngineError::PositionNotFound => CdpError::EnginePositionNotFound,
            EngineError::Unauthorized => CdpError::EngineUnauthorized,
            EngineError::Undercollateralized => CdpError::EngineUndercollateralized,
            EngineError::BelowMinNetDebt => CdpError::EngineBelowMinNetDebt,
            EngineError::NothingToClaim => CdpError::EngineNothingToClaim,
            EngineError::SlabFull => CdpError::EngineSlabFull,
            EngineError::InvalidParam => CdpError::EngineInvalidParam,
            EngineError::InvalidPrice => CdpError::EngineInvalidPrice,
            EngineError::Overflow => CdpError::EngineOverflow,
            EngineError::LastPosition => CdpError::EngineLastPosition,
            EngineError::IndexUpdateTooFrequent => CdpError::EngineIndexUpdateTooFrequent,
        };
        ProgramError::Custom(err as u32)
    }
}

// 4. mod ix
pub mod ix {
    use alloc::vec::Vec;
    use arrayref::array_ref;
    use solana_program::program_error::ProgramError;
    use crate::engine::{EngineParams, MAX_POSITIONS};

    #[derive(Debug)]
    pub enum Instruction {
        InitSystem {
            params: EngineParams,
            max_staleness_slots: u64,
            conf_filter_bps: u16,
        },
        OpenPosition { coll_amount: u64, debt_amount: u64, lower_hint: u16, upper_hint: u16 },
        AdjustPosition {
            idx: u16,
            coll_added: u64,
            coll_withdrawn: u64,
            debt_minted: u64,
            debt_repaid: u64,
            lower_hint: u16,
            upper_hint: u16,
        },
        ClosePosition { idx: u16 },
        LiquidatePosition { idx: u16 },
        LiquidateBatch { max_count: u16 },
        LiquidateSet { ids: Vec<u16> },
        Redeem {
            amount: u64,
            first_hint: u16,
            upper_hint: u16,
            lower_hint: u16,
            partial_nicr: u128,
            max_iterations: u32,
            max_fee_pct: u128,
        },
        ClaimSurplus { idx: u16 },
        TopUpReserve { amount: u64 },
        KeeperCrank,
        SetRedemptionFeeFloor { floor: u128 },
        SetMinuteDecayFactor { factor: u128 },
        SetGracePeriod { secs: u64 },
        SetStakingRewardSplit { bps: u64 },
        ClaimFees { amount: u64 },
        LiquidatePartial { idx: u16, debt_amount: u64, lower_hint: u16, upper_hint: u16 },
        SetIndexUpdateInterval { secs: u64 },
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input.split_first().ok_or(ProgramError::InvalidInstructionData)?;

            match tag {
                0 => { // InitSystem
                    let params = read_engine_params(&mut rest)?;
                    let max_staleness_slots = read_u64(&mut rest)?;
                    let conf_filter_bps = read_u16(&mut rest)?;
                    Ok(Instruction::InitSystem { params, max_staleness_slots, conf_filter_bps })
                },
                1 => { // OpenPosition
                    let coll_amount = read_u64(&mut rest)?;
                    let debt_amount = read_u64(&mut rest)?;
                    let lower_hint = read_u16(&mut rest)?;
                    let upper_hint = read_u16(&mut rest)?;
                    Ok(Instruction::OpenPosition { coll_amount, debt_amount, lower_hint, upper_hint })
                },
                2 => { // AdjustPosition
                    let idx = read_u16(&mut rest)?;
                    let coll_added = read_u64(&mut rest)?;
                    let coll_withdrawn = read_u64(&mut rest)?;
                    let debt_minted = read_u64(&mut rest)?;
                    let debt_repaid = read_u64(&mut rest)?;
                    let lower_hint = read_u16(&mut rest)?;
                    let upper_hint = read_u16(&mut rest)?;
                    Ok(Instruction::AdjustPosition {
                        idx, coll_added, coll_withdrawn, debt_minted, debt_repaid, lower_hint, upper_hint,
                    })
                },
                3 => Ok(Instruction::ClosePosition { idx: read_u16(&mut rest)? }),
                4 => Ok(Instruction::LiquidatePosition { idx: read_u16(&mut rest)? }),
                5 => Ok(Instruction::LiquidateBatch { max_count: read_u16(&mut rest)? }),
                6 => { // LiquidateSet
                    let count = read_u16(&mut rest)? as usize;
                    if count > MAX_POSITIONS {
                        return Err(ProgramError::InvalidInstructionData);
                    }
                    let mut ids = Vec::with_capacity(count);
                    for _ in 0..count {
                        ids.push(read_u16(&mut rest)?);
                    }
                    Ok(Instruction::LiquidateSet { ids })
                },
                7 => { // Redeem
                    let amount = read_u64(&mut rest)?;
                    let first_hint = read_u16(&mut rest)?;
                    let upper_hint = read_u16(&mut rest)?;
                    let lower_hint = read_u16(&mut rest)?;
                    let partial_nicr = read_u128(&mut rest)?;
                    let max_iterations = read_u32(&mut rest)?;
                    let max_fee_pct = read_u128(&mut rest)?;
                    Ok(Instruction::Redeem {
                        amount, first_hint, upper_hint, lower_hint, partial_nicr, max_iterations, max_fee_pct,
                    })
                },
                8 => Ok(Instruction::ClaimSurplus { idx: read_u16(&mut rest)? }),
                9 => Ok(Instruction::TopUpReserve { amount: read_u64(&mut rest)? }),
                10 => Ok(Instruction::KeeperCrank),
                11 => Ok(Instruction::SetRedemptionFeeFloor { floor: read_u128(&mut rest)? }),
                12 => Ok(Instruction::SetMinuteDecayFactor { factor: read_u128(&mut rest)? }),
                13 => Ok(Instruction::SetGracePeriod { secs: read_u64(&mut rest)? }),
                14 => Ok(Instruction::SetStakingRewardSplit { bps: read_u64(&mut rest)? }),
                15 => Ok(Instruction::ClaimFees { amount: read_u64(&mut rest)? }),
                16 => { // LiquidatePartial
                    let idx = read_u16(&mut rest)?;
                    let debt_amount = read_u64(&mut rest)?;
                    let lower_hint = read_u16(&mut rest)?;
                    let upper_hint = read_u16(&mut rest)?;
                    Ok(Instruction::LiquidatePartial { idx, debt_amount, lower_hint, upper_hint })
                },
                17 => Ok(Instruction::SetIndexUpdateInterval { secs: read_u64(&mut rest)? }),
                _ => Err(ProgramError::InvalidInstructionData),
            }
        }
    }

    fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], ProgramError> {
        if input.len() < n { return Err(ProgramError::InvalidInstructionData); }
        let (bytes, rest) = input.split_at(n);
        *input = rest;
        Ok(bytes)
    }

    fn read_u16(input: &mut &[u8]) -> Result<u16, ProgramError> {
        let bytes = take(input, 2)?;
        Ok(u16::from_le_bytes(*array_ref![bytes, 0, 2]))
    }

    fn read_u32(input: &mut &[u8]) -> Result<u32, ProgramError> {
        let bytes = take(input, 4)?;
        Ok(u32::from_le_bytes(*array_ref![bytes, 0, 4]))
    }

    fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        let bytes = take(input, 8)?;
        Ok(u64::from_le_bytes(*array_ref![bytes, 0, 8]))
    }

    fn read_u128(input: &mut &[u8]) -> Result<u128, ProgramError> {
        let bytes = take(input, 16)?;
        Ok(u128::from_le_bytes(*array_ref![bytes, 0, 16]))
    }

    fn read_engine_params(input: &mut &[u8]) -> Result<EngineParams, ProgramError> {
        Ok(EngineParams {
            mcr: read_u128(input)?,
            ccr: read_u128(input)?,
            min_net_debt: read_u128(input)?,
            liquidator_reward_shares: read_u128(input)?,
            redemption_fee_floor: read_u128(input)?,
            minute_decay_factor: read_u128(input)?,
            liquidation_cap_ratio: read_u128(input)?,
            recovery_grace_period_secs: read_u64(input)?,
            staking_reward_split_bps: read_u64(input)?,
            index_update_interval_secs: read_u64(input)?,
        })
    }
}

// 5. mod accounts
pub mod accounts {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};
    use crate::constants::VAULT_SEED;
    use crate::error::CdpError;

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if accounts.len() < n {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(CdpError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(CdpError::ExpectedWritable.into());
        }
        Ok(())
    }

    pub fn expect_owner(ai: &AccountInfo, owner: &Pubkey) -> Result<(), ProgramError> {
        if ai.owner != owner {
            return Err(ProgramError::IllegalOwner);
        }
        Ok(())
    }

    pub fn expect_key(ai: &AccountInfo, expected: &Pubkey) -> Result<(), ProgramError> {
        if ai.key != expected {
            return Err(ProgramError::InvalidArgument);
        }
        Ok(())
    }

    /// Vault authority PDA; owns the collateral vault and mints the debt token
    pub fn derive_vault_authority(program_id: &Pubkey, slab_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[VAULT_SEED, slab_key.as_ref()], program_id)
    }
}

// 6. mod state
pub mod state {
    use bytemuck::{Pod, Zeroable};
    use core::cell::RefMut;
    use solana_program::account_info::AccountInfo;
    use solana_program::program_error::ProgramError;
    use crate::constants::{HEADER_LEN, CONFIG_LEN};

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct SlabHeader {
        pub magic: u64,
        pub version: u32,
        pub bump: u8,
        pub _padding: [u8; 3],
        pub admin: [u8; 32],
        pub _reserved: [u8; 16],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct SystemConfig {
        pub collateral_mint: [u8; 32],
        pub vault_pubkey: [u8; 32],
        pub debt_mint: [u8; 32],
        /// Debt tokens per unit of underlying collateral
        pub price_oracle: [u8; 32],
        /// Underlying collateral per share
        pub index_oracle: [u8; 32],
        pub max_staleness_slots: u64,
        pub conf_filter_bps: u16,
        pub vault_authority_bump: u8,
        pub _padding: [u8; 5],
    }

    pub fn slab_data_mut<'a, 'b>(ai: &'b AccountInfo<'a>) -> Result<RefMut<'b, &'a mut [u8]>, ProgramError> {
        Ok(ai.try_borrow_mut_data()?)
    }

    pub fn read_header(data: &[u8]) -> SlabHeader {
        let mut h = SlabHeader::zeroed();
        let src = &data[..HEADER_LEN];
        let dst = bytemuck::bytes_of_mut(&mut h);
        dst.copy_from_slice(src);
        h
    }

    pub fn write_header(data: &mut [u8], h: &SlabHeader) {
        let src = bytemuck::bytes_of(h);
        let dst = &mut data[..HEADER_LEN];
        dst.copy_from_slice(src);
    }

    pub fn read_config(data: &[u8]) -> SystemConfig {
        let mut c = SystemConfig::zeroed();
        let src = &data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        let dst = bytemuck::bytes_of_mut(&mut c);
        dst.copy_from_slice(src);
        c
    }

    pub fn write_config(data: &mut [u8], c: &SystemConfig) {
        let src = bytemuck::bytes_of(c);
        let dst = &mut data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        dst.copy_from_slice(src);
    }
}

// 7. mod oracle
pub mod oracle {
    use arrayref::array_ref;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};
    use crate::constants::PYTH_PRICE_LEN;
    use crate::error::CdpError;

    /// Read a Pyth-layout price account as 1e18 fixed point.
    ///
    /// Used for both the collateral price and the share index feed.
    pub fn read_pyth_price_e18(price_ai: &AccountInfo, now_slot: u64, max_staleness: u64, conf_bps: u16) -> Result<u128, ProgramError> {
        let data = price_ai.try_borrow_data()?;
        if data.len() < PYTH_PRICE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }

        let expo = i32::from_le_bytes(*array_ref![data, 20, 4]);
        let price = i64::from_le_bytes(*array_ref![data, 176, 8]);
        let conf = u64::from_le_bytes(*array_ref![data, 184, 8]);
        let pub_slot = u64::from_le_bytes(*array_ref![data, 200, 8]);

        if price <= 0 {
            return Err(CdpError::OracleInvalid.into());
        }

        let age = now_slot.saturating_sub(pub_slot);
        if age > max_staleness {
            return Err(CdpError::OracleStale.into());
        }

        let price_u = price as u128;
        let lhs = (conf as u128) * 10_000;
        let rhs = price_u * (conf_bps as u128);
        if lhs > rhs {
            return Err(CdpError::OracleConfTooWide.into());
        }

        let scale = expo + 18;
        let scaled = if scale >= 0 {
            let mul = 10u128.checked_pow(scale as u32).ok_or(CdpError::EngineOverflow)?;
            price_u.checked_mul(mul).ok_or(CdpError::EngineOverflow)?
        } else {
            match 10u128.checked_pow((-scale) as u32) {
                Some(div) => price_u / div,
                None => 0,
            }
        };

        if scaled == 0 {
            return Err(CdpError::OracleInvalid.into());
        }
        Ok(scaled)
    }
}

// 8. mod collateral
pub mod collateral {
    use solana_program::{
        account_info::AccountInfo, program_error::ProgramError,
    };

    #[cfg(not(test))]
    use solana_program::program::{invoke, invoke_signed};

    #[cfg(test)]
    use solana_program::program_pack::Pack;
    #[cfg(test)]
    use spl_token::state::Account as TokenAccount;

    /// Move collateral shares from a user's account into the vault.
    pub fn deposit<'a>(
        token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        vault: &AccountInfo<'a>,
        owner: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        if amount == 0 {
            return Ok(());
        }
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::transfer(
                token_program.key, source.key, vault.key, owner.key, &[], amount,
            )?;
            invoke(&ix, &[source.clone(), vault.clone(), owner.clone(), token_program.clone()])
        }
        #[cfg(test)]
        {
            let _ = (token_program, owner);
            move_tokens(source, vault, amount)
        }
    }

    /// Pay collateral shares out of the vault, signed by the vault authority.
    pub fn withdraw<'a>(
        token_program: &AccountInfo<'a>,
        vault: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        vault_authority: &AccountInfo<'a>,
        amount: u64,
        signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        if amount == 0 {
            return Ok(());
        }
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::transfer(
                token_program.key, vault.key, dest.key, vault_authority.key, &[], amount,
            )?;
            invoke_signed(&ix, &[vault.clone(), dest.clone(), vault_authority.clone(), token_program.clone()], signer_seeds)
        }
        #[cfg(test)]
        {
            let _ = (token_program, vault_authority, signer_seeds);
            move_tokens(vault, dest, amount)
        }
    }

    #[cfg(test)]
    fn move_tokens(source: &AccountInfo, dest: &AccountInfo, amount: u64) -> Result<(), ProgramError> {
        let mut src_data = source.try_borrow_mut_data()?;
        let mut src_state = TokenAccount::unpack(&src_data)?;
        src_state.amount = src_state.amount.checked_sub(amount).ok_or(ProgramError::InsufficientFunds)?;
        TokenAccount::pack(src_state, &mut src_data)?;

        let mut dst_data = dest.try_borrow_mut_data()?;
        let mut dst_state = TokenAccount::unpack(&dst_data)?;
        dst_state.amount = dst_state.amount.checked_add(amount).ok_or(ProgramError::InvalidAccountData)?;
        TokenAccount::pack(dst_state, &mut dst_data)?;
        Ok(())
    }
}

// 9. mod debt_token
pub mod debt_token {
    use solana_program::{
        account_info::AccountInfo, program_error::ProgramError,
    };

    #[cfg(not(test))]
    use solana_program::program::{invoke, invoke_signed};

    #[cfg(test)]
    use solana_program::program_pack::Pack;
    #[cfg(test)]
    use spl_token::state::{Account as TokenAccount, Mint};

    /// Mint debt tokens to `dest`; the vault authority is the mint authority.
    pub fn mint_to<'a>(
        token_program: &AccountInfo<'a>,
        mint: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        mint_authority: &AccountInfo<'a>,
        amount: u64,
        signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        if amount == 0 {
            return Ok(());
        }
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::mint_to(
                token_program.key, mint.key, dest.key, mint_authority.key, &[], amount,
            )?;
            invoke_signed(&ix, &[mint.clone(), dest.clone(), mint_authority.clone(), token_program.clone()], signer_seeds)
        }
        #[cfg(test)]
        {
            let _ = (token_program, mint_authority, signer_seeds);
            let mut mint_data = mint.try_borrow_mut_data()?;
            let mut mint_state = Mint::unpack(&mint_data)?;
            mint_state.supply = mint_state.supply.checked_add(amount).ok_or(ProgramError::InvalidAccountData)?;
            Mint::pack(mint_state, &mut mint_data)?;

            let mut dst_data = dest.try_borrow_mut_data()?;
            let mut dst_state = TokenAccount::unpack(&dst_data)?;
            dst_state.amount = dst_state.amount.checked_add(amount).ok_or(ProgramError::InvalidAccountData)?;
            TokenAccount::pack(dst_state, &mut dst_data)?;
            Ok(())
        }
    }

    /// Burn debt tokens from `source`, authorized by its owner.
    pub fn burn<'a>(
        token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        mint: &AccountInfo<'a>,
        owner: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        if amount == 0 {
            return Ok(());
        }
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::burn(
                token_program.key, source.key, mint.key, owner.key, &[], amount,
            )?;
            invoke(&ix, &[source.clone(), mint.clone(), owner.clone(), token_program.clone()])
        }
        #[cfg(test)]
        {
            let _ = (token_program, owner);
            let mut src_data = source.try_borrow_mut_data()?;
            let mut src_state = TokenAccount::unpack(&src_data)?;
            src_state.amount = src_state.amount.checked_sub(amount).ok_or(ProgramError::InsufficientFunds)?;
            TokenAccount::pack(src_state, &mut src_data)?;

            let mut mint_data = mint.try_borrow_mut_data()?;
            let mut mint_state = Mint::unpack(&mint_data)?;
            mint_state.supply = mint_state.supply.checked_sub(amount).ok_or(ProgramError::InvalidAccountData)?;
            Mint::pack(mint_state, &mut mint_data)?;
            Ok(())
        }
    }
}

// 10. mod processor
pub mod processor {
    use alloc::format;
    use solana_program::{
        account_info::AccountInfo, entrypoint::ProgramResult, msg, pubkey::Pubkey,
        sysvar::{clock::Clock, Sysvar},
        program_error::ProgramError,
        program_option::COption,
        program_pack::Pack,
    };
    use crate::{
        ix::Instruction,
        state::{self, SlabHeader, SystemConfig},
        accounts,
        constants::{MAGIC, VERSION, SLAB_LEN, CONFIG_LEN, VAULT_SEED},
        error::{CdpError, map_engine_error},
        oracle,
        collateral,
        debt_token,
        zc,
    };
    use crate::engine::{CdpEvent, EngineError, EventSink, PositionAdjustment, RedemptionRequest};

    /// Logs every engine event to the transaction log
    struct MsgLog;

    impl EventSink for MsgLog {
        fn emit(&mut self, event: CdpEvent) {
            msg!("{:?}", event);
        }
    }

    fn slab_guard(program_id: &Pubkey, slab: &AccountInfo, data: &[u8]) -> Result<(), ProgramError> {
        accounts::expect_owner(slab, program_id)?;
        if data.len() != SLAB_LEN { return Err(CdpError::InvalidSlabLen.into()); }
        Ok(())
    }

    fn require_initialized(data: &[u8]) -> Result<(), ProgramError> {
        let h = state::read_header(data);
        if h.magic != MAGIC { return Err(CdpError::NotInitialized.into()); }
        if h.version != VERSION { return Err(CdpError::InvalidVersion.into()); }
        Ok(())
    }

    fn require_admin(data: &[u8], a_admin: &AccountInfo) -> Result<(), ProgramError> {
        accounts::expect_signer(a_admin)?;
        let h = state::read_header(data);
        if h.admin != a_admin.key.to_bytes() { return Err(CdpError::AdminOnly.into()); }
        Ok(())
    }

    fn verify_vault(a_vault: &AccountInfo, expected_owner: &Pubkey, expected_mint: &Pubkey, expected_pubkey: &Pubkey) -> Result<(), ProgramError> {
        if a_vault.key != expected_pubkey { return Err(CdpError::InvalidVaultAta.into()); }
        if a_vault.owner != &spl_token::ID { return Err(CdpError::InvalidVaultAta.into()); }
        if a_vault.data_len() != spl_token::state::Account::LEN { return Err(CdpError::InvalidVaultAta.into()); }

        let data = a_vault.try_borrow_data()?;
        let tok = spl_token::state::Account::unpack(&data)?;
        if tok.mint != *expected_mint { return Err(CdpError::InvalidMint.into()); }
        if tok.owner != *expected_owner { return Err(CdpError::InvalidVaultAta.into()); }
        Ok(())
    }

    /// The debt mint must be an SPL mint whose authority is the vault PDA.
    fn verify_debt_mint(a_mint: &AccountInfo, expected_authority: &Pubkey) -> Result<(), ProgramError> {
        if a_mint.owner != &spl_token::ID { return Err(CdpError::InvalidDebtMint.into()); }
        if a_mint.data_len() != spl_token::state::Mint::LEN { return Err(CdpError::InvalidDebtMint.into()); }

        let data = a_mint.try_borrow_data()?;
        let mint = spl_token::state::Mint::unpack(&data)?;
        if mint.mint_authority != COption::Some(*expected_authority) {
            return Err(CdpError::InvalidDebtMint.into());
        }
        Ok(())
    }

    /// A user token account for `expected_mint`, optionally owned by `expected_owner`.
    fn verify_token_account(
        ai: &AccountInfo,
        expected_mint: &Pubkey,
        expected_owner: Option<&Pubkey>,
    ) -> Result<spl_token::state::Account, ProgramError> {
        if ai.owner != &spl_token::ID { return Err(CdpError::InvalidTokenAccount.into()); }
        let data = ai.try_borrow_data()?;
        let tok = spl_token::state::Account::unpack(&data)?;
        if tok.mint != *expected_mint { return Err(CdpError::InvalidMint.into()); }
        if let Some(owner) = expected_owner {
            if tok.owner != *owner { return Err(CdpError::InvalidTokenAccount.into()); }
        }
        Ok(tok)
    }

    fn expect_debt_mint(ai: &AccountInfo, config: &SystemConfig) -> Result<(), ProgramError> {
        if ai.key.to_bytes() != config.debt_mint { return Err(CdpError::InvalidDebtMint.into()); }
        Ok(())
    }

    fn read_price(config: &SystemConfig, a_oracle: &AccountInfo, clock: &Clock) -> Result<u128, ProgramError> {
        if a_oracle.key.to_bytes() != config.price_oracle { return Err(CdpError::InvalidOracleKey.into()); }
        oracle::read_pyth_price_e18(a_oracle, clock.slot, config.max_staleness_slots, config.conf_filter_bps)
    }

    fn unix_now(clock: &Clock) -> u64 {
        clock.unix_timestamp.max(0) as u64
    }

    fn to_token_amount(v: u128) -> Result<u64, ProgramError> {
        u64::try_from(v).map_err(|_| ProgramError::from(CdpError::EngineOverflow))
    }

    pub fn process_instruction<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::InitSystem { params, max_staleness_slots, conf_filter_bps } => {
                accounts::expect_len(accounts, 8)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_coll_mint = &accounts[2];
                let a_vault = &accounts[3];
                let a_debt_mint = &accounts[4];
                let a_price_oracle = &accounts[5];
                let a_index_oracle = &accounts[6];
                let a_clock = &accounts[7];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                #[cfg(debug_assertions)]
                {
                    if core::mem::size_of::<SystemConfig>() != CONFIG_LEN {
                        return Err(ProgramError::InvalidAccountData);
                    }
                }

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;

                let _ = zc::engine_mut(&mut data)?;

                let header = state::read_header(&data);
                if header.magic == MAGIC { return Err(CdpError::AlreadyInitialized.into()); }

                params.validate().map_err(map_engine_error)?;

                let (auth, bump) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(a_vault, &auth, a_coll_mint.key, a_vault.key)?;
                verify_debt_mint(a_debt_mint, &auth)?;

                let clock = Clock::from_account_info(a_clock)?;

                for b in data.iter_mut() { *b = 0; }

                {
                    let engine = zc::engine_mut(&mut data)?;
                    engine.init_in_place(params, unix_now(&clock));
                }

                let config = SystemConfig {
                    collateral_mint: a_coll_mint.key.to_bytes(),
                    vault_pubkey: a_vault.key.to_bytes(),
                    debt_mint: a_debt_mint.key.to_bytes(),
                    price_oracle: a_price_oracle.key.to_bytes(),
                    index_oracle: a_index_oracle.key.to_bytes(),
                    max_staleness_slots,
                    conf_filter_bps,
                    vault_authority_bump: bump,
                    _padding: [0; 5],
                };
                state::write_config(&mut data, &config);

                let new_header = SlabHeader {
                    magic: MAGIC,
                    version: VERSION,
                    bump,
                    _padding: [0; 3],
                    admin: a_admin.key.to_bytes(),
                    _reserved: [0; 16],
                };
                state::write_header(&mut data, &new_header);
                msg!("InitSystem mcr={} ccr={}", params.mcr, params.ccr);
            },
            Instruction::OpenPosition { coll_amount, debt_amount, lower_hint, upper_hint } => {
                accounts::expect_len(accounts, 10)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];
                let a_owner_coll = &accounts[2];
                let a_vault = &accounts[3];
                let a_owner_debt = &accounts[4];
                let a_debt_mint = &accounts[5];
                let a_vault_pda = &accounts[6];
                let a_token = &accounts[7];
                let a_clock = &accounts[8];
                let a_oracle = &accounts[9];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &auth)?;
                let coll_mint = Pubkey::new_from_array(config.collateral_mint);
                let debt_mint = Pubkey::new_from_array(config.debt_mint);
                verify_vault(a_vault, &auth, &coll_mint, &Pubkey::new_from_array(config.vault_pubkey))?;
                expect_debt_mint(a_debt_mint, &config)?;
                verify_token_account(a_owner_coll, &coll_mint, None)?;
                verify_token_account(a_owner_debt, &debt_mint, None)?;

                let clock = Clock::from_account_info(a_clock)?;
                let price = read_price(&config, a_oracle, &clock)?;

                let engine = zc::engine_mut(&mut data)?;
                let idx = engine
                    .open_position(
                        a_owner.key.to_bytes(),
                        coll_amount as u128,
                        debt_amount as u128,
                        lower_hint,
                        upper_hint,
                        price,
                        unix_now(&clock),
                        &mut MsgLog,
                    )
                    .map_err(map_engine_error)?;
                let reward = to_token_amount(engine.params.liquidator_reward_shares)?;
                let deposit = coll_amount.checked_add(reward).ok_or(CdpError::EngineOverflow)?;

                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seeds: [&[u8]; 3] = [VAULT_SEED, a_slab.key.as_ref(), &bump_arr];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                collateral::deposit(a_token, a_owner_coll, a_vault, a_owner, deposit)?;
                debt_token::mint_to(a_token, a_debt_mint, a_owner_debt, a_vault_pda, debt_amount, &signer_seeds)?;
                msg!("OpenPosition idx={} coll={} debt={}", idx, coll_amount, debt_amount);
            },
            Instruction::AdjustPosition {
                idx, coll_added, coll_withdrawn, debt_minted, debt_repaid, lower_hint, upper_hint,
            } => {
                accounts::expect_len(accounts, 10)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];
                let a_owner_coll = &accounts[2];
                let a_vault = &accounts[3];
                let a_owner_debt = &accounts[4];
                let a_debt_mint = &accounts[5];
                let a_vault_pda = &accounts[6];
                let a_token = &accounts[7];
                let a_clock = &accounts[8];
                let a_oracle = &accounts[9];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &auth)?;
                let coll_mint = Pubkey::new_from_array(config.collateral_mint);
                let debt_mint = Pubkey::new_from_array(config.debt_mint);
                verify_vault(a_vault, &auth, &coll_mint, &Pubkey::new_from_array(config.vault_pubkey))?;
                expect_debt_mint(a_debt_mint, &config)?;
                verify_token_account(a_owner_coll, &coll_mint, None)?;
                verify_token_account(a_owner_debt, &debt_mint, None)?;

                let clock = Clock::from_account_info(a_clock)?;
                let price = read_price(&config, a_oracle, &clock)?;

                let adjustment = PositionAdjustment {
                    coll_added: coll_added as u128,
                    coll_withdrawn: coll_withdrawn as u128,
                    debt_minted: debt_minted as u128,
                    debt_repaid: debt_repaid as u128,
                };
                let engine = zc::engine_mut(&mut data)?;
                engine
                    .adjust_position(
                        idx,
                        &a_owner.key.to_bytes(),
                        adjustment,
                        lower_hint,
                        upper_hint,
                        price,
                        unix_now(&clock),
                        &mut MsgLog,
                    )
                    .map_err(map_engine_error)?;

                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seeds: [&[u8]; 3] = [VAULT_SEED, a_slab.key.as_ref(), &bump_arr];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                collateral::deposit(a_token, a_owner_coll, a_vault, a_owner, coll_added)?;
                collateral::withdraw(a_token, a_vault, a_owner_coll, a_vault_pda, coll_withdrawn, &signer_seeds)?;
                debt_token::burn(a_token, a_owner_debt, a_debt_mint, a_owner, debt_repaid)?;
                debt_token::mint_to(a_token, a_debt_mint, a_owner_debt, a_vault_pda, debt_minted, &signer_seeds)?;
                msg!("AdjustPosition idx={}", idx);
            },
            Instruction::ClosePosition { idx } => {
                accounts::expect_len(accounts, 10)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];
                let a_owner_coll = &accounts[2];
                let a_vault = &accounts[3];
                let a_owner_debt = &accounts[4];
                let a_debt_mint = &accounts[5];
                let a_vault_pda = &accounts[6];
                let a_token = &accounts[7];
                let a_clock = &accounts[8];
                let a_oracle = &accounts[9];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &auth)?;
                let coll_mint = Pubkey::new_from_array(config.collateral_mint);
                let debt_mint = Pubkey::new_from_array(config.debt_mint);
                verify_vault(a_vault, &auth, &coll_mint, &Pubkey::new_from_array(config.vault_pubkey))?;
                expect_debt_mint(a_debt_mint, &config)?;
                verify_token_account(a_owner_coll, &coll_mint, None)?;
                verify_token_account(a_owner_debt, &debt_mint, Some(a_owner.key))?;

                let clock = Clock::from_account_info(a_clock)?;
                let price = read_price(&config, a_oracle, &clock)?;

                let engine = zc::engine_mut(&mut data)?;
                let closed = engine
                    .close_position(idx, &a_owner.key.to_bytes(), price, unix_now(&clock), &mut MsgLog)
                    .map_err(map_engine_error)?;
                let repay = to_token_amount(closed.debt)?;
                let returned = to_token_amount(closed.coll_shares)?;

                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seeds: [&[u8]; 3] = [VAULT_SEED, a_slab.key.as_ref(), &bump_arr];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                debt_token::burn(a_token, a_owner_debt, a_debt_mint, a_owner, repay)?;
                collateral::withdraw(a_token, a_vault, a_owner_coll, a_vault_pda, returned, &signer_seeds)?;
                msg!("ClosePosition idx={} repaid={} returned={}", idx, repay, returned);
            },
            Instruction::LiquidatePosition { .. }
            | Instruction::LiquidateBatch { .. }
            | Instruction::LiquidateSet { .. }
            | Instruction::LiquidatePartial { .. } => {
                accounts::expect_len(accounts, 8)?;
                let a_liquidator = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_liquidator_coll = &accounts[3];
                let a_vault_pda = &accounts[4];
                let a_token = &accounts[5];
                let a_clock = &accounts[6];
                let a_oracle = &accounts[7];

                accounts::expect_signer(a_liquidator)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &auth)?;
                let coll_mint = Pubkey::new_from_array(config.collateral_mint);
                verify_vault(a_vault, &auth, &coll_mint, &Pubkey::new_from_array(config.vault_pubkey))?;
                verify_token_account(a_liquidator_coll, &coll_mint, None)?;

                let clock = Clock::from_account_info(a_clock)?;
                let price = read_price(&config, a_oracle, &clock)?;
                let now = unix_now(&clock);

                let engine = zc::engine_mut(&mut data)?;
                let totals = match instruction {
                    Instruction::LiquidatePosition { idx } => engine.liquidate_one(idx, price, now, &mut MsgLog),
                    Instruction::LiquidateBatch { max_count } => engine.liquidate_batch(max_count, price, now, &mut MsgLog),
                    Instruction::LiquidateSet { ids } => engine.liquidate_set(&ids, price, now, &mut MsgLog),
                    Instruction::LiquidatePartial { idx, debt_amount, lower_hint, upper_hint } => engine
                        .liquidate_partial(idx, debt_amount as u128, lower_hint, upper_hint, price, now, &mut MsgLog),
                    _ => return Err(ProgramError::InvalidInstructionData),
                }
                .map_err(map_engine_error)?;
                let reward = to_token_amount(totals.liquidator_reward_shares)?;

                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seeds: [&[u8]; 3] = [VAULT_SEED, a_slab.key.as_ref(), &bump_arr];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                collateral::withdraw(a_token, a_vault, a_liquidator_coll, a_vault_pda, reward, &signer_seeds)?;
                msg!("Liquidate count={} offset={} reward={}", totals.liquidated, totals.debt_offset, reward);
            },
            Instruction::Redeem {
                amount, first_hint, upper_hint, lower_hint, partial_nicr, max_iterations, max_fee_pct,
            } => {
                accounts::expect_len(accounts, 10)?;
                let a_redeemer = &accounts[0];
                let a_slab = &accounts[1];
                let a_redeemer_debt = &accounts[2];
                let a_debt_mint = &accounts[3];
                let a_vault = &accounts[4];
                let a_redeemer_coll = &accounts[5];
                let a_vault_pda = &accounts[6];
                let a_token = &accounts[7];
                let a_clock = &accounts[8];
                let a_oracle = &accounts[9];

                accounts::expect_signer(a_redeemer)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &auth)?;
                let coll_mint = Pubkey::new_from_array(config.collateral_mint);
                let debt_mint = Pubkey::new_from_array(config.debt_mint);
                verify_vault(a_vault, &auth, &coll_mint, &Pubkey::new_from_array(config.vault_pubkey))?;
                expect_debt_mint(a_debt_mint, &config)?;
                verify_token_account(a_redeemer_coll, &coll_mint, None)?;
                let debt_account = verify_token_account(a_redeemer_debt, &debt_mint, Some(a_redeemer.key))?;

                let clock = Clock::from_account_info(a_clock)?;
                let price = read_price(&config, a_oracle, &clock)?;

                let req = RedemptionRequest {
                    amount: amount as u128,
                    first_hint,
                    upper_hint,
                    lower_hint,
                    partial_nicr,
                    max_iterations,
                    max_fee_pct,
                    redeemer_balance: debt_account.amount as u128,
                };
                let engine = zc::engine_mut(&mut data)?;
                let outcome = engine
                    .redeem(&req, price, unix_now(&clock), &mut MsgLog)
                    .map_err(map_engine_error)?;
                let burned = to_token_amount(outcome.debt_redeemed)?;
                let paid = to_token_amount(outcome.coll_to_redeemer)?;

                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seeds: [&[u8]; 3] = [VAULT_SEED, a_slab.key.as_ref(), &bump_arr];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                debt_token::burn(a_token, a_redeemer_debt, a_debt_mint, a_redeemer, burned)?;
                collateral::withdraw(a_token, a_vault, a_redeemer_coll, a_vault_pda, paid, &signer_seeds)?;
                msg!("Redeem burned={} paid={} fee={}", burned, paid, outcome.fee);
            },
            Instruction::ClaimSurplus { idx } => {
                accounts::expect_len(accounts, 6)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_owner_coll = &accounts[3];
                let a_vault_pda = &accounts[4];
                let a_token = &accounts[5];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &auth)?;
                let coll_mint = Pubkey::new_from_array(config.collateral_mint);
                verify_vault(a_vault, &auth, &coll_mint, &Pubkey::new_from_array(config.vault_pubkey))?;
                verify_token_account(a_owner_coll, &coll_mint, None)?;

                let engine = zc::engine_mut(&mut data)?;
                let shares = engine
                    .claim_surplus(idx, &a_owner.key.to_bytes(), &mut MsgLog)
                    .map_err(map_engine_error)?;
                let amount = to_token_amount(shares)?;

                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seeds: [&[u8]; 3] = [VAULT_SEED, a_slab.key.as_ref(), &bump_arr];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                collateral::withdraw(a_token, a_vault, a_owner_coll, a_vault_pda, amount, &signer_seeds)?;
            },
            Instruction::TopUpReserve { amount } => {
                accounts::expect_len(accounts, 5)?;
                let a_funder = &accounts[0];
                let a_slab = &accounts[1];
                let a_funder_debt = &accounts[2];
                let a_debt_mint = &accounts[3];
                let a_token = &accounts[4];

                accounts::expect_signer(a_funder)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                expect_debt_mint(a_debt_mint, &config)?;
                verify_token_account(a_funder_debt, &Pubkey::new_from_array(config.debt_mint), None)?;

                let engine = zc::engine_mut(&mut data)?;
                engine.top_up_reserve(amount as u128, &mut MsgLog).map_err(map_engine_error)?;

                debt_token::burn(a_token, a_funder_debt, a_debt_mint, a_funder, amount)?;
            },
            Instruction::KeeperCrank => {
                accounts::expect_len(accounts, 5)?;
                let a_caller = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];
                let a_oracle = &accounts[3];
                let a_index = &accounts[4];

                accounts::expect_signer(a_caller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                if a_index.key.to_bytes() != config.index_oracle { return Err(CdpError::InvalidOracleKey.into()); }

                let clock = Clock::from_account_info(a_clock)?;
                let price = read_price(&config, a_oracle, &clock)?;
                let share_index = oracle::read_pyth_price_e18(a_index, clock.slot, config.max_staleness_slots, config.conf_filter_bps)?;

                let now = unix_now(&clock);
                let engine = zc::engine_mut(&mut data)?;
                let fee_shares = match engine.sync_share_index(share_index, now, &mut MsgLog) {
                    Ok(fee_shares) => fee_shares,
                    Err(EngineError::IndexUpdateTooFrequent) => {
                        msg!("KeeperCrank index sync skipped, next at {}",
                            engine.last_index_update.saturating_add(engine.params.index_update_interval_secs));
                        0
                    },
                    Err(e) => return Err(map_engine_error(e)),
                };
                engine.sync_grace_period(price, now, &mut MsgLog);
                msg!("KeeperCrank index={} fee_shares={}", share_index, fee_shares);
            },
            Instruction::SetRedemptionFeeFloor { floor } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;

                let engine = zc::engine_mut(&mut data)?;
                engine.set_redemption_fee_floor(floor, &mut MsgLog).map_err(map_engine_error)?;
            },
            Instruction::SetMinuteDecayFactor { factor } => {
                accounts::expect_len(accounts, 3)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;

                let clock = Clock::from_account_info(a_clock)?;
                let engine = zc::engine_mut(&mut data)?;
                engine
                    .set_minute_decay_factor(factor, unix_now(&clock), &mut MsgLog)
                    .map_err(map_engine_error)?;
            },
            Instruction::SetGracePeriod { secs } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;

                let engine = zc::engine_mut(&mut data)?;
                engine.set_grace_period(secs, &mut MsgLog).map_err(map_engine_error)?;
            },
            Instruction::SetStakingRewardSplit { bps } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;

                let engine = zc::engine_mut(&mut data)?;
                engine.set_staking_reward_split(bps, &mut MsgLog).map_err(map_engine_error)?;
            },
            Instruction::SetIndexUpdateInterval { secs } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;

                let engine = zc::engine_mut(&mut data)?;
                engine.set_index_update_interval(secs, &mut MsgLog).map_err(map_engine_error)?;
            },
            Instruction::ClaimFees { amount } => {
                accounts::expect_len(accounts, 6)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_dest = &accounts[3];
                let a_vault_pda = &accounts[4];
                let a_token = &accounts[5];
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &auth)?;
                let coll_mint = Pubkey::new_from_array(config.collateral_mint);
                verify_vault(a_vault, &auth, &coll_mint, &Pubkey::new_from_array(config.vault_pubkey))?;
                verify_token_account(a_dest, &coll_mint, None)?;

                let engine = zc::engine_mut(&mut data)?;
                engine.withdraw_fee_shares(amount as u128).map_err(map_engine_error)?;

                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seeds: [&[u8]; 3] = [VAULT_SEED, a_slab.key.as_ref(), &bump_arr];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];

                collateral::withdraw(a_token, a_vault, a_dest, a_vault_pda, amount, &signer_seeds)?;
            },
        }
        Ok(())
    }
}

// 11. mod entrypoint
#[cfg(not(feature = "no-entrypoint"))]
pub mod entrypoint {
    use alloc::format;
    use solana_program::{
        account_info::AccountInfo, decode_error::DecodeError, entrypoint, entrypoint::ProgramResult,
        msg, program_error::ProgramError, pubkey::Pubkey,
    };
    use crate::{error::CdpError, processor};

    entrypoint!(process_instruction);

    fn process_instruction<'a>(
        program_id: &Pubkey,
        accounts: &'a [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let res = processor::process_instruction(program_id, accounts, instruction_data);
        if let Err(ProgramError::Custom(code)) = res {
            if let Some(err) = CdpError::decode_custom_error_to_enum(code) {
                msg!("Error: {:?}", err);
            }
        }
        res
    }
}

// 12. mod layout
pub mod layout {
    //! Byte offsets external readers use to pick positions out of the slab
    //! without deserializing the whole engine.

    use core::mem::size_of;
    use memoffset::offset_of;
    use crate::constants::ENGINE_OFF;
    use crate::engine::{CdpEngine, Position};

    pub const POSITION_LEN: usize = size_of::<Position>();

    /// Offset of slot `idx` from the start of the slab account data
    pub fn position_offset(idx: u16) -> usize {
        ENGINE_OFF + offset_of!(CdpEngine, positions) + idx as usize * POSITION_LEN
    }

    /// Field offsets within one position record, in persisted order
    pub fn position_field_offsets() -> [(&'static str, usize); 14] {
        [
            ("debt", offset_of!(Position, debt)),
            ("coll_shares", offset_of!(Position, coll_shares)),
            ("stake", offset_of!(Position, stake)),
            ("status", offset_of!(Position, status)),
            ("debt_snapshot", offset_of!(Position, debt_snapshot)),
            ("coll_snapshot", offset_of!(Position, coll_snapshot)),
            ("fee_snapshot", offset_of!(Position, fee_snapshot)),
            ("nicr", offset_of!(Position, nicr)),
            ("liquidator_reward_shares", offset_of!(Position, liquidator_reward_shares)),
            ("surplus_shares", offset_of!(Position, surplus_shares)),
            ("position_id", offset_of!(Position, position_id)),
            ("owner", offset_of!(Position, owner)),
            ("prev", offset_of!(Position, prev)),
            ("next", offset_of!(Position, next)),
        ]
    }
}

// 13. mod risk (glue)
pub mod risk {
    pub use crate::engine::{
        CdpEngine, CdpEvent, EngineError, EngineParams, EventSink, NoOpSink, Position,
        PositionAdjustment, PositionStatus, RedemptionRequest,
    };
}

#[cfg(test)]
mod tests {
    extern crate std;
    extern crate alloc;
    use alloc::{vec, vec::Vec};
    use solana_program::{
        account_info::AccountInfo,
        pubkey::Pubkey,
        clock::Clock,
        program_option::COption,
        program_pack::Pack,
    };
    use spl_token::state::{Account as TokenAccount, AccountState, Mint};
    use crate::{
        processor::process_instruction,
        constants::{MAGIC, VERSION, SLAB_LEN},
        zc,
        error::CdpError,
        state,
    };
    use crate::engine::{EngineParams, PositionStatus, MAX_POSITIONS, NONE};

    const START_TS: i64 = 1_700_000_000;

    // --- Harness ---

    struct TestAccount {
        key: Pubkey,
        owner: Pubkey,
        lamports: u64,
        data: Vec<u8>,
        is_signer: bool,
        is_writable: bool,
    }

    impl TestAccount {
        fn new(key: Pubkey, owner: Pubkey, lamports: u64, data: Vec<u8>) -> Self {
            Self { key, owner, lamports, data, is_signer: false, is_writable: false }
        }
        fn signer(mut self) -> Self { self.is_signer = true; self }
        fn writable(mut self) -> Self { self.is_writable = true; self }

        fn to_info<'a>(&'a mut self) -> AccountInfo<'a> {
            AccountInfo::new(
                &self.key,
                self.is_signer,
                self.is_writable,
                &mut self.lamports,
                &mut self.data,
                &self.owner,
                false,
                0,
            )
        }
    }

    // --- Builders ---

    fn make_token_account(mint: Pubkey, owner: Pubkey, amount: u64) -> Vec<u8> {
        let mut data = vec![0u8; TokenAccount::LEN];
        let mut account = TokenAccount::default();
        account.mint = mint;
        account.owner = owner;
        account.amount = amount;
        account.state = AccountState::Initialized;
        TokenAccount::pack(account, &mut data).unwrap();
        data
    }

    fn make_mint(authority: Pubkey) -> Vec<u8> {
        let mut data = vec![0u8; Mint::LEN];
        let mint = Mint {
            mint_authority: COption::Some(authority),
            supply: 0,
            decimals: 9,
            is_initialized: true,
            freeze_authority: COption::None,
        };
        Mint::pack(mint, &mut data).unwrap();
        data
    }

    fn make_pyth(price: i64, expo: i32, conf: u64, pub_slot: u64) -> Vec<u8> {
        let mut data = vec![0u8; 208];
        data[20..24].copy_from_slice(&expo.to_le_bytes());
        data[176..184].copy_from_slice(&price.to_le_bytes());
        data[184..192].copy_from_slice(&conf.to_le_bytes());
        data[200..208].copy_from_slice(&pub_slot.to_le_bytes());
        data
    }

    fn make_clock(slot: u64, unix_timestamp: i64) -> Vec<u8> {
        let clock = Clock { slot, unix_timestamp, ..Clock::default() };
        bincode::serialize(&clock).unwrap()
    }

    fn token_amount(acc: &TestAccount) -> u64 {
        TokenAccount::unpack(&acc.data).unwrap().amount
    }

    struct SystemFixture {
        program_id: Pubkey,
        admin: TestAccount,
        slab: TestAccount,
        coll_mint: TestAccount,
        vault: TestAccount,
        debt_mint: TestAccount,
        vault_pda: TestAccount,
        token_prog: TestAccount,
        price: TestAccount,
        index: TestAccount,
        clock: TestAccount,
    }

    /// A user with a collateral account and a debt-token account
    struct User {
        signer: TestAccount,
        coll: TestAccount,
        debt: TestAccount,
    }

    fn setup_system() -> SystemFixture {
        let program_id = Pubkey::new_unique();
        let slab_key = Pubkey::new_unique();
        let (vault_pda, _) = Pubkey::find_program_address(&[b"vault", slab_key.as_ref()], &program_id);
        let coll_mint_key = Pubkey::new_unique();

        SystemFixture {
            program_id,
            admin: TestAccount::new(Pubkey::new_unique(), solana_program::system_program::id(), 0, vec![]).signer(),
            slab: TestAccount::new(slab_key, program_id, 0, vec![0u8; SLAB_LEN]).writable(),
            coll_mint: TestAccount::new(coll_mint_key, solana_program::system_program::id(), 0, vec![]),
            vault: TestAccount::new(Pubkey::new_unique(), spl_token::ID, 0, make_token_account(coll_mint_key, vault_pda, 0)).writable(),
            debt_mint: TestAccount::new(Pubkey::new_unique(), spl_token::ID, 0, make_mint(vault_pda)).writable(),
            vault_pda: TestAccount::new(vault_pda, solana_program::system_program::id(), 0, vec![]),
            token_prog: TestAccount::new(spl_token::ID, Pubkey::default(), 0, vec![]),
            price: TestAccount::new(Pubkey::new_unique(), Pubkey::default(), 0, make_pyth(2000, 0, 1, 100)),
            index: TestAccount::new(Pubkey::new_unique(), Pubkey::default(), 0, make_pyth(1_000_000, -6, 1, 100)),
            clock: TestAccount::new(solana_program::sysvar::clock::id(), solana_program::sysvar::id(), 0, make_clock(100, START_TS)),
        }
    }

    fn new_user(f: &SystemFixture, coll_balance: u64) -> User {
        let signer = TestAccount::new(Pubkey::new_unique(), solana_program::system_program::id(), 0, vec![]).signer();
        let coll = TestAccount::new(Pubkey::new_unique(), spl_token::ID, 0, make_token_account(f.coll_mint.key, signer.key, coll_balance)).writable();
        let debt = TestAccount::new(Pubkey::new_unique(), spl_token::ID, 0, make_token_account(f.debt_mint.key, signer.key, 0)).writable();
        User { signer, coll, debt }
    }

    fn test_params() -> EngineParams {
        EngineParams {
            min_net_debt: 1_000_000_000,
            liquidator_reward_shares: 10_000_000,
            ..EngineParams::default()
        }
    }

    // --- Encoders ---

    fn encode_u16(val: u16, buf: &mut Vec<u8>) { buf.extend_from_slice(&val.to_le_bytes()); }
    fn encode_u32(val: u32, buf: &mut Vec<u8>) { buf.extend_from_slice(&val.to_le_bytes()); }
    fn encode_u64(val: u64, buf: &mut Vec<u8>) { buf.extend_from_slice(&val.to_le_bytes()); }
    fn encode_u128(val: u128, buf: &mut Vec<u8>) { buf.extend_from_slice(&val.to_le_bytes()); }

    fn encode_init_system(params: &EngineParams) -> Vec<u8> {
        let mut data = vec![0u8];
        encode_u128(params.mcr, &mut data);
        encode_u128(params.ccr, &mut data);
        encode_u128(params.min_net_debt, &mut data);
        encode_u128(params.liquidator_reward_shares, &mut data);
        encode_u128(params.redemption_fee_floor, &mut data);
        encode_u128(params.minute_decay_factor, &mut data);
        encode_u128(params.liquidation_cap_ratio, &mut data);
        encode_u64(params.recovery_grace_period_secs, &mut data);
        encode_u64(params.staking_reward_split_bps, &mut data);
        encode_u64(params.index_update_interval_secs, &mut data);
        encode_u64(100, &mut data);
        encode_u16(500, &mut data);
        data
    }

    fn encode_open(coll: u64, debt: u64) -> Vec<u8> {
        let mut data = vec![1u8];
        encode_u64(coll, &mut data);
        encode_u64(debt, &mut data);
        encode_u16(NONE, &mut data);
        encode_u16(NONE, &mut data);
        data
    }

    fn encode_adjust(idx: u16, coll_added: u64, coll_withdrawn: u64, debt_minted: u64, debt_repaid: u64) -> Vec<u8> {
        let mut data = vec![2u8];
        encode_u16(idx, &mut data);
        encode_u64(coll_added, &mut data);
        encode_u64(coll_withdrawn, &mut data);
        encode_u64(debt_minted, &mut data);
        encode_u64(debt_repaid, &mut data);
        encode_u16(NONE, &mut data);
        encode_u16(NONE, &mut data);
        data
    }

    fn encode_close(idx: u16) -> Vec<u8> {
        let mut data = vec![3u8];
        encode_u16(idx, &mut data);
        data
    }

    fn encode_liquidate(idx: u16) -> Vec<u8> {
        let mut data = vec![4u8];
        encode_u16(idx, &mut data);
        data
    }

    fn encode_liquidate_partial(idx: u16, debt_amount: u64) -> Vec<u8> {
        let mut data = vec![16u8];
        encode_u16(idx, &mut data);
        encode_u64(debt_amount, &mut data);
        encode_u16(NONE, &mut data);
        encode_u16(NONE, &mut data);
        data
    }

    fn encode_liquidate_set(ids: &[u16]) -> Vec<u8> {
        let mut data = vec![6u8];
        encode_u16(ids.len() as u16, &mut data);
        for id in ids {
            encode_u16(*id, &mut data);
        }
        data
    }

    fn encode_redeem(amount: u64, first_hint: u16, partial_nicr: u128, max_fee_pct: u128) -> Vec<u8> {
        let mut data = vec![7u8];
        encode_u64(amount, &mut data);
        encode_u16(first_hint, &mut data);
        encode_u16(NONE, &mut data);
        encode_u16(NONE, &mut data);
        encode_u128(partial_nicr, &mut data);
        encode_u32(0, &mut data);
        encode_u128(max_fee_pct, &mut data);
        data
    }

    fn encode_top_up(amount: u64) -> Vec<u8> {
        let mut data = vec![9u8];
        encode_u64(amount, &mut data);
        data
    }

    fn encode_set_fee_floor(floor: u128) -> Vec<u8> {
        let mut data = vec![11u8];
        encode_u128(floor, &mut data);
        data
    }

    fn encode_set_grace_period(secs: u64) -> Vec<u8> {
        let mut data = vec![13u8];
        encode_u64(secs, &mut data);
        data
    }

    fn encode_set_index_update_interval(secs: u64) -> Vec<u8> {
        let mut data = vec![17u8];
        encode_u64(secs, &mut data);
        data
    }

    fn find_idx_by_owner(data: &[u8], owner: Pubkey) -> Option<u16> {
        let engine = zc::engine_ref(data).ok()?;
        for i in 0..MAX_POSITIONS {
            if engine.is_active(i as u16) && engine.positions[i].owner == owner.to_bytes() {
                return Some(i as u16);
            }
        }
        None
    }

    // --- Drivers ---

    fn init_system(f: &mut SystemFixture) {
        let data = encode_init_system(&test_params());
        let accs = vec![
            f.admin.to_info(), f.slab.to_info(), f.coll_mint.to_info(), f.vault.to_info(), f.debt_mint.to_info(),
            f.price.to_info(), f.index.to_info(), f.clock.to_info(),
        ];
        process_instruction(&f.program_id, &accs, &data).unwrap();
    }

    fn open(f: &mut SystemFixture, u: &mut User, coll: u64, debt: u64) -> u16 {
        {
            let accs = vec![
                u.signer.to_info(), f.slab.to_info(), u.coll.to_info(), f.vault.to_info(), u.debt.to_info(),
                f.debt_mint.to_info(), f.vault_pda.to_info(), f.token_prog.to_info(), f.clock.to_info(), f.price.to_info(),
            ];
            process_instruction(&f.program_id, &accs, &encode_open(coll, debt)).unwrap();
        }
        find_idx_by_owner(&f.slab.data, u.signer.key).unwrap()
    }

    fn set_price(f: &mut SystemFixture, price: i64) {
        f.price.data = make_pyth(price, 0, 1, 100);
    }

    // --- Tests ---

    #[test]
    fn test_init_system() {
        let mut f = setup_system();
        init_system(&mut f);

        let header = state::read_header(&f.slab.data);
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.version, VERSION);
        assert_eq!(header.admin, f.admin.key.to_bytes());

        let config = state::read_config(&f.slab.data);
        assert_eq!(config.debt_mint, f.debt_mint.key.to_bytes());

        let engine = zc::engine_ref(&f.slab.data).unwrap();
        assert_eq!(engine.params, test_params());
        assert_eq!(engine.head, NONE);
        assert_eq!(engine.last_fee_op_time, START_TS as u64);
    }

    #[test]
    fn test_init_twice_fails() {
        let mut f = setup_system();
        init_system(&mut f);
        let data = encode_init_system(&test_params());
        let accs = vec![
            f.admin.to_info(), f.slab.to_info(), f.coll_mint.to_info(), f.vault.to_info(), f.debt_mint.to_info(),
            f.price.to_info(), f.index.to_info(), f.clock.to_info(),
        ];
        let res = process_instruction(&f.program_id, &accs, &data);
        assert_eq!(res, Err(CdpError::AlreadyInitialized.into()));
    }

    #[test]
    fn test_debt_mint_authority_must_be_vault_pda() {
        let mut f = setup_system();
        f.debt_mint.data = make_mint(Pubkey::new_unique());
        let data = encode_init_system(&test_params());
        let accs = vec![
            f.admin.to_info(), f.slab.to_info(), f.coll_mint.to_info(), f.vault.to_info(), f.debt_mint.to_info(),
            f.price.to_info(), f.index.to_info(), f.clock.to_info(),
        ];
        let res = process_instruction(&f.program_id, &accs, &data);
        assert_eq!(res, Err(CdpError::InvalidDebtMint.into()));
    }

    #[test]
    fn test_vault_validation() {
        let mut f = setup_system();
        f.vault.owner = solana_program::system_program::id();
        let data = encode_init_system(&test_params());
        let accs = vec![
            f.admin.to_info(), f.slab.to_info(), f.coll_mint.to_info(), f.vault.to_info(), f.debt_mint.to_info(),
            f.price.to_info(), f.index.to_info(), f.clock.to_info(),
        ];
        let res = process_instruction(&f.program_id, &accs, &data);
        assert_eq!(res, Err(CdpError::InvalidVaultAta.into()));
    }

    #[test]
    fn test_open_and_close_position() {
        let mut f = setup_system();
        init_system(&mut f);

        let mut u = new_user(&f, 2_000_000_000);
        let idx = open(&mut f, &mut u, 1_000_000_000, 1_000_000_000_000);

        assert_eq!(token_amount(&f.vault), 1_010_000_000);
        assert_eq!(token_amount(&u.debt), 1_000_000_000_000);
        {
            let engine = zc::engine_ref(&f.slab.data).unwrap();
            assert_eq!(engine.status(idx), PositionStatus::Active);
            assert_eq!(engine.list_head(), idx);
        }

        {
            let accs = vec![
                u.signer.to_info(), f.slab.to_info(), u.coll.to_info(), f.vault.to_info(), u.debt.to_info(),
                f.debt_mint.to_info(), f.vault_pda.to_info(), f.token_prog.to_info(), f.clock.to_info(), f.price.to_info(),
            ];
            process_instruction(&f.program_id, &accs, &encode_close(idx)).unwrap();
        }

        assert_eq!(token_amount(&f.vault), 0);
        assert_eq!(token_amount(&u.coll), 2_000_000_000);
        assert_eq!(token_amount(&u.debt), 0);
        assert_eq!(Mint::unpack(&f.debt_mint.data).unwrap().supply, 0);
        let engine = zc::engine_ref(&f.slab.data).unwrap();
        assert_eq!(engine.status(idx), PositionStatus::ClosedByOwner);
        assert_eq!(engine.list_head(), NONE);
    }

    #[test]
    fn test_adjust_position_moves_tokens() {
        let mut f = setup_system();
        init_system(&mut f);

        let mut u = new_user(&f, 2_000_000_000);
        let idx = open(&mut f, &mut u, 1_000_000_000, 500_000_000_000);
        {
            let accs = vec![
                u.signer.to_info(), f.slab.to_info(), u.coll.to_info(), f.vault.to_info(), u.debt.to_info(),
                f.debt_mint.to_info(), f.vault_pda.to_info(), f.token_prog.to_info(), f.clock.to_info(), f.price.to_info(),
            ];
            process_instruction(&f.program_id, &accs, &encode_adjust(idx, 0, 100_000_000, 200_000_000_000, 0)).unwrap();
        }

        assert_eq!(token_amount(&f.vault), 910_000_000);
        assert_eq!(token_amount(&u.debt), 700_000_000_000);
        let engine = zc::engine_ref(&f.slab.data).unwrap();
        assert_eq!(engine.synced_position(idx), (700_000_000_000, 900_000_000));
    }

    #[test]
    fn test_close_wrong_signer() {
        let mut f = setup_system();
        init_system(&mut f);

        let mut u = new_user(&f, 2_000_000_000);
        let idx = open(&mut f, &mut u, 1_000_000_000, 1_000_000_000_000);

        let mut attacker = new_user(&f, 0);
        let accs = vec![
            attacker.signer.to_info(), f.slab.to_info(), attacker.coll.to_info(), f.vault.to_info(), attacker.debt.to_info(),
            f.debt_mint.to_info(), f.vault_pda.to_info(), f.token_prog.to_info(), f.clock.to_info(), f.price.to_info(),
        ];
        let res = process_instruction(&f.program_id, &accs, &encode_close(idx));
        assert_eq!(res, Err(CdpError::EngineUnauthorized.into()));
    }

    #[test]
    fn test_liquidate_after_price_drop() {
        let mut f = setup_system();
        init_system(&mut f);

        let mut a = new_user(&f, 2_000_000_000);
        let mut b = new_user(&f, 2_000_000_000);
        let idx_a = open(&mut f, &mut a, 1_000_000_000, 500_000_000_000);
        let idx_b = open(&mut f, &mut b, 1_000_000_000, 1_800_000_000_000);

        let mut keeper = new_user(&f, 0);

        // Still healthy at 2000
        {
            let accs = vec![
                keeper.signer.to_info(), f.slab.to_info(), f.vault.to_info(), keeper.coll.to_info(),
                f.vault_pda.to_info(), f.token_prog.to_info(), f.clock.to_info(), f.price.to_info(),
            ];
            let res = process_instruction(&f.program_id, &accs, &encode_liquidate(idx_b));
            assert_eq!(res, Err(CdpError::EngineAboveThreshold.into()));
        }

        set_price(&mut f, 1900);
        {
            let accs = vec![
                keeper.signer.to_info(), f.slab.to_info(), f.vault.to_info(), keeper.coll.to_info(),
                f.vault_pda.to_info(), f.token_prog.to_info(), f.clock.to_info(), f.price.to_info(),
            ];
            process_instruction(&f.program_id, &accs, &encode_liquidate(idx_b)).unwrap();
        }

        assert_eq!(token_amount(&keeper.coll), 10_000_000);
        let engine = zc::engine_ref(&f.slab.data).unwrap();
        assert_eq!(engine.status(idx_b), PositionStatus::ClosedByLiquidation);
        assert!(!engine.list_contains(idx_b));
        assert_eq!(engine.synced_position(idx_a), (2_300_000_000_000, 2_000_000_000));
        assert!(engine.check_conservation());
    }

    #[test]
    fn test_partial_liquidation_keeps_position_open() {
        let mut f = setup_system();
        init_system(&mut f);

        let mut a = new_user(&f, 2_000_000_000);
        let mut b = new_user(&f, 2_000_000_000);
        let idx_a = open(&mut f, &mut a, 1_000_000_000, 500_000_000_000);
        let idx_b = open(&mut f, &mut b, 1_000_000_000, 1_800_000_000_000);
        {
            let accs = vec![
                b.signer.to_info(), f.slab.to_info(), b.debt.to_info(), f.debt_mint.to_info(), f.token_prog.to_info(),
            ];
            process_instruction(&f.program_id, &accs, &encode_top_up(1_000_000_000_000)).unwrap();
        }

        set_price(&mut f, 1900);
        let mut keeper = new_user(&f, 0);
        let accs = vec![
            keeper.signer.to_info(), f.slab.to_info(), f.vault.to_info(), keeper.coll.to_info(),
            f.vault_pda.to_info(), f.token_prog.to_info(), f.clock.to_info(), f.price.to_info(),
        ];
        // Remainder under the minimum net debt
        let res = process_instruction(&f.program_id, &accs, &encode_liquidate_partial(idx_b, 1_799_500_000_000));
        assert_eq!(res, Err(CdpError::EngineBelowMinNetDebt.into()));
        process_instruction(&f.program_id, &accs, &encode_liquidate_partial(idx_b, 900_000_000_000)).unwrap();
        drop(accs);

        // The reward stays with the open position
        assert_eq!(token_amount(&keeper.coll), 0);
        let engine = zc::engine_ref(&f.slab.data).unwrap();
        assert_eq!(engine.status(idx_b), PositionStatus::Active);
        assert_eq!(engine.synced_position(idx_b), (900_000_000_000, 500_000_000));
        assert_eq!(engine.synced_position(idx_a), (500_000_000_000, 1_000_000_000));
        assert_eq!(engine.reserve.debt, 100_000_000_000);
        assert_eq!(engine.reserve.coll_gain_shares, 500_000_000);
        assert!(engine.check_ordering());
        assert!(engine.check_conservation());
    }

    #[test]
    fn test_liquidate_set_skips_ineligible() {
        let mut f = setup_system();
        init_system(&mut f);

        let mut a = new_user(&f, 2_000_000_000);
        let idx_a = open(&mut f, &mut a, 1_000_000_000, 500_000_000_000);

        let mut keeper = new_user(&f, 0);
        let accs = vec![
            keeper.signer.to_info(), f.slab.to_info(), f.vault.to_info(), keeper.coll.to_info(),
            f.vault_pda.to_info(), f.token_prog.to_info(), f.clock.to_info(), f.price.to_info(),
        ];
        process_instruction(&f.program_id, &accs, &encode_liquidate_set(&[idx_a, 7, idx_a])).unwrap();
        let res = process_instruction(&f.program_id, &accs, &encode_liquidate_set(&[]));
        assert_eq!(res, Err(CdpError::EngineEmptyInput.into()));
    }

    #[test]
    fn test_redeem_burns_only_redeemed_debt() {
        let mut f = setup_system();
        init_system(&mut f);

        let mut a = new_user(&f, 2_000_000_000);
        let mut b = new_user(&f, 2_000_000_000);
        open(&mut f, &mut a, 1_000_000_000, 500_000_000_000);
        let idx_b = open(&mut f, &mut b, 1_000_000_000, 1_000_000_000_000);

        let amount = 500_000_000_000u64;
        let hints = {
            let engine = zc::engine_ref(&f.slab.data).unwrap();
            engine.get_redemption_hints(amount as u128, 2000 * 1_000_000_000_000_000_000, 0)
        };
        assert_eq!(hints.first, idx_b);
        assert_eq!(hints.truncated_amount, amount as u128);

        let vault_before = token_amount(&f.vault);
        {
            let accs = vec![
                b.signer.to_info(), f.slab.to_info(), b.debt.to_info(), f.debt_mint.to_info(), f.vault.to_info(),
                b.coll.to_info(), f.vault_pda.to_info(), f.token_prog.to_info(), f.clock.to_info(), f.price.to_info(),
            ];
            process_instruction(&f.program_id, &accs, &encode_redeem(amount, hints.first, hints.partial_nicr, 1_000_000_000_000_000_000)).unwrap();
        }

        assert_eq!(token_amount(&b.debt), 500_000_000_000);
        let engine = zc::engine_ref(&f.slab.data).unwrap();
        let fee = engine.fee_recipient_shares as u64;
        assert!(fee > 0);
        // 2.5e8 shares drawn at 2000 per share
        assert_eq!(token_amount(&b.coll), 1_000_000_000 - 10_000_000 + 250_000_000 - fee);
        assert_eq!(token_amount(&f.vault), vault_before - 250_000_000 + fee);
        assert_eq!(engine.synced_debt(idx_b), 500_000_000_000);
        assert_eq!(engine.status(idx_b), PositionStatus::Active);
    }

    #[test]
    fn test_redeem_rejects_low_fee_cap() {
        let mut f = setup_system();
        init_system(&mut f);

        let mut a = new_user(&f, 2_000_000_000);
        let mut b = new_user(&f, 2_000_000_000);
        open(&mut f, &mut a, 1_000_000_000, 500_000_000_000);
        open(&mut f, &mut b, 1_000_000_000, 1_000_000_000_000);

        let hints = {
            let engine = zc::engine_ref(&f.slab.data).unwrap();
            engine.get_redemption_hints(500_000_000_000, 2000 * 1_000_000_000_000_000_000, 0)
        };
        let before = f.slab.data.clone();
        let accs = vec![
            b.signer.to_info(), f.slab.to_info(), b.debt.to_info(), f.debt_mint.to_info(), f.vault.to_info(),
            b.coll.to_info(), f.vault_pda.to_info(), f.token_prog.to_info(), f.clock.to_info(), f.price.to_info(),
        ];
        let res = process_instruction(&f.program_id, &accs, &encode_redeem(500_000_000_000, NONE, hints.partial_nicr, 5_000_000_000_000_000));
        assert_eq!(res, Err(CdpError::EngineFeeExceedsMaxFee.into()));
        drop(accs);
        assert!(f.slab.data == before);
    }

    #[test]
    fn test_top_up_reserve_burns() {
        let mut f = setup_system();
        init_system(&mut f);

        let mut a = new_user(&f, 2_000_000_000);
        open(&mut f, &mut a, 1_000_000_000, 500_000_000_000);
        {
            let accs = vec![
                a.signer.to_info(), f.slab.to_info(), a.debt.to_info(), f.debt_mint.to_info(), f.token_prog.to_info(),
            ];
            process_instruction(&f.program_id, &accs, &encode_top_up(100_000_000_000)).unwrap();
        }
        assert_eq!(token_amount(&a.debt), 400_000_000_000);
        assert_eq!(Mint::unpack(&f.debt_mint.data).unwrap().supply, 400_000_000_000);
        let engine = zc::engine_ref(&f.slab.data).unwrap();
        assert_eq!(engine.reserve.debt, 100_000_000_000);
    }

    #[test]
    fn test_admin_setters() {
        let mut f = setup_system();
        init_system(&mut f);

        let mut stranger = TestAccount::new(Pubkey::new_unique(), solana_program::system_program::id(), 0, vec![]).signer();
        {
            let accs = vec![stranger.to_info(), f.slab.to_info()];
            let res = process_instruction(&f.program_id, &accs, &encode_set_fee_floor(10_000_000_000_000_000));
            assert_eq!(res, Err(CdpError::AdminOnly.into()));
        }
        {
            let accs = vec![f.admin.to_info(), f.slab.to_info()];
            process_instruction(&f.program_id, &accs, &encode_set_fee_floor(10_000_000_000_000_000)).unwrap();
            let res = process_instruction(&f.program_id, &accs, &encode_set_grace_period(60));
            assert_eq!(res, Err(CdpError::EngineInvalidParam.into()));
            process_instruction(&f.program_id, &accs, &encode_set_grace_period(3600)).unwrap();
        }
        let engine = zc::engine_ref(&f.slab.data).unwrap();
        assert_eq!(engine.params.redemption_fee_floor, 10_000_000_000_000_000);
        assert_eq!(engine.params.recovery_grace_period_secs, 3600);
    }

    #[test]
    fn test_set_index_update_interval() {
        let mut f = setup_system();
        init_system(&mut f);

        let accs = vec![f.admin.to_info(), f.slab.to_info()];
        let res = process_instruction(&f.program_id, &accs, &encode_set_index_update_interval(604_801));
        assert_eq!(res, Err(CdpError::EngineInvalidParam.into()));
        process_instruction(&f.program_id, &accs, &encode_set_index_update_interval(3_600)).unwrap();
        drop(accs);

        let engine = zc::engine_ref(&f.slab.data).unwrap();
        assert_eq!(engine.params.index_update_interval_secs, 3_600);
    }

    #[test]
    fn test_keeper_crank_takes_staking_fee() {
        let mut f = setup_system();
        init_system(&mut f);

        let mut a = new_user(&f, 2_000_000_000);
        open(&mut f, &mut a, 1_000_000_000, 500_000_000_000);

        // Index 1.0 -> 1.1
        f.index.data = make_pyth(1_100_000, -6, 1, 100);
        let mut keeper = TestAccount::new(Pubkey::new_unique(), solana_program::system_program::id(), 0, vec![]).signer();

        // Too soon after init: the crank succeeds but leaves the index alone
        {
            let accs = vec![keeper.to_info(), f.slab.to_info(), f.clock.to_info(), f.price.to_info(), f.index.to_info()];
            process_instruction(&f.program_id, &accs, &vec![10u8]).unwrap();
        }
        {
            let engine = zc::engine_ref(&f.slab.data).unwrap();
            assert_eq!(engine.share_index, 1_000_000_000_000_000_000);
            assert_eq!(engine.fee_recipient_shares, 0);
        }

        f.clock.data = make_clock(100, START_TS + 43_200);
        {
            let accs = vec![keeper.to_info(), f.slab.to_info(), f.clock.to_info(), f.price.to_info(), f.index.to_info()];
            process_instruction(&f.program_id, &accs, &vec![10u8]).unwrap();
        }
        let engine = zc::engine_ref(&f.slab.data).unwrap();
        assert_eq!(engine.last_index_update, (START_TS + 43_200) as u64);
        assert_eq!(engine.share_index, 1_100_000_000_000_000_000);
        assert!(engine.fee_recipient_shares > 0);
        assert!(engine.check_conservation());
    }

    #[test]
    fn test_stale_oracle_rejected() {
        let mut f = setup_system();
        init_system(&mut f);
        f.clock.data = make_clock(1_000, START_TS);

        let mut u = new_user(&f, 2_000_000_000);
        let accs = vec![
            u.signer.to_info(), f.slab.to_info(), u.coll.to_info(), f.vault.to_info(), u.debt.to_info(),
            f.debt_mint.to_info(), f.vault_pda.to_info(), f.token_prog.to_info(), f.clock.to_info(), f.price.to_info(),
        ];
        let res = process_instruction(&f.program_id, &accs, &encode_open(1_000_000_000, 1_000_000_000_000));
        assert_eq!(res, Err(CdpError::OracleStale.into()));
    }
}
