//! Fixed-point helpers. Prices, ratios and indices are 1e18 scaled; products
//! that can leave 128 bits go through a 256-bit intermediate.

use primitive_types::U256;

use super::{EngineError, Result, DECIMAL_PRECISION, NICR_PRECISION};

/// 1000 years of minutes; caps the decay exponent
pub const MAX_DECAY_MINUTES: u64 = 525_600_000;

#[inline]
fn narrow(v: U256) -> Result<u128> {
    if v > U256::from(u128::MAX) {
        return Err(EngineError::Overflow);
    }
    Ok(v.low_u128())
}

/// floor(a * b / c)
#[inline]
pub fn mul_div(a: u128, b: u128, c: u128) -> Result<u128> {
    if c == 0 {
        return Err(EngineError::Overflow); // Division by zero
    }
    narrow(U256::from(a) * U256::from(b) / U256::from(c))
}

/// floor(a * b / c), clamped to u128::MAX. `c` must be non-zero.
#[inline]
pub fn mul_div_saturating(a: u128, b: u128, c: u128) -> u128 {
    mul_div(a, b, c).unwrap_or(u128::MAX)
}

/// Collateral ratio of `coll` (underlying units) against `debt` at `price`.
///
/// `u128::MAX` when there is no debt, `0` when the price is zero.
pub fn compute_ratio(coll: u128, debt: u128, price: u128) -> u128 {
    if debt == 0 {
        return u128::MAX;
    }
    if price == 0 {
        return 0;
    }
    mul_div_saturating(coll, price, debt)
}

/// Price-free ordering key: coll * 1e20 / debt.
pub fn compute_nominal_ratio(coll_shares: u128, debt: u128) -> u128 {
    if debt == 0 {
        return u128::MAX;
    }
    mul_div_saturating(coll_shares, NICR_PRECISION, debt)
}

/// 1e18 fixed-point multiply, rounding half up.
#[inline]
pub fn dec_mul(x: u128, y: u128) -> u128 {
    let prod = U256::from(x) * U256::from(y) + U256::from(DECIMAL_PRECISION / 2);
    narrow(prod / U256::from(DECIMAL_PRECISION)).unwrap_or(u128::MAX)
}

/// base^minutes in 1e18 fixed point, by repeated squaring.
///
/// `base` is at most 1e18, so every intermediate stays below 1e36.
pub fn dec_pow(base: u128, minutes: u64) -> u128 {
    let mut n = minutes.min(MAX_DECAY_MINUTES);
    if n == 0 {
        return DECIMAL_PRECISION;
    }

    let mut y = DECIMAL_PRECISION;
    let mut x = base;
    while n > 1 {
        if n % 2 == 0 {
            x = dec_mul(x, x);
            n /= 2;
        } else {
            y = dec_mul(x, y);
            x = dec_mul(x, x);
            n = (n - 1) / 2;
        }
    }
    dec_mul(x, y)
}

/// Spread `amount` over `total` units of stake with error feedback.
///
/// Returns (per-unit increment scaled by 1e18, remainder to carry). The
/// carried remainder is already scaled and is fed back in next time.
pub fn per_unit_with_error(amount: u128, carried: u128, total: u128) -> Result<(u128, u128)> {
    if total == 0 {
        return Err(EngineError::CannotRedistribute);
    }
    let numerator = U256::from(amount) * U256::from(DECIMAL_PRECISION) + U256::from(carried);
    let total = U256::from(total);
    let per_unit = numerator / total;
    let remainder = numerator - per_unit * total;
    Ok((narrow(per_unit)?, narrow(remainder)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_edges() {
        assert_eq!(compute_ratio(100, 0, 1), u128::MAX);
        assert_eq!(compute_ratio(100, 10, 0), 0);
        assert_eq!(compute_ratio(150, 100, DECIMAL_PRECISION), 1_500_000_000_000_000_000);
    }

    #[test]
    fn mul_div_survives_wide_products() {
        let big = u128::MAX / 2;
        assert_eq!(mul_div(big, 4, 4).unwrap(), big);
        assert_eq!(mul_div(1, 1, 0), Err(EngineError::Overflow));
        assert_eq!(mul_div(u128::MAX, 2, 1), Err(EngineError::Overflow));
    }

    #[test]
    fn dec_pow_half_life() {
        // 720 minutes at the default factor halves the rate
        let half = dec_pow(super::super::DEFAULT_MINUTE_DECAY_FACTOR, 720);
        let diff = half.abs_diff(DECIMAL_PRECISION / 2);
        assert!(diff < 1_000_000_000, "decay after 12h was {}", half);
        assert_eq!(dec_pow(123, 0), DECIMAL_PRECISION);
        assert_eq!(dec_pow(DECIMAL_PRECISION, 10_000), DECIMAL_PRECISION);
    }

    #[test]
    fn per_unit_carries_remainder() {
        let (per_unit, err) = per_unit_with_error(10, 0, 3).unwrap();
        assert_eq!(per_unit, 10 * DECIMAL_PRECISION / 3);
        assert_eq!(err, 10 * DECIMAL_PRECISION - per_unit * 3);
        let (next, _) = per_unit_with_error(10, err, 3).unwrap();
        assert!(next >= per_unit);
        assert_eq!(per_unit_with_error(1, 0, 0), Err(EngineError::CannotRedistribute));
    }
}
