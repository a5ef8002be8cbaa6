//! Fixed-point helpers for converting between decimal values and integer
//! token amounts.
//!
//! Every conversion is checked: an amount that does not fit returns `None`
//! instead of wrapping or saturating.

use alloy::primitives::U256;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Largest exponent representable as a `Decimal` power of ten.
pub const MAX_DECIMALS: u8 = 28;

/// Pre-computed powers of 10 for token decimal scaling
const POW10: [u128; 29] = [
    1,
    10,
    100,
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
    1_000_000_000,
    10_000_000_000,
    100_000_000_000,
    1_000_000_000_000,
    10_000_000_000_000,
    100_000_000_000_000,
    1_000_000_000_000_000,
    10_000_000_000_000_000,
    100_000_000_000_000_000,
    1_000_000_000_000_000_000,
    10_000_000_000_000_000_000,
    100_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000,
];

/// 10^exp as a Decimal, for exp up to 28.
#[inline(always)]
pub fn pow10(exp: u8) -> Option<Decimal> {
    POW10
        .get(exp as usize)
        .map(|p| Decimal::from_i128_with_scale(*p as i128, 0))
}

/// Convert base units to whole tokens.
///
/// Example: 1_500_000 base units of a 6-decimal token = 1.5 tokens
#[inline(always)]
pub fn to_whole_tokens(base_units: Decimal, decimals: u8) -> Option<Decimal> {
    base_units.checked_div(pow10(decimals)?)
}

/// Floor a non-negative decimal to an integer amount.
pub fn floor_to_u256(value: Decimal) -> Option<U256> {
    if value.is_sign_negative() {
        return None;
    }
    value.floor().to_u128().map(U256::from)
}

/// Convert an integer amount to a decimal, if it fits.
pub fn u256_to_decimal(value: U256) -> Option<Decimal> {
    let value: u128 = value.try_into().ok()?;
    let value: i128 = value.try_into().ok()?;
    Decimal::try_from_i128_with_scale(value, 0).ok()
}

/// `floor(total * numerator / denominator)`, multiplying before dividing.
///
/// Returns `None` for a zero denominator or on overflow.
pub fn proportional_floor(total: Decimal, numerator: Decimal, denominator: Decimal) -> Option<U256> {
    if denominator.is_zero() {
        return None;
    }
    let scaled = total.checked_mul(numerator)?.checked_div(denominator)?;
    floor_to_u256(scaled)
}

/// `value * (1 + margin)`
#[inline(always)]
pub fn apply_margin_up(value: Decimal, margin: Decimal) -> Option<Decimal> {
    value.checked_mul(Decimal::ONE.checked_add(margin)?)
}

/// `value * (1 - margin)`
#[inline(always)]
pub fn apply_margin_down(value: Decimal, margin: Decimal) -> Option<Decimal> {
    value.checked_mul(Decimal::ONE.checked_sub(margin)?)
}
