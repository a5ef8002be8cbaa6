//! Position valuation with confidence-adjusted prices.
//!
//! Debt is priced at `price × (1 + margin)` and collateral at
//! `price × (1 − margin)`, so a plan sized from these values over-covers
//! rather than under-covers once settlement prices move.

use std::collections::{BTreeMap, HashMap};

use alloy::primitives::Address;
use deleverage_chain::{Balance, Pool, Position};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::decimal_math;
use crate::error::{DeleverageError, Result};

/// Valued collateral in one pool.
#[derive(Debug, Clone, PartialEq)]
pub struct CollateralValuation {
    pub pool: Address,
    /// Underlying amount held, in base units
    pub token_units: Decimal,
    /// Confidence-discounted value available to cover debt
    pub seizable_value: Decimal,
    pub has_external_rewards: bool,
}

/// Valued debt in one pool.
#[derive(Debug, Clone, PartialEq)]
pub struct DebtValuation {
    pub pool: Address,
    /// Underlying amount owed, in base units
    pub token_units: Decimal,
    /// Confidence-inflated value
    pub value: Decimal,
}

/// Result of valuing a position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValuationResult {
    pub debt_value: Decimal,
    pub seizable_value: BTreeMap<Address, Decimal>,
    /// Collateral pools in discovery order
    pub collateral: Vec<CollateralValuation>,
    /// Debt pools in discovery order
    pub debts: Vec<DebtValuation>,
}

impl ValuationResult {
    /// Total seizable value across all collateral pools, `None` on overflow.
    pub fn total_seizable(&self) -> Option<Decimal> {
        self.collateral
            .iter()
            .try_fold(Decimal::ZERO, |total, c| total.checked_add(c.seizable_value))
    }
}

/// `total += value`, failing with an overflow labelled `what`.
pub(crate) fn accumulate(total: &mut Decimal, value: Decimal, what: &'static str) -> Result<()> {
    *total = total
        .checked_add(value)
        .ok_or(DeleverageError::ArithmeticOverflow(what))?;
    Ok(())
}

/// Value a position's balances against the supplied pools.
///
/// Balances with a missing, non-positive or unreadable share amount contribute
/// nothing. Every other balance must reference a pool in `pools`.
pub fn value(
    position: &Position,
    pools: &HashMap<Address, Pool>,
    confidence_margin: Decimal,
) -> Result<ValuationResult> {
    let mut result = ValuationResult::default();

    for balance in &position.balances {
        let Some(shares) = balance.positive_shares() else {
            warn!(
                position = %position.address,
                pool = %balance.pool,
                shares = ?balance.shares,
                "Skipping balance without a positive share amount"
            );
            continue;
        };
        let pool = pools
            .get(&balance.pool)
            .ok_or(DeleverageError::MissingPoolData { pool: balance.pool })?;

        if balance.is_collateral {
            let (token_units, seizable) = value_collateral(balance, shares, pool, confidence_margin)?;
            accumulate(result.seizable_value.entry(pool.address).or_default(), seizable, "seizable value")?;

            match result.collateral.iter_mut().find(|c| c.pool == pool.address) {
                Some(existing) => {
                    accumulate(&mut existing.token_units, token_units, "collateral units")?;
                    accumulate(&mut existing.seizable_value, seizable, "seizable value")?;
                    existing.has_external_rewards |= balance.has_external_rewards;
                }
                None => result.collateral.push(CollateralValuation {
                    pool: pool.address,
                    token_units,
                    seizable_value: seizable,
                    has_external_rewards: balance.has_external_rewards,
                }),
            }
        } else {
            let (token_units, debt) = value_debt(shares, pool, confidence_margin)?;
            accumulate(&mut result.debt_value, debt, "debt value")?;

            match result.debts.iter_mut().find(|d| d.pool == pool.address) {
                Some(existing) => {
                    accumulate(&mut existing.token_units, token_units, "debt units")?;
                    accumulate(&mut existing.value, debt, "debt value")?;
                }
                None => result.debts.push(DebtValuation {
                    pool: pool.address,
                    token_units,
                    value: debt,
                }),
            }
        }
    }

    debug!(
        position = %position.address,
        debt_value = %result.debt_value,
        collateral_pools = result.collateral.len(),
        total_seizable = ?result.total_seizable(),
        "Valued position"
    );

    Ok(result)
}

fn value_collateral(
    balance: &Balance,
    shares: Decimal,
    pool: &Pool,
    margin: Decimal,
) -> Result<(Decimal, Decimal)> {
    let token_units = shares
        .checked_mul(pool.deposit_note_rate)
        .ok_or(DeleverageError::ArithmeticOverflow("collateral units"))?;

    if pool.init_weight.is_zero() || !pool.price.is_sign_positive() || pool.price.is_zero() {
        debug!(pool = %balance.pool, "Collateral pool has zero weight or price");
        return Ok((token_units, Decimal::ZERO));
    }

    let seizable = decimal_math::to_whole_tokens(token_units, pool.decimals)
        .and_then(|tokens| tokens.checked_mul(pool.price))
        .and_then(|value| decimal_math::apply_margin_down(value, margin))
        .ok_or(DeleverageError::ArithmeticOverflow("seizable value"))?;

    Ok((token_units, seizable.max(Decimal::ZERO)))
}

fn value_debt(shares: Decimal, pool: &Pool, margin: Decimal) -> Result<(Decimal, Decimal)> {
    let token_units = shares
        .checked_mul(pool.loan_note_rate)
        .ok_or(DeleverageError::ArithmeticOverflow("debt units"))?;

    let value = decimal_math::to_whole_tokens(token_units, pool.decimals)
        .and_then(|tokens| tokens.checked_mul(pool.price.max(Decimal::ZERO)))
        .and_then(|value| decimal_math::apply_margin_up(value, margin))
        .ok_or(DeleverageError::ArithmeticOverflow("debt value"))?;

    Ok((token_units, value))
}
