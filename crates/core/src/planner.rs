//! Allocation planning: which collateral to withdraw, and which debt to repay.
//!
//! Collateral is consumed greedily in a fixed order. Every pool that cannot
//! cover the remaining debt on its own is withdrawn in full; the first pool that
//! can is withdrawn proportionally and ends the plan. The debt those
//! withdrawals cover is then spread over the debt balances in discovery order.

use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::decimal_math;
use crate::error::{DeleverageError, Result};
use crate::valuation::{accumulate, CollateralValuation, DebtValuation};

/// Whether a step reduces collateral or debt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Repay,
    Withdraw,
}

/// One planned withdrawal or repayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationStep {
    pub kind: StepKind,
    pub pool: Address,
    /// Base units to move; `None` for the whole balance
    pub amount: Option<U256>,
    pub withdraw_all: bool,
}

impl AllocationStep {
    fn all(kind: StepKind, pool: Address) -> Self {
        Self { kind, pool, amount: None, withdraw_all: true }
    }

    fn partial(kind: StepKind, pool: Address, amount: U256) -> Self {
        Self { kind, pool, amount: Some(amount), withdraw_all: false }
    }
}

/// Collateral plan for a given debt.
#[derive(Debug, Clone, PartialEq)]
pub struct CollateralPlan {
    pub steps: Vec<AllocationStep>,
    /// Debt value the steps cover
    pub covered_value: Decimal,
    /// Debt value left uncovered; zero when settled within dust tolerance
    pub remaining_debt_value: Decimal,
}

/// Complete plan: repayments first, then withdrawals.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub initial_debt_value: Decimal,
    pub repayments: Vec<AllocationStep>,
    pub withdrawals: Vec<AllocationStep>,
    pub remaining_debt_value: Decimal,
}

impl Plan {
    /// Number of steps in the plan.
    pub fn len(&self) -> usize {
        self.repayments.len() + self.withdrawals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Steps in execution order.
    pub fn steps(&self) -> impl Iterator<Item = &AllocationStep> {
        self.repayments.iter().chain(self.withdrawals.iter())
    }
}

/// Order collateral by the preference list, then discovery order for the rest.
fn ordered<'a>(collateral: &'a [CollateralValuation], ordering: &[Address]) -> Vec<&'a CollateralValuation> {
    let mut out: Vec<&CollateralValuation> = Vec::with_capacity(collateral.len());
    for preferred in ordering {
        if out.iter().any(|c| c.pool == *preferred) {
            continue;
        }
        if let Some(c) = collateral.iter().find(|c| c.pool == *preferred) {
            out.push(c);
        }
    }
    for c in collateral {
        if !out.iter().any(|o| o.pool == c.pool) {
            out.push(c);
        }
    }
    out
}

/// Plan collateral withdrawals covering `debt_value`.
///
/// Amounts below `dust_units` base units are treated as zero: the plan stops
/// and the remainder counts as settled.
pub fn plan(
    debt_value: Decimal,
    collateral: &[CollateralValuation],
    ordering: &[Address],
    emissions_floor: Decimal,
    dust_units: u64,
) -> Result<CollateralPlan> {
    let dust = U256::from(dust_units.max(1));
    let mut remaining = debt_value;
    let mut covered = Decimal::ZERO;
    let mut steps = Vec::new();

    for c in ordered(collateral, ordering) {
        if remaining <= Decimal::ZERO {
            break;
        }
        if c.seizable_value <= Decimal::ZERO {
            debug!(pool = %c.pool, "Skipping collateral with no seizable value");
            continue;
        }
        if c.has_external_rewards && c.seizable_value < emissions_floor {
            debug!(
                pool = %c.pool,
                seizable_value = %c.seizable_value,
                emissions_floor = %emissions_floor,
                "Skipping reward-earning collateral below the emissions floor"
            );
            continue;
        }

        if c.seizable_value >= remaining {
            let amount = decimal_math::proportional_floor(c.token_units, remaining, c.seizable_value)
                .ok_or(DeleverageError::ArithmeticOverflow("partial withdrawal"))?;
            if amount < dust {
                debug!(pool = %c.pool, remaining = %remaining, "Remaining debt below dust threshold");
                remaining = Decimal::ZERO;
                break;
            }
            accumulate(&mut covered, remaining, "covered value")?;
            remaining = Decimal::ZERO;
            steps.push(AllocationStep::partial(StepKind::Withdraw, c.pool, amount));
            break;
        }

        steps.push(AllocationStep::all(StepKind::Withdraw, c.pool));
        accumulate(&mut covered, c.seizable_value, "covered value")?;
        remaining = remaining
            .checked_sub(c.seizable_value)
            .ok_or(DeleverageError::ArithmeticOverflow("remaining debt value"))?;
    }

    Ok(CollateralPlan {
        steps,
        covered_value: covered,
        remaining_debt_value: remaining.max(Decimal::ZERO),
    })
}

/// Spread `covered_value` over the debts in discovery order.
///
/// Fully covered debts are repaid in full; the first partially covered debt
/// gets a floored partial repayment and ends the plan.
pub fn plan_repayments(
    covered_value: Decimal,
    debts: &[DebtValuation],
    dust_units: u64,
) -> Result<Vec<AllocationStep>> {
    let dust = U256::from(dust_units.max(1));
    let mut available = covered_value;
    let mut steps = Vec::new();

    for debt in debts {
        if available <= Decimal::ZERO {
            break;
        }
        if debt.value <= Decimal::ZERO {
            continue;
        }
        if available >= debt.value {
            steps.push(AllocationStep::all(StepKind::Repay, debt.pool));
            available = available
                .checked_sub(debt.value)
                .ok_or(DeleverageError::ArithmeticOverflow("repay amount"))?;
            continue;
        }

        let amount = decimal_math::proportional_floor(debt.token_units, available, debt.value)
            .ok_or(DeleverageError::ArithmeticOverflow("partial repayment"))?;
        if amount >= dust {
            steps.push(AllocationStep::partial(StepKind::Repay, debt.pool, amount));
        }
        break;
    }

    Ok(steps)
}

/// Build the complete plan for a valued position.
pub fn plan_position(
    debt_value: Decimal,
    collateral: &[CollateralValuation],
    debts: &[DebtValuation],
    ordering: &[Address],
    emissions_floor: Decimal,
    dust_units: u64,
) -> Result<Plan> {
    let withdrawals = plan(debt_value, collateral, ordering, emissions_floor, dust_units)?;
    let repayments = plan_repayments(withdrawals.covered_value, debts, dust_units)?;

    debug!(
        debt_value = %debt_value,
        covered_value = %withdrawals.covered_value,
        remaining_debt_value = %withdrawals.remaining_debt_value,
        withdrawals = withdrawals.steps.len(),
        repayments = repayments.len(),
        "Planned deleverage"
    );

    Ok(Plan {
        initial_debt_value: debt_value,
        repayments,
        withdrawals: withdrawals.steps,
        remaining_debt_value: withdrawals.remaining_debt_value,
    })
}
