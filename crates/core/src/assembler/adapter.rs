//! External money-market adapters.
//!
//! The adapter program rejects withdrawals and repayments against stale
//! reserve or obligation state, so each operation is preceded by the refreshes
//! its adapter kind needs. Refreshes are emitted once per reserve and once per
//! obligation within a transaction; an obligation refresh comes after the
//! refreshes of all the reserves it lists.

use alloy::primitives::Address;
use deleverage_chain::{instructions, AdapterState, Balance};

use super::TransactionDraft;
use crate::planner::{AllocationStep, StepKind};

/// Which refreshes an adapter kind needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RefreshScope {
    /// Reserve refresh only
    Reserve,
    /// Reserve refresh, then an obligation refresh over every reserve used
    Obligation,
}

pub(super) fn assemble(
    draft: &mut TransactionDraft,
    scope: RefreshScope,
    authority: Address,
    position: Address,
    step: &AllocationStep,
    adapter: &AdapterState,
    balance: &Balance,
) {
    match scope {
        RefreshScope::Reserve => {
            if draft.refreshed_reserves.insert(adapter.reserve) {
                draft.push(instructions::refresh_reserve(adapter));
            }
        }
        RefreshScope::Obligation => draft.refresh_obligation(adapter),
    }

    let instruction = match step.kind {
        StepKind::Withdraw => instructions::adapter_withdraw(adapter, balance, position, authority, step.amount),
        StepKind::Repay => instructions::adapter_repay(adapter, balance, position, authority, step.amount),
    };
    draft.push(instruction);
}
