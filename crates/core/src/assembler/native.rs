//! Native margin pools: one withdraw or repay instruction, no refresh.

use alloy::primitives::Address;
use deleverage_chain::{instructions, Balance, Instruction, Pool};

use crate::planner::{AllocationStep, StepKind};

pub(super) fn assemble(
    program: Address,
    authority: Address,
    position: Address,
    step: &AllocationStep,
    pool: &Pool,
    balance: &Balance,
) -> Instruction {
    match step.kind {
        StepKind::Withdraw => instructions::withdraw(program, pool, balance, position, authority, step.amount),
        StepKind::Repay => instructions::repay(program, pool, balance, position, authority, step.amount),
    }
}
