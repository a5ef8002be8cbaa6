//! Deleveraging engine core.
//!
//! This crate turns an under-collateralized margin position into a settlement
//! transaction:
//! - Valuation of collateral and debt with a confidence margin
//! - Greedy collateral allocation and repayment planning
//! - Instruction assembly for native and adapter-backed pools
//! - Address table management for oversize transactions
//! - Transaction packing with bounded oversize recovery
//! - Batch runs with per-position failure isolation

mod assembler;
pub mod config;
pub mod decimal_math;
mod engine;
mod error;
mod packer;
mod planner;
mod report;
mod run_state;
mod snapshot;
mod tables;
mod valuation;

#[cfg(test)]
mod test_support;

pub use assembler::{assemble_plan, AssemblyContext, InstructionAssembler};
pub use config::{AppConfig, LedgerConfig, ProgramAddresses, RunConfig};
pub use engine::Deleverager;
pub use error::{DeleverageError, Result, RunFailure};
pub use packer::{PackFailure, PackOutcome, TransactionPacker};
pub use planner::{plan, plan_position, plan_repayments, AllocationStep, CollateralPlan, Plan, StepKind};
pub use report::{RunReport, TerminalStatus};
pub use run_state::RunState;
pub use snapshot::{PositionSnapshot, SnapshotLoader};
pub use tables::{AddressTable, AddressTableManager, TableOp};
pub use valuation::{value, CollateralValuation, DebtValuation, ValuationResult};
