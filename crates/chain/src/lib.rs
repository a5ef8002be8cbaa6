//! Ledger interaction layer for the deleveraging engine.
//!
//! This crate provides:
//! - Account types read from the ledger (positions, pools, adapter state, address tables)
//! - The `Ledger` trait and a JSON-RPC implementation
//! - Instruction shapes for the margin pool, money-market adapters and address tables
//! - Transaction compilation with size and account-reference estimation
//! - Ledger error classification (oversize, retryable, unknown outcome)

pub mod accounts;
mod error;
pub mod instructions;
mod ledger;
mod rpc;
pub mod transaction;

pub use accounts::{AdapterState, AddressTableAccount, Balance, IntegrationKind, Pool, Position};
pub use error::LedgerError;
pub use instructions::{AccountMeta, Instruction, InstructionBuilder, InstructionTag};
pub use ledger::{Ledger, TransactionRequest};
pub use rpc::{methods, RpcLedger};
pub use transaction::{CompiledTransaction, TableLookup, TableView, TransactionLimits};
