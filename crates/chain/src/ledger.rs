//! Ledger abstraction.
//!
//! The engine only talks to the ledger through this trait, so the RPC client and
//! in-memory test doubles are interchangeable.

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::accounts::{AdapterState, AddressTableAccount, Pool, Position};
use crate::error::LedgerError;
use crate::instructions::Instruction;

/// A transaction ready for submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    /// Instructions executed atomically, in order
    pub instructions: Vec<Instruction>,
    /// Accounts that must sign
    pub signers: Vec<Address>,
    /// Address tables the transaction may reference accounts through
    pub tables: Vec<Address>,
}

/// Read and submit access to the ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Fetch a position and its balances.
    async fn fetch_position(&self, address: Address) -> Result<Position, LedgerError>;

    /// Fetch pools by address. Pools that do not exist are omitted from the result.
    async fn fetch_pools(&self, addresses: &[Address]) -> Result<Vec<Pool>, LedgerError>;

    /// Fetch adapter state for the given pools. Pools without adapter state are omitted.
    async fn fetch_adapter_states(&self, pools: &[Address]) -> Result<Vec<AdapterState>, LedgerError>;

    /// Fetch an address table, or `None` if it does not exist.
    async fn fetch_address_table(
        &self,
        address: Address,
    ) -> Result<Option<AddressTableAccount>, LedgerError>;

    /// Submit a transaction and wait for it to land.
    ///
    /// A [`LedgerError::Timeout`] means the outcome is unknown.
    async fn submit_transaction(&self, request: &TransactionRequest) -> Result<B256, LedgerError>;
}
