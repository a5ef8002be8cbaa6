//! JSON-RPC ledger client.
//!
//! Uses the alloy RPC client over HTTP. The HTTP client owns connection reuse
//! and reconnects; this layer adds per-call deadlines and error classification.

use std::future::IntoFuture;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use alloy::rpc::client::{ClientBuilder, RpcClient};
use alloy::transports::TransportResult;
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::accounts::{AdapterState, AddressTableAccount, Pool, Position};
use crate::error::LedgerError;
use crate::ledger::{Ledger, TransactionRequest};

/// Method names served by the margin ledger endpoint.
pub mod methods {
    pub const GET_POSITION: &str = "margin_getPosition";
    pub const GET_POOLS: &str = "margin_getPools";
    pub const GET_ADAPTER_STATES: &str = "margin_getAdapterStates";
    pub const GET_ADDRESS_TABLE: &str = "margin_getAddressTable";
    pub const SEND_TRANSACTION: &str = "margin_sendAndConfirmTransaction";
    pub const HEALTH: &str = "margin_health";
}

/// Ledger client backed by a JSON-RPC endpoint.
#[derive(Clone)]
pub struct RpcLedger {
    client: RpcClient,
    url: String,
    request_timeout: Duration,
    submit_timeout: Duration,
}

impl RpcLedger {
    /// Create a client for the given endpoint.
    pub fn new(url: &str, request_timeout: Duration, submit_timeout: Duration) -> Result<Self, LedgerError> {
        let parsed = url
            .parse()
            .map_err(|e| LedgerError::Transport(format!("invalid RPC url {url}: {e}")))?;
        let client = ClientBuilder::default().http(parsed);

        info!(
            url = url,
            request_timeout_ms = request_timeout.as_millis() as u64,
            submit_timeout_ms = submit_timeout.as_millis() as u64,
            "Initialized ledger RPC client"
        );

        Ok(Self {
            client,
            url: url.to_string(),
            request_timeout,
            submit_timeout,
        })
    }

    /// Endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Check the endpoint responds.
    pub async fn health(&self) -> Result<(), LedgerError> {
        let status: String = self
            .call(methods::HEALTH, (), self.request_timeout)
            .await?;
        debug!(status = %status, "Ledger health check");
        Ok(())
    }

    async fn call<P, R>(&self, method: &'static str, params: P, deadline: Duration) -> Result<R, LedgerError>
    where
        P: serde::Serialize + Clone + std::fmt::Debug + Send + Sync + Unpin + 'static,
        R: serde::de::DeserializeOwned + std::fmt::Debug + Send + Sync + Unpin + 'static,
    {
        with_timeout(method, deadline, self.client.request::<P, R>(method, params)).await
    }
}

/// Run an RPC call under a deadline.
async fn with_timeout<F, T>(operation: &'static str, deadline: Duration, call: F) -> Result<T, LedgerError>
where
    F: IntoFuture<Output = TransportResult<T>>,
{
    match tokio::time::timeout(deadline, call.into_future()).await {
        Ok(result) => result.map_err(LedgerError::from),
        Err(_) => {
            warn!(operation, after_ms = deadline.as_millis() as u64, "RPC call timed out");
            Err(LedgerError::Timeout {
                operation,
                after_ms: deadline.as_millis() as u64,
            })
        }
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    #[instrument(skip(self), fields(position = %address))]
    async fn fetch_position(&self, address: Address) -> Result<Position, LedgerError> {
        self.call(methods::GET_POSITION, (address,), self.request_timeout)
            .await
    }

    #[instrument(skip(self, addresses), fields(count = addresses.len()))]
    async fn fetch_pools(&self, addresses: &[Address]) -> Result<Vec<Pool>, LedgerError> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let pools: Vec<Option<Pool>> = self
            .call(methods::GET_POOLS, (addresses.to_vec(),), self.request_timeout)
            .await?;
        Ok(pools.into_iter().flatten().collect())
    }

    #[instrument(skip(self, pools), fields(count = pools.len()))]
    async fn fetch_adapter_states(&self, pools: &[Address]) -> Result<Vec<AdapterState>, LedgerError> {
        if pools.is_empty() {
            return Ok(Vec::new());
        }
        let states: Vec<Option<AdapterState>> = self
            .call(methods::GET_ADAPTER_STATES, (pools.to_vec(),), self.request_timeout)
            .await?;
        Ok(states.into_iter().flatten().collect())
    }

    #[instrument(skip(self), fields(table = %address))]
    async fn fetch_address_table(
        &self,
        address: Address,
    ) -> Result<Option<AddressTableAccount>, LedgerError> {
        self.call(methods::GET_ADDRESS_TABLE, (address,), self.request_timeout)
            .await
    }

    #[instrument(skip(self, request), fields(instructions = request.instructions.len(), tables = request.tables.len()))]
    async fn submit_transaction(&self, request: &TransactionRequest) -> Result<B256, LedgerError> {
        let signature: B256 = self
            .call(methods::SEND_TRANSACTION, (request.clone(),), self.submit_timeout)
            .await?;
        debug!(signature = %signature, "Transaction landed");
        Ok(signature)
    }
}
