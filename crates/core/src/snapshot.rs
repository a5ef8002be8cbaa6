//! Position snapshot loading.

use std::collections::HashMap;

use alloy::primitives::Address;
use deleverage_chain::{AdapterState, Ledger, Pool, Position};
use tracing::{debug, warn};

use crate::error::Result;
use crate::run_state::RunState;

/// A position together with every pool and adapter state it references.
#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    pub position: Position,
    pub pools: HashMap<Address, Pool>,
    pub adapters: HashMap<Address, AdapterState>,
}

/// Reads positions and resolves their pools through the run caches.
pub struct SnapshotLoader<'a> {
    ledger: &'a dyn Ledger,
    state: &'a RunState,
}

impl<'a> SnapshotLoader<'a> {
    pub fn new(ledger: &'a dyn Ledger, state: &'a RunState) -> Self {
        Self { ledger, state }
    }

    /// Fetch a fresh position and build its snapshot.
    pub async fn load(&self, address: Address) -> Result<PositionSnapshot> {
        let position = self.ledger.fetch_position(address).await?;
        self.resolve(position).await
    }

    /// Build a snapshot for an already-fetched position.
    pub async fn resolve(&self, position: Position) -> Result<PositionSnapshot> {
        let conflicts = position.conflicting_pools();
        if !conflicts.is_empty() {
            warn!(
                position = %position.address,
                pools = ?conflicts,
                "Position holds both collateral and debt in the same pool"
            );
        }

        let referenced = position.referenced_pools();
        self.state.ensure_pools(self.ledger, &referenced).await?;

        let pools = self.state.pools_for(&referenced);
        let adapters = self.state.adapters_for(&referenced);
        debug!(
            position = %position.address,
            balances = position.balances.len(),
            pools = pools.len(),
            adapters = adapters.len(),
            "Loaded position snapshot"
        );

        Ok(PositionSnapshot { position, pools, adapters })
    }
}
