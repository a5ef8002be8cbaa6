//! Per-run shared state: pool and adapter caches plus the address tables.
//!
//! Created at run start, dropped at run end. The caches are insert-if-absent
//! maps filled under a single fetch lock, so concurrent workers never issue
//! duplicate reads for the same pool.

use std::collections::HashMap;

use alloy::primitives::Address;
use dashmap::DashMap;
use deleverage_chain::{AdapterState, Ledger, Pool, Position};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::{LedgerConfig, RunConfig};
use crate::error::Result;
use crate::tables::AddressTableManager;

/// Caches and tables shared by every position in a run.
pub struct RunState {
    pools: DashMap<Address, Pool>,
    adapter_states: DashMap<Address, AdapterState>,
    tables: Mutex<AddressTableManager>,
    fetch_lock: Mutex<()>,
}

impl RunState {
    /// Empty state with no known tables.
    pub fn new(tables: AddressTableManager) -> Self {
        Self {
            pools: DashMap::new(),
            adapter_states: DashMap::new(),
            tables: Mutex::new(tables),
            fetch_lock: Mutex::new(()),
        }
    }

    /// Build run state, loading the configured lookup tables.
    #[instrument(skip_all, fields(tables = ledger_config.lookup_tables.len()))]
    pub async fn initialize(ledger: &dyn Ledger, ledger_config: &LedgerConfig, config: &RunConfig) -> Result<Self> {
        let mut manager = AddressTableManager::new(
            ledger_config.authority,
            ledger_config.programs.address_table,
            config.table_capacity,
            config.max_addresses_per_extend,
        );

        for address in &ledger_config.lookup_tables {
            match ledger.fetch_address_table(*address).await? {
                Some(account) => manager.add_table(account),
                None => warn!(table = %address, "Configured address table not found"),
            }
        }

        info!(
            tables = manager.tables().len(),
            known_addresses = manager.known_addresses().len(),
            "Run state initialized"
        );
        Ok(Self::new(manager))
    }

    /// Address tables, locked for the duration of an extension pass.
    pub fn tables(&self) -> &Mutex<AddressTableManager> {
        &self.tables
    }

    /// Fetch any of `pools` not yet cached, then the adapter state of the
    /// adapter-kind pools among them.
    pub async fn ensure_pools(&self, ledger: &dyn Ledger, pools: &[Address]) -> Result<()> {
        let _guard = self.fetch_lock.lock().await;

        let missing: Vec<Address> = pools
            .iter()
            .copied()
            .filter(|p| !self.pools.contains_key(p))
            .collect();
        if !missing.is_empty() {
            let fetched = ledger.fetch_pools(&missing).await?;
            debug!(requested = missing.len(), fetched = fetched.len(), "Fetched pools");
            for pool in fetched {
                self.pools.entry(pool.address).or_insert(pool);
            }
        }

        let missing_adapters: Vec<Address> = pools
            .iter()
            .filter(|p| {
                self.pools.get(*p).is_some_and(|pool| pool.kind.is_adapter())
                    && !self.adapter_states.contains_key(*p)
            })
            .copied()
            .collect();
        if !missing_adapters.is_empty() {
            let fetched = ledger.fetch_adapter_states(&missing_adapters).await?;
            debug!(requested = missing_adapters.len(), fetched = fetched.len(), "Fetched adapter states");
            for state in fetched {
                self.adapter_states.entry(state.pool).or_insert(state);
            }
        }

        Ok(())
    }

    /// Fetch every pool the given positions reference, in one batched read.
    pub async fn prefetch(&self, ledger: &dyn Ledger, positions: &[Position]) -> Result<()> {
        let mut pools: Vec<Address> = Vec::new();
        for position in positions {
            for pool in position.referenced_pools() {
                if !pools.contains(&pool) {
                    pools.push(pool);
                }
            }
        }
        self.ensure_pools(ledger, &pools).await
    }

    /// Cached pools among `addresses`.
    pub fn pools_for(&self, addresses: &[Address]) -> HashMap<Address, Pool> {
        addresses
            .iter()
            .filter_map(|a| self.pools.get(a).map(|p| (*a, p.clone())))
            .collect()
    }

    /// Cached adapter states among `pools`.
    pub fn adapters_for(&self, pools: &[Address]) -> HashMap<Address, AdapterState> {
        pools
            .iter()
            .filter_map(|a| self.adapter_states.get(a).map(|s| (*a, s.clone())))
            .collect()
    }

    pub fn cached_pools(&self) -> usize {
        self.pools.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProgramAddresses;
    use crate::test_support::{adapter, balance, pool, position, MockLedger};
    use deleverage_chain::{AddressTableAccount, IntegrationKind, TransactionLimits};
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn ledger() -> MockLedger {
        let mut adapted = pool(0x02, dec!(1), 6);
        adapted.kind = IntegrationKind::ReserveAdapter;
        MockLedger::new(TransactionLimits::default())
            .with_pool(pool(0x01, dec!(1), 6))
            .with_pool(adapted)
            .with_adapter(adapter(0x02, 0x50))
    }

    #[tokio::test]
    async fn test_pools_fetched_once() {
        let ledger = ledger();
        let state = RunState::new(AddressTableManager::new(Address::ZERO, Address::ZERO, 256, 20));
        let wanted = [Address::repeat_byte(0x01), Address::repeat_byte(0x02)];

        state.ensure_pools(&ledger, &wanted).await.unwrap();
        state.ensure_pools(&ledger, &wanted).await.unwrap();

        assert_eq!(ledger.pool_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.adapter_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(state.pools_for(&wanted).len(), 2);
        assert_eq!(state.adapters_for(&wanted).len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_does_not_duplicate_reads() {
        let ledger = Arc::new(ledger());
        let state = Arc::new(RunState::new(AddressTableManager::new(Address::ZERO, Address::ZERO, 256, 20)));
        let wanted = vec![Address::repeat_byte(0x01), Address::repeat_byte(0x02)];

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                let state = state.clone();
                let wanted = wanted.clone();
                tokio::spawn(async move { state.ensure_pools(ledger.as_ref(), &wanted).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(ledger.pool_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(state.cached_pools(), 2);
    }

    #[tokio::test]
    async fn test_prefetch_unions_positions() {
        let ledger = ledger();
        let state = RunState::new(AddressTableManager::new(Address::ZERO, Address::ZERO, 256, 20));
        let a = position(vec![balance(0x01, true, dec!(1))]);
        let b = position(vec![balance(0x02, false, dec!(1)), balance(0x01, true, dec!(1))]);

        state.prefetch(&ledger, &[a, b]).await.unwrap();
        assert_eq!(ledger.pool_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(state.cached_pools(), 2);
    }

    #[tokio::test]
    async fn test_initialize_loads_tables() {
        let authority = Address::repeat_byte(0xa1);
        let ledger = ledger().with_table(AddressTableAccount {
            address: Address::repeat_byte(0xb0),
            authority: Some(authority),
            addresses: vec![Address::repeat_byte(0x01)],
        });
        let ledger_config = LedgerConfig {
            rpc_url: String::new(),
            request_timeout_ms: 1000,
            submit_timeout_ms: 1000,
            authority,
            programs: ProgramAddresses { margin_pool: Address::ZERO, address_table: Address::ZERO },
            lookup_tables: vec![Address::repeat_byte(0xb0), Address::repeat_byte(0xb9)],
        };

        let state = RunState::initialize(&ledger, &ledger_config, &RunConfig::default()).await.unwrap();
        let tables = state.tables().lock().await;
        assert_eq!(tables.tables().len(), 1);
        assert!(tables.known_addresses().contains(&Address::repeat_byte(0x01)));
    }
}
