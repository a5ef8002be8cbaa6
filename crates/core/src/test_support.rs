//! In-memory ledger and fixtures for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use alloy::primitives::{keccak256, Address, B256};
use async_trait::async_trait;
use deleverage_chain::instructions::decode_extend_addresses;
use deleverage_chain::{
    AdapterState, AddressTableAccount, Balance, CompiledTransaction, InstructionTag,
    IntegrationKind, Ledger, LedgerError, Pool, Position, TableView, TransactionLimits,
    TransactionRequest,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use smallvec::{smallvec, SmallVec};

/// Address filled with `byte`, ending in `last`.
pub(crate) fn derived(byte: u8, last: u8) -> Address {
    let mut bytes = [byte; 20];
    bytes[19] = last;
    Address::from(bytes)
}

pub(crate) fn pool(byte: u8, price: Decimal, decimals: u8) -> Pool {
    Pool {
        address: Address::repeat_byte(byte),
        token_mint: derived(byte, 0x01),
        vault: derived(byte, 0x02),
        deposit_note_mint: derived(byte, 0x03),
        loan_note_mint: derived(byte, 0x04),
        price,
        deposit_note_rate: Decimal::ONE,
        loan_note_rate: Decimal::ONE,
        decimals,
        kind: IntegrationKind::Native,
        init_weight: Decimal::ONE,
        maintenance_weight: Decimal::ONE,
        has_outstanding_rewards: false,
    }
}

pub(crate) fn balance(pool_byte: u8, is_collateral: bool, shares: Decimal) -> Balance {
    Balance {
        pool: Address::repeat_byte(pool_byte),
        shares: Some(shares),
        is_collateral,
        has_external_rewards: false,
        note_account: derived(pool_byte, 0x0a),
        token_account: derived(pool_byte, 0x0b),
    }
}

pub(crate) fn position(balances: Vec<Balance>) -> Position {
    Position {
        address: Address::repeat_byte(0xee),
        owner: Address::repeat_byte(0xef),
        balances: SmallVec::from_vec(balances),
    }
}

pub(crate) fn adapter(pool_byte: u8, market_byte: u8) -> AdapterState {
    AdapterState {
        pool: Address::repeat_byte(pool_byte),
        program: Address::repeat_byte(0xad),
        market: Address::repeat_byte(market_byte),
        reserve: derived(pool_byte, 0x20),
        obligation: derived(market_byte, 0x21),
        oracles: smallvec![derived(pool_byte, 0x22)],
        liquidity_supply: derived(pool_byte, 0x23),
        collateral_supply: derived(pool_byte, 0x24),
    }
}

/// Scripted response for one submission.
#[derive(Debug, Clone)]
pub(crate) enum SubmitScript {
    /// Reject without landing
    Fail(LedgerError),
    /// Land the transaction
    Land,
    /// Land the transaction, then report a timeout
    LandThenTimeout,
}

/// In-memory ledger.
///
/// Submissions are checked against `limits` with the same compiler the packer
/// uses; landed table instructions update the stored tables.
pub(crate) struct MockLedger {
    pub positions: Mutex<HashMap<Address, Position>>,
    pub pools: HashMap<Address, Pool>,
    pub adapters: HashMap<Address, AdapterState>,
    pub tables: Mutex<HashMap<Address, AddressTableAccount>>,
    pub limits: TransactionLimits,
    /// Position state to install once a transaction touching it lands
    pub settled_positions: Mutex<HashMap<Address, Position>>,
    pub script: Mutex<VecDeque<SubmitScript>>,
    pub landed: Mutex<Vec<TransactionRequest>>,
    pub submit_attempts: AtomicUsize,
    pub position_fetches: AtomicUsize,
    pub pool_fetches: AtomicUsize,
    pub adapter_fetches: AtomicUsize,
}

impl MockLedger {
    pub fn new(limits: TransactionLimits) -> Self {
        Self {
            positions: Mutex::new(HashMap::new()),
            pools: HashMap::new(),
            adapters: HashMap::new(),
            tables: Mutex::new(HashMap::new()),
            limits,
            settled_positions: Mutex::new(HashMap::new()),
            script: Mutex::new(VecDeque::new()),
            landed: Mutex::new(Vec::new()),
            submit_attempts: AtomicUsize::new(0),
            position_fetches: AtomicUsize::new(0),
            pool_fetches: AtomicUsize::new(0),
            adapter_fetches: AtomicUsize::new(0),
        }
    }

    pub fn with_position(self, position: Position) -> Self {
        self.positions.lock().insert(position.address, position);
        self
    }

    pub fn with_pool(mut self, pool: Pool) -> Self {
        self.pools.insert(pool.address, pool);
        self
    }

    pub fn with_adapter(mut self, adapter: AdapterState) -> Self {
        self.adapters.insert(adapter.pool, adapter);
        self
    }

    pub fn with_table(self, table: AddressTableAccount) -> Self {
        self.tables.lock().insert(table.address, table);
        self
    }

    pub fn push_script(&self, script: SubmitScript) {
        self.script.lock().push_back(script);
    }

    pub fn landed(&self) -> Vec<TransactionRequest> {
        self.landed.lock().clone()
    }

    fn land(&self, request: &TransactionRequest) -> B256 {
        let mut tables = self.tables.lock();
        for ix in &request.instructions {
            match ix.tag() {
                Some(InstructionTag::CreateTable) => {
                    let table = ix.accounts[0].address;
                    tables.entry(table).or_insert_with(|| AddressTableAccount {
                        address: table,
                        authority: Some(ix.accounts[1].address),
                        addresses: Vec::new(),
                    });
                }
                Some(InstructionTag::ExtendTable) => {
                    let table = ix.accounts[0].address;
                    if let (Some(account), Some(addresses)) =
                        (tables.get_mut(&table), decode_extend_addresses(ix))
                    {
                        account.addresses.extend(addresses);
                    }
                }
                _ => {}
            }
        }
        drop(tables);

        let touched: Vec<Address> = request
            .instructions
            .iter()
            .flat_map(|ix| ix.addresses().collect::<Vec<_>>())
            .collect();
        let mut settled = self.settled_positions.lock();
        let mut positions = self.positions.lock();
        for address in touched {
            if let Some(next) = settled.remove(&address) {
                positions.insert(address, next);
            }
        }

        let mut landed = self.landed.lock();
        landed.push(request.clone());
        keccak256((landed.len() as u64).to_be_bytes())
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn fetch_position(&self, address: Address) -> Result<Position, LedgerError> {
        self.position_fetches.fetch_add(1, Ordering::SeqCst);
        self.positions
            .lock()
            .get(&address)
            .cloned()
            .ok_or_else(|| LedgerError::Rejected { code: -32602, message: format!("position {address} not found") })
    }

    async fn fetch_pools(&self, addresses: &[Address]) -> Result<Vec<Pool>, LedgerError> {
        self.pool_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(addresses.iter().filter_map(|a| self.pools.get(a).cloned()).collect())
    }

    async fn fetch_adapter_states(&self, pools: &[Address]) -> Result<Vec<AdapterState>, LedgerError> {
        self.adapter_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(pools.iter().filter_map(|p| self.adapters.get(p).cloned()).collect())
    }

    async fn fetch_address_table(
        &self,
        address: Address,
    ) -> Result<Option<AddressTableAccount>, LedgerError> {
        Ok(self.tables.lock().get(&address).cloned())
    }

    async fn submit_transaction(&self, request: &TransactionRequest) -> Result<B256, LedgerError> {
        self.submit_attempts.fetch_add(1, Ordering::SeqCst);

        let views: Vec<TableView> = {
            let tables = self.tables.lock();
            request
                .tables
                .iter()
                .filter_map(|t| tables.get(t))
                .map(|t| TableView { address: t.address, addresses: t.addresses.clone() })
                .collect()
        };
        CompiledTransaction::compile(&request.instructions, &request.signers, &views)
            .check_limits(&self.limits)?;

        let scripted = self.script.lock().pop_front();
        match scripted {
            Some(SubmitScript::Fail(err)) => Err(err),
            Some(SubmitScript::LandThenTimeout) => {
                self.land(request);
                Err(LedgerError::Timeout { operation: "submit_transaction", after_ms: 1 })
            }
            Some(SubmitScript::Land) | None => Ok(self.land(request)),
        }
    }
}
