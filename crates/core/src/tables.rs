//! Address table management.
//!
//! Tracks the address tables visible to a run, which of them the authority
//! may extend, and how much room each has left. `ensure_capacity` is a pure
//! planner: it returns the create/extend operations needed to cover a set of
//! addresses, and the caller applies each one after its transaction lands.

use std::collections::HashSet;

use alloy::primitives::Address;
use deleverage_chain::instructions::{create_table, derive_table_address, extend_table};
use deleverage_chain::{AddressTableAccount, Instruction, TableView};
use tracing::{debug, info};

use crate::error::{DeleverageError, Result};

/// One address table.
#[derive(Debug, Clone)]
pub struct AddressTable {
    pub address: Address,
    /// Authority allowed to extend; `None` once frozen
    pub owned_by: Option<Address>,
    pub capacity_remaining: usize,
    /// Stored addresses in slot order
    addresses: Vec<Address>,
    known: HashSet<Address>,
}

impl AddressTable {
    fn new(address: Address, owned_by: Option<Address>, addresses: Vec<Address>, capacity: usize) -> Self {
        let known = addresses.iter().copied().collect();
        Self {
            address,
            owned_by,
            capacity_remaining: capacity.saturating_sub(addresses.len()),
            addresses,
            known,
        }
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.known.contains(address)
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// A table operation to submit, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOp {
    Create { table: Address, nonce: u64, instruction: Instruction },
    Extend { table: Address, addresses: Vec<Address>, instruction: Instruction },
}

impl TableOp {
    pub fn instruction(&self) -> &Instruction {
        match self {
            Self::Create { instruction, .. } | Self::Extend { instruction, .. } => instruction,
        }
    }

    pub fn table(&self) -> Address {
        match self {
            Self::Create { table, .. } | Self::Extend { table, .. } => *table,
        }
    }
}

/// Tables visible to a run.
#[derive(Debug)]
pub struct AddressTableManager {
    authority: Address,
    program: Address,
    table_capacity: usize,
    max_per_extend: usize,
    tables: Vec<AddressTable>,
    next_nonce: u64,
}

impl AddressTableManager {
    pub fn new(authority: Address, program: Address, table_capacity: usize, max_per_extend: usize) -> Self {
        Self {
            authority,
            program,
            table_capacity,
            max_per_extend,
            tables: Vec::new(),
            next_nonce: 0,
        }
    }

    /// Register a table read from the ledger.
    pub fn add_table(&mut self, account: AddressTableAccount) {
        if self.tables.iter().any(|t| t.address == account.address) {
            return;
        }
        debug!(
            table = %account.address,
            entries = account.addresses.len(),
            owned = account.authority == Some(self.authority),
            "Registered address table"
        );
        self.tables.push(AddressTable::new(
            account.address,
            account.authority,
            account.addresses,
            self.table_capacity,
        ));
    }

    pub fn tables(&self) -> &[AddressTable] {
        &self.tables
    }

    /// Union of addresses across all tables.
    pub fn known_addresses(&self) -> HashSet<Address> {
        self.tables.iter().flat_map(|t| t.known.iter().copied()).collect()
    }

    /// Table contents for the transaction compiler.
    pub fn views(&self) -> Vec<TableView> {
        self.tables
            .iter()
            .filter(|t| !t.is_empty())
            .map(|t| TableView { address: t.address, addresses: t.addresses.clone() })
            .collect()
    }

    fn is_owned(&self, table: &AddressTable) -> bool {
        table.owned_by == Some(self.authority)
    }

    /// Plan the operations that make every address in `required` resolvable.
    ///
    /// Owned tables are filled first, in registration order; new tables are
    /// created for whatever is left. Returns no operations when nothing is missing.
    pub fn ensure_capacity(&self, required: &[Address]) -> Result<Vec<TableOp>> {
        let known = self.known_addresses();
        let mut seen = HashSet::new();
        let mut missing: Vec<Address> = required
            .iter()
            .copied()
            .filter(|a| !known.contains(a) && seen.insert(*a))
            .collect();

        if missing.is_empty() {
            return Ok(Vec::new());
        }
        if self.table_capacity == 0 || self.max_per_extend == 0 {
            return Err(DeleverageError::TableCapacityExhausted {
                required: missing.len(),
                reason: "tables cannot hold any addresses".to_string(),
            });
        }

        let mut ops = Vec::new();
        for table in self.tables.iter().filter(|t| self.is_owned(t)) {
            let mut capacity = table.capacity_remaining;
            self.fill(table.address, &mut capacity, &mut missing, &mut ops);
            if missing.is_empty() {
                return Ok(ops);
            }
        }

        let taken: HashSet<Address> = self.tables.iter().map(|t| t.address).collect();
        let mut nonce = self.next_nonce;
        while !missing.is_empty() {
            let (table, table_nonce) = loop {
                let candidate = derive_table_address(self.authority, nonce);
                let current = nonce;
                nonce = nonce.checked_add(1).ok_or_else(|| DeleverageError::TableCapacityExhausted {
                    required: missing.len(),
                    reason: "table nonce space exhausted".to_string(),
                })?;
                if !taken.contains(&candidate) {
                    break (candidate, current);
                }
            };

            ops.push(TableOp::Create {
                table,
                nonce: table_nonce,
                instruction: create_table(self.program, table, self.authority, table_nonce),
            });
            let mut capacity = self.table_capacity;
            self.fill(table, &mut capacity, &mut missing, &mut ops);
        }

        Ok(ops)
    }

    fn fill(&self, table: Address, capacity: &mut usize, missing: &mut Vec<Address>, ops: &mut Vec<TableOp>) {
        while !missing.is_empty() && *capacity > 0 {
            let take = (*capacity).min(missing.len()).min(self.max_per_extend);
            let batch: Vec<Address> = missing.drain(..take).collect();
            *capacity -= take;
            ops.push(TableOp::Extend {
                table,
                instruction: extend_table(self.program, table, self.authority, batch.clone()),
                addresses: batch,
            });
        }
    }

    /// Record an operation whose transaction has landed.
    pub fn apply(&mut self, op: &TableOp) {
        match op {
            TableOp::Create { table, nonce, .. } => {
                if !self.tables.iter().any(|t| t.address == *table) {
                    info!(table = %table, nonce, "Created address table");
                    self.tables.push(AddressTable::new(
                        *table,
                        Some(self.authority),
                        Vec::new(),
                        self.table_capacity,
                    ));
                }
                self.next_nonce = self.next_nonce.max(nonce.saturating_add(1));
            }
            TableOp::Extend { table, addresses, .. } => {
                if let Some(t) = self.tables.iter_mut().find(|t| t.address == *table) {
                    for address in addresses {
                        if t.known.insert(*address) {
                            t.addresses.push(*address);
                            t.capacity_remaining = t.capacity_remaining.saturating_sub(1);
                        }
                    }
                    debug!(table = %table, added = addresses.len(), remaining = t.capacity_remaining, "Extended address table");
                }
            }
        }
    }
}
