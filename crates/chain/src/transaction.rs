//! Transaction compilation and size estimation.
//!
//! A transaction references every account its instructions touch. Accounts can
//! be listed inline (20 bytes each) or resolved through an address table
//! (1 byte each), which is what keeps large settlement transactions under the
//! ledger's size limit.

use std::collections::HashMap;

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::instructions::Instruction;

const ADDRESS_BYTES: usize = 20;
const SIGNATURE_BYTES: usize = 64;
const HEADER_BYTES: usize = 3;
const BLOCKHASH_BYTES: usize = 32;
const VERSION_PREFIX_BYTES: usize = 1;

/// Protocol limits a transaction must respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLimits {
    /// Maximum serialized transaction size
    #[serde(default = "default_max_transaction_bytes")]
    pub max_transaction_bytes: usize,
    /// Maximum distinct accounts a transaction may reference
    #[serde(default = "default_max_account_refs")]
    pub max_account_refs: usize,
}

fn default_max_transaction_bytes() -> usize {
    1232
}

fn default_max_account_refs() -> usize {
    64
}

impl Default for TransactionLimits {
    fn default() -> Self {
        Self {
            max_transaction_bytes: default_max_transaction_bytes(),
            max_account_refs: default_max_account_refs(),
        }
    }
}

/// Contents of an address table as seen by the compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableView {
    pub address: Address,
    pub addresses: Vec<Address>,
}

/// Accounts resolved through one address table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLookup {
    pub table: Address,
    pub writable_indexes: Vec<u8>,
    pub readonly_indexes: Vec<u8>,
}

impl TableLookup {
    fn encoded_len(&self) -> usize {
        ADDRESS_BYTES
            + compact_len(self.writable_indexes.len())
            + self.writable_indexes.len()
            + compact_len(self.readonly_indexes.len())
            + self.readonly_indexes.len()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct AccountFlags {
    signer: bool,
    writable: bool,
    program: bool,
}

/// A transaction with its account list resolved.
#[derive(Debug, Clone)]
pub struct CompiledTransaction {
    /// Accounts listed inline, signers first
    pub static_keys: Vec<Address>,
    /// Accounts resolved through tables
    pub lookups: Vec<TableLookup>,
    /// Number of required signatures
    pub signature_count: usize,
    /// Estimated serialized size
    pub size_bytes: usize,
    /// Distinct accounts referenced, inline or through tables
    pub account_refs: usize,
}

impl CompiledTransaction {
    /// Resolve accounts against the given tables and estimate the wire size.
    ///
    /// Signers and invoked programs are always listed inline. Any other account
    /// found in a table is resolved through the first table that holds it.
    pub fn compile(instructions: &[Instruction], signers: &[Address], tables: &[TableView]) -> Self {
        let (order, flags) = collect_accounts(instructions, signers);

        let mut slots: HashMap<Address, (usize, u8)> = HashMap::new();
        for (table_index, table) in tables.iter().enumerate() {
            for (slot, address) in table.addresses.iter().enumerate() {
                if let Ok(slot) = u8::try_from(slot) {
                    slots.entry(*address).or_insert((table_index, slot));
                }
            }
        }

        let mut signer_keys = Vec::new();
        let mut other_keys = Vec::new();
        let mut lookups: Vec<TableLookup> = tables
            .iter()
            .map(|t| TableLookup {
                table: t.address,
                writable_indexes: Vec::new(),
                readonly_indexes: Vec::new(),
            })
            .collect();

        for address in &order {
            let f = flags[address];
            if f.signer {
                signer_keys.push(*address);
                continue;
            }
            match slots.get(address) {
                Some((table_index, slot)) if !f.program => {
                    let lookup = &mut lookups[*table_index];
                    if f.writable {
                        lookup.writable_indexes.push(*slot);
                    } else {
                        lookup.readonly_indexes.push(*slot);
                    }
                }
                _ => other_keys.push(*address),
            }
        }

        lookups.retain(|l| !l.writable_indexes.is_empty() || !l.readonly_indexes.is_empty());

        let signature_count = signer_keys.len();
        let mut static_keys = signer_keys;
        static_keys.extend(other_keys);

        let instruction_bytes: usize = instructions
            .iter()
            .map(|ix| {
                1 + compact_len(ix.accounts.len())
                    + ix.accounts.len()
                    + compact_len(ix.data.len())
                    + ix.data.len()
            })
            .sum();
        let lookup_bytes: usize = lookups.iter().map(TableLookup::encoded_len).sum();

        let message_bytes = VERSION_PREFIX_BYTES
            + HEADER_BYTES
            + compact_len(static_keys.len())
            + static_keys.len() * ADDRESS_BYTES
            + BLOCKHASH_BYTES
            + compact_len(instructions.len())
            + instruction_bytes
            + compact_len(lookups.len())
            + lookup_bytes;

        let size_bytes =
            compact_len(signature_count) + signature_count * SIGNATURE_BYTES + message_bytes;

        Self {
            static_keys,
            lookups,
            signature_count,
            size_bytes,
            account_refs: order.len(),
        }
    }

    /// Number of accounts resolved through tables.
    pub fn looked_up(&self) -> usize {
        self.lookups
            .iter()
            .map(|l| l.writable_indexes.len() + l.readonly_indexes.len())
            .sum()
    }

    /// Reject the transaction if it exceeds either limit.
    pub fn check_limits(&self, limits: &TransactionLimits) -> Result<(), LedgerError> {
        if self.size_bytes > limits.max_transaction_bytes {
            return Err(LedgerError::TransactionTooLarge(format!(
                "transaction size {} exceeds maximum {}",
                self.size_bytes, limits.max_transaction_bytes
            )));
        }
        if self.account_refs > limits.max_account_refs {
            return Err(LedgerError::TransactionTooLarge(format!(
                "too many account references: {} > {}",
                self.account_refs, limits.max_account_refs
            )));
        }
        Ok(())
    }
}

/// Addresses a table could hold for these instructions: every referenced
/// account except signers and invoked programs, deduplicated in first-seen order.
pub fn table_candidates(instructions: &[Instruction], signers: &[Address]) -> Vec<Address> {
    let (order, flags) = collect_accounts(instructions, signers);
    order
        .into_iter()
        .filter(|a| {
            let f = flags[a];
            !f.signer && !f.program
        })
        .collect()
}

fn collect_accounts(
    instructions: &[Instruction],
    signers: &[Address],
) -> (Vec<Address>, HashMap<Address, AccountFlags>) {
    let mut order = Vec::new();
    let mut flags: HashMap<Address, AccountFlags> = HashMap::new();

    let mut touch = |address: Address, update: &dyn Fn(&mut AccountFlags)| {
        let entry = flags.entry(address).or_insert_with(|| {
            order.push(address);
            AccountFlags::default()
        });
        update(entry);
    };

    for signer in signers {
        touch(*signer, &|f| {
            f.signer = true;
            f.writable = true;
        });
    }
    for ix in instructions {
        for meta in &ix.accounts {
            touch(meta.address, &|f| {
                f.signer |= meta.is_signer;
                f.writable |= meta.is_writable;
            });
        }
        touch(ix.program, &|f| f.program = true);
    }

    (order, flags)
}

/// Encoded length of a compact-u16 length prefix.
fn compact_len(n: usize) -> usize {
    match n {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        _ => 3,
    }
}
