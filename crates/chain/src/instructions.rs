//! Instruction shapes for the margin pool, money-market adapters and the
//! address table program.
//!
//! Every instruction's data is encoded as `[tag] ++ abi.encode(args)`, where the
//! tag byte identifies the operation and the argument struct is tag-specific.
//!
//! # Example
//!
//! ```rust,ignore
//! let instructions = InstructionBuilder::new()
//!     .refresh_reserve(&adapter)
//!     .push(adapter_withdraw(&adapter, &balance, position, authority, None))
//!     .build();
//! ```

use alloy::primitives::{keccak256, Address, Bytes, U256};
use alloy::sol;
use alloy::sol_types::SolType;
use serde::{Deserialize, Serialize};

use crate::accounts::{AdapterState, Balance, Pool};

/// Operation tag, the first byte of every instruction's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InstructionTag {
    /// Withdraw from a native pool.
    /// Data: `abi.encode(uint256 amount, bool withdrawAll)`
    Withdraw = 1,

    /// Repay a native pool loan.
    /// Data: `abi.encode(uint256 amount, bool repayAll)`
    Repay = 2,

    /// Refresh an adapter reserve. No arguments.
    RefreshReserve = 3,

    /// Refresh an adapter obligation. No arguments.
    RefreshObligation = 4,

    /// Withdraw through an external adapter.
    /// Data: `abi.encode(uint256 amount, bool withdrawAll)`
    AdapterWithdraw = 5,

    /// Repay through an external adapter.
    /// Data: `abi.encode(uint256 amount, bool repayAll)`
    AdapterRepay = 6,

    /// Create an address table.
    /// Data: `abi.encode(uint64 nonce)`
    CreateTable = 7,

    /// Append addresses to an address table.
    /// Data: `abi.encode(address[] addresses)`
    ExtendTable = 8,
}

impl InstructionTag {
    /// Get tag from ID.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Withdraw),
            2 => Some(Self::Repay),
            3 => Some(Self::RefreshReserve),
            4 => Some(Self::RefreshObligation),
            5 => Some(Self::AdapterWithdraw),
            6 => Some(Self::AdapterRepay),
            7 => Some(Self::CreateTable),
            8 => Some(Self::ExtendTable),
            _ => None,
        }
    }

    /// Short name for logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Withdraw => "withdraw",
            Self::Repay => "repay",
            Self::RefreshReserve => "refresh_reserve",
            Self::RefreshObligation => "refresh_obligation",
            Self::AdapterWithdraw => "adapter_withdraw",
            Self::AdapterRepay => "adapter_repay",
            Self::CreateTable => "create_table",
            Self::ExtendTable => "extend_table",
        }
    }
}

// ABI encoding helper types
sol! {
    /// Withdraw arguments
    #[derive(Debug)]
    struct WithdrawArgs {
        uint256 amount;
        bool withdrawAll;
    }

    /// Repay arguments
    #[derive(Debug)]
    struct RepayArgs {
        uint256 amount;
        bool repayAll;
    }

    /// Create table arguments
    #[derive(Debug)]
    struct CreateTableArgs {
        uint64 nonce;
    }

    /// Extend table arguments
    #[derive(Debug)]
    struct ExtendTableArgs {
        address[] addresses;
    }
}

/// Account referenced by an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountMeta {
    pub address: Address,
    pub is_signer: bool,
    pub is_writable: bool,
}

impl AccountMeta {
    pub fn writable(address: Address) -> Self {
        Self { address, is_signer: false, is_writable: true }
    }

    pub fn readonly(address: Address) -> Self {
        Self { address, is_signer: false, is_writable: false }
    }

    pub fn signer(address: Address) -> Self {
        Self { address, is_signer: true, is_writable: false }
    }
}

/// A single program instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instruction {
    /// Program that executes the instruction
    pub program: Address,
    /// Accounts in program-defined order
    pub accounts: Vec<AccountMeta>,
    /// `[tag] ++ abi-encoded arguments`
    pub data: Bytes,
}

impl Instruction {
    fn new(program: Address, accounts: Vec<AccountMeta>, tag: InstructionTag, args: Vec<u8>) -> Self {
        let mut data = Vec::with_capacity(1 + args.len());
        data.push(tag as u8);
        data.extend_from_slice(&args);
        Self { program, accounts, data: Bytes::from(data) }
    }

    /// Operation tag, if the data carries a known one.
    pub fn tag(&self) -> Option<InstructionTag> {
        self.data.first().and_then(|id| InstructionTag::from_id(*id))
    }

    /// Human-readable label, e.g. `withdraw@0x…` naming the second account
    /// (the pool for withdraw and repay).
    pub fn label(&self) -> String {
        let name = self.tag().map(|t| t.name()).unwrap_or("unknown");
        match self.accounts.get(1).or_else(|| self.accounts.first()) {
            Some(meta) => format!("{name}@{}", meta.address),
            None => name.to_string(),
        }
    }

    /// Addresses of all accounts, in order.
    pub fn addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.accounts.iter().map(|m| m.address)
    }
}

/// Amount argument: a concrete amount, or the whole balance.
fn amount_args(amount: Option<U256>) -> (U256, bool) {
    match amount {
        Some(amount) => (amount, false),
        None => (U256::ZERO, true),
    }
}

/// Withdraw from a native pool into the position's token account.
///
/// `amount = None` withdraws the full balance.
pub fn withdraw(
    program: Address,
    pool: &Pool,
    balance: &Balance,
    position: Address,
    authority: Address,
    amount: Option<U256>,
) -> Instruction {
    let (amount, withdraw_all) = amount_args(amount);
    let args = WithdrawArgs { amount, withdrawAll: withdraw_all };
    Instruction::new(
        program,
        vec![
            AccountMeta::writable(position),
            AccountMeta::writable(pool.address),
            AccountMeta::writable(pool.vault),
            AccountMeta::writable(pool.deposit_note_mint),
            AccountMeta::writable(balance.note_account),
            AccountMeta::writable(balance.token_account),
            AccountMeta::signer(authority),
        ],
        InstructionTag::Withdraw,
        WithdrawArgs::abi_encode(&args),
    )
}

/// Repay a native pool loan from the position's token account.
///
/// `amount = None` repays the full loan.
pub fn repay(
    program: Address,
    pool: &Pool,
    balance: &Balance,
    position: Address,
    authority: Address,
    amount: Option<U256>,
) -> Instruction {
    let (amount, repay_all) = amount_args(amount);
    let args = RepayArgs { amount, repayAll: repay_all };
    Instruction::new(
        program,
        vec![
            AccountMeta::writable(position),
            AccountMeta::writable(pool.address),
            AccountMeta::writable(pool.vault),
            AccountMeta::writable(pool.loan_note_mint),
            AccountMeta::writable(balance.note_account),
            AccountMeta::writable(balance.token_account),
            AccountMeta::signer(authority),
        ],
        InstructionTag::Repay,
        RepayArgs::abi_encode(&args),
    )
}

/// Refresh an adapter reserve against its oracles.
pub fn refresh_reserve(adapter: &AdapterState) -> Instruction {
    let mut accounts = vec![
        AccountMeta::writable(adapter.reserve),
        AccountMeta::readonly(adapter.market),
    ];
    accounts.extend(adapter.oracles.iter().copied().map(AccountMeta::readonly));
    Instruction::new(adapter.program, accounts, InstructionTag::RefreshReserve, Vec::new())
}

/// Refresh an adapter obligation, listing every reserve it is exposed to.
pub fn refresh_obligation(adapter: &AdapterState, reserves: &[Address]) -> Instruction {
    let mut accounts = vec![
        AccountMeta::writable(adapter.obligation),
        AccountMeta::readonly(adapter.market),
    ];
    accounts.extend(reserves.iter().copied().map(AccountMeta::readonly));
    Instruction::new(adapter.program, accounts, InstructionTag::RefreshObligation, Vec::new())
}

/// Withdraw through an external adapter into the position's token account.
pub fn adapter_withdraw(
    adapter: &AdapterState,
    balance: &Balance,
    position: Address,
    authority: Address,
    amount: Option<U256>,
) -> Instruction {
    let (amount, withdraw_all) = amount_args(amount);
    let args = WithdrawArgs { amount, withdrawAll: withdraw_all };
    Instruction::new(
        adapter.program,
        vec![
            AccountMeta::writable(position),
            AccountMeta::readonly(adapter.pool),
            AccountMeta::writable(adapter.obligation),
            AccountMeta::readonly(adapter.market),
            AccountMeta::writable(adapter.reserve),
            AccountMeta::writable(adapter.collateral_supply),
            AccountMeta::writable(adapter.liquidity_supply),
            AccountMeta::writable(balance.note_account),
            AccountMeta::writable(balance.token_account),
            AccountMeta::signer(authority),
        ],
        InstructionTag::AdapterWithdraw,
        WithdrawArgs::abi_encode(&args),
    )
}

/// Repay through an external adapter from the position's token account.
pub fn adapter_repay(
    adapter: &AdapterState,
    balance: &Balance,
    position: Address,
    authority: Address,
    amount: Option<U256>,
) -> Instruction {
    let (amount, repay_all) = amount_args(amount);
    let args = RepayArgs { amount, repayAll: repay_all };
    Instruction::new(
        adapter.program,
        vec![
            AccountMeta::writable(position),
            AccountMeta::readonly(adapter.pool),
            AccountMeta::writable(adapter.obligation),
            AccountMeta::readonly(adapter.market),
            AccountMeta::writable(adapter.reserve),
            AccountMeta::writable(adapter.liquidity_supply),
            AccountMeta::writable(balance.note_account),
            AccountMeta::writable(balance.token_account),
            AccountMeta::signer(authority),
        ],
        InstructionTag::AdapterRepay,
        RepayArgs::abi_encode(&args),
    )
}

/// Derive the address of the `nonce`-th table created by `authority`.
pub fn derive_table_address(authority: Address, nonce: u64) -> Address {
    let mut seed = Vec::with_capacity(28);
    seed.extend_from_slice(authority.as_slice());
    seed.extend_from_slice(&nonce.to_be_bytes());
    Address::from_word(keccak256(seed))
}

/// Create a new address table owned by `authority`.
pub fn create_table(program: Address, table: Address, authority: Address, nonce: u64) -> Instruction {
    let args = CreateTableArgs { nonce };
    Instruction::new(
        program,
        vec![AccountMeta::writable(table), AccountMeta::signer(authority)],
        InstructionTag::CreateTable,
        CreateTableArgs::abi_encode(&args),
    )
}

/// Append addresses to an address table.
pub fn extend_table(
    program: Address,
    table: Address,
    authority: Address,
    addresses: Vec<Address>,
) -> Instruction {
    let args = ExtendTableArgs { addresses };
    Instruction::new(
        program,
        vec![AccountMeta::writable(table), AccountMeta::signer(authority)],
        InstructionTag::ExtendTable,
        ExtendTableArgs::abi_encode(&args),
    )
}

/// Decode the addresses carried by an extend-table instruction.
pub fn decode_extend_addresses(instruction: &Instruction) -> Option<Vec<Address>> {
    if instruction.tag()? != InstructionTag::ExtendTable {
        return None;
    }
    ExtendTableArgs::abi_decode(&instruction.data[1..], true)
        .ok()
        .map(|args| args.addresses)
}

/// Decode the amount argument of a withdraw or repay instruction.
///
/// Returns `None` for the "whole balance" form.
pub fn decode_amount(instruction: &Instruction) -> Option<U256> {
    let payload = &instruction.data[1..];
    match instruction.tag()? {
        InstructionTag::Withdraw | InstructionTag::AdapterWithdraw => {
            let args = WithdrawArgs::abi_decode(payload, true).ok()?;
            (!args.withdrawAll).then_some(args.amount)
        }
        InstructionTag::Repay | InstructionTag::AdapterRepay => {
            let args = RepayArgs::abi_decode(payload, true).ok()?;
            (!args.repayAll).then_some(args.amount)
        }
        _ => None,
    }
}

/// Fluent collector for instruction sequences.
#[derive(Debug, Default)]
pub struct InstructionBuilder {
    instructions: Vec<Instruction>,
}

impl InstructionBuilder {
    /// Create a new instruction builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an already-built instruction.
    pub fn push(mut self, instruction: Instruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    /// Add an adapter reserve refresh.
    pub fn refresh_reserve(self, adapter: &AdapterState) -> Self {
        self.push(refresh_reserve(adapter))
    }

    /// Add an adapter obligation refresh.
    pub fn refresh_obligation(self, adapter: &AdapterState, reserves: &[Address]) -> Self {
        self.push(refresh_obligation(adapter, reserves))
    }

    /// Finish the sequence.
    pub fn build(self) -> Vec<Instruction> {
        self.instructions
    }
}
