//! Ledger account types read by the deleveraging engine.
//!
//! These mirror what the margin program stores on the ledger: a position with
//! its balances, the pools those balances point at, the per-pool state of
//! external money-market adapters, and compact address tables.

use alloy::primitives::Address;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;
use std::hash::{Hash, Hasher};

/// How a pool reaches its underlying liquidity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IntegrationKind {
    /// Liquidity held directly by the margin pool program
    Native,
    /// External money market that needs its reserve refreshed before use
    ReserveAdapter,
    /// External money market that needs reserve and obligation refreshes before use
    ObligationAdapter,
    /// Tag this build does not know how to interact with
    Unknown(String),
}

impl IntegrationKind {
    /// Parse from the ledger's string tag.
    pub fn from_tag(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "native" | "margin-pool" => Self::Native,
            "reserve-adapter" | "reserve_adapter" => Self::ReserveAdapter,
            "obligation-adapter" | "obligation_adapter" => Self::ObligationAdapter,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// String tag as stored on the ledger.
    pub fn tag(&self) -> &str {
        match self {
            Self::Native => "native",
            Self::ReserveAdapter => "reserve-adapter",
            Self::ObligationAdapter => "obligation-adapter",
            Self::Unknown(tag) => tag,
        }
    }

    /// Whether interacting with the pool goes through an external adapter.
    pub fn is_adapter(&self) -> bool {
        matches!(self, Self::ReserveAdapter | Self::ObligationAdapter)
    }
}

impl Serialize for IntegrationKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.tag())
    }
}

impl<'de> Deserialize<'de> for IntegrationKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(Self::from_tag(&tag))
    }
}

/// A lending pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    /// Pool account address
    pub address: Address,
    /// Underlying token mint
    pub token_mint: Address,
    /// Vault holding the pool's liquidity
    pub vault: Address,
    /// Mint of the pool's deposit notes
    pub deposit_note_mint: Address,
    /// Mint of the pool's loan notes
    pub loan_note_mint: Address,
    /// Latest oracle quote for one whole token
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    /// Underlying base units per deposit note
    #[serde(with = "rust_decimal::serde::str")]
    pub deposit_note_rate: Decimal,
    /// Underlying base units per loan note
    #[serde(with = "rust_decimal::serde::str")]
    pub loan_note_rate: Decimal,
    /// Token decimals
    pub decimals: u8,
    /// Integration kind tag
    pub kind: IntegrationKind,
    /// Collateral weight used when opening positions
    #[serde(with = "rust_decimal::serde::str")]
    pub init_weight: Decimal,
    /// Collateral weight used for maintenance checks
    #[serde(with = "rust_decimal::serde::str")]
    pub maintenance_weight: Decimal,
    /// Whether the pool has unclaimed third-party rewards outstanding
    #[serde(default)]
    pub has_outstanding_rewards: bool,
}

/// A single pool exposure within a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    /// Pool this balance is held in
    pub pool: Address,
    /// Note (share) amount; `None` when the ledger value is missing or unreadable
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub shares: Option<Decimal>,
    /// Collateral (deposit notes) when true, debt (loan notes) otherwise
    pub is_collateral: bool,
    /// Pool accrues third-party rewards on this balance
    #[serde(default)]
    pub has_external_rewards: bool,
    /// Position-owned account holding the notes
    pub note_account: Address,
    /// Position-owned account for the underlying token
    pub token_account: Address,
}

impl Balance {
    /// Share amount if it is a positive number.
    pub fn positive_shares(&self) -> Option<Decimal> {
        self.shares.filter(|s| s.is_sign_positive() && !s.is_zero())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Text(String),
    Number(f64),
    Other(serde::de::IgnoredAny),
}

/// Decode a share amount without failing the whole position on a bad value.
fn lenient_decimal<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Decimal>, D::Error> {
    let raw = Option::<RawAmount>::deserialize(deserializer)?;
    Ok(match raw {
        Some(RawAmount::Text(text)) => {
            let text = text.trim();
            text.parse::<Decimal>()
                .ok()
                .or_else(|| Decimal::from_scientific(text).ok())
        }
        Some(RawAmount::Number(n)) if n.is_finite() => Decimal::from_f64(n),
        _ => None,
    })
}

/// A margin position: one account holding zero or more balances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// Position account address
    pub address: Address,
    /// Owning wallet
    pub owner: Address,
    /// Balances in discovery order
    #[serde(default)]
    pub balances: SmallVec<[Balance; 8]>,
}

impl Position {
    /// Collateral balances in discovery order.
    pub fn collateral(&self) -> impl Iterator<Item = &Balance> {
        self.balances.iter().filter(|b| b.is_collateral)
    }

    /// Debt balances in discovery order.
    pub fn debts(&self) -> impl Iterator<Item = &Balance> {
        self.balances.iter().filter(|b| !b.is_collateral)
    }

    /// Every pool referenced by this position, deduplicated, in discovery order.
    pub fn referenced_pools(&self) -> Vec<Address> {
        let mut pools: Vec<Address> = Vec::with_capacity(self.balances.len());
        for balance in &self.balances {
            if !pools.contains(&balance.pool) {
                pools.push(balance.pool);
            }
        }
        pools
    }

    /// Pools that appear both as collateral and as debt.
    ///
    /// The program never produces these; a non-empty result means the snapshot
    /// is corrupt.
    pub fn conflicting_pools(&self) -> Vec<Address> {
        let mut conflicts = Vec::new();
        for c in self.collateral() {
            if self.debts().any(|d| d.pool == c.pool) && !conflicts.contains(&c.pool) {
                conflicts.push(c.pool);
            }
        }
        conflicts
    }

    /// Hash of balance state, used to detect whether a transaction landed.
    pub fn state_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for balance in &self.balances {
            balance.pool.hash(&mut hasher);
            balance.is_collateral.hash(&mut hasher);
            balance
                .shares
                .map(|s| s.normalize().to_string())
                .hash(&mut hasher);
        }
        hasher.finish()
    }
}

/// State of an external money-market adapter for one pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterState {
    /// Margin pool this adapter state belongs to
    pub pool: Address,
    /// Adapter program
    pub program: Address,
    /// Money-market (lending market) account
    pub market: Address,
    /// Reserve backing the pool
    pub reserve: Address,
    /// Obligation the position's exposure is booked under
    pub obligation: Address,
    /// Price oracles the reserve refresh reads
    #[serde(default)]
    pub oracles: SmallVec<[Address; 2]>,
    /// Reserve liquidity supply account
    pub liquidity_supply: Address,
    /// Reserve collateral supply account
    pub collateral_supply: Address,
}

/// A compact address table as stored on the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressTableAccount {
    /// Table address
    pub address: Address,
    /// Authority allowed to extend the table; `None` once frozen
    #[serde(default)]
    pub authority: Option<Address>,
    /// Stored addresses, in slot order
    #[serde(default)]
    pub addresses: Vec<Address>,
}
