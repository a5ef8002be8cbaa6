//! Per-position run reports.

use alloy::primitives::{Address, B256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// How a position's run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    /// Debt covered, or left below dust tolerance
    Settled,
    /// Collateral ran out before the debt was covered
    SettlementInsufficient,
    /// Position has no debt
    NoDebt,
    /// Planned and compiled, nothing submitted
    DryRun,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Settled => "settled",
            Self::SettlementInsufficient => "settlement_insufficient",
            Self::NoDebt => "no_debt",
            Self::DryRun => "dry_run",
        }
    }
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of deleveraging one position.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub position: Address,
    pub steps_planned: usize,
    pub steps_executed: usize,
    #[serde(with = "rust_decimal::serde::str")]
    pub final_debt_value: Decimal,
    /// Table create/extend operations that landed (or were simulated in a dry run)
    pub tables_extended: usize,
    pub terminal_status: TerminalStatus,
    /// Signature of the settlement transaction
    pub signature: Option<B256>,
    /// False when the transaction was inferred to have landed after a submit timeout
    pub outcome_confirmed: bool,
    /// Estimated size of the settlement transaction
    pub transaction_bytes: Option<usize>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Report for a position that needs nothing done.
    pub fn no_debt(position: Address, started_at: DateTime<Utc>) -> Self {
        Self {
            position,
            steps_planned: 0,
            steps_executed: 0,
            final_debt_value: Decimal::ZERO,
            tables_extended: 0,
            terminal_status: TerminalStatus::NoDebt,
            signature: None,
            outcome_confirmed: true,
            transaction_bytes: None,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Run time in milliseconds.
    pub fn elapsed_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}
