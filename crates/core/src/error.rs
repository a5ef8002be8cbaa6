//! Engine error taxonomy.

use alloy::primitives::Address;
use deleverage_chain::LedgerError;
use serde::Serialize;
use thiserror::Error;

/// Errors raised while deleveraging a position.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeleverageError {
    // -- Input errors (caller-fixable, no side effects) --
    #[error("pool {pool} referenced by the position was not fetched")]
    MissingPoolData { pool: Address },

    #[error("pool {pool} has unknown integration kind '{kind}'")]
    UnknownIntegrationKind { pool: Address, kind: String },

    #[error("adapter state for pool {pool} was not fetched")]
    MissingAdapterState { pool: Address },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // -- Address tables --
    #[error("{required} addresses cannot be placed: {reason}")]
    TableCapacityExhausted { required: usize, reason: String },

    // -- Submission --
    #[error("transaction still oversize after {attempts} extension pass(es): {detail}")]
    PersistentOversizeFailure { attempts: u32, detail: String },

    #[error("submission outcome unknown and position state unchanged: {0}")]
    UnknownSubmissionOutcome(LedgerError),

    #[error("submission failed: {0}")]
    SubmissionFailed(LedgerError),

    // -- Arithmetic --
    #[error("arithmetic overflow in {0}")]
    ArithmeticOverflow(&'static str),

    // -- Ledger reads --
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl DeleverageError {
    /// Caller-fixable input error.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::MissingPoolData { .. }
                | Self::UnknownIntegrationKind { .. }
                | Self::MissingAdapterState { .. }
                | Self::InvalidConfig(_)
        )
    }

    /// Whether the run may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Ledger(e) => e.is_retryable(),
            Self::UnknownSubmissionOutcome(_) => true,
            _ => false,
        }
    }
}

/// A terminal failure for one position, with enough context to resume by hand.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailure {
    pub position: Address,
    #[serde(serialize_with = "serialize_display")]
    pub error: DeleverageError,
    /// Last step that completed, e.g. `valued` or `submitted:withdraw@0x…`
    pub last_successful_step: Option<String>,
    /// Label of the last instruction sent to the ledger
    pub last_instruction_attempted: Option<String>,
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "position {}: {}", self.position, self.error)?;
        if let Some(step) = &self.last_successful_step {
            write!(f, " (last successful step: {step})")?;
        }
        if let Some(ix) = &self.last_instruction_attempted {
            write!(f, " (last instruction: {ix})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

fn serialize_display<S: serde::Serializer, T: std::fmt::Display>(
    value: &T,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

pub type Result<T> = std::result::Result<T, DeleverageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let missing = DeleverageError::MissingPoolData { pool: Address::ZERO };
        assert!(missing.is_input_error());
        assert!(!missing.is_retryable());

        let timeout = LedgerError::Timeout { operation: "fetch_position", after_ms: 5 };
        let read: DeleverageError = timeout.clone().into();
        assert!(read.is_retryable());
        assert!(!read.is_input_error());

        assert!(DeleverageError::UnknownSubmissionOutcome(timeout).is_retryable());
        assert!(!DeleverageError::PersistentOversizeFailure { attempts: 1, detail: "x".into() }.is_retryable());
    }

    #[test]
    fn test_run_failure_display() {
        let failure = RunFailure {
            position: Address::repeat_byte(1),
            error: DeleverageError::ArithmeticOverflow("repay amount"),
            last_successful_step: Some("planned".into()),
            last_instruction_attempted: None,
        };
        let text = failure.to_string();
        assert!(text.contains("arithmetic overflow in repay amount"));
        assert!(text.contains("last successful step: planned"));

        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["lastSuccessfulStep"], "planned");
        assert_eq!(json["error"], "arithmetic overflow in repay amount");
    }
}
