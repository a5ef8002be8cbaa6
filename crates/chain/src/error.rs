//! Ledger error type and failure classification.

use alloy::transports::{RpcError, TransportError};
use thiserror::Error;

/// Message fragments the ledger uses when a transaction exceeds size or
/// account-reference limits.
const OVERSIZE_MARKERS: &[&str] = &[
    "too large",
    "transaction size",
    "too many account",
    "account keys",
    "exceeds maximum",
];

/// JSON-RPC error code for an oversize transaction.
const OVERSIZE_CODE: i64 = -32013;

/// JSON-RPC error codes used for rate limiting.
const RATE_LIMIT_CODES: &[i64] = &[429, -32005, -32429];

/// Errors returned by the ledger collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The call did not complete within its deadline. For submissions the
    /// transaction may still have landed.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: &'static str, after_ms: u64 },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// Transaction byte size or account-reference count exceeds protocol limits.
    #[error("transaction too large: {0}")]
    TransactionTooLarge(String),

    #[error("rejected by ledger (code {code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("failed to decode ledger response: {0}")]
    Decode(String),
}

impl LedgerError {
    /// Classify a JSON-RPC error response.
    pub fn from_rpc_error(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if code == OVERSIZE_CODE || OVERSIZE_MARKERS.iter().any(|m| lower.contains(m)) {
            Self::TransactionTooLarge(message)
        } else if RATE_LIMIT_CODES.contains(&code) || lower.contains("rate limit") {
            Self::RateLimited(message)
        } else {
            Self::Rejected { code, message }
        }
    }

    /// Whether a submission failed because the transaction is too large.
    pub fn is_oversize(&self) -> bool {
        matches!(self, Self::TransactionTooLarge(_))
    }

    /// Whether the caller may retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::RateLimited(_) | Self::Transport(_)
        )
    }

    /// Whether a submission's outcome is unknown (it may have landed).
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<TransportError> for LedgerError {
    fn from(err: TransportError) -> Self {
        match err {
            RpcError::ErrorResp(payload) => {
                Self::from_rpc_error(payload.code, payload.message.to_string())
            }
            RpcError::Transport(kind) => {
                let text = kind.to_string();
                if text.contains("429") || text.to_lowercase().contains("rate limit") {
                    Self::RateLimited(text)
                } else {
                    Self::Transport(text)
                }
            }
            RpcError::SerError(e) => Self::Decode(e.to_string()),
            RpcError::DeserError { err, .. } => Self::Decode(err.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}
