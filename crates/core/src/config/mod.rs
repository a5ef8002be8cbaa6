//! Configuration for the deleveraging engine.
//!
//! This module provides:
//! - Run parameters (valuation margin, planning thresholds, packing limits)
//! - Ledger configuration (endpoint, timeouts, authority, programs, tables)
//! - Application configuration tying both to the positions to process

mod ledger;
mod run;

use alloy::primitives::Address;
use anyhow::Context;
use serde::{Deserialize, Serialize};

pub use ledger::{LedgerConfig, ProgramAddresses};
pub use run::RunConfig;

/// Complete application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub run: RunConfig,
    /// Positions to deleverage
    #[serde(default)]
    pub positions: Vec<Address>,
}

impl AppConfig {
    /// Parse a TOML document, expanding environment variables.
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.ledger.expand_env_vars();
        config.run.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        Self::from_toml(&content).with_context(|| format!("invalid config file {path}"))
    }

    /// Load from the file named by `DELEVERAGE_CONFIG` (default `config/deleverage.toml`),
    /// letting `DELEVERAGE_POSITIONS` override the position list.
    pub fn from_env() -> anyhow::Result<Self> {
        let path = std::env::var("DELEVERAGE_CONFIG")
            .unwrap_or_else(|_| "config/deleverage.toml".to_string());
        let mut config = Self::from_file(&path)?;

        if let Ok(list) = std::env::var("DELEVERAGE_POSITIONS") {
            config.positions = parse_positions(&list)?;
        }
        Ok(config)
    }
}

/// Parse a comma-separated list of addresses.
fn parse_positions(list: &str) -> anyhow::Result<Vec<Address>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Address>()
                .with_context(|| format!("invalid position address '{s}'"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_config_from_toml() {
        std::env::set_var("DELEVERAGE_TEST_HOST", "ledger.internal");
        let config = AppConfig::from_toml(
            r#"
            positions = ["0x0000000000000000000000000000000000000011"]

            [ledger]
            rpc_url = "https://${DELEVERAGE_TEST_HOST}/rpc"
            authority = "0x00000000000000000000000000000000000000a1"

            [ledger.programs]
            margin_pool = "0x00000000000000000000000000000000000000c1"
            address_table = "0x00000000000000000000000000000000000000c2"

            [run]
            profile = "custom"
            dry_run = true
            "#,
        )
        .unwrap();

        assert_eq!(config.ledger.rpc_url, "https://ledger.internal/rpc");
        assert_eq!(config.positions, vec![Address::with_last_byte(0x11)]);
        assert!(config.run.dry_run);
        assert_eq!(config.run.max_extend_attempts, 1);
    }

    #[test]
    fn test_invalid_run_config_rejected() {
        let result = AppConfig::from_toml(
            r#"
            [ledger]
            rpc_url = "http://localhost:8899"
            authority = "0x00000000000000000000000000000000000000a1"
            programs = { margin_pool = "0x00000000000000000000000000000000000000c1", address_table = "0x00000000000000000000000000000000000000c2" }

            [run]
            batch_concurrency = 0
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_positions() {
        let parsed = parse_positions(
            "0x0000000000000000000000000000000000000001, 0x0000000000000000000000000000000000000002,",
        )
        .unwrap();
        assert_eq!(parsed, vec![Address::with_last_byte(1), Address::with_last_byte(2)]);
        assert!(parse_positions("0xnot-an-address").is_err());
    }
}
