//! Ledger endpoint and program configuration.

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ledger connection and program addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// JSON-RPC endpoint; `${VAR}` patterns are expanded from the environment
    pub rpc_url: String,
    /// Deadline for reads (milliseconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Deadline for submit-and-confirm (milliseconds)
    #[serde(default = "default_submit_timeout")]
    pub submit_timeout_ms: u64,
    /// Signing authority; also the owner of extendable address tables
    pub authority: Address,
    /// Program addresses
    pub programs: ProgramAddresses,
    /// Existing address tables to load at run start
    #[serde(default)]
    pub lookup_tables: Vec<Address>,
}

/// Program addresses the engine builds instructions for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProgramAddresses {
    /// Margin pool program (native withdraw/repay)
    pub margin_pool: Address,
    /// Address table program
    pub address_table: Address,
}

fn default_request_timeout() -> u64 {
    10_000
}
fn default_submit_timeout() -> u64 {
    60_000
}

impl LedgerConfig {
    /// Get read deadline as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Get submission deadline as Duration.
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    /// Expand environment variables in the endpoint URL.
    pub fn expand_env_vars(&mut self) {
        self.rpc_url = expand_env(&self.rpc_url);
    }
}

/// Expand ${VAR_NAME} patterns with environment variable values.
pub(crate) fn expand_env(s: &str) -> String {
    let mut result = s.to_string();
    let Ok(re) = regex_lite::Regex::new(r"\$\{([^}]+)\}") else {
        return result;
    };

    for cap in re.captures_iter(s) {
        if let (Some(full_match), Some(var_match)) = (cap.get(0), cap.get(1)) {
            let var_name = var_match.as_str();
            if let Ok(value) = std::env::var(var_name) {
                result = result.replace(full_match.as_str(), &value);
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ledger_config() {
        let toml_str = r#"
            rpc_url = "https://ledger.example/rpc"
            authority = "0x00000000000000000000000000000000000000a1"
            lookup_tables = ["0x00000000000000000000000000000000000000b1"]

            [programs]
            margin_pool = "0x00000000000000000000000000000000000000c1"
            address_table = "0x00000000000000000000000000000000000000c2"
        "#;

        let config: LedgerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.authority, Address::with_last_byte(0xa1));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.submit_timeout(), Duration::from_secs(60));
        assert_eq!(config.lookup_tables, vec![Address::with_last_byte(0xb1)]);
        assert_eq!(config.programs.address_table, Address::with_last_byte(0xc2));
    }

    #[test]
    fn test_expand_env() {
        std::env::set_var("DELEVERAGE_TEST_RPC_KEY", "secret123");
        let result = expand_env("https://rpc.example/${DELEVERAGE_TEST_RPC_KEY}/v1");
        assert_eq!(result, "https://rpc.example/secret123/v1");

        let untouched = expand_env("https://rpc.example/${DELEVERAGE_TEST_UNSET_VAR}");
        assert_eq!(untouched, "https://rpc.example/${DELEVERAGE_TEST_UNSET_VAR}");
    }
}
