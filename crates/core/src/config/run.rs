//! Per-run engine parameters with profile support.
//!
//! Provides the parameters every entry point takes explicitly, with
//! profiles for testing and production.

use alloy::primitives::Address;
use deleverage_chain::instructions::extend_table;
use deleverage_chain::{CompiledTransaction, TransactionLimits};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{DeleverageError, Result};

/// Table slots are addressed by a one-byte index.
pub const MAX_TABLE_SLOTS: usize = 256;

/// Parameters for one deleverage run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    /// Fraction added to debt prices and removed from collateral prices
    #[serde(default = "default_confidence_margin", with = "rust_decimal::serde::str")]
    pub confidence_margin: Decimal,

    /// Seizable value below which reward-earning collateral is left alone
    #[serde(default = "default_emissions_floor", with = "rust_decimal::serde::str")]
    pub emissions_floor: Decimal,

    /// Pools to seize from first, in order; unlisted pools follow in discovery order
    #[serde(default)]
    pub collateral_preference_order: Vec<Address>,

    /// Table extension passes allowed per failing transaction
    #[serde(default = "default_max_extend_attempts")]
    pub max_extend_attempts: u32,

    /// Addresses carried by one extend instruction
    #[serde(default = "default_max_addresses_per_extend")]
    pub max_addresses_per_extend: usize,

    /// Maximum addresses one table can hold
    #[serde(default = "default_table_capacity")]
    pub table_capacity: usize,

    /// Proportional amounts below this many base units are treated as zero
    #[serde(default = "default_withdraw_dust_units")]
    pub withdraw_dust_units: u64,

    /// Positions processed concurrently in a batch
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,

    /// Plan and compile without submitting
    #[serde(default)]
    pub dry_run: bool,

    /// Transaction size limits
    #[serde(default)]
    pub limits: TransactionLimits,
}

fn default_profile_name() -> String {
    "default".to_string()
}
fn default_confidence_margin() -> Decimal {
    Decimal::new(2, 2)
}
fn default_emissions_floor() -> Decimal {
    Decimal::new(1, 1)
}
fn default_max_extend_attempts() -> u32 {
    1
}
fn default_max_addresses_per_extend() -> usize {
    20
}
fn default_table_capacity() -> usize {
    256
}
fn default_withdraw_dust_units() -> u64 {
    1
}
fn default_batch_concurrency() -> usize {
    4
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            confidence_margin: default_confidence_margin(),
            emissions_floor: default_emissions_floor(),
            collateral_preference_order: Vec::new(),
            max_extend_attempts: default_max_extend_attempts(),
            max_addresses_per_extend: default_max_addresses_per_extend(),
            table_capacity: default_table_capacity(),
            withdraw_dust_units: default_withdraw_dust_units(),
            batch_concurrency: default_batch_concurrency(),
            dry_run: false,
            limits: TransactionLimits::default(),
        }
    }
}

impl RunConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Testing profile: dry run, no reward floor, single worker.
    pub fn testing() -> Self {
        Self {
            profile: "testing".to_string(),
            emissions_floor: Decimal::ZERO,
            batch_concurrency: 1,
            dry_run: true,
            ..Default::default()
        }
    }

    /// Production profile with a wider price margin.
    pub fn production() -> Self {
        Self {
            profile: "production".to_string(),
            confidence_margin: Decimal::new(3, 2),
            emissions_floor: Decimal::ONE,
            batch_concurrency: 8,
            ..Default::default()
        }
    }

    /// Profile by name. Supported values: testing, production; anything else
    /// is the default profile.
    pub fn from_profile(profile: &str) -> Self {
        match profile.to_lowercase().as_str() {
            "testing" | "test" => Self::testing(),
            "production" | "prod" => Self::production(),
            _ => Self::default(),
        }
    }

    /// Overlay a profile's tunables on this configuration.
    ///
    /// Pool preference, packing limits and table settings are kept. A profile
    /// can switch dry run on but never off.
    pub fn apply_profile(&mut self, profile: &str) {
        let tunables = Self::from_profile(profile);
        self.profile = tunables.profile;
        self.confidence_margin = tunables.confidence_margin;
        self.emissions_floor = tunables.emissions_floor;
        self.batch_concurrency = tunables.batch_concurrency;
        self.dry_run |= tunables.dry_run;
    }

    /// Reject parameter combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.confidence_margin.is_sign_negative() || self.confidence_margin >= Decimal::ONE {
            return Err(DeleverageError::InvalidConfig(format!(
                "confidence_margin must be in [0, 1), got {}",
                self.confidence_margin
            )));
        }
        if self.emissions_floor.is_sign_negative() {
            return Err(DeleverageError::InvalidConfig(
                "emissions_floor must not be negative".to_string(),
            ));
        }
        if self.table_capacity == 0 || self.max_addresses_per_extend == 0 {
            return Err(DeleverageError::InvalidConfig(
                "table_capacity and max_addresses_per_extend must be positive".to_string(),
            ));
        }
        if self.table_capacity > MAX_TABLE_SLOTS {
            return Err(DeleverageError::InvalidConfig(format!(
                "table_capacity {} exceeds the {MAX_TABLE_SLOTS} slots a table index can address",
                self.table_capacity
            )));
        }
        if self.max_addresses_per_extend > MAX_TABLE_SLOTS {
            return Err(DeleverageError::InvalidConfig(format!(
                "max_addresses_per_extend {} exceeds the {MAX_TABLE_SLOTS} slots of a table",
                self.max_addresses_per_extend
            )));
        }
        self.check_extend_fits()?;
        if self.batch_concurrency == 0 {
            return Err(DeleverageError::InvalidConfig(
                "batch_concurrency must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// A full extend batch must compile within `limits` on its own.
    fn check_extend_fits(&self) -> Result<()> {
        let authority = Address::repeat_byte(0x01);
        let batch = vec![Address::ZERO; self.max_addresses_per_extend];
        let instruction = extend_table(Address::repeat_byte(0x02), Address::repeat_byte(0x03), authority, batch);
        CompiledTransaction::compile(&[instruction], &[authority], &[])
            .check_limits(&self.limits)
            .map_err(|e| {
                DeleverageError::InvalidConfig(format!(
                    "max_addresses_per_extend {} does not fit in one transaction: {e}",
                    self.max_addresses_per_extend
                ))
            })
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, dry_run = self.dry_run, "Run configuration loaded");
        tracing::info!(
            confidence_margin = %self.confidence_margin,
            emissions_floor = %self.emissions_floor,
            preferred_pools = self.collateral_preference_order.len(),
            withdraw_dust_units = self.withdraw_dust_units,
            "Valuation and planning"
        );
        tracing::info!(
            max_extend_attempts = self.max_extend_attempts,
            max_addresses_per_extend = self.max_addresses_per_extend,
            table_capacity = self.table_capacity,
            max_transaction_bytes = self.limits.max_transaction_bytes,
            max_account_refs = self.limits.max_account_refs,
            "Transaction packing"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.confidence_margin, dec!(0.02));
        assert_eq!(config.emissions_floor, dec!(0.1));
        assert_eq!(config.max_extend_attempts, 1);
        assert_eq!(config.limits.max_transaction_bytes, 1232);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: RunConfig = toml::from_str(
            r#"
            confidence_margin = "0.05"
            collateral_preference_order = ["0x00000000000000000000000000000000000000aa"]

            [limits]
            max_account_refs = 128
            "#,
        )
        .unwrap();
        assert_eq!(config.confidence_margin, dec!(0.05));
        assert_eq!(config.collateral_preference_order, vec![Address::with_last_byte(0xaa)]);
        assert_eq!(config.limits.max_account_refs, 128);
        assert_eq!(config.limits.max_transaction_bytes, 1232);
        assert_eq!(config.table_capacity, 256);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RunConfig::default();
        config.confidence_margin = dec!(1);
        assert!(matches!(config.validate(), Err(DeleverageError::InvalidConfig(_))));

        let mut config = RunConfig::default();
        config.max_addresses_per_extend = 0;
        assert!(config.validate().is_err());

        assert!(RunConfig::testing().validate().is_ok());
        assert!(RunConfig::production().validate().is_ok());
    }

    #[test]
    fn test_validate_extend_batch_fits_limits() {
        // An extend of N addresses compiles to 267 + 32N bytes.
        let mut config = RunConfig::default();
        config.max_addresses_per_extend = 30;
        assert!(config.validate().is_ok());

        config.max_addresses_per_extend = 31;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_addresses_per_extend 31"));

        config.limits.max_transaction_bytes = 2000;
        assert!(config.validate().is_ok());

        let mut config = RunConfig::default();
        config.limits.max_transaction_bytes = 600;
        assert!(config.validate().is_err());
        config.max_addresses_per_extend = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_apply_profile_keeps_file_settings() {
        let mut config: RunConfig = toml::from_str(
            r#"
            confidence_margin = "0.05"
            collateral_preference_order = ["0x00000000000000000000000000000000000000aa"]
            max_addresses_per_extend = 10
            dry_run = true

            [limits]
            max_transaction_bytes = 900
            "#,
        )
        .unwrap();

        config.apply_profile("production");

        assert_eq!(config.profile, "production");
        assert_eq!(config.confidence_margin, dec!(0.03));
        assert_eq!(config.emissions_floor, dec!(1));
        assert_eq!(config.batch_concurrency, 8);
        assert!(config.dry_run);
        assert_eq!(config.collateral_preference_order, vec![Address::with_last_byte(0xaa)]);
        assert_eq!(config.max_addresses_per_extend, 10);
        assert_eq!(config.limits.max_transaction_bytes, 900);
        assert!(config.validate().is_ok());

        let mut config = RunConfig::default();
        config.apply_profile("testing");
        assert!(config.dry_run);
        assert_eq!(config.batch_concurrency, 1);
    }
}
