//! Margin position deleverager
//!
//! Settles under-collateralized margin positions by withdrawing collateral and
//! repaying debt in a single transaction per position.
//! Features:
//! - Batch runs over a configured position list
//! - Address table extension when a settlement is too large
//! - Dry-run mode that plans and compiles without submitting
//! - JSON lines audit trail of run reports

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use deleverage_chain::RpcLedger;
use deleverage_core::{AppConfig, Deleverager, RunFailure, RunReport};

/// Environment variable names.
mod env {
    pub const PROFILE: &str = "DELEVERAGE_PROFILE";
    pub const REPORT_PATH: &str = "DELEVERAGE_REPORT_PATH";
    pub const DRY_RUN: &str = "DELEVERAGE_DRY_RUN";
}

/// One audit line per position.
#[derive(Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
enum AuditRecord<'a> {
    Report(&'a RunReport),
    Failure(&'a RunFailure),
}

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();

    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,deleverage_core=debug,deleverage_chain=debug")),
        )
        .init();

    let mut config = AppConfig::from_env()?;
    if let Ok(profile) = std::env::var(env::PROFILE) {
        config.run.apply_profile(&profile);
    }
    if let Ok(flag) = std::env::var(env::DRY_RUN) {
        config.run.dry_run = matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes");
    }
    config.run.validate()?;
    config.run.log_config();

    if config.positions.is_empty() {
        warn!("No positions configured, nothing to do");
        return Ok(());
    }

    let ledger = RpcLedger::new(
        &config.ledger.rpc_url,
        config.ledger.request_timeout(),
        config.ledger.submit_timeout(),
    )?;
    if let Err(e) = ledger.health().await {
        warn!(error = %e, "Ledger health check failed, continuing");
    }
    info!(
        rpc = %config.ledger.rpc_url,
        authority = %config.ledger.authority,
        positions = config.positions.len(),
        "Starting deleverage run"
    );

    let engine = Deleverager::new(Arc::new(ledger), config.ledger.clone(), config.run.clone());
    let results = engine.run_batch(&config.positions).await?;

    let mut audit = match std::env::var(env::REPORT_PATH) {
        Ok(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open report file {path}"))?,
        ),
        Err(_) => None,
    };

    let mut failed = 0usize;
    for result in &results {
        let record = match result {
            Ok(report) => {
                println!(
                    "{} {} steps={}/{} final_debt={} tables_extended={} signature={}",
                    report.position,
                    report.terminal_status,
                    report.steps_executed,
                    report.steps_planned,
                    report.final_debt_value,
                    report.tables_extended,
                    report
                        .signature
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                );
                AuditRecord::Report(report)
            }
            Err(failure) => {
                failed += 1;
                println!("failed {failure}");
                AuditRecord::Failure(failure)
            }
        };

        if let Some(file) = audit.as_mut() {
            let line = serde_json::to_string(&record)?;
            writeln!(file, "{line}").context("failed to write report")?;
        }
    }

    info!(total = results.len(), failed, "Deleverage run complete");
    if failed > 0 {
        anyhow::bail!("{failed} of {} positions failed", results.len());
    }
    Ok(())
}

/// Print startup banner.
fn print_banner() {
    println!(
        r#"
    ┌┬┐┌─┐┬  ┌─┐┬  ┬┌─┐┬─┐┌─┐┌─┐┌─┐┬─┐
     ││├┤ │  ├┤ └┐┌┘├┤ ├┬┘├─┤│ ┬├┤ ├┬┘
    ─┴┘└─┘┴─┘└─┘ └┘ └─┘┴└─┴ ┴└─┘└─┘┴└─
    Margin Deleverager v0.1.0
    "#
    );
}
