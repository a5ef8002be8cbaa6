//! Deleveraging engine: one position end to end, and batches of them.
//!
//! Per position: load snapshot, value, plan, assemble, pack and submit.
//! Every failure is captured as a [`RunFailure`] for that position only.

use std::sync::Arc;

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use deleverage_chain::{Ledger, Position};
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use tracing::{debug, error, info, instrument, warn};

use crate::assembler::{assemble_plan, AssemblyContext};
use crate::config::{LedgerConfig, RunConfig};
use crate::error::{DeleverageError, RunFailure};
use crate::packer::{PackFailure, TransactionPacker};
use crate::planner::{plan_position, Plan};
use crate::report::{RunReport, TerminalStatus};
use crate::run_state::RunState;
use crate::snapshot::{PositionSnapshot, SnapshotLoader};
use crate::valuation::value;

/// Where a position's run got to, for failure reports.
#[derive(Debug, Default)]
struct Progress {
    last_step: Option<String>,
    last_instruction: Option<String>,
}

impl Progress {
    fn step(&mut self, step: impl Into<String>) {
        self.last_step = Some(step.into());
    }

    fn fail(self, position: Address, error: DeleverageError) -> RunFailure {
        RunFailure {
            position,
            error,
            last_successful_step: self.last_step,
            last_instruction_attempted: self.last_instruction,
        }
    }
}

/// Runs deleverage for positions against one ledger.
pub struct Deleverager {
    ledger: Arc<dyn Ledger>,
    ledger_config: LedgerConfig,
    config: RunConfig,
}

impl Deleverager {
    pub fn new(ledger: Arc<dyn Ledger>, ledger_config: LedgerConfig, config: RunConfig) -> Self {
        Self { ledger, ledger_config, config }
    }

    /// Override the dry-run flag.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.config.dry_run = dry_run;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Fresh run state: empty caches plus the configured address tables.
    pub async fn start_run(&self) -> Result<RunState, DeleverageError> {
        RunState::initialize(self.ledger.as_ref(), &self.ledger_config, &self.config).await
    }

    /// Deleverage one position, fetching it fresh.
    #[instrument(skip(self, state), fields(position = %position))]
    pub async fn run_deleverage(&self, state: &RunState, position: Address) -> Result<RunReport, RunFailure> {
        let started_at = Utc::now();
        let mut progress = Progress::default();
        let loader = SnapshotLoader::new(self.ledger.as_ref(), state);

        let snapshot = match loader.load(position).await {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(progress.fail(position, e)),
        };
        progress.step("loaded");

        self.settle(state, snapshot, started_at, &mut progress)
            .await
            .map_err(|e| progress.fail(position, e))
    }

    /// Deleverage an already-fetched position.
    #[instrument(skip(self, state, position), fields(position = %position.address))]
    pub async fn run_prefetched(&self, state: &RunState, position: Position) -> Result<RunReport, RunFailure> {
        let started_at = Utc::now();
        let address = position.address;
        let mut progress = Progress::default();
        let loader = SnapshotLoader::new(self.ledger.as_ref(), state);

        let snapshot = match loader.resolve(position).await {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(progress.fail(address, e)),
        };
        progress.step("loaded");

        self.settle(state, snapshot, started_at, &mut progress)
            .await
            .map_err(|e| progress.fail(address, e))
    }

    /// Run every position, isolating failures. Results keep input order.
    #[instrument(skip_all, fields(positions = positions.len(), concurrency = self.config.batch_concurrency))]
    pub async fn run_batch(
        &self,
        positions: &[Address],
    ) -> Result<Vec<Result<RunReport, RunFailure>>, DeleverageError> {
        let state = self.start_run().await?;

        let fetched: Vec<(usize, Result<Position, RunFailure>)> = stream::iter(positions.iter().copied().enumerate())
            .map(|(index, address)| async move {
                let result = self
                    .ledger
                    .fetch_position(address)
                    .await
                    .map_err(|e| Progress::default().fail(address, e.into()));
                (index, result)
            })
            .buffer_unordered(self.config.batch_concurrency)
            .collect()
            .await;

        let loaded: Vec<Position> = fetched
            .iter()
            .filter_map(|(_, r)| r.as_ref().ok().cloned())
            .collect();
        // Workers fetch on demand if this fails.
        if let Err(e) = state.prefetch(self.ledger.as_ref(), &loaded).await {
            warn!(error = %e, "Batch prefetch failed");
        }
        info!(
            loaded = loaded.len(),
            failed = positions.len() - loaded.len(),
            pools = state.cached_pools(),
            "Batch prefetched"
        );

        let state = &state;
        let mut results: Vec<(usize, Result<RunReport, RunFailure>)> = stream::iter(fetched)
            .map(|(index, fetched)| async move {
                let result = match fetched {
                    Ok(position) => self.run_prefetched(state, position).await,
                    Err(failure) => Err(failure),
                };
                (index, result)
            })
            .buffer_unordered(self.config.batch_concurrency)
            .collect()
            .await;
        results.sort_by_key(|(index, _)| *index);

        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        info!(succeeded = results.len() - failed, failed, "Batch finished");

        Ok(results.into_iter().map(|(_, r)| r).collect())
    }

    /// Value, plan, assemble and submit one snapshot.
    async fn settle(
        &self,
        state: &RunState,
        snapshot: PositionSnapshot,
        started_at: DateTime<Utc>,
        progress: &mut Progress,
    ) -> Result<RunReport, DeleverageError> {
        let position = &snapshot.position;

        let valuation = value(position, &snapshot.pools, self.config.confidence_margin)?;
        progress.step("valued");

        if valuation.debt_value <= Decimal::ZERO {
            info!(position = %position.address, "Position has no debt");
            return Ok(RunReport::no_debt(position.address, started_at));
        }

        let plan = plan_position(
            valuation.debt_value,
            &valuation.collateral,
            &valuation.debts,
            &self.config.collateral_preference_order,
            self.config.emissions_floor,
            self.config.withdraw_dust_units,
        )?;
        progress.step("planned");

        info!(
            position = %position.address,
            debt_value = %valuation.debt_value,
            seizable_value = ?valuation.total_seizable(),
            steps = plan.len(),
            remaining_debt_value = %plan.remaining_debt_value,
            "Position planned"
        );

        if plan.is_empty() {
            return Ok(self.report(position.address, &plan, started_at, |r| {
                r.terminal_status = settled_or_insufficient(&plan);
            }));
        }

        let ctx = AssemblyContext {
            program: self.ledger_config.programs.margin_pool,
            authority: self.ledger_config.authority,
            position,
            pools: &snapshot.pools,
            adapters: &snapshot.adapters,
        };
        let instructions = assemble_plan(ctx, &plan)?;
        progress.step("assembled");

        let packer = TransactionPacker::new(
            self.ledger.as_ref(),
            state.tables(),
            &self.config,
            self.ledger_config.authority,
        );

        match packer.pack_and_submit(&instructions).await {
            Ok(outcome) => {
                progress.step(if self.config.dry_run { "compiled" } else { "submitted" });
                Ok(self.report(position.address, &plan, started_at, |r| {
                    r.terminal_status = if self.config.dry_run {
                        TerminalStatus::DryRun
                    } else {
                        settled_or_insufficient(&plan)
                    };
                    r.steps_executed = if self.config.dry_run { 0 } else { plan.len() };
                    r.tables_extended = outcome.tables_extended;
                    r.signature = outcome.signature;
                    r.transaction_bytes = Some(outcome.transaction_bytes);
                }))
            }
            Err(failure) => {
                progress.last_instruction = failure.last_instruction_attempted.clone();
                self.resolve_failure(position, &plan, started_at, failure).await
            }
        }
    }

    /// After a submit timeout, decide from the ledger whether the settlement landed.
    async fn resolve_failure(
        &self,
        before: &Position,
        plan: &Plan,
        started_at: DateTime<Utc>,
        failure: PackFailure,
    ) -> Result<RunReport, DeleverageError> {
        let PackFailure { error, tables_extended, settlement_submitted, .. } = failure;
        if !matches!(error, DeleverageError::UnknownSubmissionOutcome(_)) || !settlement_submitted {
            return Err(error);
        }

        let after = match self.ledger.fetch_position(before.address).await {
            Ok(after) => after,
            Err(e) => {
                warn!(position = %before.address, error = %e, "Re-fetch after submit timeout failed");
                return Err(error);
            }
        };

        if after.state_hash() == before.state_hash() {
            debug!(position = %before.address, "Position unchanged after submit timeout");
            return Err(error);
        }

        warn!(
            position = %before.address,
            "Position changed after submit timeout, treating settlement as landed"
        );
        Ok(self.report(before.address, plan, started_at, |r| {
            r.terminal_status = settled_or_insufficient(plan);
            r.steps_executed = plan.len();
            r.tables_extended = tables_extended;
            r.outcome_confirmed = false;
        }))
    }

    fn report(
        &self,
        position: Address,
        plan: &Plan,
        started_at: DateTime<Utc>,
        fill: impl FnOnce(&mut RunReport),
    ) -> RunReport {
        let mut report = RunReport::no_debt(position, started_at);
        report.steps_planned = plan.len();
        report.final_debt_value = plan.remaining_debt_value;
        fill(&mut report);
        report.finished_at = Utc::now();

        if report.terminal_status == TerminalStatus::SettlementInsufficient {
            error!(
                position = %position,
                final_debt_value = %report.final_debt_value,
                "Collateral insufficient to cover debt"
            );
        }
        report
    }
}

fn settled_or_insufficient(plan: &Plan) -> TerminalStatus {
    if plan.remaining_debt_value <= Decimal::ZERO {
        TerminalStatus::Settled
    } else {
        TerminalStatus::SettlementInsufficient
    }
}
