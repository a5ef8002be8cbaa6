//! Instruction assembly.
//!
//! Turns planned steps into instructions, dispatching on each pool's
//! integration kind. Repayments are assembled before withdrawals so the
//! liability is reduced before collateral health is re-checked.

mod adapter;
mod native;

use std::collections::{HashMap, HashSet};

use alloy::primitives::Address;
use deleverage_chain::{AdapterState, Balance, Instruction, InstructionBuilder, IntegrationKind, Pool, Position};
use tracing::debug;

use crate::error::{DeleverageError, Result};
use crate::planner::{AllocationStep, Plan, StepKind};
use adapter::RefreshScope;

/// Everything assembly reads.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyContext<'a> {
    /// Margin pool program
    pub program: Address,
    /// Signing authority
    pub authority: Address,
    pub position: &'a Position,
    pub pools: &'a HashMap<Address, Pool>,
    pub adapters: &'a HashMap<Address, AdapterState>,
}

enum Entry {
    Ready(Instruction),
    /// Reserve refreshes followed by one obligation refresh, built at the end
    /// so later steps can add reserves to it.
    Obligation {
        adapter: AdapterState,
        reserves: Vec<Address>,
        refresh: Vec<AdapterState>,
    },
}

/// Instructions of one transaction under construction.
#[derive(Default)]
pub(crate) struct TransactionDraft {
    entries: Vec<Entry>,
    refreshed_reserves: HashSet<Address>,
    obligations: HashMap<Address, usize>,
}

impl TransactionDraft {
    fn push(&mut self, instruction: Instruction) {
        self.entries.push(Entry::Ready(instruction));
    }

    fn refresh_obligation(&mut self, adapter: &AdapterState) {
        let needs_refresh = self.refreshed_reserves.insert(adapter.reserve);

        if let Some(index) = self.obligations.get(&adapter.obligation) {
            if let Some(Entry::Obligation { reserves, refresh, .. }) = self.entries.get_mut(*index) {
                if !reserves.contains(&adapter.reserve) {
                    reserves.push(adapter.reserve);
                }
                if needs_refresh {
                    refresh.push(adapter.clone());
                }
            }
            return;
        }

        self.obligations.insert(adapter.obligation, self.entries.len());
        self.entries.push(Entry::Obligation {
            adapter: adapter.clone(),
            reserves: vec![adapter.reserve],
            refresh: if needs_refresh { vec![adapter.clone()] } else { Vec::new() },
        });
    }

    fn finish(self) -> Vec<Instruction> {
        self.entries
            .into_iter()
            .fold(InstructionBuilder::new(), |builder, entry| match entry {
                Entry::Ready(ix) => builder.push(ix),
                Entry::Obligation { adapter, reserves, refresh } => refresh
                    .iter()
                    .fold(builder, InstructionBuilder::refresh_reserve)
                    .refresh_obligation(&adapter, &reserves),
            })
            .build()
    }
}

/// Assembles the steps of one transaction.
pub struct InstructionAssembler<'a> {
    ctx: AssemblyContext<'a>,
    draft: TransactionDraft,
    steps: usize,
}

impl<'a> InstructionAssembler<'a> {
    pub fn new(ctx: AssemblyContext<'a>) -> Self {
        Self { ctx, draft: TransactionDraft::default(), steps: 0 }
    }

    fn balance_for(&self, step: &AllocationStep) -> Result<&'a Balance> {
        let want_collateral = step.kind == StepKind::Withdraw;
        self.ctx
            .position
            .balances
            .iter()
            .find(|b| b.pool == step.pool && b.is_collateral == want_collateral)
            .ok_or(DeleverageError::MissingPoolData { pool: step.pool })
    }

    fn adapter_for(&self, pool: &Pool) -> Result<&'a AdapterState> {
        self.ctx
            .adapters
            .get(&pool.address)
            .ok_or(DeleverageError::MissingAdapterState { pool: pool.address })
    }

    /// Add one step's instructions.
    pub fn assemble(&mut self, step: &AllocationStep) -> Result<()> {
        let pool = self
            .ctx
            .pools
            .get(&step.pool)
            .ok_or(DeleverageError::MissingPoolData { pool: step.pool })?;
        let balance = self.balance_for(step)?;
        let position = self.ctx.position.address;
        let authority = self.ctx.authority;

        match &pool.kind {
            IntegrationKind::Native => {
                let ix = native::assemble(self.ctx.program, authority, position, step, pool, balance);
                self.draft.push(ix);
            }
            IntegrationKind::ReserveAdapter => {
                let state = self.adapter_for(pool)?;
                adapter::assemble(&mut self.draft, RefreshScope::Reserve, authority, position, step, state, balance);
            }
            IntegrationKind::ObligationAdapter => {
                let state = self.adapter_for(pool)?;
                adapter::assemble(&mut self.draft, RefreshScope::Obligation, authority, position, step, state, balance);
            }
            IntegrationKind::Unknown(kind) => {
                return Err(DeleverageError::UnknownIntegrationKind {
                    pool: pool.address,
                    kind: kind.clone(),
                });
            }
        }

        self.steps += 1;
        Ok(())
    }

    /// Instructions in execution order.
    pub fn finish(self) -> Vec<Instruction> {
        let instructions = self.draft.finish();
        debug!(
            position = %self.ctx.position.address,
            steps = self.steps,
            instructions = instructions.len(),
            "Assembled instructions"
        );
        instructions
    }
}

/// Assemble a whole plan: repayments, then withdrawals.
pub fn assemble_plan(ctx: AssemblyContext<'_>, plan: &Plan) -> Result<Vec<Instruction>> {
    let mut assembler = InstructionAssembler::new(ctx);
    for step in plan.steps() {
        assembler.assemble(step)?;
    }
    Ok(assembler.finish())
}
