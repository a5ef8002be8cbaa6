//! Transaction packing and oversize recovery.
//!
//! State machine per settlement transaction:
//!
//! ```text
//! Building ──fits──▶ Submitted ──ok──▶ Done
//!    │  ▲                │
//!    │  │                ├──too large──▶ Extending
//!    │  └── extended ────┘                   │
//!    └──too large (local estimate)──▶ Extending
//!                         └──other error──▶ Failed
//! ```
//!
//! Extending runs at most `max_extend_attempts` times; a transaction still
//! oversize after that is a `PersistentOversizeFailure`.

use alloy::primitives::{Address, B256};
use deleverage_chain::transaction::table_candidates;
use deleverage_chain::{CompiledTransaction, Instruction, Ledger, LedgerError, TransactionRequest};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::RunConfig;
use crate::error::DeleverageError;
use crate::tables::AddressTableManager;

/// Result of a packed submission.
#[derive(Debug, Clone)]
pub struct PackOutcome {
    /// `None` in a dry run
    pub signature: Option<B256>,
    pub tables_extended: usize,
    pub transaction_bytes: usize,
    pub extend_passes: u32,
}

/// Terminal packing failure.
#[derive(Debug, Clone)]
pub struct PackFailure {
    pub error: DeleverageError,
    pub last_instruction_attempted: Option<String>,
    pub tables_extended: usize,
    /// The settlement transaction itself was sent (it may have landed)
    pub settlement_submitted: bool,
}

enum PackState {
    Building,
    Submitted(CompiledTransaction),
    Extending(String),
    Done(Option<B256>, usize),
    Failed(DeleverageError),
}

/// Packs instructions into a transaction and drives table extension on oversize.
pub struct TransactionPacker<'a> {
    ledger: &'a dyn Ledger,
    tables: &'a Mutex<AddressTableManager>,
    config: &'a RunConfig,
    authority: Address,
}

impl<'a> TransactionPacker<'a> {
    pub fn new(
        ledger: &'a dyn Ledger,
        tables: &'a Mutex<AddressTableManager>,
        config: &'a RunConfig,
        authority: Address,
    ) -> Self {
        Self { ledger, tables, config, authority }
    }

    /// Compile, submit, and recover from oversize until done or failed.
    #[instrument(skip_all, fields(instructions = instructions.len(), dry_run = self.config.dry_run))]
    pub async fn pack_and_submit(&self, instructions: &[Instruction]) -> Result<PackOutcome, PackFailure> {
        let signers = [self.authority];
        let mut state = PackState::Building;
        let mut extend_passes: u32 = 0;
        let mut tables_extended = 0usize;
        let mut last_instruction: Option<String> = None;
        let mut settlement_submitted = false;

        loop {
            state = match state {
                PackState::Building => {
                    let views = self.tables.lock().await.views();
                    let compiled = CompiledTransaction::compile(instructions, &signers, &views);
                    debug!(
                        size_bytes = compiled.size_bytes,
                        account_refs = compiled.account_refs,
                        looked_up = compiled.looked_up(),
                        "Compiled transaction"
                    );
                    match compiled.check_limits(&self.config.limits) {
                        Err(e) => PackState::Extending(e.to_string()),
                        Ok(()) if self.config.dry_run => PackState::Done(None, compiled.size_bytes),
                        Ok(()) => PackState::Submitted(compiled),
                    }
                }

                PackState::Submitted(compiled) => {
                    let request = TransactionRequest {
                        instructions: instructions.to_vec(),
                        signers: signers.to_vec(),
                        tables: compiled.lookups.iter().map(|l| l.table).collect(),
                    };
                    last_instruction = instructions.last().map(Instruction::label);
                    settlement_submitted = true;
                    match self.ledger.submit_transaction(&request).await {
                        Ok(signature) => PackState::Done(Some(signature), compiled.size_bytes),
                        Err(e) if e.is_oversize() => {
                            warn!(error = %e, "Ledger rejected transaction as oversize");
                            PackState::Extending(e.to_string())
                        }
                        Err(e) => PackState::Failed(classify_submit_error(e)),
                    }
                }

                PackState::Extending(detail) => {
                    if extend_passes >= self.config.max_extend_attempts {
                        PackState::Failed(DeleverageError::PersistentOversizeFailure {
                            attempts: extend_passes,
                            detail,
                        })
                    } else {
                        extend_passes += 1;
                        match self.extend_tables(instructions, &signers, &mut last_instruction).await {
                            Ok(0) => PackState::Failed(DeleverageError::PersistentOversizeFailure {
                                attempts: extend_passes,
                                detail: format!("{detail}; every address is already in a table"),
                            }),
                            Ok(applied) => {
                                tables_extended += applied;
                                PackState::Building
                            }
                            Err((applied, e)) => {
                                tables_extended += applied;
                                PackState::Failed(e)
                            }
                        }
                    }
                }

                PackState::Done(signature, transaction_bytes) => {
                    info!(
                        signature = ?signature,
                        transaction_bytes,
                        tables_extended,
                        extend_passes,
                        "Transaction packed"
                    );
                    return Ok(PackOutcome { signature, tables_extended, transaction_bytes, extend_passes });
                }

                PackState::Failed(error) => {
                    warn!(error = %error, last_instruction = ?last_instruction, "Transaction packing failed");
                    return Err(PackFailure {
                        error,
                        last_instruction_attempted: last_instruction,
                        tables_extended,
                        settlement_submitted,
                    });
                }
            };
        }
    }

    /// One extension pass. Returns the number of table operations applied;
    /// on failure the count of operations that landed first is returned with
    /// the error.
    ///
    /// The table lock is held for the whole pass so concurrent positions never
    /// plan against the same free slots.
    async fn extend_tables(
        &self,
        instructions: &[Instruction],
        signers: &[Address],
        last_instruction: &mut Option<String>,
    ) -> Result<usize, (usize, DeleverageError)> {
        let mut tables = self.tables.lock().await;
        let required = table_candidates(instructions, signers);
        let ops = tables.ensure_capacity(&required).map_err(|e| (0, e))?;

        info!(required = required.len(), ops = ops.len(), "Extending address tables");

        let mut applied = 0;
        for op in &ops {
            if !self.config.dry_run {
                let request = TransactionRequest {
                    instructions: vec![op.instruction().clone()],
                    signers: signers.to_vec(),
                    tables: Vec::new(),
                };
                *last_instruction = Some(op.instruction().label());
                if let Err(e) = self.ledger.submit_transaction(&request).await {
                    let error = if e.is_oversize() {
                        DeleverageError::TableCapacityExhausted {
                            required: required.len(),
                            reason: format!("table operation does not fit in a transaction: {e}"),
                        }
                    } else {
                        classify_submit_error(e)
                    };
                    return Err((applied, error));
                }
            }
            tables.apply(op);
            applied += 1;
        }
        Ok(applied)
    }
}

fn classify_submit_error(error: LedgerError) -> DeleverageError {
    if error.is_unknown_outcome() {
        DeleverageError::UnknownSubmissionOutcome(error)
    } else {
        DeleverageError::SubmissionFailed(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockLedger, SubmitScript};
    use alloy::primitives::Bytes;
    use deleverage_chain::instructions::decode_extend_addresses;
    use deleverage_chain::{AccountMeta, AddressTableAccount, InstructionTag, TransactionLimits};
    use std::sync::atomic::Ordering;

    const AUTHORITY: Address = Address::repeat_byte(0xa1);
    const TABLE_PROGRAM: Address = Address::repeat_byte(0x7a);
    const TABLE: Address = Address::repeat_byte(0xb0);

    /// One instruction referencing 40 distinct non-signer accounts.
    fn wide_instructions() -> Vec<Instruction> {
        let mut accounts: Vec<AccountMeta> = (1..=40u8).map(|i| AccountMeta::writable(Address::repeat_byte(i))).collect();
        accounts.push(AccountMeta::signer(AUTHORITY));
        vec![Instruction {
            program: Address::repeat_byte(0x70),
            accounts,
            data: Bytes::from(vec![1u8; 200]),
        }]
    }

    /// The wide transaction is 1189 bytes inline, 641 with 30 addresses looked
    /// up and 451 with all 40. A 10-address extend is 587 bytes.
    fn limits() -> TransactionLimits {
        TransactionLimits { max_transaction_bytes: 600, max_account_refs: 64 }
    }

    fn config(max_per_extend: usize, table_capacity: usize) -> RunConfig {
        RunConfig {
            max_addresses_per_extend: max_per_extend,
            table_capacity,
            limits: limits(),
            ..RunConfig::default()
        }
    }

    fn manager_with(entries: Vec<Address>, capacity: usize, per_extend: usize) -> Mutex<AddressTableManager> {
        let mut manager = AddressTableManager::new(AUTHORITY, TABLE_PROGRAM, capacity, per_extend);
        manager.add_table(AddressTableAccount { address: TABLE, authority: Some(AUTHORITY), addresses: entries });
        Mutex::new(manager)
    }

    #[tokio::test]
    async fn test_fits_without_extension() {
        let ledger = MockLedger::new(TransactionLimits::default());
        let tables = manager_with(Vec::new(), 256, 20);
        let config = RunConfig::default();
        let packer = TransactionPacker::new(&ledger, &tables, &config, AUTHORITY);

        let outcome = packer.pack_and_submit(&wide_instructions()).await.unwrap();
        assert!(outcome.signature.is_some());
        assert_eq!(outcome.tables_extended, 0);
        assert_eq!(ledger.submit_attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_oversize_recovery_single_extend() {
        let existing: Vec<Address> = (1..=30u8).map(Address::repeat_byte).collect();
        let ledger = MockLedger::new(limits()).with_table(AddressTableAccount {
            address: TABLE,
            authority: Some(AUTHORITY),
            addresses: existing.clone(),
        });
        let tables = manager_with(existing, 40, 10);
        let config = config(10, 40);
        let packer = TransactionPacker::new(&ledger, &tables, &config, AUTHORITY);

        let outcome = packer.pack_and_submit(&wide_instructions()).await.unwrap();

        assert_eq!(outcome.tables_extended, 1);
        assert_eq!(outcome.extend_passes, 1);
        let landed = ledger.landed();
        assert_eq!(landed.len(), 2);
        assert_eq!(landed[0].instructions.len(), 1);
        assert_eq!(landed[0].instructions[0].tag(), Some(InstructionTag::ExtendTable));
        let added = decode_extend_addresses(&landed[0].instructions[0]).unwrap();
        assert_eq!(added, (31..=40u8).map(Address::repeat_byte).collect::<Vec<_>>());
        assert_eq!(landed[1].tables, vec![TABLE]);
        assert!(outcome.transaction_bytes <= 600);
    }

    #[tokio::test]
    async fn test_ledger_oversize_rejection_triggers_extension() {
        // Local limits are generous; the ledger rejects once anyway.
        let ledger = MockLedger::new(TransactionLimits::default()).with_table(AddressTableAccount {
            address: TABLE,
            authority: Some(AUTHORITY),
            addresses: Vec::new(),
        });
        ledger.push_script(SubmitScript::Fail(LedgerError::TransactionTooLarge("account keys".into())));
        let tables = manager_with(Vec::new(), 256, 20);
        let config = RunConfig::default();
        let packer = TransactionPacker::new(&ledger, &tables, &config, AUTHORITY);

        let outcome = packer.pack_and_submit(&wide_instructions()).await.unwrap();
        assert_eq!(outcome.tables_extended, 2); // 40 addresses in chunks of 20
        assert_eq!(ledger.landed().len(), 3);
    }

    #[tokio::test]
    async fn test_persistent_oversize_after_one_pass() {
        let ledger = MockLedger::new(TransactionLimits::default()).with_table(AddressTableAccount {
            address: TABLE,
            authority: Some(AUTHORITY),
            addresses: Vec::new(),
        });
        let tables = manager_with(Vec::new(), 256, 20);
        // Tables shrink the byte size but not the account reference count.
        let mut config = RunConfig::default();
        config.limits = TransactionLimits { max_transaction_bytes: 10_000, max_account_refs: 30 };
        let packer = TransactionPacker::new(&ledger, &tables, &config, AUTHORITY);

        let failure = packer.pack_and_submit(&wide_instructions()).await.unwrap_err();
        assert!(matches!(failure.error, DeleverageError::PersistentOversizeFailure { attempts: 1, .. }));
        assert_eq!(failure.tables_extended, 2);
        assert!(failure.last_instruction_attempted.unwrap().starts_with("extend_table@"));
        // Only the two extends were submitted.
        assert_eq!(ledger.submit_attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_oversize_failure_not_retried() {
        let ledger = MockLedger::new(TransactionLimits::default());
        ledger.push_script(SubmitScript::Fail(LedgerError::Rejected { code: -32002, message: "insufficient funds".into() }));
        let tables = manager_with(Vec::new(), 256, 20);
        let config = RunConfig::default();
        let packer = TransactionPacker::new(&ledger, &tables, &config, AUTHORITY);

        let failure = packer.pack_and_submit(&wide_instructions()).await.unwrap_err();
        assert!(matches!(failure.error, DeleverageError::SubmissionFailed(LedgerError::Rejected { .. })));
        assert_eq!(ledger.submit_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(failure.last_instruction_attempted, Some(wide_instructions()[0].label()));
    }

    #[tokio::test]
    async fn test_submit_timeout_is_unknown_outcome() {
        let ledger = MockLedger::new(TransactionLimits::default());
        ledger.push_script(SubmitScript::LandThenTimeout);
        let tables = manager_with(Vec::new(), 256, 20);
        let config = RunConfig::default();
        let packer = TransactionPacker::new(&ledger, &tables, &config, AUTHORITY);

        let failure = packer.pack_and_submit(&wide_instructions()).await.unwrap_err();
        assert!(matches!(failure.error, DeleverageError::UnknownSubmissionOutcome(_)));
        assert!(failure.settlement_submitted);
    }

    #[tokio::test]
    async fn test_dry_run_simulates_extension() {
        let ledger = MockLedger::new(limits());
        let tables = manager_with(Vec::new(), 40, 10);
        let mut config = config(10, 40);
        config.dry_run = true;
        let packer = TransactionPacker::new(&ledger, &tables, &config, AUTHORITY);

        let outcome = packer.pack_and_submit(&wide_instructions()).await.unwrap();
        assert!(outcome.signature.is_none());
        assert_eq!(outcome.tables_extended, 4);
        assert_eq!(ledger.submit_attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_extend_failure_keeps_applied_count() {
        let ledger = MockLedger::new(TransactionLimits::default()).with_table(AddressTableAccount {
            address: TABLE,
            authority: Some(AUTHORITY),
            addresses: Vec::new(),
        });
        ledger.push_script(SubmitScript::Land);
        ledger.push_script(SubmitScript::Fail(LedgerError::Rejected { code: -32002, message: "blockhash expired".into() }));
        let tables = manager_with(Vec::new(), 256, 20);
        let mut config = RunConfig::default();
        config.limits = TransactionLimits { max_transaction_bytes: 10_000, max_account_refs: 30 };
        let packer = TransactionPacker::new(&ledger, &tables, &config, AUTHORITY);

        let failure = packer.pack_and_submit(&wide_instructions()).await.unwrap_err();
        assert!(matches!(failure.error, DeleverageError::SubmissionFailed(LedgerError::Rejected { .. })));
        assert_eq!(failure.tables_extended, 1);
        assert!(!failure.settlement_submitted);
        assert_eq!(tables.lock().await.views()[0].addresses.len(), 20);
    }

    #[tokio::test]
    async fn test_oversize_extend_is_table_error() {
        // Chunks of 20 make a 907-byte extend against a 600-byte ledger.
        let ledger = MockLedger::new(limits()).with_table(AddressTableAccount {
            address: TABLE,
            authority: Some(AUTHORITY),
            addresses: Vec::new(),
        });
        let tables = manager_with(Vec::new(), 40, 20);
        let config = config(20, 40);
        let packer = TransactionPacker::new(&ledger, &tables, &config, AUTHORITY);

        let failure = packer.pack_and_submit(&wide_instructions()).await.unwrap_err();
        assert!(matches!(failure.error, DeleverageError::TableCapacityExhausted { .. }));
        assert_eq!(failure.tables_extended, 0);
        assert!(ledger.landed().is_empty());
    }
}
