//! DFLN Round Engine
//!
//! Drives one training round end to end:
//! - validator.rs: ingest, gate, aggregate and commit (one task per validator)
//! - ledger.rs: submit commitments, finalize under stake supermajority
//!
//! `process` and `settle` are exposed separately so callers can inspect or
//! alter commitments between the two phases.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::aggregate::{AggregateError, AggregationMode};
use crate::config::{Config, ConfigError};
use crate::ledger::{Account, ConsensusLedger, ConsensusResult, LedgerError, NoQuorum, RoundStatus};
use crate::packet::SecurePacket;
use crate::types::{Digest, RoundId, ValidatorId};
use crate::validator::{PacketOutcome, ValidatorCommitment, ValidatorState};

// ============================================================================
// REPORT TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ValidatorRoundSummary {
    pub validator_id: ValidatorId,
    pub outcomes: Vec<PacketOutcome>,
    pub admitted: usize,
    pub rejected: usize,
    pub commitment: ValidatorCommitment,
    /// Digest actually sent to the ledger (differs from the commitment
    /// when the submission was altered)
    pub submitted: Digest,
}

impl ValidatorRoundSummary {
    pub fn is_honest(&self) -> bool {
        self.submitted == self.commitment.digest
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConsensusOutcome {
    Finalized { result: ConsensusResult },
    NoQuorum { reason: NoQuorum },
}

impl ConsensusOutcome {
    pub fn result(&self) -> Option<&ConsensusResult> {
        match self {
            ConsensusOutcome::Finalized { result } => Some(result),
            ConsensusOutcome::NoQuorum { .. } => None,
        }
    }
}

impl From<Result<ConsensusResult, NoQuorum>> for ConsensusOutcome {
    fn from(outcome: Result<ConsensusResult, NoQuorum>) -> Self {
        match outcome {
            Ok(result) => ConsensusOutcome::Finalized { result },
            Err(reason) => ConsensusOutcome::NoQuorum { reason },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub round_id: RoundId,
    pub timestamp: DateTime<Utc>,
    pub grad_dim: usize,
    pub aggregation: AggregationMode,
    pub validators: Vec<ValidatorRoundSummary>,
    /// Packets addressed to a validator not taking part in the round
    pub undeliverable: usize,
    pub consensus: ConsensusOutcome,
    /// Ledger accounts after the round
    pub accounts: BTreeMap<ValidatorId, Account>,
}

impl RoundReport {
    pub fn summary(&self, validator_id: &ValidatorId) -> Option<&ValidatorRoundSummary> {
        self.validators.iter().find(|s| &s.validator_id == validator_id)
    }
}

/// Output of the validator phase of a round
#[derive(Debug)]
pub struct RoundProcessing {
    pub round_id: RoundId,
    pub summaries: Vec<ValidatorRoundSummary>,
    pub undeliverable: usize,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct RoundEngine {
    config: Config,
    ledger: Arc<ConsensusLedger>,
}

impl RoundEngine {
    pub fn new(config: Config, ledger: Arc<ConsensusLedger>) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self { config, ledger })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<ConsensusLedger> {
        &self.ledger
    }

    /// Run every validator's pipeline for `round_id` concurrently.
    ///
    /// Each validator starts the round fresh, screens its packets in
    /// `client_id` order and commits to its aggregate. `validators` is moved
    /// into the worker tasks and put back in input order before returning,
    /// on success and on error alike. Only a validator whose task panicked
    /// is lost.
    pub async fn process(
        &self,
        round_id: RoundId,
        validators: &mut Vec<ValidatorState>,
        packets: Vec<SecurePacket>,
    ) -> Result<RoundProcessing, EngineError> {
        let mut index: HashMap<ValidatorId, usize> = HashMap::with_capacity(validators.len());
        for (i, validator) in validators.iter().enumerate() {
            if validator.grad_dim() != self.config.grad_dim {
                return Err(EngineError::DimensionMismatch {
                    validator_id: validator.id().clone(),
                    expected: self.config.grad_dim,
                    got: validator.grad_dim(),
                });
            }
            if index.insert(validator.id().clone(), i).is_some() {
                return Err(EngineError::DuplicateValidator(validator.id().clone()));
            }
        }

        let mut inboxes: Vec<Vec<SecurePacket>> = vec![Vec::new(); validators.len()];
        let mut undeliverable = 0;
        for packet in packets {
            match index.get(&packet.validator_id) {
                Some(&i) => inboxes[i].push(packet),
                None => {
                    warn!(
                        round = round_id,
                        client = %packet.client_id,
                        validator = %packet.validator_id,
                        "undeliverable packet"
                    );
                    undeliverable += 1;
                }
            }
        }

        let mut tasks = JoinSet::new();
        for (i, (mut validator, inbox)) in std::mem::take(validators).into_iter().zip(inboxes).enumerate() {
            let gate = self.config.gate.clone();
            let mode = self.config.aggregation;
            tasks.spawn_blocking(move || {
                validator.begin_round();
                let outcomes = validator.ingest(inbox, &gate);
                let commitment = validator.commit(mode);
                (i, validator, outcomes, commitment)
            });
        }

        let mut finished = Vec::with_capacity(tasks.len());
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(done) => finished.push(done),
                Err(e) => {
                    error!(round = round_id, error = %e, "validator task failed");
                    failure.get_or_insert(e);
                }
            }
        }
        finished.sort_by_key(|(i, ..)| *i);

        if let Some(e) = failure {
            validators.extend(finished.into_iter().map(|(_, validator, ..)| validator));
            return Err(EngineError::Task(e));
        }

        let mut summaries = Vec::with_capacity(finished.len());
        let mut aggregate_error = None;
        for (_, validator, outcomes, commitment) in finished {
            let commitment = match commitment {
                Ok(commitment) => commitment,
                Err(e) => {
                    error!(round = round_id, validator = %validator.id(), error = %e, "aggregation failed");
                    aggregate_error.get_or_insert(e);
                    validators.push(validator);
                    continue;
                }
            };
            let admitted = outcomes.iter().filter(|o| o.is_admitted()).count();
            debug!(
                round = round_id,
                validator = %validator.id(),
                admitted,
                rejected = outcomes.len() - admitted,
                norm = commitment.aggregate_norm,
                digest = %commitment.digest.short(),
                "validator done"
            );
            summaries.push(ValidatorRoundSummary {
                validator_id: validator.id().clone(),
                rejected: outcomes.len() - admitted,
                admitted,
                outcomes,
                submitted: commitment.digest,
                commitment,
            });
            validators.push(validator);
        }
        if let Some(e) = aggregate_error {
            return Err(e.into());
        }

        Ok(RoundProcessing {
            round_id,
            summaries,
            undeliverable,
        })
    }

    /// Submit commitments and try to finalize the round
    pub fn settle<I>(&self, round_id: RoundId, submissions: I) -> Result<ConsensusOutcome, EngineError>
    where
        I: IntoIterator<Item = (ValidatorId, Digest)>,
    {
        for (validator_id, digest) in submissions {
            self.ledger.submit(round_id, validator_id, digest)?;
        }
        let outcome = ConsensusOutcome::from(self.ledger.finalize(round_id));
        match &outcome {
            ConsensusOutcome::Finalized { result } => info!(
                round = round_id,
                digest = %result.winning_digest.short(),
                stake_pct = result.stake_fraction * 100.0,
                slashed = result.slashed.len(),
                "consensus reached"
            ),
            ConsensusOutcome::NoQuorum { reason } => warn!(round = round_id, %reason, "no consensus"),
        }
        Ok(outcome)
    }

    /// Process, submit every commitment unchanged, finalize
    pub async fn run_round(
        &self,
        round_id: RoundId,
        validators: &mut Vec<ValidatorState>,
        packets: Vec<SecurePacket>,
    ) -> Result<RoundReport, EngineError> {
        self.run_round_with(round_id, validators, packets, |_, digest| digest).await
    }

    /// Like `run_round`, but each digest passes through `submission` before
    /// it reaches the ledger.
    ///
    /// A round that is already finalized is refused before any validator
    /// state is touched.
    pub async fn run_round_with<F>(
        &self,
        round_id: RoundId,
        validators: &mut Vec<ValidatorState>,
        packets: Vec<SecurePacket>,
        mut submission: F,
    ) -> Result<RoundReport, EngineError>
    where
        F: FnMut(&ValidatorId, Digest) -> Digest,
    {
        if self.ledger.round_status(round_id) == Some(RoundStatus::Finalized) {
            return Err(LedgerError::RoundFinalized { round_id }.into());
        }

        let mut processing = self.process(round_id, validators, packets).await?;
        for summary in &mut processing.summaries {
            summary.submitted = submission(&summary.validator_id, summary.commitment.digest);
        }
        let consensus = self.settle(
            round_id,
            processing
                .summaries
                .iter()
                .map(|s| (s.validator_id.clone(), s.submitted)),
        )?;

        let report = RoundReport {
            round_id,
            timestamp: Utc::now(),
            grad_dim: self.config.grad_dim,
            aggregation: self.config.aggregation,
            validators: processing.summaries,
            undeliverable: processing.undeliverable,
            consensus,
            accounts: self.ledger.accounts(),
        };
        Ok(report)
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Validator {validator_id} has grad_dim {got}, round expects {expected}")]
    DimensionMismatch {
        validator_id: ValidatorId,
        expected: usize,
        got: usize,
    },

    #[error("Duplicate validator {0}")]
    DuplicateValidator(ValidatorId),

    #[error("Aggregation failed: {0}")]
    Aggregate(#[from] AggregateError),

    #[error("Validator task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
