//! Stake-weighted consensus ledger
//!
//! Validators submit one aggregate digest per round. A round finalizes when
//! the heaviest digest (by current stake) reaches the supermajority share of
//! all registered stake; agreeing validators gain reputation, the rest lose
//! reputation and a fraction of their stake.
//!
//! Locking: each round has its own mutex, accounts sit behind one RwLock.
//! Always take the round lock first, then the account lock.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto;
use crate::types::{Digest, RoundId, ValidatorId};

// =============================================================================
// CONSTANTS
// =============================================================================

pub const DEFAULT_SUPERMAJORITY: f64 = 2.0 / 3.0;
pub const DEFAULT_SLASH_FRACTION: f64 = 0.2;
/// Stake given to validators that submit without registering
pub const DEFAULT_STAKE: f64 = 1.0;
/// Relative tolerance on the quorum comparison, as a share of total stake
pub const QUORUM_EPSILON: f64 = 1e-12;

// =============================================================================
// CONFIG / TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub supermajority_fraction: f64,
    pub slash_fraction: f64,
    pub default_stake: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            supermajority_fraction: DEFAULT_SUPERMAJORITY,
            slash_fraction: DEFAULT_SLASH_FRACTION,
            default_stake: DEFAULT_STAKE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub stake: f64,
    pub reputation: i64,
}

impl Account {
    pub fn with_stake(stake: f64) -> Self {
        Self { stake, reputation: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Open,
    NoQuorum,
    Finalized,
}

/// A validator that disagreed with the finalized digest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudRecord {
    pub validator_id: ValidatorId,
    pub submitted: Digest,
    pub stake_before: f64,
    pub stake_after: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub round_id: RoundId,
    pub winning_digest: Digest,
    pub winning_weight: f64,
    pub total_stake: f64,
    /// `winning_weight / total_stake`
    pub stake_fraction: f64,
    pub per_validator_digests: BTreeMap<ValidatorId, Digest>,
    pub slashed: Vec<ValidatorId>,
    pub fraud: Vec<FraudRecord>,
    /// Reputation and stake after this round was applied
    pub accounts: BTreeMap<ValidatorId, Account>,
}

impl ConsensusResult {
    /// Audit hash of the whole result
    pub fn record_hash(&self) -> Digest {
        Digest(crypto::sha3(&bincode::serialize(self).unwrap_or_default()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsensusRound {
    pub round_id: RoundId,
    pub commitments: BTreeMap<ValidatorId, Digest>,
    /// Stake of every registered validator at finalization
    pub stake_snapshot: Option<BTreeMap<ValidatorId, f64>>,
    pub status: RoundStatus,
    pub result: Option<ConsensusResult>,
}

impl ConsensusRound {
    fn new(round_id: RoundId) -> Self {
        Self {
            round_id,
            commitments: BTreeMap::new(),
            stake_snapshot: None,
            status: RoundStatus::Open,
            result: None,
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("invalid stake {stake} for validator {validator_id}")]
    InvalidStake { validator_id: ValidatorId, stake: f64 },

    #[error("round {round_id} is already finalized")]
    RoundFinalized { round_id: RoundId },
}

/// Round-level outcome when nothing could be finalized
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NoQuorum {
    #[error("no commitments submitted")]
    NoSubmissions,

    #[error("total registered stake is zero")]
    ZeroStake,

    #[error("winning weight {winning_weight:.4} below required {required:.4} of {total_stake:.4}")]
    BelowThreshold {
        winning_digest: Digest,
        winning_weight: f64,
        required: f64,
        total_stake: f64,
    },
}

// =============================================================================
// LEDGER
// =============================================================================

#[derive(Debug, Default)]
pub struct ConsensusLedger {
    config: LedgerConfig,
    accounts: RwLock<BTreeMap<ValidatorId, Account>>,
    rounds: RwLock<BTreeMap<RoundId, Arc<Mutex<ConsensusRound>>>>,
}

impl ConsensusLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            accounts: RwLock::new(BTreeMap::new()),
            rounds: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Set (or overwrite) a validator's stake. Reputation is kept if the
    /// validator already exists.
    pub fn register(&self, validator_id: ValidatorId, stake: f64) -> Result<(), LedgerError> {
        if !stake.is_finite() || stake < 0.0 {
            return Err(LedgerError::InvalidStake { validator_id, stake });
        }
        let mut accounts = self.accounts.write();
        accounts
            .entry(validator_id.clone())
            .and_modify(|a| a.stake = stake)
            .or_insert_with(|| Account::with_stake(stake));
        debug!(validator = %validator_id, stake, "registered");
        Ok(())
    }

    /// Record `digest` for `validator_id` in `round_id`; last write wins.
    pub fn submit(&self, round_id: RoundId, validator_id: ValidatorId, digest: Digest) -> Result<(), LedgerError> {
        let handle = self.round_handle_or_insert(round_id);
        let mut round = handle.lock();
        if round.status == RoundStatus::Finalized {
            return Err(LedgerError::RoundFinalized { round_id });
        }

        {
            let mut accounts = self.accounts.write();
            accounts
                .entry(validator_id.clone())
                .or_insert_with(|| Account::with_stake(self.config.default_stake));
        }

        if let Some(previous) = round.commitments.insert(validator_id.clone(), digest) {
            if previous != digest {
                debug!(round = round_id, validator = %validator_id, "commitment replaced");
            }
        }
        debug!(round = round_id, validator = %validator_id, digest = %digest.short(), "commitment submitted");
        Ok(())
    }

    /// Try to finalize `round_id`.
    ///
    /// A finalized round returns its stored result again. `NoQuorum` leaves
    /// accounts untouched and the round open for more submissions.
    pub fn finalize(&self, round_id: RoundId) -> Result<ConsensusResult, NoQuorum> {
        let Some(handle) = self.round_handle(round_id) else {
            return Err(NoQuorum::NoSubmissions);
        };
        let mut round = handle.lock();
        if let Some(result) = &round.result {
            return Ok(result.clone());
        }
        if round.commitments.is_empty() {
            round.status = RoundStatus::NoQuorum;
            return Err(NoQuorum::NoSubmissions);
        }

        let mut accounts = self.accounts.write();
        let stake_of = |id: &ValidatorId| accounts.get(id).map_or(0.0, |a| a.stake);

        let mut weights: BTreeMap<Digest, f64> = BTreeMap::new();
        for (validator_id, digest) in &round.commitments {
            *weights.entry(*digest).or_insert(0.0) += stake_of(validator_id);
        }

        // Ascending digest order, strict comparison: ties keep the smallest digest
        let mut winner: Option<(Digest, f64)> = None;
        for (digest, weight) in &weights {
            match winner {
                Some((_, best)) if *weight <= best => {}
                _ => winner = Some((*digest, *weight)),
            }
        }
        let Some((winning_digest, winning_weight)) = winner else {
            return Err(NoQuorum::NoSubmissions);
        };

        let total_stake: f64 = accounts.values().map(|a| a.stake).sum();
        if total_stake <= 0.0 {
            round.status = RoundStatus::NoQuorum;
            return Err(NoQuorum::ZeroStake);
        }

        let required = self.config.supermajority_fraction * total_stake;
        if winning_weight < required - QUORUM_EPSILON * total_stake {
            round.status = RoundStatus::NoQuorum;
            info!(
                round = round_id,
                winning_weight,
                required,
                total_stake,
                "no quorum"
            );
            return Err(NoQuorum::BelowThreshold {
                winning_digest,
                winning_weight,
                required,
                total_stake,
            });
        }

        let stake_snapshot: BTreeMap<ValidatorId, f64> =
            accounts.iter().map(|(id, a)| (id.clone(), a.stake)).collect();

        let mut slashed = Vec::new();
        let mut fraud = Vec::new();
        for (validator_id, digest) in &round.commitments {
            let Some(account) = accounts.get_mut(validator_id) else {
                continue;
            };
            if *digest == winning_digest {
                account.reputation += 1;
            } else {
                let stake_before = account.stake;
                account.reputation -= 1;
                account.stake = (account.stake * (1.0 - self.config.slash_fraction)).max(0.0);
                warn!(
                    round = round_id,
                    validator = %validator_id,
                    stake_before,
                    stake_after = account.stake,
                    "slashed"
                );
                slashed.push(validator_id.clone());
                fraud.push(FraudRecord {
                    validator_id: validator_id.clone(),
                    submitted: *digest,
                    stake_before,
                    stake_after: account.stake,
                });
            }
        }

        let result = ConsensusResult {
            round_id,
            winning_digest,
            winning_weight,
            total_stake,
            stake_fraction: winning_weight / total_stake,
            per_validator_digests: round.commitments.clone(),
            slashed,
            fraud,
            accounts: accounts.clone(),
        };
        drop(accounts);

        info!(
            round = round_id,
            digest = %winning_digest.short(),
            stake_pct = result.stake_fraction * 100.0,
            slashed = result.slashed.len(),
            "round finalized"
        );

        round.stake_snapshot = Some(stake_snapshot);
        round.status = RoundStatus::Finalized;
        round.result = Some(result.clone());
        Ok(result)
    }

    // Queries

    /// Current stake; unregistered validators report the default stake
    pub fn stake(&self, validator_id: &ValidatorId) -> f64 {
        self.accounts
            .read()
            .get(validator_id)
            .map_or(self.config.default_stake, |a| a.stake)
    }

    pub fn reputation(&self, validator_id: &ValidatorId) -> i64 {
        self.accounts.read().get(validator_id).map_or(0, |a| a.reputation)
    }

    pub fn accounts(&self) -> BTreeMap<ValidatorId, Account> {
        self.accounts.read().clone()
    }

    pub fn total_stake(&self) -> f64 {
        self.accounts.read().values().map(|a| a.stake).sum()
    }

    pub fn round(&self, round_id: RoundId) -> Option<ConsensusRound> {
        self.round_handle(round_id).map(|h| h.lock().clone())
    }

    pub fn round_status(&self, round_id: RoundId) -> Option<RoundStatus> {
        self.round_handle(round_id).map(|h| h.lock().status)
    }

    fn round_handle(&self, round_id: RoundId) -> Option<Arc<Mutex<ConsensusRound>>> {
        self.rounds.read().get(&round_id).cloned()
    }

    fn round_handle_or_insert(&self, round_id: RoundId) -> Arc<Mutex<ConsensusRound>> {
        if let Some(handle) = self.round_handle(round_id) {
            return handle;
        }
        self.rounds
            .write()
            .entry(round_id)
            .or_insert_with(|| Arc::new(Mutex::new(ConsensusRound::new(round_id))))
            .clone()
    }
}

// =============================================================================
// TESTS
// =============================================================================
