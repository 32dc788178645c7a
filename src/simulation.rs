//! Synthetic federation
//!
//! Stands in for local training so the whole pipeline can run in-process.
//! Honest clients send a shared base direction plus seeded Gaussian noise,
//! optionally clipped and noised for differential privacy, then masked.
//! Malicious clients scale their gradient up; malicious validators submit a
//! random digest instead of their real commitment.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal, NormalError, StandardNormal};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;
use crate::crypto::{self, CryptoError, Keypair, SymmetricKey};
use crate::engine::{EngineError, RoundEngine, RoundReport};
use crate::ledger::{ConsensusLedger, LedgerError};
use crate::packet::{CodecError, SecurePacket};
use crate::types::{ClientId, Digest, GradientVector, IdError, RoundId, ValidatorId};
use crate::validator::ValidatorState;

pub const DEFAULT_ATTACK_SCALE: f64 = 50.0;
pub const DEFAULT_NOISE_STD: f64 = 0.1;
pub const DEFAULT_MASK_STD: f64 = 0.01;
pub const DEFAULT_DP_CLIP_NORM: f64 = 1.0;
pub const DEFAULT_DP_NOISE_STD: f64 = 0.05;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("invalid simulation config: {0}")]
    Invalid(String),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("identifier error: {0}")]
    Id(#[from] IdError),

    #[error("noise distribution error: {0}")]
    Noise(#[from] NormalError),
}

/// Clip-then-noise step applied by each client before masking
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DpConfig {
    pub clip_norm: f64,
    pub noise_std: f64,
}

impl Default for DpConfig {
    fn default() -> Self {
        Self {
            clip_norm: DEFAULT_DP_CLIP_NORM,
            noise_std: DEFAULT_DP_NOISE_STD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub clients: usize,
    pub validators: usize,
    /// The last `malicious_clients` clients attack
    pub malicious_clients: usize,
    /// The last `malicious_validators` validators forge digests
    pub malicious_validators: usize,
    pub seed: u64,
    /// Stake registered for every validator
    pub stake: f64,
    /// Norm of the shared honest direction
    pub base_norm: f64,
    pub noise_std: f64,
    pub mask_std: f64,
    pub attack_scale: f64,
    pub differential_privacy: Option<DpConfig>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            clients: 3,
            validators: 3,
            malicious_clients: 0,
            malicious_validators: 0,
            seed: 0,
            stake: 10.0,
            base_norm: 1.0,
            noise_std: DEFAULT_NOISE_STD,
            mask_std: DEFAULT_MASK_STD,
            attack_scale: DEFAULT_ATTACK_SCALE,
            differential_privacy: None,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), SimulationError> {
        let invalid = |msg: String| Err(SimulationError::Invalid(msg));
        if self.clients == 0 || self.validators == 0 {
            return invalid("need at least one client and one validator".into());
        }
        if self.malicious_clients > self.clients {
            return invalid(format!("{} malicious of {} clients", self.malicious_clients, self.clients));
        }
        if self.malicious_validators > self.validators {
            return invalid(format!(
                "{} malicious of {} validators",
                self.malicious_validators, self.validators
            ));
        }
        if !self.stake.is_finite() || self.stake < 0.0 {
            return invalid(format!("stake {} must be non-negative", self.stake));
        }
        if !self.base_norm.is_finite() || self.base_norm <= 0.0 {
            return invalid(format!("base_norm {} must be positive", self.base_norm));
        }
        if !self.attack_scale.is_finite() {
            return invalid(format!("attack_scale {} must be finite", self.attack_scale));
        }
        for (name, value) in [("noise_std", self.noise_std), ("mask_std", self.mask_std)] {
            if !value.is_finite() || value < 0.0 {
                return invalid(format!("{name} {value} must be non-negative"));
            }
        }
        if let Some(dp) = &self.differential_privacy {
            if !dp.clip_norm.is_finite() || dp.clip_norm <= 0.0 {
                return invalid(format!("dp clip_norm {} must be positive", dp.clip_norm));
            }
            if !dp.noise_std.is_finite() || dp.noise_std < 0.0 {
                return invalid(format!("dp noise_std {} must be non-negative", dp.noise_std));
            }
        }
        Ok(())
    }
}

pub struct SimClient {
    pub id: ClientId,
    pub malicious: bool,
    signer: Keypair,
    keys: BTreeMap<ValidatorId, SymmetricKey>,
    mask: Vec<f32>,
}

impl SimClient {
    /// Validators this client completed a key exchange with
    pub fn validators(&self) -> impl Iterator<Item = &ValidatorId> {
        self.keys.keys()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientSummary {
    pub client_id: ClientId,
    pub grad_norm: f64,
    pub malicious: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub round: RoundReport,
    pub clients: Vec<ClientSummary>,
    pub malicious_validators: Vec<ValidatorId>,
}

pub struct Simulation {
    config: SimulationConfig,
    engine: RoundEngine,
    validators: Vec<ValidatorState>,
    clients: Vec<SimClient>,
    malicious_validators: BTreeSet<ValidatorId>,
    base: Vec<f64>,
    rng: ChaCha20Rng,
    next_round: RoundId,
}

impl Simulation {
    /// Create validators and clients, register stake and run every key exchange
    pub fn bootstrap(engine_config: Config, config: SimulationConfig) -> Result<Self, SimulationError> {
        config.validate()?;
        let grad_dim = engine_config.grad_dim;
        let ledger = Arc::new(ConsensusLedger::new(engine_config.ledger.clone()));
        let engine = RoundEngine::new(engine_config, Arc::clone(&ledger))?;
        let mut rng = ChaCha20Rng::seed_from_u64(config.seed);

        let mut validators = Vec::with_capacity(config.validators);
        let mut malicious_validators = BTreeSet::new();
        for i in 1..=config.validators {
            let id = ValidatorId::new(format!("V{i}"))?;
            ledger.register(id.clone(), config.stake)?;
            if i > config.validators - config.malicious_validators {
                malicious_validators.insert(id.clone());
            }
            validators.push(ValidatorState::new(id, grad_dim, &mut rng));
        }

        let mask_noise = Normal::new(0.0, config.mask_std)?;
        let mut clients = Vec::with_capacity(config.clients);
        for i in 1..=config.clients {
            let id = ClientId::new(format!("C{i}"))?;
            let mut keys = BTreeMap::new();
            for validator in &mut validators {
                let (encapsulation, shared) = crypto::encapsulate(&mut rng, &validator.kem_public_key())?;
                validator.accept_key_exchange(id.clone(), &encapsulation)?;
                keys.insert(validator.id().clone(), crypto::derive_symmetric_key(&shared));
            }
            let mask = (0..grad_dim).map(|_| mask_noise.sample(&mut rng) as f32).collect();
            debug!(client = %id, validators = keys.len(), "key exchange complete");
            clients.push(SimClient {
                malicious: i > config.clients - config.malicious_clients,
                signer: Keypair::generate(),
                id,
                keys,
                mask,
            });
        }

        let base = random_direction(&mut rng, grad_dim, config.base_norm);
        info!(
            clients = config.clients,
            validators = config.validators,
            malicious_clients = config.malicious_clients,
            malicious_validators = config.malicious_validators,
            seed = config.seed,
            "simulation ready"
        );

        Ok(Self {
            config,
            engine,
            validators,
            clients,
            malicious_validators,
            base,
            rng,
            next_round: 1,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn engine(&self) -> &RoundEngine {
        &self.engine
    }

    pub fn ledger(&self) -> &Arc<ConsensusLedger> {
        self.engine.ledger()
    }

    pub fn clients(&self) -> &[SimClient] {
        &self.clients
    }

    pub fn validators(&self) -> &[ValidatorState] {
        &self.validators
    }

    /// Generate gradients, seal packets for every validator, run the round
    pub async fn next_round(&mut self) -> Result<SimulationReport, SimulationError> {
        let round_id = self.next_round;
        self.next_round += 1;

        let noise = Normal::new(0.0, self.config.noise_std)?;
        let dp = match self.config.differential_privacy {
            Some(dp) => Some((dp.clip_norm, Normal::new(0.0, dp.noise_std)?)),
            None => None,
        };

        let mut summaries = Vec::with_capacity(self.clients.len());
        let mut packets = Vec::with_capacity(self.clients.len() * self.validators.len());
        for client in &self.clients {
            let mut gradient: Vec<f64> = self.base.iter().map(|b| b + noise.sample(&mut self.rng)).collect();
            if let Some((clip_norm, dp_noise)) = &dp {
                clip(&mut gradient, *clip_norm);
                for g in gradient.iter_mut() {
                    *g += dp_noise.sample(&mut self.rng);
                }
            }
            if client.malicious {
                for g in gradient.iter_mut() {
                    *g *= self.config.attack_scale;
                }
            }
            let vector = GradientVector::new(
                gradient
                    .iter()
                    .zip(&client.mask)
                    .map(|(g, m)| *g as f32 + m)
                    .collect(),
            );

            summaries.push(ClientSummary {
                client_id: client.id.clone(),
                grad_norm: vector.l2_norm(),
                malicious: client.malicious,
            });

            for (validator_id, key) in &client.keys {
                let packet = SecurePacket::seal(
                    &mut self.rng,
                    client.id.clone(),
                    validator_id.clone(),
                    &vector,
                    key,
                    &client.signer,
                )?;
                // In-process delivery still crosses the wire codec
                packets.push(SecurePacket::from_bytes(&packet.to_bytes()?)?);
            }
        }

        let malicious = &self.malicious_validators;
        let rng = &mut self.rng;
        let round = self
            .engine
            .run_round_with(round_id, &mut self.validators, packets, |validator_id, digest| {
                if malicious.contains(validator_id) {
                    let mut forged = [0u8; 32];
                    rng.fill_bytes(&mut forged);
                    debug!(round = round_id, validator = %validator_id, "forging digest");
                    Digest(forged)
                } else {
                    digest
                }
            })
            .await?;

        Ok(SimulationReport {
            round,
            clients: summaries,
            malicious_validators: self.malicious_validators.iter().cloned().collect(),
        })
    }

    pub async fn run(&mut self, rounds: usize) -> Result<Vec<SimulationReport>, SimulationError> {
        let mut reports = Vec::with_capacity(rounds);
        for _ in 0..rounds {
            reports.push(self.next_round().await?);
        }
        Ok(reports)
    }
}

fn random_direction<R: RngCore>(rng: &mut R, dim: usize, norm: f64) -> Vec<f64> {
    let mut direction: Vec<f64> = (0..dim).map(|_| StandardNormal.sample(rng)).collect();
    let length = direction.iter().map(|v| v * v).sum::<f64>().sqrt();
    if length <= f64::EPSILON {
        direction.iter_mut().for_each(|v| *v = 0.0);
        if let Some(first) = direction.first_mut() {
            *first = norm;
        }
        return direction;
    }
    direction.iter_mut().for_each(|v| *v *= norm / length);
    direction
}

/// Scale `values` down to `max_norm` if it is longer
fn clip(values: &mut [f64], max_norm: f64) {
    let norm = values.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-8);
        values.iter_mut().for_each(|v| *v *= scale);
    }
}
