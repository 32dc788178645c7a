//! Validator state
//!
//! One `ValidatorState` per validator, owned by exactly one task. Holds the
//! pairwise keys agreed with clients, the gradients admitted this round and
//! the anomaly gate state. Packets are processed in `client_id` order so the
//! admitted set (and hence the commitment) does not depend on arrival order.

use rand::{CryptoRng, RngCore};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::aggregate::{self, AggregateError, AggregationMode};
use crate::anomaly::{self, AnomalyRejection, GateConfig, GateState, Verdict};
use crate::commitment;
use crate::crypto::{self, CryptoError, Encapsulation, KemKeypair, KemPublicKey, SymmetricKey};
use crate::packet::{self, AuthError, SecurePacket};
use crate::types::{ClientId, Digest, GradientVector, ValidatorId};

/// Why a packet did not make it into the aggregate
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "stage", content = "detail", rename_all = "snake_case")]
pub enum Rejection {
    #[error("packet addressed to validator {addressed_to}")]
    Misrouted { addressed_to: ValidatorId },

    #[error("client already admitted this round")]
    Duplicate,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Anomaly(#[from] AnomalyRejection),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PacketStatus {
    Admitted { verdict: Verdict },
    Rejected { reason: Rejection },
}

/// Per-packet decision, attributable to client and check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PacketOutcome {
    pub client_id: ClientId,
    /// Norm of the decrypted gradient; `None` if it never decrypted
    pub grad_norm: Option<f64>,
    pub status: PacketStatus,
}

impl PacketOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self.status, PacketStatus::Admitted { .. })
    }
}

/// What a validator puts forward at the end of a round
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatorCommitment {
    pub validator_id: ValidatorId,
    #[serde(skip)]
    pub aggregate: GradientVector,
    pub aggregate_norm: f64,
    pub digest: Digest,
    pub admitted: usize,
}

pub struct ValidatorState {
    id: ValidatorId,
    grad_dim: usize,
    kem: KemKeypair,
    symmetric_keys: HashMap<ClientId, SymmetricKey>,
    admitted: Vec<(ClientId, GradientVector)>,
    gate: GateState,
}

impl ValidatorState {
    pub fn new<R: RngCore + CryptoRng>(id: ValidatorId, grad_dim: usize, rng: &mut R) -> Self {
        Self {
            id,
            grad_dim,
            kem: KemKeypair::generate(rng),
            symmetric_keys: HashMap::new(),
            admitted: Vec::new(),
            gate: GateState::new(),
        }
    }

    pub fn id(&self) -> &ValidatorId {
        &self.id
    }

    pub fn grad_dim(&self) -> usize {
        self.grad_dim
    }

    pub fn kem_public_key(&self) -> KemPublicKey {
        self.kem.public_key()
    }

    // Key exchange

    /// Complete a client's key exchange. Returns `false` if the client
    /// already has a key; the existing key is kept.
    pub fn accept_key_exchange(
        &mut self,
        client_id: ClientId,
        encapsulation: &Encapsulation,
    ) -> Result<bool, CryptoError> {
        let shared = self.kem.decapsulate(encapsulation)?;
        Ok(self.register_client_key(client_id, crypto::derive_symmetric_key(&shared)))
    }

    pub fn register_client_key(&mut self, client_id: ClientId, key: SymmetricKey) -> bool {
        if self.symmetric_keys.contains_key(&client_id) {
            warn!(validator = %self.id, client = %client_id, "key already registered, keeping existing");
            return false;
        }
        self.symmetric_keys.insert(client_id, key);
        true
    }

    pub fn symmetric_key(&self, client_id: &ClientId) -> Option<&SymmetricKey> {
        self.symmetric_keys.get(client_id)
    }

    pub fn known_clients(&self) -> usize {
        self.symmetric_keys.len()
    }

    // Round lifecycle

    /// Clear admitted gradients and gate state
    pub fn begin_round(&mut self) {
        self.admitted.clear();
        self.gate.reset();
    }

    pub fn admitted(&self) -> &[(ClientId, GradientVector)] {
        &self.admitted
    }

    pub fn gate(&self) -> &GateState {
        &self.gate
    }

    /// Screen a batch of packets in `client_id` order.
    ///
    /// Equal client ids keep their arrival order, so the first valid packet wins.
    pub fn ingest(&mut self, mut packets: Vec<SecurePacket>, config: &GateConfig) -> Vec<PacketOutcome> {
        packets.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        packets.iter().map(|p| self.ingest_one(p, config)).collect()
    }

    fn ingest_one(&mut self, packet: &SecurePacket, config: &GateConfig) -> PacketOutcome {
        match self.screen(packet, config) {
            Ok((vector, verdict)) => {
                let grad_norm = vector.l2_norm();
                debug!(
                    validator = %self.id,
                    client = %packet.client_id,
                    norm = grad_norm,
                    ?verdict,
                    "admitted"
                );
                self.admitted.push((packet.client_id.clone(), vector));
                PacketOutcome {
                    client_id: packet.client_id.clone(),
                    grad_norm: Some(grad_norm),
                    status: PacketStatus::Admitted { verdict },
                }
            }
            Err((reason, grad_norm)) => {
                warn!(
                    validator = %self.id,
                    client = %packet.client_id,
                    %reason,
                    "rejected"
                );
                PacketOutcome {
                    client_id: packet.client_id.clone(),
                    grad_norm,
                    status: PacketStatus::Rejected { reason },
                }
            }
        }
    }

    fn screen(
        &mut self,
        packet: &SecurePacket,
        config: &GateConfig,
    ) -> Result<(GradientVector, Verdict), (Rejection, Option<f64>)> {
        if packet.validator_id != self.id {
            return Err((
                Rejection::Misrouted { addressed_to: packet.validator_id.clone() },
                None,
            ));
        }
        if self.admitted.iter().any(|(c, _)| c == &packet.client_id) {
            return Err((Rejection::Duplicate, None));
        }

        let vector = packet::authenticate(packet, self).map_err(|e| (e.into(), None))?;
        let norm = vector.l2_norm();
        let verdict = anomaly::admit(config, &mut self.gate, &packet.client_id, &vector)
            .map_err(|e| (e.into(), Some(norm)))?;
        Ok((vector, verdict))
    }

    /// Aggregate what was admitted and commit to it
    pub fn commit(&self, mode: AggregationMode) -> Result<ValidatorCommitment, AggregateError> {
        let vectors: Vec<GradientVector> = self.admitted.iter().map(|(_, v)| v.clone()).collect();
        let aggregate = aggregate::aggregate(&vectors, mode, self.grad_dim)?;
        let digest = commitment::commit(&aggregate);
        debug!(
            validator = %self.id,
            admitted = vectors.len(),
            digest = %digest.short(),
            "committed aggregate"
        );
        Ok(ValidatorCommitment {
            validator_id: self.id.clone(),
            aggregate_norm: aggregate.l2_norm(),
            aggregate,
            digest,
            admitted: vectors.len(),
        })
    }
}

impl std::fmt::Debug for ValidatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatorState")
            .field("id", &self.id)
            .field("grad_dim", &self.grad_dim)
            .field("clients", &self.symmetric_keys.len())
            .field("admitted", &self.admitted.len())
            .finish()
    }
}
