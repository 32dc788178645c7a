//! Anomaly gate
//!
//! Screens authenticated gradients before they reach the aggregator:
//! a hard magnitude cutoff, then a drift check against an exponential
//! moving average of what this validator already admitted. Suspicion only
//! accumulates within a round; a blocked client stays blocked until the
//! next `reset`.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::types::{ClientId, GradientVector};

pub const DEFAULT_EMA_ALPHA: f64 = 0.1;
pub const DEFAULT_NORM_THRESHOLD: f64 = 10.0;
pub const DEFAULT_COSINE_THRESHOLD: f64 = 0.0;
pub const DEFAULT_MAX_SUSPICION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub norm_threshold: f64,
    pub cosine_threshold: f64,
    pub max_suspicion: u32,
    pub ema_alpha: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            norm_threshold: DEFAULT_NORM_THRESHOLD,
            cosine_threshold: DEFAULT_COSINE_THRESHOLD,
            max_suspicion: DEFAULT_MAX_SUSPICION,
            ema_alpha: DEFAULT_EMA_ALPHA,
        }
    }
}

/// Outcome of a successful admission
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Clean,
    /// Drifted from the reference but below the block threshold
    Suspect { similarity: f64, suspicion: u32 },
}

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalyRejection {
    #[error("gradient norm {norm:.4} exceeds threshold {threshold}")]
    MagnitudeExceeded { norm: f64, threshold: f64 },

    #[error("client blocked after {suspicion} drift flags")]
    RepeatedDrift { suspicion: u32, similarity: Option<f64> },
}

/// Per-validator, per-round gate state
#[derive(Debug, Clone, Default)]
pub struct GateState {
    reference: Option<Vec<f64>>,
    suspicion: HashMap<ClientId, u32>,
    blocked: HashSet<ClientId>,
}

impl GateState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Round boundary: forget reference direction, suspicion and blocks
    pub fn reset(&mut self) {
        self.reference = None;
        self.suspicion.clear();
        self.blocked.clear();
    }

    pub fn reference_gradient(&self) -> Option<GradientVector> {
        self.reference
            .as_ref()
            .map(|r| GradientVector::new(r.iter().map(|&v| v as f32).collect()))
    }

    pub fn suspicion(&self, client_id: &ClientId) -> u32 {
        self.suspicion.get(client_id).copied().unwrap_or(0)
    }

    pub fn is_blocked(&self, client_id: &ClientId) -> bool {
        self.blocked.contains(client_id)
    }

    fn similarity_to_reference(&self, vector: &GradientVector) -> Option<f64> {
        vector.cosine_similarity(&self.reference_gradient()?)
    }

    fn absorb(&mut self, vector: &GradientVector, alpha: f64) {
        match self.reference.as_mut() {
            None => {
                self.reference = Some(vector.as_slice().iter().map(|&v| v as f64).collect());
            }
            Some(reference) => {
                for (r, &v) in reference.iter_mut().zip(vector.as_slice()) {
                    *r = (1.0 - alpha) * *r + alpha * v as f64;
                }
            }
        }
    }
}

/// Decide whether `vector` from `client_id` may join the aggregate.
///
/// On `Ok` the caller appends the vector to its admitted set; the reference
/// direction has already absorbed it. On `Err` nothing but the suspicion
/// counter (and possibly the block list) changed.
pub fn admit(
    config: &GateConfig,
    state: &mut GateState,
    client_id: &ClientId,
    vector: &GradientVector,
) -> Result<Verdict, AnomalyRejection> {
    if state.is_blocked(client_id) {
        return Err(AnomalyRejection::RepeatedDrift {
            suspicion: state.suspicion(client_id),
            similarity: None,
        });
    }

    // Hard cutoff, no suspicion
    let norm = vector.l2_norm();
    if !vector.is_finite() || !norm.is_finite() || norm > config.norm_threshold {
        return Err(AnomalyRejection::MagnitudeExceeded {
            norm,
            threshold: config.norm_threshold,
        });
    }

    let mut verdict = Verdict::Clean;
    if let Some(similarity) = state.similarity_to_reference(vector) {
        if similarity < config.cosine_threshold {
            let count = state.suspicion.entry(client_id.clone()).or_insert(0);
            *count += 1;
            let suspicion = *count;
            if suspicion >= config.max_suspicion {
                state.blocked.insert(client_id.clone());
                return Err(AnomalyRejection::RepeatedDrift {
                    suspicion,
                    similarity: Some(similarity),
                });
            }
            verdict = Verdict::Suspect { similarity, suspicion };
        }
    }

    state.absorb(vector, config.ema_alpha);
    Ok(verdict)
}
