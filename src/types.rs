use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

pub type Hash = [u8; 32];
pub type PublicKey = Vec<u8>;  // ML-DSA (Dilithium3)
pub type Signature = Vec<u8>;  // detached ML-DSA signature
pub type RoundId = u64;

/// Maximum identifier length (client and validator ids)
pub const MAX_ID_LEN: usize = 64;

/// Bytes per serialized gradient component (f32, little-endian)
pub const GRADIENT_COMPONENT_BYTES: usize = 4;

// =============================================================================
// IDENTIFIERS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier too long: {len} > {max}")]
    TooLong { len: usize, max: usize },
    #[error("identifier contains invalid character {0:?}")]
    InvalidChar(char),
}

fn validate_id(raw: &str) -> Result<(), IdError> {
    if raw.is_empty() {
        return Err(IdError::Empty);
    }
    if raw.len() > MAX_ID_LEN {
        return Err(IdError::TooLong { len: raw.len(), max: MAX_ID_LEN });
    }
    if let Some(c) = raw
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(IdError::InvalidChar(c));
    }
    Ok(())
}

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Result<Self, IdError> {
                let raw = raw.into();
                validate_id(&raw)?;
                Ok(Self(raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(raw: String) -> Result<Self, IdError> {
                Self::new(raw)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdError;

            fn from_str(raw: &str) -> Result<Self, IdError> {
                Self::new(raw)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

identifier!(
    /// Federated-learning client identifier
    ClientId
);

identifier!(
    /// Validator (committee member) identifier
    ValidatorId
);

// =============================================================================
// DIGEST
// =============================================================================

/// SHA3-256 digest. Ordered by raw byte comparison.
///
/// Human-readable formats (JSON) carry it as lowercase hex,
/// binary formats as the raw 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Digest(pub Hash);

impl Digest {
    pub fn as_bytes(&self) -> &Hash {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 10 hex characters, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..5])
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }
}

impl From<Hash> for Digest {
    fn from(hash: Hash) -> Self {
        Self(hash)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Digest::from_hex(&s).map_err(serde::de::Error::custom)
        } else {
            Hash::deserialize(deserializer).map(Digest)
        }
    }
}

// =============================================================================
// GRADIENT VECTOR
// =============================================================================

/// Flattened gradient of one client for one round.
///
/// Length is the round-wide `grad_dim`; mismatched vectors are rejected
/// upstream, never padded or truncated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientVector(Vec<f32>);

impl GradientVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn zeros(dim: usize) -> Self {
        Self(vec![0.0; dim])
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Fixed little-endian encoding, 4 bytes per component
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * GRADIENT_COMPONENT_BYTES);
        for v in &self.0 {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Inverse of `to_le_bytes`. `None` if the length is not a multiple of 4.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % GRADIENT_COMPONENT_BYTES != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(GRADIENT_COMPONENT_BYTES)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self(values))
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }

    /// Euclidean norm, accumulated in f64
    pub fn l2_norm(&self) -> f64 {
        self.0
            .iter()
            .map(|&v| {
                let v = v as f64;
                v * v
            })
            .sum::<f64>()
            .sqrt()
    }

    pub fn dot(&self, other: &GradientVector) -> f64 {
        self.0
            .iter()
            .zip(&other.0)
            .map(|(&a, &b)| a as f64 * b as f64)
            .sum()
    }

    /// Cosine similarity in [-1, 1].
    ///
    /// `None` when the dimensions differ or either vector has zero norm
    /// (direction undefined).
    pub fn cosine_similarity(&self, other: &GradientVector) -> Option<f64> {
        if self.dim() != other.dim() {
            return None;
        }
        let denom = self.l2_norm() * other.l2_norm();
        if denom <= f64::EPSILON {
            return None;
        }
        Some((self.dot(other) / denom).clamp(-1.0, 1.0))
    }
}

impl From<Vec<f32>> for GradientVector {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}
