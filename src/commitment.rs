//! Aggregate commitments

use sha3::{Digest as _, Sha3_256};

use crate::types::{Digest, GradientVector};

/// Domain separation for aggregate commitments
pub const COMMITMENT_PREFIX: &[u8] = b"DFLN_AGGREGATE_V1:";

/// SHA3-256 over prefix || dim (u64 LE) || components (f32 LE).
///
/// Bit-identical vectors always commit to the same digest; `0.0` and `-0.0`
/// are different bit patterns and commit differently.
pub fn commit(vector: &GradientVector) -> Digest {
    let mut hasher = Sha3_256::new();
    hasher.update(COMMITMENT_PREFIX);
    hasher.update((vector.dim() as u64).to_le_bytes());
    hasher.update(vector.to_le_bytes());
    Digest(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_deterministic() {
        let v = GradientVector::new(vec![0.25, -1.5, 3.0]);
        assert_eq!(commit(&v), commit(&v.clone()));
    }

    #[test]
    fn test_commit_sensitive_to_single_bit() {
        let a = GradientVector::new(vec![1.0, 2.0]);
        let b = GradientVector::new(vec![1.0, f32::from_bits(2.0f32.to_bits() ^ 1)]);
        assert_ne!(commit(&a), commit(&b));
    }

    #[test]
    fn test_zero_vector_commitment_fixed() {
        let zero = commit(&GradientVector::zeros(3));
        assert_eq!(zero, commit(&GradientVector::new(vec![0.0; 3])));
        assert_ne!(zero, commit(&GradientVector::zeros(4)));
        assert_ne!(zero, commit(&GradientVector::new(vec![-0.0; 3])));
    }
}
