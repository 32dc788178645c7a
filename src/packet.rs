//! Secure gradient packets
//!
//! A client seals one packet per validator: the gradient bytes are encrypted
//! under the pairwise key, hashed and signed. The validator side reverses this
//! in a fixed order of short-circuiting checks so every rejection names the
//! first check that failed.

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{self, CryptoError, Keypair, SymmetricKey};
use crate::types::{ClientId, Digest, GradientVector, PublicKey, Signature, ValidatorId, GRADIENT_COMPONENT_BYTES};
use crate::validator::ValidatorState;

/// Domain separation for the AEAD associated data
pub const PACKET_AAD_PREFIX: &[u8] = b"DFLN_PACKET_V1:";

/// Upper bound for a serialized packet accepted by `from_bytes` (16 MiB)
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthError {
    #[error("no symmetric key registered for client {client_id}")]
    UnknownClient { client_id: ClientId },

    #[error("payload failed authenticated decryption")]
    DecryptionError,

    #[error("plaintext hash mismatch")]
    IntegrityError,

    #[error("signature verification failed")]
    AuthenticityError,

    #[error("gradient length mismatch: expected {expected_bytes} bytes, got {got_bytes}")]
    DimensionError { expected_bytes: usize, got_bytes: usize },
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("packet too large: {size} > {max}")]
    TooLarge { size: usize, max: usize },

    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Encrypted, hash-committed, signed gradient for one validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurePacket {
    pub client_id: ClientId,
    pub validator_id: ValidatorId,
    pub encrypted_payload: Vec<u8>,
    pub plaintext_hash: Digest,
    pub signature: Signature,
    pub signer_public_key: PublicKey,
    pub payload_length: u32,
}

impl SecurePacket {
    /// Client side: encrypt, hash and sign a gradient for `validator_id`.
    pub fn seal<R: RngCore + CryptoRng>(
        rng: &mut R,
        client_id: ClientId,
        validator_id: ValidatorId,
        gradient: &GradientVector,
        key: &SymmetricKey,
        signer: &Keypair,
    ) -> Result<Self, CryptoError> {
        let plaintext = gradient.to_le_bytes();
        let aad = associated_data(&client_id, &validator_id);
        let encrypted_payload = key.encrypt(rng, &plaintext, &aad)?;

        Ok(Self {
            plaintext_hash: Digest(crypto::sha3(&plaintext)),
            signature: signer.sign(&plaintext),
            signer_public_key: signer.public_key(),
            payload_length: plaintext.len() as u32,
            encrypted_payload,
            client_id,
            validator_id,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(CodecError::TooLarge { size: bytes.len(), max: MAX_PACKET_SIZE });
        }
        Ok(postcard::from_bytes(bytes)?)
    }
}

fn associated_data(client_id: &ClientId, validator_id: &ValidatorId) -> Vec<u8> {
    let mut aad = Vec::with_capacity(PACKET_AAD_PREFIX.len() + 2 * crate::types::MAX_ID_LEN + 1);
    aad.extend_from_slice(PACKET_AAD_PREFIX);
    aad.extend_from_slice(client_id.as_str().as_bytes());
    aad.push(b'|');
    aad.extend_from_slice(validator_id.as_str().as_bytes());
    aad
}

/// Validator side: turn a packet into a gradient or say which check failed.
///
/// Order: key lookup, decryption, plaintext hash, signature, dimension.
/// Pure; never touches validator or ledger state.
pub fn authenticate(packet: &SecurePacket, state: &ValidatorState) -> Result<GradientVector, AuthError> {
    let key = state
        .symmetric_key(&packet.client_id)
        .ok_or_else(|| AuthError::UnknownClient { client_id: packet.client_id.clone() })?;

    let aad = associated_data(&packet.client_id, &packet.validator_id);
    let plaintext = key
        .decrypt(&packet.encrypted_payload, &aad)
        .map_err(|_| AuthError::DecryptionError)?;

    if crypto::sha3(&plaintext) != packet.plaintext_hash.0 {
        return Err(AuthError::IntegrityError);
    }

    if !crypto::verify(&packet.signer_public_key, &plaintext, &packet.signature) {
        return Err(AuthError::AuthenticityError);
    }

    let expected_bytes = state.grad_dim() * GRADIENT_COMPONENT_BYTES;
    if plaintext.len() != expected_bytes || packet.payload_length as usize != plaintext.len() {
        return Err(AuthError::DimensionError {
            expected_bytes,
            got_bytes: plaintext.len(),
        });
    }

    GradientVector::from_le_bytes(&plaintext).ok_or(AuthError::DimensionError {
        expected_bytes,
        got_bytes: plaintext.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    struct Fixture {
        validator: ValidatorState,
        client: ClientId,
        key: SymmetricKey,
        signer: Keypair,
    }

    fn fixture(grad_dim: usize) -> Fixture {
        let mut rng = OsRng;
        let mut validator = ValidatorState::new(ValidatorId::new("V1").unwrap(), grad_dim, &mut rng);
        let client = ClientId::new("C1").unwrap();
        let (encapsulation, shared) = crypto::encapsulate(&mut rng, &validator.kem_public_key()).unwrap();
        validator.accept_key_exchange(client.clone(), &encapsulation).unwrap();
        Fixture {
            validator,
            client,
            key: crypto::derive_symmetric_key(&shared),
            signer: Keypair::generate(),
        }
    }

    fn seal(fx: &Fixture, gradient: &GradientVector) -> SecurePacket {
        SecurePacket::seal(
            &mut OsRng,
            fx.client.clone(),
            fx.validator.id().clone(),
            gradient,
            &fx.key,
            &fx.signer,
        )
        .unwrap()
    }

    #[test]
    fn test_authenticate_valid_packet() {
        let fx = fixture(3);
        let gradient = GradientVector::new(vec![0.5, -1.0, 2.0]);
        let packet = seal(&fx, &gradient);
        assert_eq!(authenticate(&packet, &fx.validator), Ok(gradient));
    }

    #[test]
    fn test_unknown_client() {
        let fx = fixture(3);
        let mut packet = seal(&fx, &GradientVector::zeros(3));
        packet.client_id = ClientId::new("C9").unwrap();
        assert!(matches!(
            authenticate(&packet, &fx.validator),
            Err(AuthError::UnknownClient { .. })
        ));
    }

    #[test]
    fn test_payload_tamper_detected() {
        let fx = fixture(3);
        let packet = seal(&fx, &GradientVector::new(vec![1.0, 2.0, 3.0]));
        for i in 0..packet.encrypted_payload.len() {
            let mut tampered = packet.clone();
            tampered.encrypted_payload[i] ^= 0x01;
            assert_eq!(authenticate(&tampered, &fx.validator), Err(AuthError::DecryptionError));
        }
    }

    #[test]
    fn test_hash_tamper_detected() {
        let fx = fixture(3);
        let packet = seal(&fx, &GradientVector::new(vec![1.0, 2.0, 3.0]));
        for i in 0..32 {
            let mut tampered = packet.clone();
            tampered.plaintext_hash.0[i] ^= 0x01;
            assert_eq!(authenticate(&tampered, &fx.validator), Err(AuthError::IntegrityError));
        }
    }

    #[test]
    fn test_signature_tamper_detected() {
        let fx = fixture(3);
        let packet = seal(&fx, &GradientVector::new(vec![1.0, 2.0, 3.0]));
        for i in [0, 1, 100, packet.signature.len() / 2, packet.signature.len() - 1] {
            let mut tampered = packet.clone();
            tampered.signature[i] ^= 0x01;
            assert_eq!(authenticate(&tampered, &fx.validator), Err(AuthError::AuthenticityError));
        }
    }

    #[test]
    fn test_foreign_signer_rejected() {
        let fx = fixture(3);
        let mut packet = seal(&fx, &GradientVector::new(vec![1.0, 2.0, 3.0]));
        packet.signer_public_key = Keypair::generate().public;
        assert_eq!(authenticate(&packet, &fx.validator), Err(AuthError::AuthenticityError));
    }

    #[test]
    fn test_dimension_mismatch() {
        let fx = fixture(3);
        let packet = seal(&fx, &GradientVector::new(vec![1.0, 2.0]));
        assert_eq!(
            authenticate(&packet, &fx.validator),
            Err(AuthError::DimensionError { expected_bytes: 12, got_bytes: 8 })
        );
    }

    #[test]
    fn test_declared_length_must_match() {
        let fx = fixture(3);
        let mut packet = seal(&fx, &GradientVector::new(vec![1.0, 2.0, 3.0]));
        packet.payload_length = 16;
        assert!(matches!(
            authenticate(&packet, &fx.validator),
            Err(AuthError::DimensionError { .. })
        ));
    }

    #[test]
    fn test_replay_to_other_validator_fails_decryption() {
        let fx = fixture(3);
        let mut packet = seal(&fx, &GradientVector::new(vec![1.0, 2.0, 3.0]));
        packet.validator_id = ValidatorId::new("V2").unwrap();
        assert_eq!(authenticate(&packet, &fx.validator), Err(AuthError::DecryptionError));
    }

    #[test]
    fn test_wire_codec() {
        let fx = fixture(3);
        let packet = seal(&fx, &GradientVector::new(vec![1.0, 2.0, 3.0]));
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(SecurePacket::from_bytes(&bytes).unwrap(), packet);
        assert!(SecurePacket::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }
}
