//! Cryptographic collaborators
//!
//! - ML-DSA (Dilithium3) detached signatures over gradient bytes
//! - Hybrid ML-KEM-768 + X25519 key exchange between client and validator
//! - ChaCha20-Poly1305 payload encryption (tamper → decryption failure)
//! - SHA3-256 digests

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use pqcrypto_dilithium::dilithium3 as mldsa;
use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SharedSecret as _};
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};

use crate::types::{Hash, PublicKey, Signature};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Transcript label for the hybrid key exchange
pub const KEX_PROTOCOL_NAME: &[u8] = b"DFLN_KEX_25519+Kyber768_SHA3-256";

/// Label for deriving the packet encryption key from the shared secret
pub const PACKET_KEY_LABEL: &[u8] = b"DFLN_PACKET_KEY_V1";

/// X25519 public key size
pub const X25519_PUBKEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 key size
pub const CHACHA_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce size
pub const CHACHA_NONCE_SIZE: usize = 12;

/// ChaCha20-Poly1305 tag size
pub const CHACHA_TAG_SIZE: usize = 16;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed")]
    Decryption,

    #[error("ml-kem error: {0}")]
    MlKem(String),

    #[error("key exchange failed: {0}")]
    KeyExchange(String),
}

// =============================================================================
// HASHING
// =============================================================================

pub fn sha3(data: &[u8]) -> Hash {
    Sha3_256::digest(data).into()
}

/// HKDF-style extract/expand over SHA3-256, two 32-byte outputs
pub fn hkdf_sha3(chaining_key: &[u8; 32], input_key_material: &[u8]) -> ([u8; 32], [u8; 32]) {
    // Extract
    let mut hasher = Sha3_256::new();
    hasher.update(chaining_key);
    hasher.update(input_key_material);
    let temp_key: [u8; 32] = hasher.finalize().into();

    // Expand (output 1)
    let mut hasher = Sha3_256::new();
    hasher.update(temp_key);
    hasher.update([0x01]);
    let output1: [u8; 32] = hasher.finalize().into();

    // Expand (output 2)
    let mut hasher = Sha3_256::new();
    hasher.update(temp_key);
    hasher.update(output1);
    hasher.update([0x02]);
    let output2: [u8; 32] = hasher.finalize().into();

    (output1, output2)
}

// =============================================================================
// SIGNATURES (ML-DSA)
// =============================================================================

/// Client signing identity
pub struct Keypair {
    pub public: PublicKey,
    secret: mldsa::SecretKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let (pk, sk) = mldsa::keypair();
        Self {
            public: pk.as_bytes().to_vec(),
            secret: sk,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public.clone()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        mldsa::detached_sign(message, &self.secret).as_bytes().to_vec()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({}, [REDACTED])", hex::encode(&self.public[..8.min(self.public.len())]))
    }
}

/// Verify a detached ML-DSA signature. Malformed keys or signatures verify as false.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(pk) = mldsa::PublicKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(sig) = mldsa::DetachedSignature::from_bytes(signature) else {
        return false;
    };
    mldsa::verify_detached_signature(&sig, message, &pk).is_ok()
}

// =============================================================================
// KEY EXCHANGE (ML-KEM-768 + X25519)
// =============================================================================

/// Validator's published key-exchange key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KemPublicKey {
    pub kyber: Vec<u8>,
    pub x25519: [u8; X25519_PUBKEY_SIZE],
}

/// What the client sends back: KEM ciphertext plus its ephemeral X25519 key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Encapsulation {
    pub kyber_ciphertext: Vec<u8>,
    pub x25519_ephemeral: [u8; X25519_PUBKEY_SIZE],
}

/// Combined shared secret of both halves
pub struct SharedSecret([u8; 32]);

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// Validator's long-term key-exchange keypair
pub struct KemKeypair {
    kyber_pk: kyber768::PublicKey,
    kyber_sk: kyber768::SecretKey,
    x25519_secret: [u8; 32],
    x25519_public: [u8; X25519_PUBKEY_SIZE],
}

impl KemKeypair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let (kyber_pk, kyber_sk) = kyber768::keypair();

        let mut x25519_secret = [0u8; 32];
        rng.fill_bytes(&mut x25519_secret);
        let x25519_public = X25519PublicKey::from(&X25519Secret::from(x25519_secret)).to_bytes();

        Self {
            kyber_pk,
            kyber_sk,
            x25519_secret,
            x25519_public,
        }
    }

    pub fn public_key(&self) -> KemPublicKey {
        KemPublicKey {
            kyber: self.kyber_pk.as_bytes().to_vec(),
            x25519: self.x25519_public,
        }
    }

    pub fn decapsulate(&self, encapsulation: &Encapsulation) -> Result<SharedSecret, CryptoError> {
        let ct = kyber768::Ciphertext::from_bytes(&encapsulation.kyber_ciphertext)
            .map_err(|_| CryptoError::MlKem("invalid KEM ciphertext".into()))?;
        let kem_ss = kyber768::decapsulate(&ct, &self.kyber_sk);
        let dh = dh(&self.x25519_secret, &encapsulation.x25519_ephemeral)?;
        Ok(combine(&dh, kem_ss.as_bytes(), &encapsulation.x25519_ephemeral))
    }
}

impl fmt::Debug for KemKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KemKeypair({}, [REDACTED])", hex::encode(&self.x25519_public[..8]))
    }
}

/// Client side of the exchange against a validator's public key
pub fn encapsulate<R: RngCore + CryptoRng>(
    rng: &mut R,
    remote: &KemPublicKey,
) -> Result<(Encapsulation, SharedSecret), CryptoError> {
    let remote_kem_pk = kyber768::PublicKey::from_bytes(&remote.kyber)
        .map_err(|_| CryptoError::MlKem("invalid remote KEM public key".into()))?;
    let (kem_ss, ct) = kyber768::encapsulate(&remote_kem_pk);

    let mut ephemeral = [0u8; 32];
    rng.fill_bytes(&mut ephemeral);
    let ephemeral_public = X25519PublicKey::from(&X25519Secret::from(ephemeral)).to_bytes();
    let dh = dh(&ephemeral, &remote.x25519)?;

    let shared = combine(&dh, kem_ss.as_bytes(), &ephemeral_public);
    let encapsulation = Encapsulation {
        kyber_ciphertext: ct.as_bytes().to_vec(),
        x25519_ephemeral: ephemeral_public,
    };
    Ok((encapsulation, shared))
}

pub fn derive_symmetric_key(shared: &SharedSecret) -> SymmetricKey {
    let (_, key) = hkdf_sha3(&sha3(PACKET_KEY_LABEL), &shared.0);
    SymmetricKey(key)
}

fn combine(dh: &[u8; 32], kem_ss: &[u8], ephemeral_public: &[u8; 32]) -> SharedSecret {
    let mut ikm = Vec::with_capacity(32 + kem_ss.len() + 32);
    ikm.extend_from_slice(dh);
    ikm.extend_from_slice(kem_ss);
    ikm.extend_from_slice(ephemeral_public);
    let (secret, _) = hkdf_sha3(&sha3(KEX_PROTOCOL_NAME), &ikm);
    SharedSecret(secret)
}

/// X25519 Diffie-Hellman; low-order remote points are refused
fn dh(secret: &[u8; 32], public: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    let secret_key = X25519Secret::from(*secret);
    let public_key = X25519PublicKey::from(*public);
    let shared = secret_key.diffie_hellman(&public_key);
    if !shared.was_contributory() {
        return Err(CryptoError::KeyExchange("non-contributory X25519 share".into()));
    }
    Ok(*shared.as_bytes())
}

// =============================================================================
// SYMMETRIC CIPHER (ChaCha20-Poly1305)
// =============================================================================

/// Per (client, validator) payload key. Token layout: nonce || ciphertext || tag.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; CHACHA_KEY_SIZE]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; CHACHA_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn encrypt<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0).map_err(|_| CryptoError::Encryption)?;

        let mut nonce_bytes = [0u8; CHACHA_NONCE_SIZE];
        rng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::Encryption)?;

        let mut token = Vec::with_capacity(CHACHA_NONCE_SIZE + ciphertext.len());
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(&ciphertext);
        Ok(token)
    }

    pub fn decrypt(&self, token: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if token.len() < CHACHA_NONCE_SIZE + CHACHA_TAG_SIZE {
            return Err(CryptoError::Decryption);
        }
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0).map_err(|_| CryptoError::Decryption)?;

        let (nonce_bytes, ciphertext) = token.split_at(CHACHA_NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad })
            .map_err(|_| CryptoError::Decryption)
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey([REDACTED])")
    }
}

// =============================================================================
// TESTS
// =============================================================================
