//! ML-DSA-65 (FIPS 204) identity keys for signing handshake payloads.
//!
//! Each authenticated user holds a [`SigningIdentity`]. Every handshake step
//! posted through signaling carries a signature over [`handshake_digest`],
//! which binds a step label, the call id and the step's payload fields.

use ml_dsa::signature::{Signer, Verifier};
use ml_dsa::{MlDsa65, B32};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};

pub const ML_DSA_PUBLIC_KEY_LEN: usize = 1952;
pub const ML_DSA_SIGNATURE_LEN: usize = 3309;

const SEED_LABEL: &[u8] = b"qumail/ml-dsa-65/seed";
const DIGEST_LABEL: &[u8] = b"qumail/handshake-signature/v1";

#[derive(Clone, PartialEq, Eq)]
pub struct IdentityKey {
    bytes: [u8; ML_DSA_PUBLIC_KEY_LEN],
}

impl IdentityKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; ML_DSA_PUBLIC_KEY_LEN] =
            bytes.try_into().map_err(|_| CryptoError::InvalidLength {
                expected: ML_DSA_PUBLIC_KEY_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn fingerprint(&self) -> String {
        hex::encode(&Sha256::digest(self.bytes)[..8])
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let sig_bytes: [u8; ML_DSA_SIGNATURE_LEN] = signature
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature)?;
        let sig = ml_dsa::Signature::<MlDsa65>::decode(&sig_bytes.into())
            .ok_or(CryptoError::InvalidSignature)?;
        let vk = ml_dsa::VerifyingKey::<MlDsa65>::decode(&self.bytes.into());
        vk.verify(message, &sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl core::fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "IdentityKey({})", self.fingerprint())
    }
}

/// Holds the 32-byte FIPS 204 key-generation seed; the expanded signing
/// key is rebuilt from it for each signature.
pub struct SigningIdentity {
    seed: Zeroizing<[u8; 32]>,
    public: IdentityKey,
}

impl SigningIdentity {
    pub fn generate() -> Result<Self> {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng
            .try_fill_bytes(&mut seed[..])
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(Self::from_seed(&seed[..]))
    }

    /// Deterministic identity from arbitrary seed material.
    pub fn from_seed(seed: &[u8]) -> Self {
        let mut xi = Zeroizing::new([0u8; 32]);
        let mut hasher = Sha256::new();
        hasher.update(SEED_LABEL);
        hasher.update(seed);
        xi.copy_from_slice(&hasher.finalize());

        let sk = signing_key(&xi);
        let mut public = [0u8; ML_DSA_PUBLIC_KEY_LEN];
        public.copy_from_slice(sk.verifying_key().encode().as_ref());

        Self {
            seed: xi,
            public: IdentityKey { bytes: public },
        }
    }

    pub fn identity_key(&self) -> &IdentityKey {
        &self.public
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        signing_key(&self.seed).sign(message).encode().to_vec()
    }
}

impl core::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

fn signing_key(seed: &[u8; 32]) -> ml_dsa::SigningKey<MlDsa65> {
    let seed: B32 = (*seed).into();
    ml_dsa::SigningKey::<MlDsa65>::from_seed(&seed)
}

/// SHA-256 over the label, call id and fields, each length-prefixed.
pub fn handshake_digest(step: &str, call_id: &str, fields: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(DIGEST_LABEL);
    for part in [step.as_bytes(), call_id.as_bytes()].into_iter().chain(fields.iter().copied()) {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}
