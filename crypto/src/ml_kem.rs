//! ML-KEM-768 (FIPS 203) key encapsulation.
//!
//! Thin owned-byte wrappers around the `ml-kem` crate. Public keys are
//! validated before use: the encoded polynomial vector must pass the FIPS 203
//! modulus check (every 12-bit coefficient below q = 3329) and must not be
//! all-zero.

use kem::{Decapsulate, Encapsulate};
use ml_kem::kem::{DecapsulationKey, EncapsulationKey};
use ml_kem::{EncodedSizeUser, KemCore, MlKem768, MlKem768Params};
use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};

pub const ML_KEM_PUBLIC_KEY_LEN: usize = 1184;
pub const ML_KEM_SECRET_KEY_LEN: usize = 2400;
pub const ML_KEM_CIPHERTEXT_LEN: usize = 1088;
pub const ML_KEM_SHARED_SECRET_LEN: usize = 32;

/// ML-KEM modulus.
const Q: u16 = 3329;
/// Bytes of the encoded `t_hat` vector (k = 3 polynomials, 256 x 12 bits each).
const T_HAT_LEN: usize = 3 * 384;

#[derive(Clone, PartialEq, Eq)]
pub struct MlKemPublicKey {
    bytes: [u8; ML_KEM_PUBLIC_KEY_LEN],
}

impl MlKemPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; ML_KEM_PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidPublicKey(format!(
                "ML-KEM public key must be {ML_KEM_PUBLIC_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        if arr.iter().all(|b| *b == 0) {
            return Err(CryptoError::InvalidPublicKey(
                "ML-KEM public key is all zeros".into(),
            ));
        }
        if !coefficients_in_range(&arr[..T_HAT_LEN]) {
            return Err(CryptoError::InvalidPublicKey(
                "ML-KEM public key fails modulus check".into(),
            ));
        }
        Ok(Self { bytes: arr })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Encapsulate a fresh shared secret to this key.
    pub fn encapsulate<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
    ) -> Result<(MlKemCiphertext, MlKemSharedSecret)> {
        let ek = EncapsulationKey::<MlKem768Params>::from_bytes(&self.bytes.into());
        let (ct, ss) = ek
            .encapsulate(rng)
            .map_err(|e| CryptoError::InvalidPublicKey(format!("encapsulation failed: {e:?}")))?;

        let mut ct_bytes = [0u8; ML_KEM_CIPHERTEXT_LEN];
        ct_bytes.copy_from_slice(&ct[..]);
        let mut ss_bytes = Zeroizing::new([0u8; ML_KEM_SHARED_SECRET_LEN]);
        ss_bytes.copy_from_slice(&ss[..]);

        Ok((MlKemCiphertext { bytes: ct_bytes }, MlKemSharedSecret(ss_bytes)))
    }
}

impl core::fmt::Debug for MlKemPublicKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "MlKemPublicKey({}..)", hex::encode(&self.bytes[..8]))
    }
}

/// Every 12-bit little-endian packed coefficient must be reduced mod q.
fn coefficients_in_range(encoded: &[u8]) -> bool {
    encoded.chunks_exact(3).all(|c| {
        let lo = u16::from(c[0]) | (u16::from(c[1] & 0x0f) << 8);
        let hi = u16::from(c[1] >> 4) | (u16::from(c[2]) << 4);
        lo < Q && hi < Q
    })
}

#[derive(Clone, PartialEq, Eq)]
pub struct MlKemCiphertext {
    bytes: [u8; ML_KEM_CIPHERTEXT_LEN],
}

impl MlKemCiphertext {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes = bytes.try_into().map_err(|_| {
            CryptoError::Decapsulation(format!(
                "ML-KEM ciphertext must be {ML_KEM_CIPHERTEXT_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl core::fmt::Debug for MlKemCiphertext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MlKemCiphertext")
            .field("len", &self.bytes.len())
            .finish()
    }
}

pub struct MlKemSharedSecret(Zeroizing<[u8; ML_KEM_SHARED_SECRET_LEN]>);

impl MlKemSharedSecret {
    pub fn as_bytes(&self) -> &[u8; ML_KEM_SHARED_SECRET_LEN] {
        &self.0
    }
}

/// An ML-KEM-768 key pair. The decapsulation key is zeroized on drop.
pub struct MlKemKeyPair {
    secret: Zeroizing<[u8; ML_KEM_SECRET_KEY_LEN]>,
    public: MlKemPublicKey,
}

impl MlKemKeyPair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let (dk, ek) = MlKem768::generate(rng);

        let mut secret = Zeroizing::new([0u8; ML_KEM_SECRET_KEY_LEN]);
        secret.copy_from_slice(&dk.as_bytes()[..]);
        let mut public = [0u8; ML_KEM_PUBLIC_KEY_LEN];
        public.copy_from_slice(&ek.as_bytes()[..]);

        Self {
            secret,
            public: MlKemPublicKey { bytes: public },
        }
    }

    pub fn public_key(&self) -> &MlKemPublicKey {
        &self.public
    }

    /// Recover the shared secret. ML-KEM uses implicit rejection, so a
    /// corrupted ciphertext yields an unrelated secret rather than an error.
    pub fn decapsulate(&self, ciphertext: &MlKemCiphertext) -> Result<MlKemSharedSecret> {
        let dk = DecapsulationKey::<MlKem768Params>::from_bytes(&(*self.secret).into());
        let ss = dk
            .decapsulate(&ciphertext.bytes.into())
            .map_err(|e| CryptoError::Decapsulation(format!("{e:?}")))?;

        let mut ss_bytes = Zeroizing::new([0u8; ML_KEM_SHARED_SECRET_LEN]);
        ss_bytes.copy_from_slice(&ss[..]);
        Ok(MlKemSharedSecret(ss_bytes))
    }
}

impl core::fmt::Debug for MlKemKeyPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MlKemKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
