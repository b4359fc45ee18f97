use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// The random source failed while producing key material.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// A remote public key is malformed, all-zero, low-order, or fails the
    /// ML-KEM modulus check.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Ciphertext, ephemeral share, or authentication tag did not verify.
    #[error("decapsulation failed: {0}")]
    Decapsulation(String),

    #[error("invalid length: expected {expected} bytes, found {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("verification failed")]
    VerificationFailed,

    #[error("invalid signature")]
    InvalidSignature,
}

pub type Result<T> = core::result::Result<T, CryptoError>;
