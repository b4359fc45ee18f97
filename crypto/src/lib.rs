//! # QuMail key exchange primitives
//!
//! Hybrid X25519 + ML-KEM-768 key agreement for call setup. A session key
//! is only as weak as the stronger of the two components: an attacker must
//! break both the elliptic-curve agreement and the lattice KEM.
//!
//! ## Modules
//!
//! - [`hybrid`]: key pairs, encapsulate/decapsulate, session keys
//! - [`ml_kem`]: ML-KEM-768 wrapper with public key validation
//! - [`kdf`]: HKDF/HMAC derivations and key confirmation
//! - [`srtp`]: SRTP master key derivation for media
//! - [`signing`]: ML-DSA-65 identity keys for handshake signatures
//! - [`encoding`]: base64 wire helpers

pub mod encoding;
pub mod error;
pub mod hybrid;
pub mod kdf;
pub mod ml_kem;
pub mod signing;
pub mod srtp;

pub use error::{CryptoError, Result};
pub use hybrid::{
    decapsulate, encapsulate, encapsulate_with_rng, CiphertextBundle, EncapsulationResult,
    HybridKeyPair, HybridPublicKeys, SessionKey, PROTOCOL_VERSION,
};
pub use kdf::{key_confirmation, verify_key_confirmation};
pub use signing::{handshake_digest, IdentityKey, SigningIdentity};
pub use srtp::{derive_srtp_keys, SrtpKeys};
