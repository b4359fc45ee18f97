//! Hybrid X25519 + ML-KEM-768 key exchange.
//!
//! The initiator publishes [`HybridPublicKeys`]; the peer calls
//! [`encapsulate`] against them and sends back only the
//! [`CiphertextBundle`]. The key holder recovers the same [`SessionKey`] with
//! [`decapsulate`]. The session key is derived as
//! `HKDF-SHA256(salt = "qumail/hybrid-kem/v1", pq_ss || x25519_ss)`.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};
use crate::kdf::{self, PQ_AUTH_TAG_LEN};
use crate::ml_kem::{MlKemCiphertext, MlKemKeyPair, MlKemPublicKey};

pub const PROTOCOL_VERSION: u8 = 1;
pub const X25519_KEY_LEN: usize = 32;
pub const SESSION_KEY_LEN: usize = 32;

/// The 32-byte shared key of a call. Never serialized; `Debug` is redacted.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub(crate) fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }

    /// Short hash of the key, usable in logs to compare both ends.
    pub fn fingerprint(&self) -> String {
        hex::encode(&kdf::sha256(&self.0)[..8])
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for SessionKey {}

impl core::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// The transmitted projection of a [`HybridKeyPair`].
///
/// Byte fields are kept raw so malformed peer input reaches [`encapsulate`]
/// and is rejected there.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridPublicKeys {
    #[serde(default = "default_version")]
    pub version: u8,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub classical_public_key: Vec<u8>,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub pq_public_key: Vec<u8>,
}

fn default_version() -> u8 {
    PROTOCOL_VERSION
}

/// One party's handshake material. Secret halves are zeroized on drop.
pub struct HybridKeyPair {
    keypair_id: String,
    created_at: u64,
    classical_secret: StaticSecret,
    classical_public: X25519PublicKey,
    pq: MlKemKeyPair,
}

impl HybridKeyPair {
    /// Fresh key material from the OS random source.
    pub fn generate() -> Result<Self> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let mut rng = ChaCha20Rng::from_seed(seed);
        seed.zeroize();
        Ok(Self::generate_with_rng(&mut rng))
    }

    pub fn generate_with_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let keypair_id = format!("hybrid_{}", random_hex(rng));
        let classical_secret = StaticSecret::random_from_rng(&mut *rng);
        let classical_public = X25519PublicKey::from(&classical_secret);
        let pq = MlKemKeyPair::generate(rng);

        Self {
            keypair_id,
            created_at: unix_millis(),
            classical_secret,
            classical_public,
            pq,
        }
    }

    pub fn keypair_id(&self) -> &str {
        &self.keypair_id
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn classical_public_key(&self) -> &[u8; X25519_KEY_LEN] {
        self.classical_public.as_bytes()
    }

    pub fn pq_public_key(&self) -> &MlKemPublicKey {
        self.pq.public_key()
    }

    pub fn public_keys(&self) -> HybridPublicKeys {
        HybridPublicKeys {
            version: PROTOCOL_VERSION,
            classical_public_key: self.classical_public.as_bytes().to_vec(),
            pq_public_key: self.pq.public_key().as_bytes().to_vec(),
        }
    }

    /// Short hash over both public halves.
    pub fn fingerprint(&self) -> String {
        let mut data = Vec::with_capacity(X25519_KEY_LEN + crate::ml_kem::ML_KEM_PUBLIC_KEY_LEN);
        data.extend_from_slice(self.classical_public.as_bytes());
        data.extend_from_slice(self.pq.public_key().as_bytes());
        hex::encode(&kdf::sha256(&data)[..8])
    }
}

impl core::fmt::Debug for HybridKeyPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HybridKeyPair")
            .field("keypair_id", &self.keypair_id)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// What the encapsulating side sends back: no session key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiphertextBundle {
    #[serde(default = "default_version")]
    pub version: u8,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub classical_key_share: Vec<u8>,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub pq_ciphertext: Vec<u8>,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub pq_auth_tag: Vec<u8>,
}

/// Output of [`encapsulate`]. Holds the local session key next to the
/// wire bundle; only [`EncapsulationResult::bundle`] is ever transmitted.
pub struct EncapsulationResult {
    pub encapsulation_id: String,
    pub timestamp: u64,
    bundle: CiphertextBundle,
    session_key: Option<SessionKey>,
}

impl EncapsulationResult {
    pub fn bundle(&self) -> &CiphertextBundle {
        &self.bundle
    }

    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.as_ref()
    }

    /// Move the session key out, leaving the result with only public data.
    pub fn take_session_key(&mut self) -> Option<SessionKey> {
        self.session_key.take()
    }
}

impl core::fmt::Debug for EncapsulationResult {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EncapsulationResult")
            .field("encapsulation_id", &self.encapsulation_id)
            .field("timestamp", &self.timestamp)
            .field("has_session_key", &self.session_key.is_some())
            .finish()
    }
}

pub fn encapsulate(remote: &HybridPublicKeys) -> Result<EncapsulationResult> {
    encapsulate_with_rng(remote, &mut OsRng)
}

pub fn encapsulate_with_rng<R: RngCore + CryptoRng>(
    remote: &HybridPublicKeys,
    rng: &mut R,
) -> Result<EncapsulationResult> {
    if remote.version != PROTOCOL_VERSION {
        return Err(CryptoError::InvalidPublicKey(format!(
            "unsupported protocol version {} (local {PROTOCOL_VERSION})",
            remote.version
        )));
    }
    let remote_classical = parse_x25519(&remote.classical_public_key)
        .map_err(CryptoError::InvalidPublicKey)?;
    let remote_pq = MlKemPublicKey::from_bytes(&remote.pq_public_key)?;

    let ephemeral = EphemeralSecret::random_from_rng(&mut *rng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral);
    let classical_shared = ephemeral.diffie_hellman(&remote_classical);
    if !classical_shared.was_contributory() {
        return Err(CryptoError::InvalidPublicKey(
            "X25519 public key is a low-order point".into(),
        ));
    }

    let (ciphertext, pq_shared) = remote_pq.encapsulate(rng)?;
    let session_key = kdf::derive_session_key(pq_shared.as_bytes(), classical_shared.as_bytes())?;
    let tag = kdf::pq_auth_tag(
        pq_shared.as_bytes(),
        PROTOCOL_VERSION,
        ephemeral_public.as_bytes(),
        ciphertext.as_bytes(),
    )?;

    Ok(EncapsulationResult {
        encapsulation_id: format!("encap_{}", random_hex(rng)),
        timestamp: unix_millis(),
        bundle: CiphertextBundle {
            version: PROTOCOL_VERSION,
            classical_key_share: ephemeral_public.as_bytes().to_vec(),
            pq_ciphertext: ciphertext.as_bytes().to_vec(),
            pq_auth_tag: tag.to_vec(),
        },
        session_key: Some(session_key),
    })
}

/// Recover the session key from a received bundle with our key pair.
pub fn decapsulate(bundle: &CiphertextBundle, ours: &HybridKeyPair) -> Result<SessionKey> {
    if bundle.version != PROTOCOL_VERSION {
        return Err(CryptoError::Decapsulation(format!(
            "unsupported protocol version {}",
            bundle.version
        )));
    }
    let ciphertext = MlKemCiphertext::from_bytes(&bundle.pq_ciphertext)?;
    if bundle.pq_auth_tag.len() != PQ_AUTH_TAG_LEN {
        return Err(CryptoError::Decapsulation(format!(
            "auth tag must be {PQ_AUTH_TAG_LEN} bytes, got {}",
            bundle.pq_auth_tag.len()
        )));
    }
    let ephemeral = parse_x25519(&bundle.classical_key_share).map_err(CryptoError::Decapsulation)?;

    let pq_shared = ours.pq.decapsulate(&ciphertext)?;
    let expected = kdf::pq_auth_tag(
        pq_shared.as_bytes(),
        bundle.version,
        &bundle.classical_key_share,
        &bundle.pq_ciphertext,
    )?;
    if !bool::from(expected[..].ct_eq(&bundle.pq_auth_tag)) {
        return Err(CryptoError::Decapsulation("authentication tag mismatch".into()));
    }

    let classical_shared = ours.classical_secret.diffie_hellman(&ephemeral);
    if !classical_shared.was_contributory() {
        return Err(CryptoError::Decapsulation(
            "ephemeral key is a low-order point".into(),
        ));
    }

    kdf::derive_session_key(pq_shared.as_bytes(), classical_shared.as_bytes())
}

fn parse_x25519(bytes: &[u8]) -> core::result::Result<X25519PublicKey, String> {
    let arr: [u8; X25519_KEY_LEN] = bytes
        .try_into()
        .map_err(|_| format!("X25519 key must be {X25519_KEY_LEN} bytes, got {}", bytes.len()))?;
    if arr.iter().all(|b| *b == 0) {
        return Err("X25519 key is all zeros".into());
    }
    Ok(X25519PublicKey::from(arr))
}

fn random_hex<R: RngCore>(rng: &mut R) -> String {
    let mut id = [0u8; 8];
    rng.fill_bytes(&mut id);
    hex::encode(id)
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn seeded(seed: u64) -> ChaCha20Rng {
        ChaCha20Rng::seed_from_u64(seed)
    }

    #[test]
    fn test_encapsulate_decapsulate_agree() {
        let mut rng = seeded(1);
        let bob = HybridKeyPair::generate_with_rng(&mut rng);
        let result = encapsulate_with_rng(&bob.public_keys(), &mut rng).unwrap();
        let recovered = decapsulate(result.bundle(), &bob).unwrap();
        assert_eq!(result.session_key(), Some(&recovered));
    }

    #[test]
    fn test_os_rng_generation() {
        let kp = HybridKeyPair::generate().unwrap();
        assert!(kp.keypair_id().starts_with("hybrid_"));
        assert_eq!(kp.keypair_id().len(), "hybrid_".len() + 16);
        let result = encapsulate(&kp.public_keys()).unwrap();
        assert!(result.encapsulation_id.starts_with("encap_"));
        assert_eq!(
            decapsulate(result.bundle(), &kp).unwrap(),
            *result.session_key().unwrap()
        );
    }

    #[test]
    fn test_two_encapsulations_are_fresh() {
        let mut rng = seeded(2);
        let bob = HybridKeyPair::generate_with_rng(&mut rng);
        let a = encapsulate_with_rng(&bob.public_keys(), &mut rng).unwrap();
        let b = encapsulate_with_rng(&bob.public_keys(), &mut rng).unwrap();
        assert_ne!(a.bundle().classical_key_share, b.bundle().classical_key_share);
        assert_ne!(a.bundle().pq_ciphertext, b.bundle().pq_ciphertext);
        assert_ne!(a.session_key(), b.session_key());
    }

    #[test]
    fn test_wire_sizes() {
        let mut rng = seeded(3);
        let bob = HybridKeyPair::generate_with_rng(&mut rng);
        let keys = bob.public_keys();
        assert_eq!(keys.classical_public_key.len(), 32);
        assert_eq!(keys.pq_public_key.len(), 1184);
        let result = encapsulate_with_rng(&keys, &mut rng).unwrap();
        assert_eq!(result.bundle().pq_ciphertext.len(), 1088);
        assert_eq!(result.bundle().pq_auth_tag.len(), 16);
    }

    #[test]
    fn test_bundle_json_never_contains_session_key() {
        let mut rng = seeded(4);
        let bob = HybridKeyPair::generate_with_rng(&mut rng);
        let result = encapsulate_with_rng(&bob.public_keys(), &mut rng).unwrap();
        let json = serde_json::to_value(result.bundle()).unwrap();
        let obj = json.as_object().unwrap();
        let mut fields: Vec<_> = obj.keys().cloned().collect();
        fields.sort();
        assert_eq!(
            fields,
            vec!["classicalKeyShare", "pqAuthTag", "pqCiphertext", "version"]
        );
        let key_b64 = crate::encoding::encode(result.session_key().unwrap().as_bytes());
        assert!(!json.to_string().contains(&key_b64));
    }

    #[test]
    fn test_debug_output_is_redacted() {
        let mut rng = seeded(5);
        let bob = HybridKeyPair::generate_with_rng(&mut rng);
        let result = encapsulate_with_rng(&bob.public_keys(), &mut rng).unwrap();
        let key = result.session_key().unwrap();
        assert_eq!(format!("{key:?}"), "SessionKey(<redacted>)");
        let shown = format!("{bob:?}");
        assert!(shown.contains(bob.keypair_id()));
        assert!(!shown.contains("classical_secret"));
    }

    #[test]
    fn test_empty_ciphertext_is_decapsulation_error() {
        let mut rng = seeded(6);
        let bob = HybridKeyPair::generate_with_rng(&mut rng);
        let mut bundle = encapsulate_with_rng(&bob.public_keys(), &mut rng)
            .unwrap()
            .bundle()
            .clone();
        bundle.pq_ciphertext.clear();
        assert!(matches!(
            decapsulate(&bundle, &bob),
            Err(CryptoError::Decapsulation(_))
        ));
    }

    #[test]
    fn test_tampering_is_detected() {
        let mut rng = seeded(7);
        let bob = HybridKeyPair::generate_with_rng(&mut rng);
        let bundle = encapsulate_with_rng(&bob.public_keys(), &mut rng)
            .unwrap()
            .bundle()
            .clone();

        let mut ct = bundle.clone();
        ct.pq_ciphertext[10] ^= 0x80;
        assert!(matches!(decapsulate(&ct, &bob), Err(CryptoError::Decapsulation(_))));

        let mut eph = bundle.clone();
        eph.classical_key_share[0] ^= 0x01;
        assert!(matches!(decapsulate(&eph, &bob), Err(CryptoError::Decapsulation(_))));

        let mut tag = bundle.clone();
        tag.pq_auth_tag[15] ^= 0x01;
        assert!(matches!(decapsulate(&tag, &bob), Err(CryptoError::Decapsulation(_))));

        let mut short = bundle;
        short.pq_auth_tag.truncate(8);
        assert!(matches!(decapsulate(&short, &bob), Err(CryptoError::Decapsulation(_))));
    }

    #[test]
    fn test_wrong_key_pair_fails() {
        let mut rng = seeded(8);
        let bob = HybridKeyPair::generate_with_rng(&mut rng);
        let eve = HybridKeyPair::generate_with_rng(&mut rng);
        let result = encapsulate_with_rng(&bob.public_keys(), &mut rng).unwrap();
        assert!(matches!(
            decapsulate(result.bundle(), &eve),
            Err(CryptoError::Decapsulation(_))
        ));
    }

    #[test]
    fn test_invalid_remote_keys_rejected() {
        let mut rng = seeded(9);
        let bob = HybridKeyPair::generate_with_rng(&mut rng);

        let mut short = bob.public_keys();
        short.classical_public_key.truncate(31);
        assert!(matches!(
            encapsulate_with_rng(&short, &mut rng),
            Err(CryptoError::InvalidPublicKey(_))
        ));

        let mut zero = bob.public_keys();
        zero.classical_public_key = vec![0u8; 32];
        assert!(matches!(
            encapsulate_with_rng(&zero, &mut rng),
            Err(CryptoError::InvalidPublicKey(_))
        ));

        // u = 1 is a point of small order on Curve25519.
        let mut low_order = bob.public_keys();
        let mut point = [0u8; 32];
        point[0] = 1;
        low_order.classical_public_key = point.to_vec();
        assert!(matches!(
            encapsulate_with_rng(&low_order, &mut rng),
            Err(CryptoError::InvalidPublicKey(_))
        ));

        let mut pq = bob.public_keys();
        pq.pq_public_key = vec![0xff; 1184];
        assert!(matches!(
            encapsulate_with_rng(&pq, &mut rng),
            Err(CryptoError::InvalidPublicKey(_))
        ));

        let mut version = bob.public_keys();
        version.version = 2;
        assert!(matches!(
            encapsulate_with_rng(&version, &mut rng),
            Err(CryptoError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_public_keys_json_shape() {
        let mut rng = seeded(10);
        let bob = HybridKeyPair::generate_with_rng(&mut rng);
        let json = serde_json::to_value(bob.public_keys()).unwrap();
        assert!(json["classicalPublicKey"].is_string());
        assert!(json["pqPublicKey"].is_string());
        let back: HybridPublicKeys = serde_json::from_value(json).unwrap();
        assert_eq!(back, bob.public_keys());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_any_seed_agrees(seed in any::<u64>()) {
            let mut rng = seeded(seed);
            let bob = HybridKeyPair::generate_with_rng(&mut rng);
            let result = encapsulate_with_rng(&bob.public_keys(), &mut rng).unwrap();
            let recovered = decapsulate(result.bundle(), &bob).unwrap();
            prop_assert_eq!(result.session_key(), Some(&recovered));
        }

        #[test]
        fn prop_single_bit_flip_in_ciphertext_fails(seed in any::<u64>(), idx in 0usize..1088, bit in 0u8..8) {
            let mut rng = seeded(seed);
            let bob = HybridKeyPair::generate_with_rng(&mut rng);
            let mut bundle = encapsulate_with_rng(&bob.public_keys(), &mut rng).unwrap().bundle().clone();
            bundle.pq_ciphertext[idx] ^= 1 << bit;
            prop_assert!(decapsulate(&bundle, &bob).is_err());
        }
    }
}
