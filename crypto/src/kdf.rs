//! HKDF/HMAC derivations shared by the hybrid exchange and call setup.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};
use crate::hybrid::SessionKey;

type HmacSha256 = Hmac<Sha256>;

/// HKDF salt for the session key. Carries the protocol version.
pub const SESSION_KEY_SALT: &[u8] = b"qumail/hybrid-kem/v1";
pub const SESSION_KEY_INFO: &[u8] = b"mlkem768+x25519 session key";
const AUTH_TAG_INFO: &[u8] = b"pq auth tag";
const KEY_CONFIRM_LABEL: &[u8] = b"qumail/key-confirm/v1";

pub const PQ_AUTH_TAG_LEN: usize = 16;
pub const KEY_CONFIRMATION_LEN: usize = 32;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Generic HKDF-SHA256 expand into a zeroizing buffer.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new(vec![0u8; len]);
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(okm)
}

/// `HKDF(salt, pq_ss || classical_ss, info)`. Operand order is fixed.
pub fn derive_session_key(pq_shared: &[u8; 32], classical_shared: &[u8; 32]) -> Result<SessionKey> {
    let mut ikm = Zeroizing::new([0u8; 64]);
    ikm[..32].copy_from_slice(pq_shared);
    ikm[32..].copy_from_slice(classical_shared);

    let okm = hkdf_sha256(&ikm[..], SESSION_KEY_SALT, SESSION_KEY_INFO, 32)?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&okm);
    Ok(SessionKey::from_bytes(key))
}

/// Binds the ML-KEM secret to the transmitted ephemeral share and ciphertext.
pub(crate) fn pq_auth_tag(
    pq_shared: &[u8; 32],
    version: u8,
    classical_ephemeral: &[u8],
    pq_ciphertext: &[u8],
) -> Result<[u8; PQ_AUTH_TAG_LEN]> {
    let tag_key = hkdf_sha256(pq_shared, SESSION_KEY_SALT, AUTH_TAG_INFO, 32)?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&tag_key)
        .map_err(|_| CryptoError::KeyDerivation)?;
    mac.update(&[version]);
    mac.update(classical_ephemeral);
    mac.update(pq_ciphertext);
    let full = mac.finalize().into_bytes();

    let mut tag = [0u8; PQ_AUTH_TAG_LEN];
    tag.copy_from_slice(&full[..PQ_AUTH_TAG_LEN]);
    Ok(tag)
}

/// Proof that the holder derived `session_key` for `call_id`.
pub fn key_confirmation(session_key: &SessionKey, call_id: &str) -> Result<[u8; KEY_CONFIRMATION_LEN]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(session_key.as_bytes())
        .map_err(|_| CryptoError::KeyDerivation)?;
    mac.update(KEY_CONFIRM_LABEL);
    mac.update(call_id.as_bytes());
    Ok(mac.finalize().into_bytes().into())
}

pub fn verify_key_confirmation(session_key: &SessionKey, call_id: &str, tag: &[u8]) -> Result<()> {
    let expected = key_confirmation(session_key, call_id)?;
    if tag.len() == expected.len() && bool::from(expected[..].ct_eq(tag)) {
        Ok(())
    } else {
        Err(CryptoError::VerificationFailed)
    }
}
