//! SRTP master key material for an established call.

use zeroize::Zeroizing;

use crate::error::Result;
use crate::hybrid::SessionKey;
use crate::kdf::{hkdf_sha256, sha256};

pub const SRTP_MASTER_KEY_LEN: usize = 30;
pub const SRTP_MASTER_SALT_LEN: usize = 14;
const SRTP_INFO: &[u8] = b"QuMail-SRTP-Keys-v1";
const SRTP_OKM_LEN: usize = 46;
const SALT_PREFIX_LEN: usize = 16;

#[derive(Clone)]
pub struct SrtpKeys {
    master_key: Zeroizing<[u8; SRTP_MASTER_KEY_LEN]>,
    master_salt: Zeroizing<[u8; SRTP_MASTER_SALT_LEN]>,
    key_id: String,
}

impl SrtpKeys {
    pub fn master_key(&self) -> &[u8; SRTP_MASTER_KEY_LEN] {
        &self.master_key
    }

    pub fn master_salt(&self) -> &[u8; SRTP_MASTER_SALT_LEN] {
        &self.master_salt
    }

    /// Short public identifier, safe to log.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

impl PartialEq for SrtpKeys {
    fn eq(&self, other: &Self) -> bool {
        self.master_key[..] == other.master_key[..]
            && self.master_salt[..] == other.master_salt[..]
            && self.key_id == other.key_id
    }
}

impl Eq for SrtpKeys {}

impl core::fmt::Debug for SrtpKeys {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SrtpKeys")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Expand a call's session key into SRTP master key and salt.
///
/// The HKDF salt is the first 16 bytes of `call_id` (shorter ids are used
/// whole). Two trailing bytes of the 46-byte expansion are discarded.
pub fn derive_srtp_keys(session_key: &SessionKey, call_id: &str) -> Result<SrtpKeys> {
    let id = call_id.as_bytes();
    let salt = &id[..id.len().min(SALT_PREFIX_LEN)];
    let okm = hkdf_sha256(session_key.as_bytes(), salt, SRTP_INFO, SRTP_OKM_LEN)?;

    let mut master_key = Zeroizing::new([0u8; SRTP_MASTER_KEY_LEN]);
    master_key.copy_from_slice(&okm[..SRTP_MASTER_KEY_LEN]);
    let mut master_salt = Zeroizing::new([0u8; SRTP_MASTER_SALT_LEN]);
    master_salt
        .copy_from_slice(&okm[SRTP_MASTER_KEY_LEN..SRTP_MASTER_KEY_LEN + SRTP_MASTER_SALT_LEN]);

    let mut id_input = Zeroizing::new(Vec::with_capacity(32 + id.len()));
    id_input.extend_from_slice(session_key.as_bytes());
    id_input.extend_from_slice(id);
    let key_id = hex::encode(&sha256(&id_input)[..8]);

    Ok(SrtpKeys {
        master_key,
        master_salt,
        key_id,
    })
}
