//! Call identifiers, states and the handshake messages exchanged through
//! signaling.

use std::fmt;

use crypto::encoding::base64_bytes;
use crypto::{handshake_digest, CiphertextBundle, HybridPublicKeys, SrtpKeys};
use serde::{Deserialize, Serialize};

/// Server-assigned call identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallType::Audio => f.write_str("audio"),
            CallType::Video => f.write_str("video"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

/// Lifecycle of a call's key negotiation.
///
/// ```text
/// INITIATED -> AWAITING_PUBLIC_KEY -> CIPHERTEXT_SENT -> ESTABLISHED   (initiator)
/// INITIATED -> KEYS_EXCHANGED ----------------------> ESTABLISHED     (responder)
/// any non-terminal -> ENDED | FAILED
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    Initiated,
    AwaitingPublicKey,
    KeysExchanged,
    CiphertextSent,
    Established,
    Ended,
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }

    /// States in which the session is blocked on the peer.
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            CallState::AwaitingPublicKey | CallState::KeysExchanged | CallState::CiphertextSent
        )
    }

    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (s, Ended | Failed) => !s.is_terminal(),
            (Initiated, AwaitingPublicKey | KeysExchanged) => true,
            (AwaitingPublicKey, CiphertextSent) => true,
            (CiphertextSent | KeysExchanged, Established) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallState::Initiated => "INITIATED",
            CallState::AwaitingPublicKey => "AWAITING_PUBLIC_KEY",
            CallState::KeysExchanged => "KEYS_EXCHANGED",
            CallState::CiphertextSent => "CIPHERTEXT_SENT",
            CallState::Established => "ESTABLISHED",
            CallState::Ended => "ENDED",
            CallState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `POST /calls/initiate` body
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub contact_id: String,
    pub call_type: CallType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub call_id: CallId,
    pub state: CallState,
}

/// A party's public key halves, signed with its identity key.
///
/// Sent as `PUT /calls/{id}/public_key` and delivered to the peer as a
/// `call_public_key` frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyMessage {
    pub call_id: CallId,
    #[serde(flatten)]
    pub keys: HybridPublicKeys,
    #[serde(with = "base64_bytes")]
    pub identity_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

impl PublicKeyMessage {
    /// What the sender's identity key signs.
    pub fn signing_digest(&self) -> [u8; 32] {
        handshake_digest(
            "public_key",
            self.call_id.as_str(),
            &[
                std::slice::from_ref(&self.keys.version),
                self.keys.classical_public_key.as_slice(),
                self.keys.pq_public_key.as_slice(),
            ],
        )
    }
}

/// `PUT /calls/{id}/ciphertext`; never carries the session key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiphertextMessage {
    pub call_id: CallId,
    #[serde(flatten)]
    pub bundle: CiphertextBundle,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

impl CiphertextMessage {
    pub fn signing_digest(&self) -> [u8; 32] {
        handshake_digest(
            "ciphertext",
            self.call_id.as_str(),
            &[
                std::slice::from_ref(&self.bundle.version),
                self.bundle.classical_key_share.as_slice(),
                self.bundle.pq_ciphertext.as_slice(),
                self.bundle.pq_auth_tag.as_slice(),
            ],
        )
    }
}

/// `PUT /calls/{id}/confirm`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationMessage {
    pub call_id: CallId,
    #[serde(with = "base64_bytes")]
    pub key_confirmation: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

impl ConfirmationMessage {
    pub fn signing_digest(&self) -> [u8; 32] {
        handshake_digest(
            "confirm",
            self.call_id.as_str(),
            &[self.key_confirmation.as_slice()],
        )
    }
}

/// Notification that a contact is calling us, carrying their signed keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    pub call_id: CallId,
    pub caller_id: String,
    pub call_type: CallType,
    pub public_key: Option<PublicKeyMessage>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnded {
    #[serde(alias = "call_id")]
    pub call_id: CallId,
    #[serde(default, alias = "message", skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStatus {
    pub call_id: CallId,
    pub state: CallState,
}

/// Published by the negotiator for the owning application context
#[derive(Clone, Debug)]
pub enum CallEvent {
    StateChanged {
        call_id: CallId,
        contact_id: String,
        state: CallState,
    },
    Established {
        call_id: CallId,
        contact_id: String,
        role: Role,
        srtp: SrtpKeys,
        key_fingerprint: String,
    },
    Failed {
        call_id: CallId,
        contact_id: String,
        reason: String,
    },
}

impl CallEvent {
    pub fn call_id(&self) -> &CallId {
        match self {
            CallEvent::StateChanged { call_id, .. }
            | CallEvent::Established { call_id, .. }
            | CallEvent::Failed { call_id, .. } => call_id,
        }
    }
}
