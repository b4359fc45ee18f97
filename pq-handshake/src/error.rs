//! Error types for call negotiation

use thiserror::Error;

use crate::types::{CallId, CallState};

/// Errors from the signaling collaborator
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("signaling rejected request: {0}")]
    Rejected(String),

    #[error("signaling request timed out")]
    Timeout,
}

/// Errors that can occur while negotiating a call
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Key exchange primitive failed
    #[error("crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// A frame arrived that the session is not waiting for
    #[error("unexpected {message} for call {call_id} in state {state}")]
    UnexpectedMessage {
        call_id: CallId,
        state: CallState,
        message: &'static str,
    },

    #[error("unknown call {0}")]
    UnknownCall(CallId),

    #[error("call {0} already exists")]
    DuplicateCall(CallId),

    /// Peer's handshake signature did not verify
    #[error("invalid signature on {0}")]
    InvalidSignature(&'static str),

    /// Peer presented a different identity key than the one pinned for it
    #[error("identity key mismatch for {0}")]
    IdentityMismatch(String),

    #[error("key confirmation mismatch")]
    ConfirmationMismatch,

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for negotiation operations
pub type Result<T> = std::result::Result<T, HandshakeError>;
