//! Hybrid post-quantum call negotiation
//!
//! Each call derives its own session key from a combined X25519 and
//! ML-KEM-768 exchange. The four handshake steps travel through a
//! [`Signaling`] collaborator and arrive at the peer as real-time frames.
//!
//! # Protocol Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Call Handshake                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  1. Offer       │  initiator publishes signed hybrid keys    │
//! │  2. Answer      │  responder publishes its own hybrid keys   │
//! │  3. Ciphertext  │  initiator encapsulates to the responder   │
//! │  4. Confirm     │  responder proves it derived the same key  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every step is signed with the sender's ML-DSA-65 identity key.
//!
//! # Example
//!
//! ```rust,ignore
//! use pq_handshake::{CallNegotiator, CallType, NegotiatorConfig};
//!
//! let negotiator = CallNegotiator::new(identity, signaling, NegotiatorConfig::default());
//! let call_id = negotiator.start_call("bob", CallType::Audio).await?;
//! ```

pub mod config;
pub mod error;
pub mod negotiator;
pub mod session;
pub mod signaling;
pub mod types;

pub use config::{NegotiatorConfig, NegotiatorConfigBuilder};
pub use error::{HandshakeError, Result, SignalingError};
pub use negotiator::CallNegotiator;
pub use session::CallSession;
pub use signaling::{
    HttpSignaling, HttpSignalingConfig, RecordingSignaling, Signaling, SignalingRecord,
    SignalingStep,
};
pub use types::{
    CallEnded, CallEvent, CallId, CallState, CallStatus, CallType, CiphertextMessage,
    ConfirmationMessage, IncomingCall, InitiateRequest, InitiateResponse, PublicKeyMessage, Role,
};
