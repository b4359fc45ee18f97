//! Real-time frames exchanged over the channel, discriminated by `type`.

use std::fmt;

use pq_handshake::{
    CallEnded, CallStatus, CiphertextMessage, ConfirmationMessage, IncomingCall, PublicKeyMessage,
};
use serde::{Deserialize, Serialize};

use crate::policy::SecurityLevel;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    ChatMessage { data: OutgoingChat },
    EncryptedChatMessage(EncryptedChat),
    RequestQuantumStatus,
    QuantumStatusUpdate { data: serde_json::Value },
    MessageSent(MessageSent),
    /// Raised locally when the channel gives up reconnecting
    ConnectionError { message: String },
    IncomingCall(IncomingCall),
    CallPublicKey(PublicKeyMessage),
    CallCiphertext(CiphertextMessage),
    CallConfirmed(ConfirmationMessage),
    CallEnded(CallEnded),
    CallStatus(CallStatus),
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingChat {
    pub contact_id: String,
    pub message: String,
    pub security_level: SecurityLevel,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedChat {
    pub sender: String,
    #[serde(default, alias = "contact_id", skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    pub message: String,
    pub timestamp: String,
    #[serde(alias = "security_level")]
    pub security_level: SecurityLevel,
    pub encrypted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSent {
    // The server writes this one in snake case.
    #[serde(alias = "message_id")]
    pub message_id: String,
    pub status: String,
}

/// Discriminant of [`Frame`], used to key handlers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FrameKind {
    ChatMessage,
    EncryptedChatMessage,
    RequestQuantumStatus,
    QuantumStatusUpdate,
    MessageSent,
    ConnectionError,
    IncomingCall,
    CallPublicKey,
    CallCiphertext,
    CallConfirmed,
    CallEnded,
    CallStatus,
    Unknown,
}

impl FrameKind {
    pub const CALL_KINDS: [FrameKind; 5] = [
        FrameKind::IncomingCall,
        FrameKind::CallPublicKey,
        FrameKind::CallCiphertext,
        FrameKind::CallConfirmed,
        FrameKind::CallEnded,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::ChatMessage => "chat_message",
            FrameKind::EncryptedChatMessage => "encrypted_chat_message",
            FrameKind::RequestQuantumStatus => "request_quantum_status",
            FrameKind::QuantumStatusUpdate => "quantum_status_update",
            FrameKind::MessageSent => "message_sent",
            FrameKind::ConnectionError => "connection_error",
            FrameKind::IncomingCall => "incoming_call",
            FrameKind::CallPublicKey => "call_public_key",
            FrameKind::CallCiphertext => "call_ciphertext",
            FrameKind::CallConfirmed => "call_confirmed",
            FrameKind::CallEnded => "call_ended",
            FrameKind::CallStatus => "call_status",
            FrameKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::ChatMessage { .. } => FrameKind::ChatMessage,
            Frame::EncryptedChatMessage(_) => FrameKind::EncryptedChatMessage,
            Frame::RequestQuantumStatus => FrameKind::RequestQuantumStatus,
            Frame::QuantumStatusUpdate { .. } => FrameKind::QuantumStatusUpdate,
            Frame::MessageSent(_) => FrameKind::MessageSent,
            Frame::ConnectionError { .. } => FrameKind::ConnectionError,
            Frame::IncomingCall(_) => FrameKind::IncomingCall,
            Frame::CallPublicKey(_) => FrameKind::CallPublicKey,
            Frame::CallCiphertext(_) => FrameKind::CallCiphertext,
            Frame::CallConfirmed(_) => FrameKind::CallConfirmed,
            Frame::CallEnded(_) => FrameKind::CallEnded,
            Frame::CallStatus(_) => FrameKind::CallStatus,
            Frame::Unknown => FrameKind::Unknown,
        }
    }

    /// The call a handshake frame belongs to.
    pub fn call_id(&self) -> Option<&pq_handshake::CallId> {
        match self {
            Frame::IncomingCall(m) => Some(&m.call_id),
            Frame::CallPublicKey(m) => Some(&m.call_id),
            Frame::CallCiphertext(m) => Some(&m.call_id),
            Frame::CallConfirmed(m) => Some(&m.call_id),
            Frame::CallEnded(m) => Some(&m.call_id),
            Frame::CallStatus(m) => Some(&m.call_id),
            _ => None,
        }
    }

    pub fn chat(contact_id: impl Into<String>, message: impl Into<String>, level: SecurityLevel) -> Self {
        Frame::ChatMessage {
            data: OutgoingChat {
                contact_id: contact_id.into(),
                message: message.into(),
                security_level: level,
            },
        }
    }

    pub fn connection_error(message: impl Into<String>) -> Self {
        Frame::ConnectionError {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
