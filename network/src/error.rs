use std::time::Duration;

use thiserror::Error;

use crate::policy::PolicyError;

#[derive(Debug, Error)]
pub enum NetworkError {
    /// `send` was called while the channel is not `CONNECTED`
    #[error("channel is not connected")]
    NotConnected,

    #[error("connection not established within {0:?}")]
    ConnectionTimeout(Duration),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connection closed")]
    Closed,

    #[error("channel already has a reconnection supervisor")]
    SupervisorAttached,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("policy violation: {0}")]
    Policy(#[from] PolicyError),
}

pub type Result<T> = std::result::Result<T, NetworkError>;
