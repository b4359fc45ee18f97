//! Real-time transport for QuMail clients.
//!
//! A [`TransportChannel`] keeps one persistent link to the server and
//! dispatches typed [`Frame`]s to registered handlers. The
//! [`ReconnectionSupervisor`] restores the link after involuntary closes with
//! exponential backoff, and the [`CallFrameRouter`] feeds call handshake
//! frames to a [`pq_handshake::CallNegotiator`].

pub mod channel;
pub mod error;
pub mod frame;
pub mod link;
pub mod policy;
pub mod router;
pub mod supervisor;

pub use channel::{
    ChannelConfig, ConnectionState, FrameHandler, HandlerKey, HandlerResult, LinkEvent,
    TransportChannel, DEFAULT_CONNECT_TIMEOUT,
};
pub use error::{NetworkError, Result};
pub use frame::{EncryptedChat, Frame, FrameKind, MessageSent, OutgoingChat};
pub use link::{Connector, Link, StreamConnector, WebSocketConnector, DEFAULT_MAX_FRAME_LEN};
pub use policy::{KeyConsumption, PolicyError, SecurityLevel};
pub use router::CallFrameRouter;
pub use supervisor::{
    BackoffPolicy, BackoffState, ReconnectionSupervisor, RetryDecision, SupervisorHandle,
};
