//! Raw text-frame links and the connectors that open them.
//!
//! A [`Link`] is a split sink/stream pair carrying one JSON document per
//! frame. The production connector speaks WebSocket; [`StreamConnector`]
//! wraps any byte stream with a length-delimited codec.

use std::future::{ready, Future};
use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt, TryStreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use crate::error::{NetworkError, Result};

pub type FrameSink = Pin<Box<dyn Sink<String, Error = NetworkError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Default cap on a single inbound frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Link {
    /// Frame a byte stream with a 4-byte big-endian length prefix.
    pub fn framed<S>(io: S, max_frame_len: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_len)
            .new_codec();
        let (sink, stream) = Framed::new(io, codec).split::<Bytes>();
        let sink = sink.with(|text: String| ready(Ok::<_, NetworkError>(Bytes::from(text))));
        let stream = stream.map(|chunk| {
            let chunk = chunk?;
            String::from_utf8(chunk.to_vec())
                .map_err(|e| NetworkError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
        });
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    /// Adapt a WebSocket so that text messages become frames. Control
    /// messages are consumed here; binary messages are accepted when they
    /// hold UTF-8.
    pub fn websocket<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, stream) = ws.split::<Message>();
        let sink = sink.with(|text: String| ready(Ok::<_, NetworkError>(Message::Text(text))));
        let stream = stream
            .map_err(NetworkError::from)
            .try_filter_map(|message| {
                ready(Ok(match message {
                    Message::Text(text) => Some(text),
                    Message::Binary(bytes) => String::from_utf8(bytes).ok(),
                    _ => None,
                }))
            });
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Opens a fresh [`Link`] for the given identity.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, identity: &str) -> Result<Link>;
}

/// Connects to `{base_url}/api/ws/chat/{identity}`.
#[derive(Clone, Debug)]
pub struct WebSocketConnector {
    base_url: String,
    token: Option<String>,
}

impl WebSocketConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn endpoint(&self, identity: &str) -> String {
        format!(
            "{}/api/ws/chat/{}",
            self.base_url.trim_end_matches('/'),
            identity
        )
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, identity: &str) -> Result<Link> {
        let url = self.endpoint(identity);
        let mut request = url.as_str().into_client_request()?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| NetworkError::Connect(format!("invalid token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (ws, response) = connect_async(request).await?;
        debug!(%url, status = %response.status(), "websocket upgraded");
        Ok(Link::websocket(ws))
    }
}

/// Builds links from any async byte stream produced by `open`.
pub struct StreamConnector<F> {
    open: F,
    max_frame_len: usize,
}

impl<F> StreamConnector<F> {
    pub fn new(open: F) -> Self {
        Self {
            open,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

#[async_trait]
impl<F, Fut, S> Connector for StreamConnector<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = io::Result<S>> + Send,
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn connect(&self, identity: &str) -> Result<Link> {
        let io = (self.open)(identity.to_string()).await?;
        Ok(Link::framed(io, self.max_frame_len))
    }
}
