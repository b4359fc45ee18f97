//! Persistent bidirectional channel with kind-keyed frame dispatch.
//!
//! The channel owns at most one live [`Link`]. A reader task parses inbound
//! text into [`Frame`]s and hands each one to the handler registered for its
//! kind and to the catch-all handler. Handler failures are logged and never
//! reach the reader.
//!
//! Losing the link without a call to [`TransportChannel::disconnect`] is
//! reported on an internal event queue consumed by the
//! [`ReconnectionSupervisor`](crate::supervisor::ReconnectionSupervisor).

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{NetworkError, Result};
use crate::frame::{Frame, FrameKind};
use crate::link::{Connector, FrameSink, FrameStream, Link, DEFAULT_MAX_FRAME_LEN};
use crate::policy::SecurityLevel;
use crate::supervisor::{BackoffPolicy, BackoffState};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which frames a handler receives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerKey {
    Kind(FrameKind),
    All,
}

impl From<FrameKind> for HandlerKey {
    fn from(kind: FrameKind) -> Self {
        HandlerKey::Kind(kind)
    }
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = std::result::Result<(), HandlerError>;
pub type FrameHandler = Arc<dyn Fn(&Frame) -> HandlerResult + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub connect_timeout: Duration,
    pub max_frame_len: usize,
    pub backoff: BackoffPolicy,
    /// Log every dispatched frame at debug level
    pub verbose_logging: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            backoff: BackoffPolicy::default(),
            verbose_logging: false,
        }
    }
}

impl ChannelConfig {
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn with_verbose_logging(mut self, verbose: bool) -> Self {
        self.verbose_logging = verbose;
        self
    }
}

/// Involuntary loss of the link, tagged with the session generation that
/// was live when it happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Lost { generation: u64, reason: String },
}

struct Writer {
    link_id: u64,
    sink: FrameSink,
}

struct Inner {
    identity: String,
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    state: watch::Sender<ConnectionState>,
    /// Bumped by every explicit `connect`/`disconnect`; pending recovery
    /// for an older generation is abandoned.
    generation: watch::Sender<u64>,
    /// Identifies the installed link so late reader exits are ignored.
    link_seq: AtomicU64,
    connect_lock: Mutex<()>,
    writer: Mutex<Option<Writer>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    handlers: RwLock<HashMap<HandlerKey, FrameHandler>>,
    backoff: StdMutex<BackoffState>,
    events: mpsc::UnboundedSender<LinkEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(task) = reader.take() {
                task.abort();
            }
        }
    }
}

#[derive(Clone)]
pub struct TransportChannel {
    inner: Arc<Inner>,
}

impl fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportChannel")
            .field("identity", &self.inner.identity)
            .field("state", &self.state())
            .finish()
    }
}

impl TransportChannel {
    pub fn new(
        identity: impl Into<String>,
        connector: Arc<dyn Connector>,
        config: ChannelConfig,
    ) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let backoff = config.backoff.initial();
        Self {
            inner: Arc::new(Inner {
                identity: identity.into(),
                config,
                connector,
                state: watch::Sender::new(ConnectionState::Disconnected),
                generation: watch::Sender::new(0),
                link_seq: AtomicU64::new(0),
                connect_lock: Mutex::new(()),
                writer: Mutex::new(None),
                reader: StdMutex::new(None),
                handlers: RwLock::new(HashMap::new()),
                backoff: StdMutex::new(backoff),
                events,
                events_rx: StdMutex::new(Some(events_rx)),
            }),
        }
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Attempts made in the current recovery and the delay before the next.
    pub fn backoff_state(&self) -> BackoffState {
        self.inner
            .backoff
            .lock()
            .map(|state| *state)
            .unwrap_or_else(|_| self.inner.config.backoff.initial())
    }

    /// Open the link. Returns immediately when already connected; concurrent
    /// callers are serialized. Cancels any pending reconnection.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        let generation = self.bump_generation();
        self.set_state(ConnectionState::Connecting);
        let result = self.open(generation).await;
        if result.is_err() && self.generation() == generation {
            self.set_state(ConnectionState::Disconnected);
        }
        result
    }

    /// Close the link on purpose. No reconnection follows.
    pub async fn disconnect(&self) {
        self.bump_generation();
        self.inner.link_seq.fetch_add(1, Ordering::SeqCst);
        // An install racing with us holds the writer lock until its reader
        // is registered, so both are torn down below.
        let writer = self.inner.writer.lock().await.take();
        if let Ok(mut reader) = self.inner.reader.lock() {
            if let Some(task) = reader.take() {
                task.abort();
            }
        }
        if let Some(mut writer) = writer {
            if let Err(e) = writer.sink.close().await {
                debug!(error = %e, "close after disconnect failed");
            }
        }
        self.set_state(ConnectionState::Disconnected);
        info!(identity = %self.inner.identity, "Channel disconnected");
    }

    /// Serialize and write one frame. Requires `CONNECTED`.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        if !self.is_connected() {
            return Err(NetworkError::NotConnected);
        }
        let text = frame.to_json()?;
        let mut writer = self.inner.writer.lock().await;
        let Some(live) = writer.as_mut() else {
            return Err(NetworkError::NotConnected);
        };
        if let Err(e) = live.sink.send(text).await {
            let link_id = live.link_id;
            *writer = None;
            drop(writer);
            self.link_lost(link_id, e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }

    /// Send a chat message after checking it against the level's payload
    /// limit.
    pub async fn send_chat(
        &self,
        contact_id: &str,
        message: &str,
        level: SecurityLevel,
    ) -> Result<()> {
        let consumption = level.key_consumption(message.len())?;
        debug!(contact = contact_id, %level, ?consumption, "sending chat message");
        self.send(&Frame::chat(contact_id, message, level)).await
    }

    pub async fn request_quantum_status(&self) -> Result<()> {
        self.send(&Frame::RequestQuantumStatus).await
    }

    /// Install `handler` for `key`, replacing any previous one.
    pub fn register_handler<F>(&self, key: impl Into<HandlerKey>, handler: F)
    where
        F: Fn(&Frame) -> HandlerResult + Send + Sync + 'static,
    {
        let key = key.into();
        if let Ok(mut handlers) = self.inner.handlers.write() {
            if handlers.insert(key, Arc::new(handler)).is_some() {
                debug!(?key, "replaced frame handler");
            }
        }
    }

    pub fn unregister_handler(&self, key: impl Into<HandlerKey>) {
        let key = key.into();
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.remove(&key);
        }
    }

    /// Deliver a frame to its kind handler, then the catch-all handler.
    pub fn dispatch(&self, frame: &Frame) {
        let kind = frame.kind();
        let targets: Vec<(HandlerKey, FrameHandler)> = match self.inner.handlers.read() {
            Ok(handlers) => [HandlerKey::Kind(kind), HandlerKey::All]
                .into_iter()
                .filter_map(|key| handlers.get(&key).map(|h| (key, Arc::clone(h))))
                .collect(),
            Err(_) => return,
        };
        if self.inner.config.verbose_logging {
            debug!(%kind, handlers = targets.len(), "dispatching frame");
        }
        for (key, handler) in targets {
            match catch_unwind(AssertUnwindSafe(|| handler(frame))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(%kind, ?key, error = %e, "frame handler failed"),
                Err(_) => error!(%kind, ?key, "frame handler panicked"),
            }
        }
    }

    /// Hand the link-loss queue to a supervisor. Only the first caller gets it.
    pub(crate) fn take_link_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.inner.events_rx.lock().ok()?.take()
    }

    pub(crate) fn generation(&self) -> u64 {
        *self.inner.generation.borrow()
    }

    pub(crate) fn subscribe_generation(&self) -> watch::Receiver<u64> {
        self.inner.generation.subscribe()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!(identity = %self.inner.identity, from = %previous, to = %state, "connection state");
        }
    }

    /// Move to `state` on behalf of `generation`. Returns false, leaving the
    /// state alone, once an explicit `connect`/`disconnect` has moved the
    /// channel to a newer generation. Both bump the generation before they
    /// write the state, so the check under the state lock never overwrites
    /// their result.
    pub(crate) fn set_state_for(&self, generation: u64, state: ConnectionState) -> bool {
        let mut live = false;
        let mut previous = None;
        self.inner.state.send_if_modified(|current| {
            if self.generation() != generation {
                return false;
            }
            live = true;
            if *current == state {
                return false;
            }
            previous = Some(std::mem::replace(current, state));
            true
        });
        if let Some(previous) = previous {
            debug!(identity = %self.inner.identity, from = %previous, to = %state, generation, "connection state");
        }
        live
    }

    pub(crate) fn record_backoff(&self, state: BackoffState) {
        if let Ok(mut backoff) = self.inner.backoff.lock() {
            *backoff = state;
        }
    }

    /// One recovery attempt on behalf of `generation`. Fails with
    /// [`NetworkError::Closed`] once that generation has been superseded.
    pub(crate) async fn reconnect(&self, generation: u64) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.generation() != generation {
            return Err(NetworkError::Closed);
        }
        if self.is_connected() {
            return Ok(());
        }
        self.open(generation).await
    }

    /// Give up recovery for `generation`: move to `FAILED` and tell the
    /// handlers. Ignored if that generation has been superseded.
    pub(crate) fn fail(&self, generation: u64, attempts: u32) {
        if !self.set_state_for(generation, ConnectionState::Failed) {
            return;
        }
        error!(identity = %self.inner.identity, attempts, "giving up on reconnection");
        self.dispatch(&Frame::connection_error(format!(
            "connection lost after {attempts} reconnection attempts"
        )));
    }

    fn bump_generation(&self) -> u64 {
        let mut current = 0;
        self.inner.generation.send_modify(|g| {
            *g += 1;
            current = *g;
        });
        current
    }

    async fn open(&self, generation: u64) -> Result<()> {
        let limit = self.inner.config.connect_timeout;
        let link = match timeout(limit, self.inner.connector.connect(&self.inner.identity)).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                warn!(identity = %self.inner.identity, error = %e, "connect failed");
                return Err(e);
            }
            Err(_) => {
                warn!(identity = %self.inner.identity, ?limit, "connect timed out");
                return Err(NetworkError::ConnectionTimeout(limit));
            }
        };
        self.install(link, generation).await
    }

    async fn install(&self, link: Link, generation: u64) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        if self.generation() != generation {
            return Err(NetworkError::Closed);
        }
        let link_id = self.inner.link_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let Link { sink, stream } = link;
        *writer = Some(Writer { link_id, sink });
        let reader = tokio::spawn(read_loop(Arc::downgrade(&self.inner), stream, link_id));
        if let Ok(mut slot) = self.inner.reader.lock() {
            if let Some(old) = slot.replace(reader) {
                old.abort();
            }
        }
        self.record_backoff(self.inner.config.backoff.initial());
        if !self.set_state_for(generation, ConnectionState::Connected) {
            // A disconnect is waiting on the writer lock and tears this link down.
            return Err(NetworkError::Closed);
        }
        drop(writer);
        info!(identity = %self.inner.identity, link_id, "Channel connected");
        Ok(())
    }

    async fn link_lost(&self, link_id: u64, reason: String) {
        if self.inner.link_seq.load(Ordering::SeqCst) != link_id {
            return;
        }
        {
            let mut writer = self.inner.writer.lock().await;
            if writer.as_ref().is_some_and(|w| w.link_id == link_id) {
                *writer = None;
            }
        }
        if self.state() != ConnectionState::Connected {
            return;
        }
        self.set_state(ConnectionState::Disconnected);
        warn!(identity = %self.inner.identity, %reason, "Channel lost");
        let _ = self.inner.events.send(LinkEvent::Lost {
            generation: self.generation(),
            reason,
        });
    }

    fn receive(&self, text: &str) {
        match Frame::from_json(text) {
            Ok(Frame::Unknown) => {
                debug!(len = text.len(), "ignoring frame of unknown type");
            }
            Ok(frame) => self.dispatch(&frame),
            Err(e) => warn!(error = %e, "dropping malformed frame"),
        }
    }
}

async fn read_loop(inner: Weak<Inner>, mut stream: FrameStream, link_id: u64) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(text)) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                TransportChannel { inner }.receive(&text);
            }
            Some(Err(e)) => break e.to_string(),
            None => break "stream closed by peer".to_string(),
        }
    };
    if let Some(inner) = inner.upgrade() {
        TransportChannel { inner }.link_lost(link_id, reason).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio::io::DuplexStream;

    use super::*;

    /// Hands out duplex links and passes the far end to the test.
    struct PipeConnector {
        peers: mpsc::UnboundedSender<Link>,
    }

    #[async_trait]
    impl Connector for PipeConnector {
        async fn connect(&self, _identity: &str) -> Result<Link> {
            let (near, far): (DuplexStream, DuplexStream) = tokio::io::duplex(64 * 1024);
            let _ = self.peers.send(Link::framed(far, DEFAULT_MAX_FRAME_LEN));
            Ok(Link::framed(near, DEFAULT_MAX_FRAME_LEN))
        }
    }

    struct StallConnector;

    #[async_trait]
    impl Connector for StallConnector {
        async fn connect(&self, _identity: &str) -> Result<Link> {
            futures::future::pending().await
        }
    }

    /// Takes a while to open each link and counts how often it is asked.
    struct SlowConnector {
        opened: AtomicUsize,
        peers: mpsc::UnboundedSender<Link>,
    }

    #[async_trait]
    impl Connector for SlowConnector {
        async fn connect(&self, _identity: &str) -> Result<Link> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(2)).await;
            let (near, far) = tokio::io::duplex(64 * 1024);
            let _ = self.peers.send(Link::framed(far, DEFAULT_MAX_FRAME_LEN));
            Ok(Link::framed(near, DEFAULT_MAX_FRAME_LEN))
        }
    }

    fn pipe_channel() -> (TransportChannel, mpsc::UnboundedReceiver<Link>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let channel = TransportChannel::new(
            "alice",
            Arc::new(PipeConnector { peers }),
            ChannelConfig::default(),
        );
        (channel, rx)
    }

    async fn push(peer: &mut Link, text: &str) {
        peer.sink.send(text.to_string()).await.unwrap();
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (channel, _peers) = pipe_channel();
        assert!(matches!(
            channel.send(&Frame::RequestQuantumStatus).await,
            Err(NetworkError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (channel, mut peers) = pipe_channel();
        channel.connect().await.unwrap();
        channel.connect().await.unwrap();
        assert_eq!(channel.state(), ConnectionState::Connected);
        assert!(peers.recv().await.is_some());
        assert!(peers.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_open_one_link() {
        let (peers, mut links) = mpsc::unbounded_channel();
        let connector = Arc::new(SlowConnector {
            opened: AtomicUsize::new(0),
            peers,
        });
        let channel = TransportChannel::new("alice", connector.clone(), ChannelConfig::default());

        let (first, second) = tokio::join!(channel.connect(), channel.connect());
        first.unwrap();
        second.unwrap();
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ConnectionState::Connected);
        assert!(links.recv().await.is_some());
        assert!(links.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let channel = TransportChannel::new(
            "alice",
            Arc::new(StallConnector),
            ChannelConfig::default().with_connect_timeout(Duration::from_secs(10)),
        );
        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, NetworkError::ConnectionTimeout(d) if d == Duration::from_secs(10)));
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let (channel, mut peers) = pipe_channel();
        channel.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        channel.request_quantum_status().await.unwrap();
        let text = peer.stream.next().await.unwrap().unwrap();
        assert_eq!(Frame::from_json(&text).unwrap(), Frame::RequestQuantumStatus);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sends_arrive_whole() {
        let (channel, mut peers) = pipe_channel();
        channel.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        // Large enough that each frame spans several writes into the pipe.
        let messages: Vec<String> = (0..64)
            .map(|i| format!("{i:02}:{}", "q".repeat(8 * 1024)))
            .collect();
        let sends = futures::future::join_all(messages.iter().map(|message| {
            let channel = channel.clone();
            let frame = Frame::chat("bob", message.clone(), SecurityLevel::L2);
            tokio::spawn(async move { channel.send(&frame).await })
        }));
        let reads = async {
            let mut seen = Vec::new();
            while seen.len() < messages.len() {
                let text = peer.stream.next().await.unwrap().unwrap();
                match Frame::from_json(&text).unwrap() {
                    Frame::ChatMessage { data } => seen.push(data.message),
                    other => panic!("unexpected frame {other:?}"),
                }
            }
            seen
        };

        let (results, mut seen) = tokio::join!(sends, reads);
        for result in results {
            result.unwrap().unwrap();
        }
        seen.sort();
        assert_eq!(seen, messages);
    }

    #[tokio::test]
    async fn test_send_chat_enforces_payload_limit() {
        let (channel, _peers) = pipe_channel();
        channel.connect().await.unwrap();
        let message = "x".repeat(60 * 1024);
        let err = channel
            .send_chat("bob", &message, SecurityLevel::L1)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Policy(_)));
    }

    #[tokio::test]
    async fn test_dispatch_to_kind_and_catch_all() {
        let (channel, mut peers) = pipe_channel();
        let kind_hits = Arc::new(AtomicUsize::new(0));
        let all_hits = Arc::new(AtomicUsize::new(0));
        let k = Arc::clone(&kind_hits);
        channel.register_handler(FrameKind::MessageSent, move |_| {
            k.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let a = Arc::clone(&all_hits);
        channel.register_handler(HandlerKey::All, move |_| {
            a.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        channel.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        push(&mut peer, r#"{"type":"message_sent","messageId":"m1","status":"sent"}"#).await;
        push(&mut peer, r#"{"type":"quantum_status_update","data":{}}"#).await;
        settle().await;

        assert_eq!(kind_hits.load(Ordering::SeqCst), 1);
        assert_eq!(all_hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_registration_replaces_previous_handler() {
        let (channel, _peers) = pipe_channel();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&first);
        channel.register_handler(FrameKind::ConnectionError, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let s = Arc::clone(&second);
        channel.register_handler(FrameKind::ConnectionError, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        channel.dispatch(&Frame::connection_error("boom"));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        channel.unregister_handler(FrameKind::ConnectionError);
        channel.dispatch(&Frame::connection_error("boom"));
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_handlers_do_not_stop_the_reader() {
        let (channel, mut peers) = pipe_channel();
        let after = Arc::new(AtomicUsize::new(0));
        channel.register_handler(FrameKind::QuantumStatusUpdate, |_| panic!("handler bug"));
        channel.register_handler(FrameKind::MessageSent, |_| Err("rejected".into()));
        let a = Arc::clone(&after);
        channel.register_handler(HandlerKey::All, move |_| {
            a.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        channel.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        push(&mut peer, r#"{"type":"quantum_status_update","data":{}}"#).await;
        push(&mut peer, r#"{"type":"message_sent","messageId":"m1","status":"sent"}"#).await;
        push(&mut peer, "not json").await;
        push(&mut peer, r#"{"type":"from_the_future"}"#).await;
        push(&mut peer, r#"{"type":"quantum_status_update","data":{}}"#).await;
        settle().await;

        assert_eq!(after.load(Ordering::SeqCst), 3);
        assert_eq!(channel.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_peer_close_reports_loss() {
        let (channel, mut peers) = pipe_channel();
        let mut events = channel.take_link_events().unwrap();
        channel.connect().await.unwrap();
        let generation = channel.generation();
        drop(peers.recv().await.unwrap());

        let event = events.recv().await.unwrap();
        assert!(matches!(event, LinkEvent::Lost { generation: g, .. } if g == generation));
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_is_not_a_loss() {
        let (channel, mut peers) = pipe_channel();
        let mut events = channel.take_link_events().unwrap();
        channel.connect().await.unwrap();
        let _peer = peers.recv().await.unwrap();

        channel.disconnect().await;
        settle().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert!(events.try_recv().is_err());
        assert!(channel.take_link_events().is_none());
    }
}
