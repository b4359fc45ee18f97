//! In-process stand-in for the QuMail server: terminates every client's
//! channel, relays handshake signaling between parties and records what
//! clients send.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crypto::SigningIdentity;
use futures::{SinkExt, StreamExt};
use network::link::FrameSink;
use network::{
    CallFrameRouter, ChannelConfig, ConnectionState, Connector, Frame, Link, ReconnectionSupervisor,
    StreamConnector, SupervisorHandle, TransportChannel, DEFAULT_MAX_FRAME_LEN,
};
use pq_handshake::{
    CallEnded, CallEvent, CallId, CallNegotiator, IncomingCall, InitiateRequest, NegotiatorConfig,
    RecordingSignaling, SignalingRecord,
};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(15);

#[derive(Default)]
struct Board {
    sinks: AsyncMutex<HashMap<String, FrameSink>>,
    readers: Mutex<HashMap<String, JoinHandle<()>>>,
    connections: Mutex<HashMap<String, usize>>,
    refused: Mutex<HashSet<String>>,
    received: Mutex<Vec<(String, Frame)>>,
    pending: Mutex<HashMap<String, InitiateRequest>>,
    calls: Mutex<HashMap<CallId, (String, String)>>,
}

#[derive(Clone, Default)]
pub struct Switchboard {
    board: Arc<Board>,
}

pub struct Client {
    pub identity: String,
    pub channel: TransportChannel,
    pub negotiator: CallNegotiator,
    pub router: CallFrameRouter,
    pub signaling: Arc<RecordingSignaling>,
    _supervisor: SupervisorHandle,
}

impl Switchboard {
    pub fn client(&self, identity: &str) -> Client {
        self.client_with(identity, ChannelConfig::default(), NegotiatorConfig::default())
    }

    pub fn client_with(
        &self,
        identity: &str,
        channel_config: ChannelConfig,
        negotiator_config: NegotiatorConfig,
    ) -> Client {
        let signaling = self.signaling(identity);
        let negotiator = CallNegotiator::new(
            SigningIdentity::generate().expect("signing identity"),
            signaling.clone(),
            negotiator_config,
        );
        let channel = TransportChannel::new(identity, self.connector(), channel_config);
        let router = CallFrameRouter::new(negotiator.clone());
        router.attach(&channel);
        let supervisor = ReconnectionSupervisor::new(channel.clone())
            .spawn()
            .expect("supervisor");
        Client {
            identity: identity.to_string(),
            channel,
            negotiator,
            router,
            signaling,
            _supervisor: supervisor,
        }
    }

    fn connector(&self) -> Arc<dyn Connector> {
        let board = self.clone();
        Arc::new(StreamConnector::new(move |identity: String| {
            let board = board.clone();
            async move {
                if board.board.refused.lock().unwrap().contains(&identity) {
                    return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
                }
                let (near, far) = tokio::io::duplex(256 * 1024);
                board.accept(identity, Link::framed(far, DEFAULT_MAX_FRAME_LEN)).await;
                Ok::<_, io::Error>(near)
            }
        }))
    }

    async fn accept(&self, identity: String, link: Link) {
        let Link { sink, mut stream } = link;
        self.board.sinks.lock().await.insert(identity.clone(), sink);
        *self
            .board
            .connections
            .lock()
            .unwrap()
            .entry(identity.clone())
            .or_default() += 1;

        let board = Arc::clone(&self.board);
        let from = identity.clone();
        let reader = tokio::spawn(async move {
            while let Some(Ok(text)) = stream.next().await {
                if let Ok(frame) = Frame::from_json(&text) {
                    board.received.lock().unwrap().push((from.clone(), frame));
                }
            }
        });
        if let Some(old) = self.board.readers.lock().unwrap().insert(identity, reader) {
            old.abort();
        }
    }

    /// Drop the server side of `identity`'s link.
    pub async fn sever(&self, identity: &str) {
        self.board.sinks.lock().await.remove(identity);
        if let Some(reader) = self.board.readers.lock().unwrap().remove(identity) {
            reader.abort();
        }
    }

    pub fn refuse(&self, identity: &str) {
        self.board.refused.lock().unwrap().insert(identity.to_string());
    }

    pub fn admit(&self, identity: &str) {
        self.board.refused.lock().unwrap().remove(identity);
    }

    pub fn connections(&self, identity: &str) -> usize {
        self.board
            .connections
            .lock()
            .unwrap()
            .get(identity)
            .copied()
            .unwrap_or(0)
    }

    /// Frames the server received from `identity`.
    pub fn received_from(&self, identity: &str) -> Vec<Frame> {
        self.board
            .received
            .lock()
            .unwrap()
            .iter()
            .filter(|(from, _)| from == identity)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    pub async fn deliver(&self, to: &str, frame: &Frame) -> bool {
        let text = frame.to_json().expect("frame json");
        let mut sinks = self.board.sinks.lock().await;
        match sinks.get_mut(to) {
            Some(sink) => sink.send(text).await.is_ok(),
            None => false,
        }
    }

    fn signaling(&self, identity: &str) -> Arc<RecordingSignaling> {
        let (forward, mut records) = mpsc::unbounded_channel();
        let board = self.clone();
        let from = identity.to_string();
        tokio::spawn(async move {
            while let Some(record) = records.recv().await {
                board.relay(&from, record).await;
            }
        });
        Arc::new(RecordingSignaling::with_forwarder(forward))
    }

    fn peer_of(&self, from: &str, call_id: &CallId) -> Option<String> {
        let calls = self.board.calls.lock().unwrap();
        let (caller, callee) = calls.get(call_id)?;
        Some(if caller == from { callee.clone() } else { caller.clone() })
    }

    async fn relay(&self, from: &str, record: SignalingRecord) {
        match record {
            SignalingRecord::Initiate(request) => {
                self.board
                    .pending
                    .lock()
                    .unwrap()
                    .insert(from.to_string(), request);
            }
            SignalingRecord::PublicKey(message) => {
                if let Some(peer) = self.peer_of(from, &message.call_id) {
                    self.deliver(&peer, &Frame::CallPublicKey(message)).await;
                    return;
                }
                let request = self.board.pending.lock().unwrap().remove(from);
                if let Some(request) = request {
                    self.board.calls.lock().unwrap().insert(
                        message.call_id.clone(),
                        (from.to_string(), request.contact_id.clone()),
                    );
                    let incoming = IncomingCall {
                        call_id: message.call_id.clone(),
                        caller_id: from.to_string(),
                        call_type: request.call_type,
                        public_key: Some(message),
                    };
                    self.deliver(&request.contact_id, &Frame::IncomingCall(incoming))
                        .await;
                }
            }
            SignalingRecord::Ciphertext(message) => {
                if let Some(peer) = self.peer_of(from, &message.call_id) {
                    self.deliver(&peer, &Frame::CallCiphertext(message)).await;
                }
            }
            SignalingRecord::Confirmation(message) => {
                if let Some(peer) = self.peer_of(from, &message.call_id) {
                    self.deliver(&peer, &Frame::CallConfirmed(message)).await;
                }
            }
            SignalingRecord::End(call_id) => {
                if let Some(peer) = self.peer_of(from, &call_id) {
                    let ended = CallEnded {
                        call_id,
                        reason: Some(format!("ended by {from}")),
                    };
                    self.deliver(&peer, &Frame::CallEnded(ended)).await;
                }
            }
        }
    }
}

pub async fn wait_for_state(channel: &TransportChannel, state: ConnectionState) {
    tokio::time::timeout(WAIT, channel.subscribe_state().wait_for(|s| *s == state))
        .await
        .expect("state change timed out")
        .map(|_| ())
        .expect("channel dropped");
}

/// Next terminal or established event for `call_id`.
pub async fn next_outcome(events: &mut broadcast::Receiver<CallEvent>, call_id: &CallId) -> CallEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await.expect("event stream") {
                event @ (CallEvent::Established { .. } | CallEvent::Failed { .. })
                    if event.call_id() == call_id =>
                {
                    return event;
                }
                _ => {}
            }
        }
    })
    .await
    .expect("call outcome timed out")
}
