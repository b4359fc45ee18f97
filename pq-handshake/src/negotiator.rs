//! Hybrid session negotiation for calls.
//!
//! The four handshake messages and who handles them:
//!
//! ```text
//! initiator                                   responder
//!   start_call      -- public_key -->         accept_call
//!   on_public_keys  <-- public_key --
//!                   -- ciphertext -->         on_ciphertext
//!   on_confirmation <-- confirm -----
//! ```

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crypto::{
    derive_srtp_keys, key_confirmation, verify_key_confirmation, HybridKeyPair, IdentityKey,
    SessionKey, SigningIdentity, SrtpKeys,
};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::config::NegotiatorConfig;
use crate::error::{HandshakeError, Result, SignalingError};
use crate::session::CallSession;
use crate::signaling::Signaling;
use crate::types::{
    CallEnded, CallEvent, CallId, CallState, CallType, CiphertextMessage, ConfirmationMessage,
    IncomingCall, PublicKeyMessage, Role,
};

type SharedSession = Arc<AsyncMutex<CallSession>>;

#[derive(Default)]
struct Registry {
    sessions: HashMap<CallId, SharedSession>,
    by_contact: HashMap<String, CallId>,
    tombstones: VecDeque<(CallId, CallState)>,
}

struct Inner {
    config: NegotiatorConfig,
    identity: SigningIdentity,
    signaling: Arc<dyn Signaling>,
    registry: Mutex<Registry>,
    pinned: Mutex<HashMap<String, IdentityKey>>,
    events: broadcast::Sender<CallEvent>,
}

/// Drives every call of one authenticated user. Cheap to clone.
#[derive(Clone)]
pub struct CallNegotiator {
    inner: Arc<Inner>,
}

impl CallNegotiator {
    pub fn new(
        identity: SigningIdentity,
        signaling: Arc<dyn Signaling>,
        config: NegotiatorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                identity,
                signaling,
                registry: Mutex::new(Registry::default()),
                pinned: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn identity_key(&self) -> &IdentityKey {
        self.inner.identity.identity_key()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    /// Require `contact_id` to sign its handshake steps with `key`.
    pub fn pin_identity(&self, contact_id: impl Into<String>, key: IdentityKey) {
        lock(&self.inner.pinned).insert(contact_id.into(), key);
    }

    /// Place a call: obtain a call id, generate key material and publish
    /// our public keys. Returns once the session is `AWAITING_PUBLIC_KEY`.
    pub async fn start_call(&self, contact_id: &str, call_type: CallType) -> Result<CallId> {
        let response = self
            .signal(self.inner.signaling.initiate(contact_id, call_type))
            .await?;
        let call_id = response.call_id;
        info!(call_id = %call_id, contact = %contact_id, %call_type, "Starting call");

        let shared = Arc::new(AsyncMutex::new(CallSession::new(
            call_id.clone(),
            contact_id.to_string(),
            call_type,
            Role::Initiator,
        )));
        let mut session = shared.lock().await;
        let prior = self.register(&call_id, contact_id, shared.clone())?;
        self.emit_state(&session);
        if let Some(prior) = prior {
            self.supersede(prior, &call_id).await;
        }

        let result = self.offer(&mut session).await;
        self.settle(&mut session, result).map(|()| call_id)
    }

    /// Answer an incoming call that carries the initiator's signed keys.
    pub async fn accept_call(&self, incoming: IncomingCall) -> Result<()> {
        let call_id = incoming.call_id.clone();
        if let Some(state) = self.tombstone_state(&call_id) {
            return Err(HandshakeError::UnexpectedMessage {
                call_id,
                state,
                message: "incoming_call",
            });
        }
        info!(call_id = %call_id, caller = %incoming.caller_id, call_type = %incoming.call_type, "Accepting call");

        let shared = Arc::new(AsyncMutex::new(CallSession::new(
            call_id.clone(),
            incoming.caller_id.clone(),
            incoming.call_type,
            Role::Responder,
        )));
        let mut session = shared.lock().await;
        let prior = self.register(&call_id, &incoming.caller_id, shared.clone())?;
        self.emit_state(&session);
        if let Some(prior) = prior {
            self.supersede(prior, &call_id).await;
        }

        let result = self.answer(&mut session, incoming).await;
        self.settle(&mut session, result)
    }

    /// Initiator: the responder's public keys arrived.
    pub async fn on_public_keys(&self, message: PublicKeyMessage) -> Result<()> {
        let shared = self.lookup(&message.call_id)?;
        let mut session = shared.lock().await;
        let result = self.send_ciphertext(&mut session, message).await;
        self.settle(&mut session, result)
    }

    /// Responder: the initiator's ciphertext arrived.
    pub async fn on_ciphertext(&self, message: CiphertextMessage) -> Result<()> {
        let shared = self.lookup(&message.call_id)?;
        let mut session = shared.lock().await;
        let result = self.confirm(&mut session, message).await;
        self.settle(&mut session, result)
    }

    /// Initiator: the responder proved it derived the same key.
    pub async fn on_confirmation(&self, message: ConfirmationMessage) -> Result<()> {
        let shared = self.lookup(&message.call_id)?;
        let mut session = shared.lock().await;
        let result = self.check_confirmation(&mut session, message);
        self.settle(&mut session, result)
    }

    /// End a call locally and tell the server. Ending an unknown or already
    /// terminal call does nothing.
    pub async fn end_call(&self, call_id: &CallId) {
        if !self.finish(call_id, CallState::Ended, "ended locally").await {
            return;
        }
        if let Err(err) = self.signal(self.inner.signaling.end(call_id)).await {
            warn!(call_id = %call_id, error = %err, "Failed to report call end");
        }
    }

    /// The peer or server ended the call.
    pub async fn on_remote_end(&self, ended: CallEnded) {
        let reason = ended.reason.as_deref().unwrap_or("ended by peer");
        self.finish(&ended.call_id, CallState::Ended, reason).await;
    }

    pub async fn state(&self, call_id: &CallId) -> Option<CallState> {
        match self.session(call_id) {
            Some(shared) => Some(shared.lock().await.state()),
            None => self.tombstone_state(call_id),
        }
    }

    pub async fn session_key(&self, call_id: &CallId) -> Option<SessionKey> {
        let shared = self.session(call_id)?;
        let session = shared.lock().await;
        match session.state() {
            CallState::Established => session.session_key.clone(),
            _ => None,
        }
    }

    pub async fn srtp_keys(&self, call_id: &CallId) -> Option<SrtpKeys> {
        let shared = self.session(call_id)?;
        let session = shared.lock().await;
        session.srtp.clone()
    }

    /// The live call with `contact_id`, if any.
    pub fn active_call(&self, contact_id: &str) -> Option<CallId> {
        self.registry().by_contact.get(contact_id).cloned()
    }

    pub fn live_calls(&self) -> usize {
        self.registry().sessions.len()
    }

    async fn offer(&self, session: &mut CallSession) -> Result<()> {
        let keys = HybridKeyPair::generate()?;
        let message = self.signed_public_key(session.call_id(), &keys);
        self.trace(session, "Generated hybrid key pair", &keys.fingerprint());
        session.our_keys = Some(keys);

        self.signal(self.inner.signaling.publish_public_key(&message))
            .await?;
        self.transition(session, CallState::AwaitingPublicKey);
        Ok(())
    }

    async fn answer(&self, session: &mut CallSession, incoming: IncomingCall) -> Result<()> {
        let offer = incoming
            .public_key
            .ok_or(HandshakeError::MissingField("publicKey"))?;
        let identity = self.verify_public_key(session, &offer)?;

        let keys = HybridKeyPair::generate()?;
        let message = self.signed_public_key(session.call_id(), &keys);
        self.trace(session, "Generated hybrid key pair", &keys.fingerprint());
        session.our_keys = Some(keys);
        session.remote_keys = Some(offer.keys);
        session.remote_identity = Some(identity);

        self.signal(self.inner.signaling.publish_public_key(&message))
            .await?;
        self.transition(session, CallState::KeysExchanged);
        Ok(())
    }

    async fn send_ciphertext(
        &self,
        session: &mut CallSession,
        message: PublicKeyMessage,
    ) -> Result<()> {
        session.expect(CallState::AwaitingPublicKey, "call_public_key")?;
        let identity = self.verify_public_key(session, &message)?;

        let mut encapsulation = crypto::encapsulate(&message.keys)?;
        let session_key = encapsulation
            .take_session_key()
            .ok_or(HandshakeError::MissingField("sessionKey"))?;
        let mut outgoing = CiphertextMessage {
            call_id: session.call_id().clone(),
            bundle: encapsulation.bundle().clone(),
            signature: Vec::new(),
        };
        outgoing.signature = self.inner.identity.sign(&outgoing.signing_digest());
        self.trace(session, "Encapsulated session key", &session_key.fingerprint());

        session.remote_keys = Some(message.keys);
        session.remote_identity = Some(identity);
        session.session_key = Some(session_key);

        self.signal(self.inner.signaling.publish_ciphertext(&outgoing))
            .await?;
        self.transition(session, CallState::CiphertextSent);
        Ok(())
    }

    async fn confirm(&self, session: &mut CallSession, message: CiphertextMessage) -> Result<()> {
        session.expect(CallState::KeysExchanged, "call_ciphertext")?;
        let identity = session
            .remote_identity
            .as_ref()
            .ok_or(HandshakeError::MissingField("identityKey"))?;
        identity
            .verify(&message.signing_digest(), &message.signature)
            .map_err(|_| HandshakeError::InvalidSignature("call_ciphertext"))?;

        let ours = session
            .our_keys
            .as_ref()
            .ok_or(HandshakeError::MissingField("ourKeyPair"))?;
        let session_key = crypto::decapsulate(&message.bundle, ours)?;
        let srtp = derive_srtp_keys(&session_key, session.call_id().as_str())?;
        let tag = key_confirmation(&session_key, session.call_id().as_str())?;
        let mut outgoing = ConfirmationMessage {
            call_id: session.call_id().clone(),
            key_confirmation: tag.to_vec(),
            signature: Vec::new(),
        };
        outgoing.signature = self.inner.identity.sign(&outgoing.signing_digest());
        self.trace(session, "Decapsulated session key", &session_key.fingerprint());

        session.session_key = Some(session_key);
        session.srtp = Some(srtp);

        self.signal(self.inner.signaling.publish_confirmation(&outgoing))
            .await?;
        self.establish(session);
        Ok(())
    }

    fn check_confirmation(
        &self,
        session: &mut CallSession,
        message: ConfirmationMessage,
    ) -> Result<()> {
        session.expect(CallState::CiphertextSent, "call_confirmed")?;
        let identity = session
            .remote_identity
            .as_ref()
            .ok_or(HandshakeError::MissingField("identityKey"))?;
        identity
            .verify(&message.signing_digest(), &message.signature)
            .map_err(|_| HandshakeError::InvalidSignature("call_confirmed"))?;

        let session_key = session
            .session_key
            .as_ref()
            .ok_or(HandshakeError::MissingField("sessionKey"))?;
        verify_key_confirmation(
            session_key,
            session.call_id().as_str(),
            &message.key_confirmation,
        )
        .map_err(|_| HandshakeError::ConfirmationMismatch)?;
        let srtp = derive_srtp_keys(session_key, session.call_id().as_str())?;

        session.srtp = Some(srtp);
        self.establish(session);
        Ok(())
    }

    fn establish(&self, session: &mut CallSession) {
        self.transition(session, CallState::Established);
        let (Some(srtp), Some(key)) = (&session.srtp, &session.session_key) else {
            return;
        };
        info!(
            call_id = %session.call_id(),
            contact = %session.contact_id(),
            srtp_key_id = %srtp.key_id(),
            "Call secured"
        );
        self.emit(CallEvent::Established {
            call_id: session.call_id().clone(),
            contact_id: session.contact_id().to_string(),
            role: session.role(),
            srtp: srtp.clone(),
            key_fingerprint: key.fingerprint(),
        });
    }

    /// Apply the outcome of a step: out-of-order frames are dropped without
    /// touching the session, every other error fails it.
    fn settle(&self, session: &mut CallSession, result: Result<()>) -> Result<()> {
        match &result {
            Ok(()) => {}
            Err(err @ HandshakeError::UnexpectedMessage { .. }) => {
                warn!(call_id = %session.call_id(), error = %err, "Rejected out-of-order frame");
            }
            Err(err) => self.fail(session, err.to_string()),
        }
        result
    }

    fn fail(&self, session: &mut CallSession, reason: String) {
        if !session.advance(CallState::Failed) {
            return;
        }
        warn!(call_id = %session.call_id(), contact = %session.contact_id(), %reason, "Call failed");
        self.retire(session);
        self.emit_state(session);
        self.emit(CallEvent::Failed {
            call_id: session.call_id().clone(),
            contact_id: session.contact_id().to_string(),
            reason,
        });
    }

    /// Move a live session to a terminal state. Returns false if there was
    /// nothing to do.
    async fn finish(&self, call_id: &CallId, state: CallState, reason: &str) -> bool {
        let Some(shared) = self.session(call_id) else {
            debug!(call_id = %call_id, "Ignoring end for unknown or finished call");
            return false;
        };
        let mut session = shared.lock().await;
        if !session.advance(state) {
            return false;
        }
        info!(call_id = %call_id, contact = %session.contact_id(), %reason, "Call ended");
        self.retire(&session);
        self.emit_state(&session);
        true
    }

    async fn supersede(&self, prior: SharedSession, by: &CallId) {
        let mut session = prior.lock().await;
        if session.state().is_terminal() {
            return;
        }
        self.fail(&mut session, format!("superseded by call {by}"));
    }

    fn transition(&self, session: &mut CallSession, next: CallState) {
        let from = session.state();
        if !session.advance(next) {
            warn!(call_id = %session.call_id(), %from, to = %next, "Refused invalid transition");
            return;
        }
        if self.inner.config.verbose_logging {
            debug!(call_id = %session.call_id(), %from, to = %next, "Call state changed");
        }
        if next.is_waiting() {
            self.arm_timer(session);
        } else {
            session.cancel_timer();
        }
        self.emit_state(session);
    }

    fn arm_timer(&self, session: &mut CallSession) {
        session.cancel_timer();
        let epoch = session.timer_epoch();
        let call_id = session.call_id().clone();
        let timeout = self.inner.config.signaling_timeout;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                CallNegotiator { inner }.expire(call_id, epoch).await;
            }
        });
        session.set_timer(handle);
    }

    async fn expire(&self, call_id: CallId, epoch: u64) {
        let Some(shared) = self.session(&call_id) else {
            return;
        };
        let mut session = shared.lock().await;
        if session.timer_epoch() != epoch || !session.state().is_waiting() {
            return;
        }
        session.release_timer();
        let reason = format!("timed out waiting for peer in {}", session.state());
        self.fail(&mut session, reason);
    }

    fn verify_public_key(
        &self,
        session: &CallSession,
        message: &PublicKeyMessage,
    ) -> Result<IdentityKey> {
        if &message.call_id != session.call_id() {
            return Err(HandshakeError::InvalidSignature("public_key"));
        }
        let identity = IdentityKey::from_bytes(&message.identity_key)
            .map_err(|_| HandshakeError::InvalidSignature("public_key"))?;
        if let Some(pinned) = lock(&self.inner.pinned).get(session.contact_id()) {
            if pinned != &identity {
                return Err(HandshakeError::IdentityMismatch(
                    session.contact_id().to_string(),
                ));
            }
        }
        identity
            .verify(&message.signing_digest(), &message.signature)
            .map_err(|_| HandshakeError::InvalidSignature("public_key"))?;
        Ok(identity)
    }

    fn signed_public_key(&self, call_id: &CallId, keys: &HybridKeyPair) -> PublicKeyMessage {
        let mut message = PublicKeyMessage {
            call_id: call_id.clone(),
            keys: keys.public_keys(),
            identity_key: self.identity_key().as_bytes().to_vec(),
            signature: Vec::new(),
        };
        message.signature = self.inner.identity.sign(&message.signing_digest());
        message
    }

    async fn signal<T>(
        &self,
        request: impl Future<Output = std::result::Result<T, SignalingError>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.inner.config.signaling_timeout, request).await {
            Ok(result) => result.map_err(HandshakeError::from),
            Err(_) => Err(SignalingError::Timeout.into()),
        }
    }

    fn register(
        &self,
        call_id: &CallId,
        contact_id: &str,
        shared: SharedSession,
    ) -> Result<Option<SharedSession>> {
        let mut registry = self.registry();
        if registry.sessions.contains_key(call_id) {
            return Err(HandshakeError::DuplicateCall(call_id.clone()));
        }
        registry.sessions.insert(call_id.clone(), shared);
        let prior = registry
            .by_contact
            .insert(contact_id.to_string(), call_id.clone());
        Ok(prior.and_then(|id| registry.sessions.get(&id).cloned()))
    }

    fn retire(&self, session: &CallSession) {
        let capacity = self.inner.config.tombstone_capacity;
        let mut registry = self.registry();
        registry.sessions.remove(session.call_id());
        if registry.by_contact.get(session.contact_id()) == Some(session.call_id()) {
            registry.by_contact.remove(session.contact_id());
        }
        registry
            .tombstones
            .push_back((session.call_id().clone(), session.state()));
        while registry.tombstones.len() > capacity {
            registry.tombstones.pop_front();
        }
    }

    fn lookup(&self, call_id: &CallId) -> Result<SharedSession> {
        self.session(call_id)
            .ok_or_else(|| HandshakeError::UnknownCall(call_id.clone()))
    }

    fn session(&self, call_id: &CallId) -> Option<SharedSession> {
        self.registry().sessions.get(call_id).cloned()
    }

    fn tombstone_state(&self, call_id: &CallId) -> Option<CallState> {
        self.registry()
            .tombstones
            .iter()
            .rev()
            .find(|(id, _)| id == call_id)
            .map(|(_, state)| *state)
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.inner.registry)
    }

    fn emit_state(&self, session: &CallSession) {
        self.emit(CallEvent::StateChanged {
            call_id: session.call_id().clone(),
            contact_id: session.contact_id().to_string(),
            state: session.state(),
        });
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn trace(&self, session: &CallSession, what: &str, fingerprint: &str) {
        if self.inner.config.verbose_logging {
            debug!(call_id = %session.call_id(), %fingerprint, "{what}");
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
