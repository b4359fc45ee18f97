//! Per-call negotiation state

use std::time::Instant;

use crypto::{HybridKeyPair, HybridPublicKeys, IdentityKey, SessionKey, SrtpKeys};
use tokio::task::JoinHandle;

use crate::error::{HandshakeError, Result};
use crate::types::{CallId, CallState, CallType, Role};

/// One call's handshake. Mutated only by the negotiator, under the
/// session's own async mutex.
pub struct CallSession {
    call_id: CallId,
    contact_id: String,
    call_type: CallType,
    role: Role,
    state: CallState,
    created_at: Instant,
    pub(crate) our_keys: Option<HybridKeyPair>,
    pub(crate) remote_keys: Option<HybridPublicKeys>,
    pub(crate) remote_identity: Option<IdentityKey>,
    pub(crate) session_key: Option<SessionKey>,
    pub(crate) srtp: Option<SrtpKeys>,
    timer: Option<JoinHandle<()>>,
    timer_epoch: u64,
}

impl CallSession {
    pub(crate) fn new(call_id: CallId, contact_id: String, call_type: CallType, role: Role) -> Self {
        Self {
            call_id,
            contact_id,
            call_type,
            role,
            state: CallState::Initiated,
            created_at: Instant::now(),
            our_keys: None,
            remote_keys: None,
            remote_identity: None,
            session_key: None,
            srtp: None,
            timer: None,
            timer_epoch: 0,
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn contact_id(&self) -> &str {
        &self.contact_id
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Reject a frame unless the session is in `expected`. Never mutates.
    pub(crate) fn expect(&self, expected: CallState, message: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(HandshakeError::UnexpectedMessage {
                call_id: self.call_id.clone(),
                state: self.state,
                message,
            })
        }
    }

    /// Move to `next`. Returns false (and leaves the state alone) when the
    /// edge is not in the state machine.
    pub(crate) fn advance(&mut self, next: CallState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        if next.is_terminal() {
            self.cancel_timer();
            self.discard_keys();
        }
        true
    }

    /// Store the timer armed for the current epoch. Call
    /// [`cancel_timer`](Self::cancel_timer) first.
    pub(crate) fn set_timer(&mut self, handle: JoinHandle<()>) {
        if let Some(old) = self.timer.replace(handle) {
            old.abort();
        }
    }

    pub(crate) fn timer_epoch(&self) -> u64 {
        self.timer_epoch
    }

    /// Forget the timer handle without aborting it. Used by the timer task
    /// itself when it fires.
    pub(crate) fn release_timer(&mut self) {
        self.timer = None;
    }

    /// Abort the pending timer and invalidate any expiry already in flight.
    pub(crate) fn cancel_timer(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
        self.timer_epoch += 1;
    }

    fn discard_keys(&mut self) {
        self.our_keys = None;
        self.remote_keys = None;
        self.session_key = None;
        self.srtp = None;
    }

    pub fn has_key_material(&self) -> bool {
        self.our_keys.is_some() || self.session_key.is_some()
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("call_id", &self.call_id)
            .field("contact_id", &self.contact_id)
            .field("call_type", &self.call_type)
            .field("role", &self.role)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
