//! Feeds call handshake frames from the channel into a [`CallNegotiator`].
//!
//! Frames for one call are processed strictly in arrival order by a task
//! that owns that call's queue. Different calls progress independently.
//! A queue closes as soon as its call is terminal, whether a frame or a
//! local action (hangup, timeout, supersession) put it there.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pq_handshake::{CallEvent, CallId, CallNegotiator};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::channel::{HandlerResult, TransportChannel};
use crate::frame::{Frame, FrameKind};

type Queues = Arc<Mutex<HashMap<CallId, mpsc::UnboundedSender<Frame>>>>;

#[derive(Clone)]
pub struct CallFrameRouter {
    negotiator: CallNegotiator,
    queues: Queues,
}

impl CallFrameRouter {
    pub fn new(negotiator: CallNegotiator) -> Self {
        Self {
            negotiator,
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn negotiator(&self) -> &CallNegotiator {
        &self.negotiator
    }

    /// Register handlers for every call frame kind on `channel`.
    pub fn attach(&self, channel: &TransportChannel) {
        for kind in FrameKind::CALL_KINDS {
            let router = self.clone();
            channel.register_handler(kind, move |frame| router.route(frame.clone()));
        }
    }

    /// Queue `frame` behind earlier frames of the same call. Must be called
    /// from within a Tokio runtime.
    pub fn route(&self, frame: Frame) -> HandlerResult {
        let call_id = frame
            .call_id()
            .cloned()
            .ok_or_else(|| format!("{} frame does not belong to a call", frame.kind()))?;
        let mut queues = self
            .queues
            .lock()
            .map_err(|_| "call queue registry poisoned")?;
        let frame = match queues.get(&call_id) {
            Some(queue) => match queue.send(frame) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(frame)) => frame,
            },
            None => frame,
        };
        let (queue, rx) = mpsc::unbounded_channel();
        // Fresh queue; the receiver is alive so this cannot fail.
        let _ = queue.send(frame);
        queues.insert(call_id.clone(), queue);
        drop(queues);

        debug!(call_id = %call_id, "opening call queue");
        // Subscribe before the first frame is handled so no terminal
        // transition can slip past the task.
        let events = self.negotiator.subscribe();
        tokio::spawn(serve(
            self.negotiator.clone(),
            Arc::clone(&self.queues),
            call_id,
            rx,
            events,
        ));
        Ok(())
    }

    /// Calls with a queue still open.
    pub fn open_queues(&self) -> usize {
        self.queues.lock().map(|q| q.len()).unwrap_or(0)
    }
}

async fn serve(
    negotiator: CallNegotiator,
    queues: Queues,
    call_id: CallId,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    mut events: broadcast::Receiver<CallEvent>,
) {
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                deliver(&negotiator, frame).await;
                if is_finished(&negotiator, &call_id).await {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(CallEvent::StateChanged { call_id: id, state, .. })
                    if id == call_id && state.is_terminal() => break,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(call_id = %call_id, skipped, "call events lagged");
                    if is_finished(&negotiator, &call_id).await {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    if let Ok(mut queues) = queues.lock() {
        queues.remove(&call_id);
    }
    rx.close();
    while let Some(frame) = rx.recv().await {
        deliver(&negotiator, frame).await;
    }
    debug!(call_id = %call_id, "call queue closed");
}

async fn is_finished(negotiator: &CallNegotiator, call_id: &CallId) -> bool {
    negotiator
        .state(call_id)
        .await
        .map_or(true, |state| state.is_terminal())
}

async fn deliver(negotiator: &CallNegotiator, frame: Frame) {
    let kind = frame.kind();
    let result = match frame {
        Frame::IncomingCall(incoming) => negotiator.accept_call(incoming).await,
        Frame::CallPublicKey(message) => negotiator.on_public_keys(message).await,
        Frame::CallCiphertext(message) => negotiator.on_ciphertext(message).await,
        Frame::CallConfirmed(message) => negotiator.on_confirmation(message).await,
        Frame::CallEnded(ended) => {
            negotiator.on_remote_end(ended).await;
            Ok(())
        }
        other => {
            debug!(kind = %other.kind(), "not a handshake frame");
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!(%kind, error = %e, "call frame rejected");
    }
}
