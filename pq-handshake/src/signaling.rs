//! Signaling collaborator: request/response endpoints that carry handshake
//! steps to the peer.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::SignalingError;
use crate::types::{
    CallId, CallState, CallType, CiphertextMessage, ConfirmationMessage, InitiateRequest,
    InitiateResponse, PublicKeyMessage,
};

type Result<T> = std::result::Result<T, SignalingError>;

/// One method per signaling endpoint.
#[async_trait]
pub trait Signaling: Send + Sync {
    /// `POST /calls/initiate`
    async fn initiate(&self, contact_id: &str, call_type: CallType) -> Result<InitiateResponse>;

    /// `PUT /calls/{id}/public_key`
    async fn publish_public_key(&self, message: &PublicKeyMessage) -> Result<()>;

    /// `PUT /calls/{id}/ciphertext`
    async fn publish_ciphertext(&self, message: &CiphertextMessage) -> Result<()>;

    /// `PUT /calls/{id}/confirm`
    async fn publish_confirmation(&self, message: &ConfirmationMessage) -> Result<()>;

    /// `POST /calls/{id}/end`, idempotent on the server
    async fn end(&self, call_id: &CallId) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct HttpSignalingConfig {
    /// API root, e.g. `https://qumail.example/api`
    pub base_url: String,
    /// Bearer token of the authenticated user
    pub token: Option<String>,
    pub request_timeout: Duration,
}

impl Default for HttpSignalingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001/api".to_string(),
            token: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl HttpSignalingConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// JSON-over-HTTP signaling client
pub struct HttpSignaling {
    client: reqwest::Client,
    config: HttpSignalingConfig,
}

impl HttpSignaling {
    pub fn new(config: HttpSignalingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<Response> {
        let response = self.request(method, path).json(body).send().await?;
        check_status(response).await
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SignalingError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl Signaling for HttpSignaling {
    async fn initiate(&self, contact_id: &str, call_type: CallType) -> Result<InitiateResponse> {
        let body = InitiateRequest {
            contact_id: contact_id.to_string(),
            call_type,
        };
        let response = self
            .send_json(Method::POST, "calls/initiate", &body)
            .await?;
        Ok(response.json::<InitiateResponse>().await?)
    }

    async fn publish_public_key(&self, message: &PublicKeyMessage) -> Result<()> {
        let path = format!("calls/{}/public_key", message.call_id);
        self.send_json(Method::PUT, &path, message).await?;
        Ok(())
    }

    async fn publish_ciphertext(&self, message: &CiphertextMessage) -> Result<()> {
        let path = format!("calls/{}/ciphertext", message.call_id);
        self.send_json(Method::PUT, &path, message).await?;
        Ok(())
    }

    async fn publish_confirmation(&self, message: &ConfirmationMessage) -> Result<()> {
        let path = format!("calls/{}/confirm", message.call_id);
        self.send_json(Method::PUT, &path, message).await?;
        Ok(())
    }

    async fn end(&self, call_id: &CallId) -> Result<()> {
        let response = self
            .request(Method::POST, &format!("calls/{call_id}/end"))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignalingStep {
    Initiate,
    PublicKey,
    Ciphertext,
    Confirmation,
    End,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalingRecord {
    Initiate(InitiateRequest),
    PublicKey(PublicKeyMessage),
    Ciphertext(CiphertextMessage),
    Confirmation(ConfirmationMessage),
    End(CallId),
}

impl SignalingRecord {
    pub fn step(&self) -> SignalingStep {
        match self {
            SignalingRecord::Initiate(_) => SignalingStep::Initiate,
            SignalingRecord::PublicKey(_) => SignalingStep::PublicKey,
            SignalingRecord::Ciphertext(_) => SignalingStep::Ciphertext,
            SignalingRecord::Confirmation(_) => SignalingStep::Confirmation,
            SignalingRecord::End(_) => SignalingStep::End,
        }
    }
}

/// In-memory signaling that records every request.
///
/// Requests can be forwarded to a channel so a test can play the server and
/// relay them to the other party. Individual steps can be made to fail or to
/// never complete.
#[derive(Default)]
pub struct RecordingSignaling {
    records: Mutex<Vec<SignalingRecord>>,
    call_ids: Mutex<VecDeque<CallId>>,
    next_id: AtomicU64,
    failing: Mutex<HashSet<SignalingStep>>,
    stalled: Mutex<HashSet<SignalingStep>>,
    forward: Option<mpsc::UnboundedSender<SignalingRecord>>,
}

impl RecordingSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_forwarder(forward: mpsc::UnboundedSender<SignalingRecord>) -> Self {
        Self {
            forward: Some(forward),
            ..Self::default()
        }
    }

    /// Queue a call id to hand out on the next `initiate`.
    pub fn push_call_id(&self, call_id: impl Into<CallId>) {
        lock(&self.call_ids).push_back(call_id.into());
    }

    pub fn fail_step(&self, step: SignalingStep) {
        lock(&self.failing).insert(step);
    }

    pub fn stall_step(&self, step: SignalingStep) {
        lock(&self.stalled).insert(step);
    }

    pub fn clear_faults(&self) {
        lock(&self.failing).clear();
        lock(&self.stalled).clear();
    }

    pub fn records(&self) -> Vec<SignalingRecord> {
        lock(&self.records).clone()
    }

    pub fn count(&self, step: SignalingStep) -> usize {
        lock(&self.records)
            .iter()
            .filter(|r| r.step() == step)
            .count()
    }

    async fn record(&self, record: SignalingRecord) -> Result<()> {
        let step = record.step();
        let stalled = lock(&self.stalled).contains(&step);
        if stalled {
            std::future::pending::<()>().await;
        }
        let failing = lock(&self.failing).contains(&step);
        if failing {
            return Err(SignalingError::Rejected(format!("{step:?} rejected")));
        }
        lock(&self.records).push(record.clone());
        if let Some(tx) = &self.forward {
            let _ = tx.send(record);
        }
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Signaling for RecordingSignaling {
    async fn initiate(&self, contact_id: &str, call_type: CallType) -> Result<InitiateResponse> {
        self.record(SignalingRecord::Initiate(InitiateRequest {
            contact_id: contact_id.to_string(),
            call_type,
        }))
        .await?;
        let call_id = lock(&self.call_ids).pop_front().unwrap_or_else(|| {
            let n = self.next_id.fetch_add(1, Ordering::Relaxed);
            CallId::new(format!("call_{n:016x}"))
        });
        Ok(InitiateResponse {
            call_id,
            state: CallState::Initiated,
        })
    }

    async fn publish_public_key(&self, message: &PublicKeyMessage) -> Result<()> {
        self.record(SignalingRecord::PublicKey(message.clone())).await
    }

    async fn publish_ciphertext(&self, message: &CiphertextMessage) -> Result<()> {
        self.record(SignalingRecord::Ciphertext(message.clone())).await
    }

    async fn publish_confirmation(&self, message: &ConfirmationMessage) -> Result<()> {
        self.record(SignalingRecord::Confirmation(message.clone())).await
    }

    async fn end(&self, call_id: &CallId) -> Result<()> {
        self.record(SignalingRecord::End(call_id.clone())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_hands_out_queued_ids() {
        let signaling = RecordingSignaling::new();
        signaling.push_call_id("call-fixed");
        let first = signaling.initiate("bob", CallType::Audio).await.unwrap();
        assert_eq!(first.call_id.as_str(), "call-fixed");
        assert_eq!(first.state, CallState::Initiated);
        let second = signaling.initiate("bob", CallType::Video).await.unwrap();
        assert!(second.call_id.as_str().starts_with("call_"));
        assert_eq!(signaling.count(SignalingStep::Initiate), 2);
    }

    #[tokio::test]
    async fn test_failing_step_is_not_recorded() {
        let signaling = RecordingSignaling::new();
        signaling.fail_step(SignalingStep::End);
        assert!(matches!(
            signaling.end(&"c1".into()).await,
            Err(SignalingError::Rejected(_))
        ));
        assert_eq!(signaling.count(SignalingStep::End), 0);
        signaling.clear_faults();
        signaling.end(&"c1".into()).await.unwrap();
        assert_eq!(signaling.records(), vec![SignalingRecord::End("c1".into())]);
    }

    #[tokio::test]
    async fn test_forwarder_receives_records() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let signaling = RecordingSignaling::with_forwarder(tx);
        signaling.end(&"c9".into()).await.unwrap();
        assert_eq!(rx.recv().await, Some(SignalingRecord::End("c9".into())));
    }

    #[test]
    fn test_http_url_join() {
        let http = HttpSignaling::new(HttpSignalingConfig::new("http://localhost:8001/api/"))
            .unwrap();
        assert_eq!(
            http.url("calls/initiate"),
            "http://localhost:8001/api/calls/initiate"
        );
    }
}
