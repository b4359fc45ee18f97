//! Exponential-backoff recovery for involuntarily closed channels.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::channel::{ConnectionState, LinkEvent, TransportChannel};
use crate::error::{NetworkError, Result};

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub ceiling: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            ceiling: DEFAULT_BACKOFF_CEILING,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Progress through one recovery: attempts already made and the wait
/// before the next one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffState {
    pub attempts: u32,
    pub delay: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration, next: BackoffState },
    Exhausted,
}

impl BackoffPolicy {
    pub fn initial(&self) -> BackoffState {
        BackoffState {
            attempts: 0,
            delay: self.base.min(self.ceiling),
        }
    }

    /// Decide whether another attempt is allowed from `state`. The delay
    /// doubles per attempt and never exceeds the ceiling.
    pub fn next(&self, state: BackoffState) -> RetryDecision {
        if state.attempts >= self.max_attempts {
            return RetryDecision::Exhausted;
        }
        RetryDecision::Retry {
            after: state.delay,
            next: BackoffState {
                attempts: state.attempts + 1,
                delay: state.delay.saturating_mul(2).min(self.ceiling),
            },
        }
    }

    /// The full wait schedule, mostly useful for logging.
    pub fn schedule(&self) -> Vec<Duration> {
        let mut delays = Vec::with_capacity(self.max_attempts as usize);
        let mut state = self.initial();
        while let RetryDecision::Retry { after, next } = self.next(state) {
            delays.push(after);
            state = next;
        }
        delays
    }
}

/// Watches a channel for involuntary closes and reopens it.
pub struct ReconnectionSupervisor {
    channel: TransportChannel,
    policy: BackoffPolicy,
}

/// Running supervisor task. Dropping the handle stops supervision.
pub struct SupervisorHandle {
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ReconnectionSupervisor {
    pub fn new(channel: TransportChannel) -> Self {
        let policy = channel.config().backoff;
        Self { channel, policy }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Start supervising. A channel accepts a single supervisor.
    pub fn spawn(self) -> Result<SupervisorHandle> {
        let events = self
            .channel
            .take_link_events()
            .ok_or(NetworkError::SupervisorAttached)?;
        let task = tokio::spawn(async move {
            let mut events = events;
            while let Some(LinkEvent::Lost { generation, reason }) = events.recv().await {
                warn!(identity = %self.channel.identity(), %reason, "connection lost, recovering");
                self.recover(generation).await;
            }
        });
        Ok(SupervisorHandle { task })
    }

    async fn recover(&self, generation: u64) {
        let channel = &self.channel;
        let mut cancelled = channel.subscribe_generation();
        if !channel.set_state_for(generation, ConnectionState::Reconnecting) {
            info!(generation, current = channel.generation(), "stale link loss, not recovering");
            return;
        }
        let mut state = self.policy.initial();
        channel.record_backoff(state);

        loop {
            let (after, next) = match self.policy.next(state) {
                RetryDecision::Retry { after, next } => (after, next),
                RetryDecision::Exhausted => {
                    channel.fail(generation, state.attempts);
                    return;
                }
            };

            tokio::select! {
                _ = sleep(after) => {}
                _ = cancelled.wait_for(|g| *g != generation) => {
                    info!("reconnection cancelled");
                    return;
                }
            }

            state = next;
            channel.record_backoff(state);
            info!(attempt = state.attempts, max = self.policy.max_attempts, ?after, "reconnecting");
            match channel.reconnect(generation).await {
                Ok(()) => {
                    info!(attempts = state.attempts, "reconnected");
                    return;
                }
                Err(NetworkError::Closed) if channel.generation() != generation => return,
                Err(e) => warn!(attempt = state.attempts, error = %e, "reconnection attempt failed"),
            }
        }
    }
}
