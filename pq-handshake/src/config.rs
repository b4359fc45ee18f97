//! Configuration for call negotiation

use std::time::Duration;

use crate::error::{HandshakeError, Result};

/// Configuration for a [`CallNegotiator`](crate::CallNegotiator)
#[derive(Clone, Debug)]
pub struct NegotiatorConfig {
    /// How long a session may wait on the peer (and each signaling request
    /// may take) before the call fails
    pub signaling_timeout: Duration,

    /// Number of ended/failed call ids remembered so repeated `end_call`
    /// stays a no-op
    pub tombstone_capacity: usize,

    /// Capacity of the `CallEvent` broadcast channel
    pub event_capacity: usize,

    /// Whether to log detailed handshake information
    pub verbose_logging: bool,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            signaling_timeout: Duration::from_secs(30),
            tombstone_capacity: 256,
            event_capacity: 64,
            verbose_logging: false,
        }
    }
}

impl NegotiatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signaling timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.signaling_timeout = timeout;
        self
    }

    /// Enable verbose logging
    pub fn with_verbose_logging(mut self) -> Self {
        self.verbose_logging = true;
        self
    }
}

/// Builder for NegotiatorConfig
pub struct NegotiatorConfigBuilder {
    signaling_timeout: Duration,
    tombstone_capacity: usize,
    event_capacity: usize,
    verbose_logging: bool,
}

impl Default for NegotiatorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NegotiatorConfigBuilder {
    pub fn new() -> Self {
        let defaults = NegotiatorConfig::default();
        Self {
            signaling_timeout: defaults.signaling_timeout,
            tombstone_capacity: defaults.tombstone_capacity,
            event_capacity: defaults.event_capacity,
            verbose_logging: defaults.verbose_logging,
        }
    }

    pub fn signaling_timeout(mut self, timeout: Duration) -> Self {
        self.signaling_timeout = timeout;
        self
    }

    pub fn tombstone_capacity(mut self, capacity: usize) -> Self {
        self.tombstone_capacity = capacity;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn verbose(mut self) -> Self {
        self.verbose_logging = true;
        self
    }

    pub fn build(self) -> Result<NegotiatorConfig> {
        if self.signaling_timeout.is_zero() {
            return Err(HandshakeError::InvalidConfig(
                "signaling timeout must be non-zero".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(HandshakeError::InvalidConfig(
                "event capacity must be non-zero".into(),
            ));
        }

        Ok(NegotiatorConfig {
            signaling_timeout: self.signaling_timeout,
            tombstone_capacity: self.tombstone_capacity,
            event_capacity: self.event_capacity,
            verbose_logging: self.verbose_logging,
        })
    }
}
