//! Security levels offered to chat and calls, and what each one draws from
//! the quantum key pool.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest message accepted at L1, where every payload bit consumes one key bit.
pub const OTP_MAX_PAYLOAD: usize = 50 * 1024;
/// Key bits drawn per message at L2.
pub const SEEDED_KEY_BITS: u64 = 256;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityLevel {
    /// One-time pad
    L1,
    /// Quantum-seeded symmetric encryption
    #[default]
    L2,
    /// Hybrid post-quantum handshake per call
    L3,
    /// Transport security only
    L4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyConsumption {
    Bits(u64),
    /// One fresh handshake-derived key per call session
    PerSession,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("payload of {size} bytes exceeds the {limit} byte limit for {level}")]
    PayloadTooLarge {
        level: SecurityLevel,
        size: usize,
        limit: usize,
    },
}

impl SecurityLevel {
    pub fn max_payload(self) -> Option<usize> {
        match self {
            SecurityLevel::L1 => Some(OTP_MAX_PAYLOAD),
            _ => None,
        }
    }

    /// Key material a payload of `payload_len` bytes consumes at this level.
    pub fn key_consumption(self, payload_len: usize) -> Result<KeyConsumption, PolicyError> {
        if let Some(limit) = self.max_payload() {
            if payload_len > limit {
                return Err(PolicyError::PayloadTooLarge {
                    level: self,
                    size: payload_len,
                    limit,
                });
            }
        }
        Ok(match self {
            SecurityLevel::L1 => KeyConsumption::Bits(payload_len as u64 * 8),
            SecurityLevel::L2 => KeyConsumption::Bits(SEEDED_KEY_BITS),
            SecurityLevel::L3 => KeyConsumption::PerSession,
            SecurityLevel::L4 => KeyConsumption::None,
        })
    }

    pub fn description(self) -> &'static str {
        match self {
            SecurityLevel::L1 => "quantum one-time pad",
            SecurityLevel::L2 => "quantum-seeded symmetric",
            SecurityLevel::L3 => "hybrid post-quantum",
            SecurityLevel::L4 => "transport only",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
