//! Error taxonomy for the connection supervisor and the forward decisions.
//!
//! Supervisor errors are recovered by reconnecting, except
//! [`SupervisorError::RetryExhausted`]. Decision errors never escalate: each
//! one ends in a `reject` of the forward it belongs to.

use thiserror::Error;

use crate::primitives::Msat;

/// Errors that end one connection attempt (or the supervisor itself).
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A mandatory setting was missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The node could not be reached or refused our credentials.
    #[error("connection error: {0}")]
    Connection(String),

    /// The forward request subscription failed or ended.
    #[error("stream error: {0}")]
    Stream(String),

    /// Too many consecutive failures; the supervisor stopped for good.
    #[error("retries exhausted after {attempts} consecutive failures")]
    RetryExhausted { attempts: u32 },
}

/// Why a ghost forward was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    /// The node could not sign the payment hash.
    #[error("signing the payment hash failed: {0}")]
    SigningFailed(String),

    /// The authorization service returned no usable record.
    #[error("no authorization record")]
    AuthorizationAbsent,

    /// The forward carries less than the authorized amount.
    #[error("forwarded {received} is below the authorized {expected}")]
    Underpayment { expected: Msat, received: Msat },

    /// The record had no preimage, or one that does not match the hash.
    #[error("authorization record has no usable preimage")]
    MissingPreimage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supervisor_error_messages() {
        assert_eq!(
            SupervisorError::Configuration("LND_NODE_SOCKET is not set".into()).to_string(),
            "configuration error: LND_NODE_SOCKET is not set"
        );
        assert_eq!(
            SupervisorError::RetryExhausted { attempts: 6 }.to_string(),
            "retries exhausted after 6 consecutive failures"
        );
    }

    #[test]
    fn test_underpayment_message() {
        let reason = RejectReason::Underpayment {
            expected: Msat(6000),
            received: Msat(5000),
        };
        assert_eq!(
            reason.to_string(),
            "forwarded 5000_msat is below the authorized 6000_msat"
        );
    }
}
