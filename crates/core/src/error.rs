//! Bridge error model.

use thiserror::Error;

use crate::id::JobKey;

/// Result type used across the bridge.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Classified bridge failure.
///
/// Every error crossing a loop boundary is one of these. The class decides what
/// happens next: a failed job (with decremented retries), a logged-and-skipped
/// message, or an engine incident.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// A required job variable is missing or malformed. No publish is attempted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The broker or the engine could not be reached (or rejected a single call).
    #[error("dependency unavailable: {0}")]
    Transient(String),

    /// A message crossed the broker boundary without a usable `requestId`.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The job ran out of retries; the engine raises an incident.
    #[error("retries exhausted for job {job_key}: {reason}")]
    RetriesExhausted { job_key: JobKey, reason: String },
}

impl BridgeError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn retries_exhausted(job_key: JobKey, reason: impl Into<String>) -> Self {
        Self::RetriesExhausted {
            job_key,
            reason: reason.into(),
        }
    }

    /// Short stable label for logs and metrics fields.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Validation(_) => "validation",
            BridgeError::Transient(_) => "transient",
            BridgeError::ProtocolViolation(_) => "protocol_violation",
            BridgeError::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}
