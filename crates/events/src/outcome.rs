//! Per-event delivery outcomes reported by downstream handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The handler call exceeded its lane's timeout.
    Timeout,
    /// The handler reported a failure that may succeed later.
    Transient(String),
    /// The handler rejected the event; retrying cannot change the outcome.
    Permanent(String),
    /// The handler raised instead of returning per-event results.
    Crashed(String),
    /// The handler returned results but none for this event.
    MissingResult,
}

impl FailureReason {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn crashed(msg: impl Into<String>) -> Self {
        Self::Crashed(msg.into())
    }

    /// Failures caused by the environment rather than by the event itself.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureReason::Timeout | FailureReason::Transient(_) | FailureReason::Crashed(_)
        )
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, FailureReason::Permanent(_))
    }

    /// Stable short code used in logs and telemetry.
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::Transient(_) => "transient",
            FailureReason::Permanent(_) => "permanent",
            FailureReason::Crashed(_) => "crashed",
            FailureReason::MissingResult => "missing_result",
        }
    }
}

impl core::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FailureReason::Timeout => f.write_str("timeout"),
            FailureReason::Transient(msg) => write!(f, "transient: {msg}"),
            FailureReason::Permanent(msg) => write!(f, "permanent: {msg}"),
            FailureReason::Crashed(msg) => write!(f, "crashed: {msg}"),
            FailureReason::MissingResult => f.write_str("missing_result"),
        }
    }
}

/// Result for one event of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryResult {
    Success,
    Failure { reason: FailureReason },
}

impl DeliveryResult {
    pub fn failure(reason: FailureReason) -> Self {
        Self::Failure { reason }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryResult::Success)
    }
}

/// Record of one failed attempt, kept on the event across retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub attempt: u32,
    pub reason: FailureReason,
    pub failed_at: DateTime<Utc>,
}
