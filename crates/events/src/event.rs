use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use herald_core::{CorrelationId, EventId};

use crate::lane::Lane;
use crate::name::EventName;
use crate::outcome::{AttemptFailure, FailureReason};

/// Longest accepted `source` identifier.
pub const MAX_SOURCE_LEN: usize = 128;

/// Largest accepted serialized payload, in bytes.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Tolerated clock skew for `created_at` values coming from producers.
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Broad event family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    System,
    Domain,
    Integration,
    User,
    Error,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::System => "system",
            Category::Domain => "domain",
            Category::Integration => "integration",
            Category::User => "user",
            Category::Error => "error",
        }
    }
}

/// Delivery priority. `High` and `Critical` take the fast lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

/// Structural problems that make an event undeliverable.
///
/// Retrying cannot fix any of these, so the processor dead-letters such
/// events immediately.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("source is empty")]
    EmptySource,
    #[error("source exceeds {MAX_SOURCE_LEN} characters")]
    SourceTooLong,
    #[error("payload must be a JSON object or array")]
    PayloadNotStructured,
    #[error("payload exceeds {MAX_PAYLOAD_BYTES} bytes ({0} bytes)")]
    PayloadTooLarge(usize),
    #[error("attempt must start at 1 (found {0})")]
    InvalidAttempt(u32),
    #[error("created_at {0} is in the future")]
    CreatedInFuture(DateTime<Utc>),
}

/// The unit of work moved through the pipeline.
///
/// Identity, taxonomy and payload are fixed at creation. Only the retry
/// bookkeeping (`attempt`, `failures`) changes, and only through
/// [`Event::record_failure`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    name: EventName,
    source: String,
    category: Category,
    #[serde(default)]
    priority: Priority,
    correlation_id: CorrelationId,
    #[serde(default)]
    payload: JsonValue,
    attempt: u32,
    created_at: DateTime<Utc>,

    /// Set when this event was re-published from a dead-letter record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    replay_of: Option<EventId>,
    /// How many dead-letter replays led to this event.
    #[serde(default)]
    replays: u32,
    /// Failures observed on earlier attempts, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    failures: Vec<AttemptFailure>,
}

impl Event {
    /// Create a new event with a generated id, `attempt = 1` and `created_at = now`.
    pub fn new(
        name: EventName,
        source: impl Into<String>,
        category: Category,
        priority: Priority,
        correlation_id: CorrelationId,
        payload: JsonValue,
    ) -> Self {
        Self {
            id: EventId::generate(),
            name,
            source: source.into(),
            category,
            priority,
            correlation_id,
            payload,
            attempt: 1,
            created_at: Utc::now(),
            replay_of: None,
            replays: 0,
            failures: Vec::new(),
        }
    }

    /// Use a producer-assigned id instead of a generated one.
    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn name(&self) -> &EventName {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn replay_of(&self) -> Option<&EventId> {
        self.replay_of.as_ref()
    }

    pub fn replays(&self) -> u32 {
        self.replays
    }

    pub fn failures(&self) -> &[AttemptFailure] {
        &self.failures
    }

    pub fn last_failure(&self) -> Option<&AttemptFailure> {
        self.failures.last()
    }

    /// Lane this event is routed to.
    pub fn lane(&self) -> Lane {
        Lane::for_priority(self.priority)
    }

    /// Record a failed attempt without moving to the next one.
    ///
    /// Used for terminal dispositions where the history must be kept but no
    /// further attempt will happen.
    pub fn record_failure(&mut self, reason: FailureReason, failed_at: DateTime<Utc>) {
        self.failures.push(AttemptFailure {
            attempt: self.attempt,
            reason,
            failed_at,
        });
    }

    /// Record a failed attempt and advance to the next one.
    pub fn advance_attempt(&mut self, reason: FailureReason, failed_at: DateTime<Utc>) {
        self.record_failure(reason, failed_at);
        self.attempt = self.attempt.saturating_add(1);
    }

    /// Build the fresh event published when a dead-letter record is replayed.
    ///
    /// The replay gets a new id, `attempt = 1` and an empty failure history;
    /// taxonomy, correlation and payload are carried over unchanged.
    pub fn replayed(&self) -> Self {
        Self {
            id: EventId::generate(),
            name: self.name.clone(),
            source: self.source.clone(),
            category: self.category,
            priority: self.priority,
            correlation_id: self.correlation_id.clone(),
            payload: self.payload.clone(),
            attempt: 1,
            created_at: Utc::now(),
            replay_of: Some(self.id.clone()),
            replays: self.replays.saturating_add(1),
            failures: Vec::new(),
        }
    }

    /// Schema validation applied by the processor before anything else.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_at(Utc::now())
    }

    pub fn validate_at(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        if self.source.trim().is_empty() {
            return Err(ValidationError::EmptySource);
        }
        if self.source.len() > MAX_SOURCE_LEN {
            return Err(ValidationError::SourceTooLong);
        }
        if !(self.payload.is_object() || self.payload.is_array()) {
            return Err(ValidationError::PayloadNotStructured);
        }
        let size = serde_json::to_vec(&self.payload)
            .map(|bytes| bytes.len())
            .unwrap_or(usize::MAX);
        if size > MAX_PAYLOAD_BYTES {
            return Err(ValidationError::PayloadTooLarge(size));
        }
        if self.attempt == 0 {
            return Err(ValidationError::InvalidAttempt(self.attempt));
        }
        if self.created_at > now + Duration::seconds(MAX_CLOCK_SKEW_SECS) {
            return Err(ValidationError::CreatedInFuture(self.created_at));
        }
        Ok(())
    }
}
