use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use herald_core::{CoreError, CorrelationId, EventId};
use herald_events::{Category, Event, EventName, Priority};
use herald_infra::{DlqFilter, DlqReasonKind, DlqRecord};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct PublishEventRequest {
    /// Producer-assigned id; generated when absent.
    pub id: Option<String>,
    pub name: String,
    pub source: String,
    pub category: Category,
    pub priority: Option<Priority>,
    /// Defaults to the event id.
    pub correlation_id: Option<String>,
    #[serde(default = "empty_object")]
    pub payload: JsonValue,
}

fn empty_object() -> JsonValue {
    json!({})
}

impl PublishEventRequest {
    pub fn into_event(self) -> Result<Event, CoreError> {
        let name = EventName::new(self.name)?;
        let id = match self.id {
            Some(id) => EventId::new(id)?,
            None => EventId::generate(),
        };
        let correlation_id = match self.correlation_id {
            Some(c) => CorrelationId::new(c)?,
            None => CorrelationId::new(id.as_str())?,
        };

        Ok(Event::new(
            name,
            self.source,
            self.category,
            self.priority.unwrap_or(Priority::Normal),
            correlation_id,
            self.payload,
        )
        .with_id(id))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DlqQuery {
    pub reason: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl DlqQuery {
    pub fn into_filter(self) -> Result<DlqFilter, CoreError> {
        let reason = self
            .reason
            .as_deref()
            .map(str::parse::<DlqReasonKind>)
            .transpose()?;
        Ok(DlqFilter {
            reason,
            since: self.since,
            until: self.until,
            limit: self.limit,
        })
    }
}

// -------------------------
// Response mapping
// -------------------------

/// Listing view: everything except the payload and failure history.
pub fn dlq_summary_to_json(record: &DlqRecord) -> JsonValue {
    json!({
        "event_id": record.event_id,
        "name": record.event.name(),
        "source": record.event.source(),
        "reason": record.reason,
        "last_failure": record.last_failure,
        "attempts": record.attempts,
        "replays": record.event.replays(),
        "failed_at": record.failed_at,
    })
}
