//! Strongly-typed identifiers used across the pipeline.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Longest identifier accepted by the string-backed id types.
pub const MAX_ID_LEN: usize = 128;

/// Identifier of an event, assigned by the producer and never changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventId(String);

/// Groups causally related events; half of the idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CorrelationId(String);

/// Name of a pipeline instance that owns claims in the staging store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerId(String);

/// Identifier of one staged publication of an event.
///
/// Publishing the same [`EventId`] twice yields two deliveries; the
/// idempotency guard decides which one reaches the downstream handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(Uuid);

fn validate_id(kind: &str, value: &str) -> Result<(), CoreError> {
    if value.is_empty() {
        return Err(CoreError::invalid_id(format!("{kind} cannot be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(CoreError::invalid_id(format!(
            "{kind} exceeds {MAX_ID_LEN} characters"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(CoreError::invalid_id(format!(
            "{kind} contains invalid characters (allowed: a-z, A-Z, 0-9, '-', '_', '.', ':')"
        )));
    }
    Ok(())
}

macro_rules! impl_string_id {
    ($t:ident, $name:literal) => {
        impl $t {
            /// Build a validated identifier.
            pub fn new(value: impl Into<String>) -> Result<Self, CoreError> {
                let value = value.into().trim().to_string();
                validate_id($name, &value)?;
                Ok(Self(value))
            }

            /// Generate a fresh identifier (UUIDv7, time-ordered).
            pub fn generate() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $t {
            type Error = CoreError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_string_id!(EventId, "EventId");
impl_string_id!(CorrelationId, "CorrelationId");
impl_string_id!(WorkerId, "WorkerId");

impl DeliveryId {
    /// Create a new delivery identifier (UUIDv7).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for DeliveryId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for DeliveryId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|e| CoreError::invalid_id(format!("DeliveryId: {e}")))?;
        Ok(Self(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_ids_are_trimmed_and_validated() {
        let id = EventId::new("  evt-1 ").unwrap();
        assert_eq!(id.as_str(), "evt-1");

        assert!(EventId::new("").is_err());
        assert!(CorrelationId::new("has space").is_err());
        assert!(WorkerId::new("x".repeat(MAX_ID_LEN + 1)).is_err());
        assert!(CorrelationId::new("corr:42.a_b-c").is_ok());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(EventId::generate(), EventId::generate());
        assert_ne!(DeliveryId::new(), DeliveryId::new());
    }

    #[test]
    fn deserialization_rejects_invalid_ids() {
        let ok: EventId = serde_json::from_str("\"evt-1\"").unwrap();
        assert_eq!(ok.as_str(), "evt-1");

        let bad: Result<EventId, _> = serde_json::from_str("\"bad id\"");
        assert!(bad.is_err());
    }

    #[test]
    fn delivery_id_round_trips_through_display() {
        let id = DeliveryId::new();
        let parsed: DeliveryId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
