//! Dotted event taxonomy (`domain.component.action`).

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use herald_core::CoreError;

/// Validated dotted event name, e.g. `ml.run.started`.
///
/// A name has at least two segments; each segment is non-empty and made of
/// `[a-z0-9_]`. Retry budgets and lane heuristics match on whole segments,
/// so `ml.run` is a prefix of `ml.run.started` but not of `ml.runner.started`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventName(String);

impl EventName {
    pub fn new(value: impl Into<String>) -> Result<Self, CoreError> {
        let value = value.into();
        let segments: Vec<&str> = value.split('.').collect();
        if segments.len() < 2 {
            return Err(CoreError::validation(format!(
                "event name '{value}' must have at least two dot-separated segments"
            )));
        }
        for segment in &segments {
            if segment.is_empty() {
                return Err(CoreError::validation(format!(
                    "event name '{value}' contains an empty segment"
                )));
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            {
                return Err(CoreError::validation(format!(
                    "event name segment '{segment}' must match [a-z0-9_]+"
                )));
            }
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first segment (`ml` for `ml.run.started`).
    pub fn domain(&self) -> &str {
        self.segments().next().unwrap_or_default()
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Segment-boundary prefix match.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        if prefix.is_empty() {
            return true;
        }
        match self.0.strip_prefix(prefix) {
            Some("") => true,
            Some(rest) => rest.starts_with('.'),
            None => false,
        }
    }
}

impl core::fmt::Display for EventName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EventName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EventName> for String {
    fn from(value: EventName) -> Self {
        value.0
    }
}

impl FromStr for EventName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}
