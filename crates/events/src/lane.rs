//! Priority-separated processing tracks.

use serde::{Deserialize, Serialize};

use crate::event::Priority;

/// A lane has its own buffers, batch channel and handler pool, so a backlog
/// in one lane never delays dispatch in the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// `high` and `critical` events: small batches, short windows.
    Fast,
    /// Everything else: larger batches for throughput.
    Standard,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::Fast, Lane::Standard];

    pub fn for_priority(priority: Priority) -> Self {
        match priority {
            Priority::High | Priority::Critical => Lane::Fast,
            Priority::Low | Priority::Normal => Lane::Standard,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Fast => "fast",
            Lane::Standard => "standard",
        }
    }
}

impl core::fmt::Display for Lane {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
