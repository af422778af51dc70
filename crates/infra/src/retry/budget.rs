//! Retry budgets resolved from event names.
//!
//! The table is built once at start-up and has no mutation API: changing a
//! budget means changing configuration and restarting, which keeps the retry
//! behaviour of a running process auditable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use herald_events::EventName;

use super::backoff::BackoffStrategy;

/// How many attempts an event gets and how the delay between them grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
}

impl RetryBudget {
    pub const fn new(max_attempts: u32, strategy: BackoffStrategy) -> Self {
        Self {
            max_attempts,
            strategy,
        }
    }

    /// Whether an event that just failed `attempt` is out of budget.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(3, BackoffStrategy::Exponential)
    }
}

/// One `prefix -> budget` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetRule {
    pub prefix: String,
    #[serde(flatten)]
    pub budget: RetryBudget,
}

impl BudgetRule {
    pub fn new(prefix: impl Into<String>, budget: RetryBudget) -> Self {
        Self {
            prefix: prefix.into(),
            budget,
        }
    }

    fn specificity(&self) -> (usize, usize) {
        (self.prefix.split('.').count(), self.prefix.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetTableError {
    #[error("budget prefix '{0}' is malformed")]
    InvalidPrefix(String),
    #[error("budget prefix '{0}' is registered twice")]
    DuplicatePrefix(String),
    #[error("budget for '{0}' must allow at least one attempt")]
    ZeroAttempts(String),
}

/// Ordered rule list: most specific prefix first, then the default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryBudgetTable {
    rules: Vec<BudgetRule>,
    default: RetryBudget,
}

impl RetryBudgetTable {
    pub fn new(
        rules: impl IntoIterator<Item = BudgetRule>,
        default: RetryBudget,
    ) -> Result<Self, BudgetTableError> {
        if default.max_attempts == 0 {
            return Err(BudgetTableError::ZeroAttempts("default".to_string()));
        }

        let mut sorted: Vec<BudgetRule> = Vec::new();
        for rule in rules {
            validate_prefix(&rule.prefix)?;
            if rule.budget.max_attempts == 0 {
                return Err(BudgetTableError::ZeroAttempts(rule.prefix));
            }
            if sorted.iter().any(|r| r.prefix == rule.prefix) {
                return Err(BudgetTableError::DuplicatePrefix(rule.prefix));
            }
            sorted.push(rule);
        }

        // Deeper prefixes first; ties broken by length then name for a stable order.
        sorted.sort_by(|a, b| {
            b.specificity()
                .cmp(&a.specificity())
                .then_with(|| a.prefix.cmp(&b.prefix))
        });

        Ok(Self {
            rules: sorted,
            default,
        })
    }

    /// Table with no rules: every event gets `default`.
    pub fn with_default(default: RetryBudget) -> Self {
        Self {
            rules: Vec::new(),
            default,
        }
    }

    pub fn resolve(&self, name: &EventName) -> RetryBudget {
        self.rules
            .iter()
            .find(|rule| name.has_prefix(&rule.prefix))
            .map(|rule| rule.budget)
            .unwrap_or(self.default)
    }

    pub fn rules(&self) -> &[BudgetRule] {
        &self.rules
    }

    pub fn default_budget(&self) -> RetryBudget {
        self.default
    }
}

impl Default for RetryBudgetTable {
    fn default() -> Self {
        Self::with_default(RetryBudget::default())
    }
}

fn validate_prefix(prefix: &str) -> Result<(), BudgetTableError> {
    let valid = !prefix.is_empty()
        && prefix.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(BudgetTableError::InvalidPrefix(prefix.to_string()))
    }
}
