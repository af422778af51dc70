//! Retry math and scheduling.
//!
//! `backoff` and `budget` are pure; `scheduler` applies them to a failed
//! event and decides between re-enqueue and dead-lettering.

pub mod backoff;
pub mod budget;
pub mod scheduler;

pub use backoff::{Backoff, BackoffConfig, BackoffError, BackoffStrategy, apply_jitter};
pub use budget::{BudgetRule, BudgetTableError, RetryBudget, RetryBudgetTable};
pub use scheduler::{RetryDecision, RetryScheduler};
