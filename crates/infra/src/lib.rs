//! Infrastructure layer: stores, retry policy, telemetry, configuration and
//! the delivery pipeline itself.
//!
//! Every store is a trait with an in-memory adapter (tests, single node) and
//! a durable one (Postgres for staging and dead letters, Redis for
//! idempotency behind the `redis` feature).

pub mod config;
pub mod dlq;
pub mod error;
pub mod idempotency;
pub mod pipeline;
pub mod retry;
pub mod staging;
pub mod telemetry;


pub use config::{ConfigError, PipelineConfig};
pub use dlq::{
    DlqFilter, DlqReason, DlqReasonKind, DlqRecord, DlqRouter, DlqStats, DlqStore, DlqSweeper,
    InMemoryDlqStore, PostgresDlqStore, ReplayReceipt,
};
pub use error::StoreError;
pub use idempotency::{
    DedupDecision, DedupFailurePolicy, IdempotencyGuard, IdempotencyKey, IdempotencyStore,
    InMemoryIdempotencyStore,
};
#[cfg(feature = "redis")]
pub use idempotency::RedisIdempotencyStore;
pub use pipeline::{
    DownstreamHandler, HandlerError, Pipeline, PipelineBuilder, PipelineError, PipelineHandle,
    PipelineStats, ShutdownReport,
};
pub use retry::{Backoff, BackoffConfig, BackoffStrategy, RetryBudget, RetryBudgetTable};
pub use staging::{Claim, ClaimToken, ClaimedEvent, InMemoryStagingStore, PostgresStagingStore, StagingStats, StagingStore};
pub use telemetry::{Signal, Telemetry, TelemetrySink, TracingSink};

/// Convert a std duration for `DateTime` arithmetic, saturating at 100 years.
pub(crate) fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    const MAX: std::time::Duration = std::time::Duration::from_secs(100 * 365 * 24 * 3600);
    chrono::Duration::from_std(d.min(MAX)).unwrap_or_else(|_| chrono::Duration::zero())
}
