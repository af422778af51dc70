//! Turns a failed delivery into either a delayed re-enqueue or a dead letter.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use herald_events::{Event, FailureReason};

use super::backoff::Backoff;
use super::budget::RetryBudgetTable;
use crate::chrono_duration;
use crate::dlq::{DlqReason, DlqRouter};
use crate::error::StoreError;
use crate::staging::{Claim, StagingStore};
use crate::telemetry::{Signal, Telemetry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueued as `attempt`, claimable after `delay`.
    Scheduled { attempt: u32, delay: Duration },
    DeadLettered,
}

/// Applies the retry budget for a failed event.
///
/// The delay is enforced by the staging store's `not_before` marker; nothing
/// here sleeps.
#[derive(Clone)]
pub struct RetryScheduler {
    budgets: Arc<RetryBudgetTable>,
    backoff: Backoff,
    staging: Arc<dyn StagingStore>,
    router: DlqRouter,
    telemetry: Telemetry,
}

impl core::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl RetryScheduler {
    pub fn new(
        budgets: Arc<RetryBudgetTable>,
        backoff: Backoff,
        staging: Arc<dyn StagingStore>,
        router: DlqRouter,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            budgets,
            backoff,
            staging,
            router,
            telemetry,
        }
    }

    pub fn budgets(&self) -> &RetryBudgetTable {
        &self.budgets
    }

    /// Dispose of one failed attempt of `event`.
    ///
    /// Permanent failures and exhausted budgets are dead-lettered; everything
    /// else is reinserted with `attempt + 1`. On error the delivery is still
    /// claimed and untouched in staging.
    pub async fn schedule(
        &self,
        claim: Claim,
        mut event: Event,
        reason: FailureReason,
    ) -> Result<RetryDecision, StoreError> {
        let now = Utc::now();

        if let FailureReason::Permanent(detail) = &reason {
            let dlq_reason = DlqReason::Rejected(detail.clone());
            event.record_failure(reason, now);
            self.router.route(claim, event, dlq_reason).await?;
            return Ok(RetryDecision::DeadLettered);
        }

        let budget = self.budgets.resolve(event.name());
        if budget.is_exhausted(event.attempt()) {
            event.record_failure(reason, now);
            self.router
                .route(claim, event, DlqReason::MaxRetriesExceeded)
                .await?;
            return Ok(RetryDecision::DeadLettered);
        }

        let delay = match self.backoff.delay(event.attempt(), budget.strategy) {
            Ok(delay) => delay,
            Err(err) => {
                event.record_failure(reason, now);
                self.router
                    .route(claim, event, DlqReason::InvalidSchema(err.to_string()))
                    .await?;
                return Ok(RetryDecision::DeadLettered);
            }
        };

        event.advance_attempt(reason, now);
        let attempt = event.attempt();
        let event_id = event.id().clone();
        let not_before = now + chrono_duration(delay);
        self.staging.reinsert(claim, event, not_before).await?;

        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        debug!(event_id = %event_id, attempt, delay_ms, "retry scheduled");
        self.telemetry.emit(Signal::Retry {
            event_id,
            attempt,
            delay_ms,
        });
        Ok(RetryDecision::Scheduled { attempt, delay })
    }
}
