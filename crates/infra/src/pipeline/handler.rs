//! Downstream handler contract and the guarded call around it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use herald_core::EventId;
use herald_events::{DeliveryResult, Event, FailureReason, Lane};

use crate::telemetry::BatchOutcome;

/// Per-event results returned by a handler, keyed by event id.
pub type BatchResults = HashMap<EventId, DeliveryResult>;

/// A handler failed as a whole instead of returning per-event results.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("handler returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid handler response: {0}")]
    InvalidResponse(String),
    #[error("{0}")]
    Other(String),
}

impl HandlerError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Business logic behind a lane.
///
/// Called once per batch. Must not assume events are unique by id across
/// batches; retries of the same event arrive with a higher `attempt`.
#[async_trait::async_trait]
pub trait DownstreamHandler: Send + Sync {
    async fn handle(&self, lane: Lane, batch: &[Event]) -> Result<BatchResults, HandlerError>;
}

#[async_trait::async_trait]
impl<H> DownstreamHandler for Arc<H>
where
    H: DownstreamHandler + ?Sized,
{
    async fn handle(&self, lane: Lane, batch: &[Event]) -> Result<BatchResults, HandlerError> {
        (**self).handle(lane, batch).await
    }
}

/// Handlers by lane, with an optional fallback for lanes without one.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    fast: Option<Arc<dyn DownstreamHandler>>,
    standard: Option<Arc<dyn DownstreamHandler>>,
    fallback: Option<Arc<dyn DownstreamHandler>>,
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("fast", &self.fast.is_some())
            .field("standard", &self.standard.is_some())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lane(mut self, lane: Lane, handler: Arc<dyn DownstreamHandler>) -> Self {
        match lane {
            Lane::Fast => self.fast = Some(handler),
            Lane::Standard => self.standard = Some(handler),
        }
        self
    }

    pub fn with_fallback(mut self, handler: Arc<dyn DownstreamHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn for_lane(&self, lane: Lane) -> Option<Arc<dyn DownstreamHandler>> {
        let specific = match lane {
            Lane::Fast => &self.fast,
            Lane::Standard => &self.standard,
        };
        specific.as_ref().or(self.fallback.as_ref()).cloned()
    }
}

/// What one guarded handler call produced, aligned with the input batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchExecution {
    pub results: Vec<DeliveryResult>,
    pub outcome: BatchOutcome,
}

/// Call `handler` once for `batch` under `timeout`.
///
/// The call runs in its own task so a panic is contained. Timeout fails every
/// event with `Timeout`; an error or panic fails every event with `Crashed`;
/// an event missing from the result map fails with `MissingResult`.
pub async fn execute_batch(
    handler: Arc<dyn DownstreamHandler>,
    lane: Lane,
    batch: Vec<Event>,
    timeout: Duration,
) -> BatchExecution {
    let ids: Vec<EventId> = batch.iter().map(|e| e.id().clone()).collect();
    let call = tokio::spawn(async move { handler.handle(lane, &batch).await });
    let abort = call.abort_handle();

    let all_failed = |reason: FailureReason| vec![DeliveryResult::failure(reason); ids.len()];

    match tokio::time::timeout(timeout, call).await {
        Err(_) => {
            abort.abort();
            warn!(lane = %lane, count = ids.len(), timeout_ms = timeout.as_millis() as u64, "handler timed out");
            BatchExecution {
                results: all_failed(FailureReason::Timeout),
                outcome: BatchOutcome::TimedOut,
            }
        }
        Ok(Err(join_err)) => {
            let msg = if join_err.is_panic() {
                "handler panicked".to_string()
            } else {
                format!("handler task failed: {join_err}")
            };
            warn!(lane = %lane, count = ids.len(), error = %msg, "handler crashed");
            BatchExecution {
                results: all_failed(FailureReason::crashed(msg)),
                outcome: BatchOutcome::Crashed,
            }
        }
        Ok(Ok(Err(err))) => {
            warn!(lane = %lane, count = ids.len(), error = %err, "handler failed the whole batch");
            BatchExecution {
                results: all_failed(FailureReason::crashed(err.to_string())),
                outcome: BatchOutcome::Crashed,
            }
        }
        Ok(Ok(Ok(by_id))) => {
            let results: Vec<DeliveryResult> = ids
                .iter()
                .map(|id| match by_id.get(id) {
                    Some(result) => result.clone(),
                    None => DeliveryResult::failure(FailureReason::MissingResult),
                })
                .collect();

            let ok = results.iter().filter(|r| r.is_success()).count();
            let outcome = if ok == results.len() {
                BatchOutcome::Delivered
            } else if ok == 0 {
                BatchOutcome::Failed
            } else {
                BatchOutcome::Partial
            };
            BatchExecution { results, outcome }
        }
    }
}
