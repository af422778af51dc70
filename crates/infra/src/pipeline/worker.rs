//! Handler worker pool for one lane.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info_span, warn, Instrument};

use herald_events::{DeliveryResult, Lane};

use super::dispatcher::LaneGauges;
use super::handler::{BatchExecution, HandlerRegistry, execute_batch};
use super::{Batch, PipelineCounters};
use crate::dlq::{DlqReason, DlqRouter};
use crate::retry::{RetryDecision, RetryScheduler};
use crate::staging::{Claim, StagingStore};
use crate::telemetry::{BatchOutcome, Signal, Telemetry};

/// Everything a lane's handler workers share.
pub(crate) struct LaneWorker {
    pub lane: Lane,
    pub handlers: HandlerRegistry,
    pub handler_timeout: Duration,
    pub staging: Arc<dyn StagingStore>,
    pub scheduler: RetryScheduler,
    pub router: DlqRouter,
    pub telemetry: Telemetry,
    pub gauges: Arc<LaneGauges>,
    pub counters: Arc<PipelineCounters>,
}

impl LaneWorker {
    /// Worker loop; ends when the dispatcher closes the batch channel.
    pub(crate) async fn run(self: Arc<Self>, input: Arc<Mutex<mpsc::Receiver<Batch>>>) {
        loop {
            let next = { input.lock().await.recv().await };
            let Some(batch) = next else {
                break;
            };
            let span = info_span!("batch", lane = %self.lane, source = %batch.source, count = batch.events.len());
            self.handle_batch(batch).instrument(span).await;
        }
    }

    async fn handle_batch(&self, batch: Batch) {
        self.gauges.batch_started();
        let started = Instant::now();
        let count = batch.events.len();

        let outcome = match self.handlers.for_lane(self.lane) {
            Some(handler) => {
                let events = batch.events.iter().map(|p| p.event.clone()).collect();
                let BatchExecution { results, outcome } =
                    execute_batch(handler, self.lane, events, self.handler_timeout).await;
                for (processed, result) in batch.events.into_iter().zip(results) {
                    self.settle(processed.claim, processed.event, result).await;
                }
                outcome
            }
            None => {
                for processed in batch.events {
                    let claim = processed.claim;
                    match self
                        .router
                        .route(claim, processed.event, DlqReason::UnknownHandler)
                        .await
                    {
                        Ok(()) => self.counters.record_dead_lettered(1),
                        Err(err) => {
                            error!(delivery_id = %claim.delivery_id, error = %err, "could not dead-letter unhandled event");
                            self.release(claim).await;
                        }
                    }
                }
                BatchOutcome::Failed
            }
        };

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(outcome = outcome.as_str(), duration_ms, "batch settled");
        self.telemetry.emit(Signal::Batch {
            lane: self.lane,
            count,
            duration_ms,
            outcome,
        });
        self.gauges.batch_finished();
    }

    async fn settle(&self, claim: Claim, event: herald_events::Event, result: DeliveryResult) {
        let delivery_id = claim.delivery_id;
        match result {
            DeliveryResult::Success => {
                match self.staging.ack(claim).await {
                    Ok(()) => {}
                    Err(err) if err.is_conflict() => {
                        warn!(event_id = %event.id(), delivery_id = %delivery_id, "delivered after losing the claim")
                    }
                    // Stays claimed; the lease sweep redelivers it.
                    Err(err) => {
                        error!(event_id = %event.id(), delivery_id = %delivery_id, error = %err, "failed to ack delivered event")
                    }
                }
                self.counters.record_delivered(1);
            }
            DeliveryResult::Failure { reason } => {
                let event_id = event.id().clone();
                match self.scheduler.schedule(claim, event, reason).await {
                    Ok(RetryDecision::Scheduled { .. }) => self.counters.record_retried(1),
                    Ok(RetryDecision::DeadLettered) => self.counters.record_dead_lettered(1),
                    Err(err) => {
                        error!(event_id = %event_id, delivery_id = %delivery_id, error = %err, "could not schedule retry");
                        self.release(claim).await;
                    }
                }
            }
        }
    }

    async fn release(&self, claim: Claim) {
        if let Err(err) = self.staging.release(&[claim]).await {
            error!(delivery_id = %claim.delivery_id, error = %err, "failed to release delivery");
        }
        self.counters.record_released(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::{DlqStore, InMemoryDlqStore};
    use crate::pipeline::ProcessedEvent;
    use crate::pipeline::handler::{BatchResults, DownstreamHandler, HandlerError};
    use crate::retry::{Backoff, BackoffConfig, RetryBudgetTable};
    use crate::staging::InMemoryStagingStore;
    use herald_core::{CorrelationId, EventId, WorkerId};
    use herald_events::{Category, Event, EventName, FailureReason, Priority};
    use serde_json::json;

    struct Scripted;

    #[async_trait::async_trait]
    impl DownstreamHandler for Scripted {
        async fn handle(&self, _lane: Lane, batch: &[Event]) -> Result<BatchResults, HandlerError> {
            Ok(batch
                .iter()
                .map(|e| {
                    let result = match e.id().as_str() {
                        "ok" => DeliveryResult::Success,
                        "flaky" => DeliveryResult::failure(FailureReason::transient("busy")),
                        _ => DeliveryResult::failure(FailureReason::permanent("nope")),
                    };
                    (e.id().clone(), result)
                })
                .collect())
        }
    }

    struct Fixture {
        staging: Arc<InMemoryStagingStore>,
        dlq: Arc<InMemoryDlqStore>,
        counters: Arc<PipelineCounters>,
    }

    fn worker(fx: &Fixture, handlers: HandlerRegistry) -> LaneWorker {
        let router = DlqRouter::new(fx.dlq.clone(), fx.staging.clone(), Telemetry::noop());
        let scheduler = RetryScheduler::new(
            Arc::new(RetryBudgetTable::with_default(Default::default())),
            Backoff::new(BackoffConfig::default()),
            fx.staging.clone(),
            router.clone(),
            Telemetry::noop(),
        );
        LaneWorker {
            lane: Lane::Standard,
            handlers,
            handler_timeout: Duration::from_secs(1),
            staging: fx.staging.clone(),
            scheduler,
            router,
            telemetry: Telemetry::noop(),
            gauges: Arc::new(LaneGauges::default()),
            counters: fx.counters.clone(),
        }
    }

    async fn batch(fx: &Fixture, ids: &[&str]) -> Batch {
        for id in ids {
            let event = Event::new(
                EventName::new("billing.invoice.created").unwrap(),
                "billing",
                Category::Domain,
                Priority::Normal,
                CorrelationId::new("corr").unwrap(),
                json!({}),
            )
            .with_id(EventId::new(*id).unwrap());
            fx.staging.publish(event).await.unwrap();
        }
        let claimed = fx
            .staging
            .claim(&WorkerId::new("w").unwrap(), ids.len())
            .await
            .unwrap();
        let events = claimed
            .into_iter()
            .map(|c| ProcessedEvent::new(c.claim, c.event))
            .collect();
        Batch {
            lane: Lane::Standard,
            source: "billing".to_string(),
            events,
        }
    }

    fn fixture() -> Fixture {
        Fixture {
            staging: InMemoryStagingStore::arc(),
            dlq: InMemoryDlqStore::arc(),
            counters: Arc::new(PipelineCounters::default()),
        }
    }

    #[tokio::test]
    async fn results_are_settled_per_event() {
        let fx = fixture();
        let worker = worker(&fx, HandlerRegistry::new().with_lane(Lane::Standard, Arc::new(Scripted)));
        worker.handle_batch(batch(&fx, &["ok", "flaky", "bad"]).await).await;

        let stats = fx.counters.snapshot();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.dead_lettered, 1);

        let remaining = fx.staging.entries();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].event.id().as_str(), "flaky");
        assert_eq!(remaining[0].event.attempt(), 2);
        assert!(fx.dlq.get(&EventId::new("bad").unwrap()).await.unwrap().is_some());
        assert_eq!(worker.gauges.snapshot().in_flight, 0);
    }

    #[tokio::test]
    async fn stale_claim_does_not_overwrite_the_new_holder() {
        let fx = fixture();
        let worker = worker(&fx, HandlerRegistry::new().with_lane(Lane::Standard, Arc::new(Scripted)));
        let stale = batch(&fx, &["flaky"]).await;

        // The lease runs out mid-batch and another instance takes the row.
        fx.staging.release_expired(Duration::ZERO).await.unwrap();
        fx.staging.claim(&WorkerId::new("other").unwrap(), 1).await.unwrap();

        worker.handle_batch(stale).await;

        let entries = fx.staging.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].claimed_by, Some(WorkerId::new("other").unwrap()));
        assert_eq!(entries[0].event.attempt(), 1);
        assert_eq!(fx.counters.snapshot().retried, 0);
    }

    #[tokio::test]
    async fn lane_without_handler_dead_letters() {
        let fx = fixture();
        let worker = worker(&fx, HandlerRegistry::new());
        worker.handle_batch(batch(&fx, &["a", "b"]).await).await;

        assert!(fx.staging.is_empty());
        let record = fx.dlq.get(&EventId::new("a").unwrap()).await.unwrap().unwrap();
        assert_eq!(record.reason, DlqReason::UnknownHandler);
        assert_eq!(fx.counters.snapshot().dead_lettered, 2);
    }
}
