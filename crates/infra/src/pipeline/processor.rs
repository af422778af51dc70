//! Validation and de-duplication between the producer and the lanes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, warn};

use herald_events::{Event, Lane};

use super::{LaneSenders, PipelineCounters, ProcessedEvent, doubling_pause};
use crate::chrono_duration;
use crate::dlq::{DlqReason, DlqRouter};
use crate::idempotency::{DedupDecision, DedupFailurePolicy, IdempotencyGuard};
use crate::staging::{Claim, ClaimedEvent, StagingStore};
use crate::telemetry::{Signal, Telemetry};

/// Default first pause while the idempotency store is unreachable.
pub const DEFAULT_OUTAGE_BACKOFF: Duration = Duration::from_millis(250);

/// What the processor did with one claimed event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Valid and fresh; goes to its lane.
    Forward(ProcessedEvent),
    /// Schema violation or undecodable row, stored in the DLQ.
    DeadLettered,
    /// Another delivery already owns the idempotency key; acknowledged.
    Deduplicated,
    /// Put back unchanged with a delay; claimable again once it passes.
    Deferred,
    /// Handed back to pending without processing.
    Released,
}

#[derive(Clone)]
pub struct Processor {
    guard: IdempotencyGuard,
    policy: DedupFailurePolicy,
    router: DlqRouter,
    staging: Arc<dyn StagingStore>,
    telemetry: Telemetry,
    outage_backoff: Duration,
    /// Idempotency failures in a row, shared by every processor worker.
    outage_streak: Arc<AtomicU32>,
}

impl core::fmt::Debug for Processor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Processor")
            .field("policy", &self.policy)
            .field("outage_backoff", &self.outage_backoff)
            .finish_non_exhaustive()
    }
}

impl Processor {
    pub fn new(
        guard: IdempotencyGuard,
        policy: DedupFailurePolicy,
        router: DlqRouter,
        staging: Arc<dyn StagingStore>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            guard,
            policy,
            router,
            staging,
            telemetry,
            outage_backoff: DEFAULT_OUTAGE_BACKOFF,
            outage_streak: Arc::new(AtomicU32::new(0)),
        }
    }

    /// First delay for events held back by an idempotency outage; doubles
    /// with every further failure.
    pub fn with_outage_backoff(mut self, base: Duration) -> Self {
        self.outage_backoff = base;
        self
    }

    /// Validate, de-duplicate and classify one claimed event.
    ///
    /// Never fails: store errors turn into `Deferred` or `Released` so the
    /// event is reclaimed later instead of being lost.
    pub async fn process(&self, claimed: ClaimedEvent) -> ProcessOutcome {
        let ClaimedEvent {
            claim,
            event,
            malformed,
            ..
        } = claimed;

        let invalid = match malformed {
            Some(detail) => Some(format!("undecodable staged row: {detail}")),
            None => event.validate().err().map(|err| err.to_string()),
        };
        if let Some(detail) = invalid {
            let event_id = event.id().clone();
            return match self.router.route(claim, event, DlqReason::InvalidSchema(detail)).await {
                Ok(()) => ProcessOutcome::DeadLettered,
                Err(store_err) => {
                    error!(event_id = %event_id, error = %store_err, "could not dead-letter invalid event");
                    self.release(claim).await
                }
            };
        }

        match self.guard.check_and_mark(&event, claim.delivery_id).await {
            Ok(decision) => {
                self.outage_streak.store(0, Ordering::Relaxed);
                match decision {
                    DedupDecision::Fresh => ProcessOutcome::Forward(ProcessedEvent::new(claim, event)),
                    DedupDecision::Duplicate { owner } => {
                        if let Err(err) = self.staging.ack(claim).await {
                            warn!(delivery_id = %claim.delivery_id, error = %err, "failed to ack duplicate delivery");
                        }
                        debug!(event_id = %event.id(), delivery_id = %claim.delivery_id, owner = %owner, "duplicate skipped");
                        self.telemetry.emit(Signal::Dedup {
                            event_id: event.id().clone(),
                        });
                        ProcessOutcome::Deduplicated
                    }
                }
            }
            Err(unknown) => match self.policy {
                DedupFailurePolicy::FailClosed => {
                    let streak = self.outage_streak.fetch_add(1, Ordering::Relaxed).saturating_add(1);
                    let pause = doubling_pause(self.outage_backoff, streak);
                    warn!(
                        event_id = %event.id(),
                        error = %unknown,
                        pause_ms = pause.as_millis() as u64,
                        "idempotency store unavailable; holding event back"
                    );
                    self.defer(claim, event, pause).await
                }
                DedupFailurePolicy::FailOpen => {
                    warn!(event_id = %event.id(), error = %unknown, "idempotency store unavailable; processing unmarked");
                    ProcessOutcome::Forward(ProcessedEvent::new(claim, event))
                }
            },
        }
    }

    /// Put the event back unchanged, invisible for `pause`. Falls back to a
    /// plain release when the reinsert fails.
    pub(crate) async fn defer(&self, claim: Claim, event: Event, pause: Duration) -> ProcessOutcome {
        let not_before = Utc::now() + chrono_duration(pause);
        match self.staging.reinsert(claim, event, not_before).await {
            Ok(()) => ProcessOutcome::Deferred,
            Err(err) => {
                warn!(delivery_id = %claim.delivery_id, error = %err, "could not defer delivery");
                self.release(claim).await
            }
        }
    }

    async fn release(&self, claim: Claim) -> ProcessOutcome {
        if let Err(err) = self.staging.release(&[claim]).await {
            // Left claimed; the lease sweep hands it back.
            error!(delivery_id = %claim.delivery_id, error = %err, "failed to release delivery");
        }
        ProcessOutcome::Released
    }
}

/// One processor worker. Workers share the receiver; the loop ends when the
/// producer side closes and the channel is empty.
///
/// Lane hand-off never waits: a full lane defers the event back to staging,
/// so one saturated lane cannot hold up the events bound for the other.
pub(crate) async fn run_processor(
    processor: Processor,
    input: Arc<Mutex<mpsc::Receiver<ClaimedEvent>>>,
    lanes: LaneSenders,
    counters: Arc<PipelineCounters>,
) {
    loop {
        let next = { input.lock().await.recv().await };
        let Some(claimed) = next else {
            break;
        };

        let outcome = match processor.process(claimed).await {
            ProcessOutcome::Forward(processed) => forward(&processor, &lanes, processed).await,
            other => Some(other),
        };
        match outcome {
            None | Some(ProcessOutcome::Forward(_)) => {}
            Some(ProcessOutcome::DeadLettered) => counters.record_dead_lettered(1),
            Some(ProcessOutcome::Deduplicated) => counters.record_deduplicated(1),
            Some(ProcessOutcome::Deferred) => counters.record_deferred(1),
            Some(ProcessOutcome::Released) => counters.record_released(1),
        }
    }
}

/// Hand a processed event to its lane. `None` means the lane took it.
async fn forward(processor: &Processor, lanes: &LaneSenders, processed: ProcessedEvent) -> Option<ProcessOutcome> {
    let lane: Lane = processed.lane;
    match lanes.get(lane).try_send(processed) {
        Ok(()) => None,
        Err(TrySendError::Full(processed)) => {
            debug!(lane = %lane, delivery_id = %processed.claim.delivery_id, "lane full; deferring event");
            Some(
                processor
                    .defer(processed.claim, processed.event, lanes.defer_for(lane))
                    .await,
            )
        }
        Err(TrySendError::Closed(processed)) => {
            warn!(lane = %lane, delivery_id = %processed.claim.delivery_id, "lane closed; releasing event");
            Some(processor.release(processed.claim).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::{DlqStore, InMemoryDlqStore};
    use crate::idempotency::InMemoryIdempotencyStore;
    use crate::pipeline::LaneInput;
    use crate::staging::InMemoryStagingStore;
    use crate::telemetry::CollectingSink;
    use herald_core::{CorrelationId, EventId, WorkerId};
    use herald_events::{Category, Event, EventName, Priority};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        staging: Arc<InMemoryStagingStore>,
        dedup: Arc<InMemoryIdempotencyStore>,
        dlq: Arc<InMemoryDlqStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                staging: InMemoryStagingStore::arc(),
                dedup: InMemoryIdempotencyStore::arc(),
                dlq: InMemoryDlqStore::arc(),
            }
        }

        fn processor(&self, policy: DedupFailurePolicy, telemetry: Telemetry) -> Processor {
            let router = DlqRouter::new(self.dlq.clone(), self.staging.clone(), Telemetry::noop());
            Processor::new(
                IdempotencyGuard::new(self.dedup.clone(), Duration::from_secs(60)),
                policy,
                router,
                self.staging.clone(),
                telemetry,
            )
            .with_outage_backoff(Duration::from_millis(100))
        }

        async fn claim_all(&self) -> Vec<ClaimedEvent> {
            self.staging
                .claim(&WorkerId::new("w1").unwrap(), 100)
                .await
                .unwrap()
        }
    }

    fn event(payload: serde_json::Value) -> Event {
        Event::new(
            EventName::new("chat.message.sent").unwrap(),
            "chat",
            Category::User,
            Priority::Critical,
            CorrelationId::new("corr-1").unwrap(),
            payload,
        )
        .with_id(EventId::new("evt-1").unwrap())
    }

    #[tokio::test]
    async fn fresh_event_is_forwarded_to_its_lane() {
        let fx = Fixture::new();
        fx.staging.publish(event(json!({"text": "hi"}))).await.unwrap();
        let claimed = fx.claim_all().await.remove(0);

        let outcome = fx
            .processor(DedupFailurePolicy::FailClosed, Telemetry::noop())
            .process(claimed)
            .await;
        match outcome {
            ProcessOutcome::Forward(processed) => assert_eq!(processed.lane, Lane::Fast),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(fx.dedup.len(), 1);
    }

    #[tokio::test]
    async fn second_publication_is_deduplicated_and_acked() {
        let fx = Fixture::new();
        let sink = Arc::new(CollectingSink::new());
        let (telemetry, task) = Telemetry::spawn(sink.clone(), 16);
        let processor = fx.processor(DedupFailurePolicy::FailClosed, telemetry);

        fx.staging.publish(event(json!({}))).await.unwrap();
        fx.staging.publish(event(json!({}))).await.unwrap();
        let mut claimed = fx.claim_all().await.into_iter();

        assert!(matches!(
            processor.process(claimed.next().unwrap()).await,
            ProcessOutcome::Forward(_)
        ));
        assert_eq!(
            processor.process(claimed.next().unwrap()).await,
            ProcessOutcome::Deduplicated
        );
        assert_eq!(fx.staging.len(), 1);

        drop(processor);
        task.await.unwrap();
        assert_eq!(sink.count(|s| matches!(s, Signal::Dedup { .. })), 1);
    }

    #[tokio::test]
    async fn invalid_event_is_dead_lettered() {
        let fx = Fixture::new();
        fx.staging.publish(event(json!("not an object"))).await.unwrap();
        let claimed = fx.claim_all().await.remove(0);

        let outcome = fx
            .processor(DedupFailurePolicy::FailClosed, Telemetry::noop())
            .process(claimed)
            .await;
        assert_eq!(outcome, ProcessOutcome::DeadLettered);

        let record = fx.dlq.get(&EventId::new("evt-1").unwrap()).await.unwrap().unwrap();
        assert!(matches!(record.reason, DlqReason::InvalidSchema(_)));
        assert!(fx.staging.is_empty());
        assert!(fx.dedup.is_empty());
    }

    fn millis_until(not_before: chrono::DateTime<Utc>) -> i64 {
        (not_before - Utc::now()).num_milliseconds()
    }

    #[tokio::test]
    async fn fail_closed_defers_with_growing_backoff() {
        let fx = Fixture::new();
        let processor = fx.processor(DedupFailurePolicy::FailClosed, Telemetry::noop());
        fx.dedup.set_unavailable(true);
        let delivery_id = fx.staging.publish(event(json!({}))).await.unwrap();

        let claimed = fx.claim_all().await.remove(0);
        assert_eq!(processor.process(claimed).await, ProcessOutcome::Deferred);
        let staged = fx.staging.get(delivery_id).unwrap();
        assert!(staged.claimed_by.is_none());
        let first = millis_until(staged.not_before);
        assert!(first > 50 && first <= 100, "first pause {first}ms");
        assert!(fx.claim_all().await.is_empty());

        fx.staging.make_due(delivery_id);
        let claimed = fx.claim_all().await.remove(0);
        assert_eq!(processor.process(claimed).await, ProcessOutcome::Deferred);
        let second = millis_until(fx.staging.get(delivery_id).unwrap().not_before);
        assert!(second > 150 && second <= 200, "second pause {second}ms");

        // Recovery resets the streak.
        fx.dedup.set_unavailable(false);
        fx.staging.make_due(delivery_id);
        let claimed = fx.claim_all().await.remove(0);
        assert!(matches!(processor.process(claimed).await, ProcessOutcome::Forward(_)));
        assert_eq!(fx.dedup.len(), 1);

        fx.dedup.set_unavailable(true);
        fx.staging.publish(event(json!({"n": 2}))).await.unwrap();
        let claimed = fx.claim_all().await.remove(0);
        let next_id = claimed.delivery_id();
        assert_eq!(processor.process(claimed).await, ProcessOutcome::Deferred);
        assert!(millis_until(fx.staging.get(next_id).unwrap().not_before) <= 100);
    }

    #[tokio::test]
    async fn undecodable_row_is_dead_lettered() {
        let fx = Fixture::new();
        let placeholder = crate::staging::undecodable_event("evt-7", json!({"priority": 9}), "unknown variant").unwrap();
        fx.staging.publish(placeholder).await.unwrap();
        let mut claimed = fx.claim_all().await.remove(0);
        claimed.malformed = Some("unknown variant".to_string());

        let outcome = fx
            .processor(DedupFailurePolicy::FailClosed, Telemetry::noop())
            .process(claimed)
            .await;
        assert_eq!(outcome, ProcessOutcome::DeadLettered);

        let record = fx.dlq.get(&EventId::new("evt-7").unwrap()).await.unwrap().unwrap();
        assert!(matches!(record.reason, DlqReason::InvalidSchema(ref detail) if detail.contains("undecodable")));
        assert!(fx.staging.is_empty());
        assert!(fx.dedup.is_empty());
    }

    #[tokio::test]
    async fn full_lane_defers_instead_of_waiting() {
        let fx = Fixture::new();
        let processor = fx.processor(DedupFailurePolicy::FailClosed, Telemetry::noop());
        let (fast_tx, mut fast_rx) = mpsc::channel(1);
        let (standard_tx, _standard_rx) = mpsc::channel(1);
        let lanes = LaneSenders::new(
            LaneInput::new(fast_tx.clone(), Duration::from_secs(5)),
            LaneInput::new(standard_tx, Duration::from_secs(5)),
        );

        // Occupy the only slot of the fast lane.
        fx.staging.publish(event(json!({"n": 0}))).await.unwrap();
        let blocker = fx.claim_all().await.remove(0);
        fast_tx
            .try_send(ProcessedEvent::new(blocker.claim, blocker.event))
            .unwrap();

        let delivery_id = fx
            .staging
            .publish(event(json!({"n": 1})).with_id(EventId::new("evt-2").unwrap()))
            .await
            .unwrap();
        let (input_tx, input_rx) = mpsc::channel(4);
        input_tx.send(fx.claim_all().await.remove(0)).await.unwrap();
        drop(input_tx);

        let counters = Arc::new(PipelineCounters::default());
        tokio::time::timeout(
            Duration::from_secs(1),
            run_processor(processor, Arc::new(Mutex::new(input_rx)), lanes, counters.clone()),
        )
        .await
        .expect("processor waited on a full lane");

        assert_eq!(counters.snapshot().deferred, 1);
        let staged = fx.staging.get(delivery_id).unwrap();
        assert!(staged.claimed_by.is_none());
        assert!(staged.not_before > Utc::now());
        assert_eq!(fast_rx.recv().await.unwrap().event.id().as_str(), "evt-1");
    }

    #[tokio::test]
    async fn fail_open_forwards_unmarked() {
        let fx = Fixture::new();
        fx.dedup.set_unavailable(true);
        fx.staging.publish(event(json!({}))).await.unwrap();
        let claimed = fx.claim_all().await.remove(0);

        let outcome = fx
            .processor(DedupFailurePolicy::FailOpen, Telemetry::noop())
            .process(claimed)
            .await;
        assert!(matches!(outcome, ProcessOutcome::Forward(_)));
        fx.dedup.set_unavailable(false);
        assert!(fx.dedup.is_empty());
    }
}
