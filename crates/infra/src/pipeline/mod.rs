//! The delivery pipeline: producer -> processors -> per-lane dispatchers ->
//! per-lane handler workers, with retries and dead letters fed back through
//! the stores.
//!
//! ```text
//! staging --claim--> Producer --chan--> Processor xN --lane chan--> Dispatcher (fast)     --batch chan--> LaneWorker xC
//!                                                              \--> Dispatcher (standard) --batch chan--> LaneWorker xC
//! ```
//!
//! Every channel is bounded. The processors never wait on a lane: when one
//! is full they put the event back into staging with a short delay, so a
//! saturated standard lane cannot starve the fast lane. Everything upstream
//! of the processors pushes back on the producer instead of growing memory.
//!
//! A maintenance task renews the leases of claims this instance still holds,
//! sweeps claims abandoned by crashed instances, and purges expired
//! idempotency records.

pub mod dispatcher;
pub mod handler;
mod lease;
pub mod processor;
mod producer;
mod worker;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{info, warn};

use herald_core::{DeliveryId, WorkerId};
use herald_events::{Event, Lane, ValidationError};

use crate::config::{ConfigError, PipelineConfig};
use crate::dlq::{DlqRouter, DlqStore, DlqSweeper, InMemoryDlqStore};
use crate::error::StoreError;
use crate::idempotency::{IdempotencyGuard, IdempotencyStore, InMemoryIdempotencyStore};
use crate::retry::{Backoff, RetryBudgetTable, RetryScheduler};
use crate::staging::{Claim, InMemoryStagingStore, StagingStore};
use crate::telemetry::{Telemetry, TelemetrySink, TracingSink};

pub use dispatcher::{BatchBuffer, LaneGauges, LaneSnapshot};
pub use handler::{
    BatchExecution, BatchResults, DownstreamHandler, HandlerError, HandlerRegistry, execute_batch,
};
pub use processor::{ProcessOutcome, Processor};

use dispatcher::run_dispatcher;
use lease::{LeasedStaging, Maintenance};
use processor::run_processor;
use producer::Producer;
use worker::LaneWorker;

/// Ceiling for every doubling pause in the pipeline.
pub(crate) const MAX_PAUSE: Duration = Duration::from_secs(30);

/// `base` doubled for each failure after the first, capped at [`MAX_PAUSE`].
pub(crate) fn doubling_pause(base: Duration, consecutive_failures: u32) -> Duration {
    let factor = 1u32 << consecutive_failures.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(MAX_PAUSE)
}

/// A claimed event that passed validation and de-duplication.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedEvent {
    pub claim: Claim,
    pub event: Event,
    pub lane: Lane,
}

impl ProcessedEvent {
    pub fn new(claim: Claim, event: Event) -> Self {
        let lane = event.lane();
        Self { claim, event, lane }
    }
}

/// Events from one source, flushed together to a lane's handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub lane: Lane,
    pub source: String,
    pub events: Vec<ProcessedEvent>,
}

/// Entry point of one lane, plus how long a processor defers an event when
/// the lane is full.
#[derive(Clone)]
pub(crate) struct LaneInput {
    tx: mpsc::Sender<ProcessedEvent>,
    defer: Duration,
}

impl LaneInput {
    pub(crate) fn new(tx: mpsc::Sender<ProcessedEvent>, defer: Duration) -> Self {
        Self { tx, defer }
    }
}

#[derive(Clone)]
pub(crate) struct LaneSenders {
    fast: LaneInput,
    standard: LaneInput,
}

impl LaneSenders {
    pub(crate) fn new(fast: LaneInput, standard: LaneInput) -> Self {
        Self { fast, standard }
    }

    fn input(&self, lane: Lane) -> &LaneInput {
        match lane {
            Lane::Fast => &self.fast,
            Lane::Standard => &self.standard,
        }
    }

    pub(crate) fn get(&self, lane: Lane) -> &mpsc::Sender<ProcessedEvent> {
        &self.input(lane).tx
    }

    pub(crate) fn defer_for(&self, lane: Lane) -> Duration {
        self.input(lane).defer
    }
}

/// Running totals since start.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    claimed: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    deduplicated: AtomicU64,
    dead_lettered: AtomicU64,
    deferred: AtomicU64,
    released: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub claimed: u64,
    pub delivered: u64,
    pub retried: u64,
    pub deduplicated: u64,
    pub dead_lettered: u64,
    /// Put back with a short delay because a lane was full or the
    /// idempotency store was unreachable.
    pub deferred: u64,
    pub released: u64,
}

impl PipelineCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_claimed(&self, n: u64) {
        self.claimed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self, n: u64) {
        self.delivered.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_retried(&self, n: u64) {
        self.retried.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_deduplicated(&self, n: u64) {
        self.deduplicated.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_dead_lettered(&self, n: u64) {
        self.dead_lettered.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_deferred(&self, n: u64) {
        self.deferred.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_released(&self, n: u64) {
        self.released.fetch_add(n, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    #[serde(flatten)]
    pub counters: CounterSnapshot,
    pub telemetry_dropped: u64,
    pub lanes: BTreeMap<Lane, LaneSnapshot>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] ValidationError),
    #[error("shutdown failed: {0}")]
    Shutdown(String),
}

/// What `shutdown` had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Every stage finished inside the grace period.
    pub drained: bool,
    /// Tasks still running at the deadline.
    pub aborted_tasks: usize,
    /// Claims handed back to pending after the stages stopped.
    pub released: usize,
}

pub struct Pipeline;

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }
}

/// Wires stores, handlers and telemetry into a running pipeline.
///
/// Anything not supplied falls back to the in-memory stores and the tracing
/// telemetry sink.
pub struct PipelineBuilder {
    config: PipelineConfig,
    staging: Option<Arc<dyn StagingStore>>,
    idempotency: Option<Arc<dyn IdempotencyStore>>,
    dlq: Option<Arc<dyn DlqStore>>,
    handlers: HandlerRegistry,
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            staging: None,
            idempotency: None,
            dlq: None,
            handlers: HandlerRegistry::new(),
            sink: None,
        }
    }

    pub fn staging(mut self, store: Arc<dyn StagingStore>) -> Self {
        self.staging = Some(store);
        self
    }

    pub fn idempotency(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency = Some(store);
        self
    }

    pub fn dlq(mut self, store: Arc<dyn DlqStore>) -> Self {
        self.dlq = Some(store);
        self
    }

    pub fn handler(mut self, lane: Lane, handler: Arc<dyn DownstreamHandler>) -> Self {
        self.handlers = self.handlers.with_lane(lane, handler);
        self
    }

    /// Used for any lane without its own handler.
    pub fn fallback_handler(mut self, handler: Arc<dyn DownstreamHandler>) -> Self {
        self.handlers = self.handlers.with_fallback(handler);
        self
    }

    pub fn telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate the configuration and spawn every stage. Must be called from
    /// inside a Tokio runtime.
    pub fn start(self) -> Result<PipelineHandle, PipelineError> {
        let config = self.config;
        config.validate()?;
        let budgets = Arc::new(config.budget_table()?);
        let worker_id = config.producer.worker_id()?;

        let leases = Arc::new(LeasedStaging::new(
            self.staging
                .unwrap_or_else(|| InMemoryStagingStore::arc() as Arc<dyn StagingStore>),
        ));
        let staging: Arc<dyn StagingStore> = leases.clone();
        let idempotency = self
            .idempotency
            .unwrap_or_else(|| InMemoryIdempotencyStore::arc() as Arc<dyn IdempotencyStore>);
        let dlq = self
            .dlq
            .unwrap_or_else(|| InMemoryDlqStore::arc() as Arc<dyn DlqStore>);
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(TracingSink) as Arc<dyn TelemetrySink>);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (settled_tx, settled_rx) = watch::channel(false);
        let mut stages = Stages::default();

        let (telemetry, telemetry_task) =
            Telemetry::spawn_until(sink, config.telemetry.queue_capacity, settled_rx.clone());
        stages.telemetry = Some(telemetry_task);
        let router = DlqRouter::new(dlq, staging.clone(), telemetry.clone());
        let scheduler = RetryScheduler::new(
            budgets.clone(),
            Backoff::new(config.backoff),
            staging.clone(),
            router.clone(),
            telemetry.clone(),
        );
        let processor = Processor::new(
            IdempotencyGuard::new(idempotency.clone(), config.processor.dedup_ttl()),
            config.processor.dedup_failure_policy,
            router.clone(),
            staging.clone(),
            telemetry.clone(),
        )
        .with_outage_backoff(config.producer.poll_interval());

        let counters = Arc::new(PipelineCounters::default());

        // Lanes first, so the processors have somewhere to send.
        let mut gauges = BTreeMap::new();
        let mut lane_inputs = BTreeMap::new();
        for lane in Lane::ALL {
            let lane_config = *config.lanes.get(lane);
            let (event_tx, event_rx) = mpsc::channel(lane_config.channel_capacity);
            let (batch_tx, batch_rx) = mpsc::channel(lane_config.channel_capacity);
            let lane_gauges = Arc::new(LaneGauges::default());

            stages.dispatchers.push(tokio::spawn(run_dispatcher(
                BatchBuffer::from_config(lane, &lane_config),
                event_rx,
                batch_tx,
                lane_gauges.clone(),
            )));

            let worker = Arc::new(LaneWorker {
                lane,
                handlers: self.handlers.clone(),
                handler_timeout: lane_config.handler_timeout(),
                staging: staging.clone(),
                scheduler: scheduler.clone(),
                router: router.clone(),
                telemetry: telemetry.clone(),
                gauges: lane_gauges.clone(),
                counters: counters.clone(),
            });
            let batch_rx = Arc::new(tokio::sync::Mutex::new(batch_rx));
            for _ in 0..lane_config.concurrency {
                stages.workers.push(tokio::spawn(worker.clone().run(batch_rx.clone())));
            }

            // Delay before a processor retries a full lane.
            let defer = lane_config.batch_timeout().max(config.producer.poll_interval());
            gauges.insert(lane, lane_gauges);
            lane_inputs.insert(lane, LaneInput::new(event_tx, defer));
        }

        let (Some(fast), Some(standard)) = (lane_inputs.remove(&Lane::Fast), lane_inputs.remove(&Lane::Standard))
        else {
            return Err(PipelineError::Config(ConfigError::Invalid("lane wiring incomplete".to_string())));
        };
        let lanes = LaneSenders::new(fast, standard);

        let (claimed_tx, claimed_rx) = mpsc::channel(config.producer.channel_capacity);
        let claimed_rx = Arc::new(tokio::sync::Mutex::new(claimed_rx));
        for _ in 0..config.processor.workers {
            stages.processors.push(tokio::spawn(run_processor(
                processor.clone(),
                claimed_rx.clone(),
                lanes.clone(),
                counters.clone(),
            )));
        }
        drop(lanes);

        stages.producer = Some(tokio::spawn(
            Producer {
                worker_id: worker_id.clone(),
                config: config.producer.clone(),
                staging: staging.clone(),
                output: claimed_tx,
                counters: counters.clone(),
            }
            .run(shutdown_rx.clone()),
        ));

        if config.dlq_sweep.enabled {
            let sweeper = DlqSweeper::new(router.clone(), config.dlq_sweep);
            stages.sweeper = Some(tokio::spawn(sweeper.run(shutdown_rx)));
        }

        // Keeps renewing until the workers have settled everything in flight.
        stages.maintenance = Some(tokio::spawn(
            Maintenance {
                leases,
                idempotency,
                lease: config.producer.claim_lease(),
                purge_interval: config.processor.dedup_purge_interval(),
            }
            .run(settled_rx),
        ));

        info!(
            worker_id = %worker_id,
            processors = config.processor.workers,
            fast_workers = config.lanes.fast.concurrency,
            standard_workers = config.lanes.standard.concurrency,
            "pipeline started"
        );

        Ok(PipelineHandle {
            config,
            worker_id,
            staging,
            router,
            budgets,
            telemetry,
            counters,
            gauges,
            shutdown_tx,
            settled_tx,
            stages: Mutex::new(Some(stages)),
        })
    }
}

/// Task handles per stage, joined in pipeline order during shutdown.
#[derive(Default)]
struct Stages {
    producer: Option<JoinHandle<()>>,
    processors: Vec<JoinHandle<()>>,
    dispatchers: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
    maintenance: Option<JoinHandle<()>>,
    telemetry: Option<JoinHandle<()>>,
}

impl Stages {
    /// `(delivery stages in pipeline order, tasks that outlive them)`.
    fn into_ordered(self) -> (Vec<JoinHandle<()>>, Vec<JoinHandle<()>>) {
        let delivery = self
            .producer
            .into_iter()
            .chain(self.sweeper)
            .chain(self.processors)
            .chain(self.dispatchers)
            .chain(self.workers)
            .collect();
        let trailing = self.maintenance.into_iter().chain(self.telemetry).collect();
        (delivery, trailing)
    }
}

/// Control and introspection for a running pipeline.
pub struct PipelineHandle {
    config: PipelineConfig,
    worker_id: WorkerId,
    staging: Arc<dyn StagingStore>,
    router: DlqRouter,
    budgets: Arc<RetryBudgetTable>,
    telemetry: Telemetry,
    counters: Arc<PipelineCounters>,
    gauges: BTreeMap<Lane, Arc<LaneGauges>>,
    shutdown_tx: watch::Sender<bool>,
    /// Flipped once the delivery stages are done; stops maintenance and
    /// telemetry.
    settled_tx: watch::Sender<bool>,
    stages: Mutex<Option<Stages>>,
}

impl core::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl PipelineHandle {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn staging(&self) -> &Arc<dyn StagingStore> {
        &self.staging
    }

    /// Operator access to the dead-letter queue.
    pub fn router(&self) -> &DlqRouter {
        &self.router
    }

    pub fn budgets(&self) -> &RetryBudgetTable {
        &self.budgets
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            counters: self.counters.snapshot(),
            telemetry_dropped: self.telemetry.dropped(),
            lanes: self
                .gauges
                .iter()
                .map(|(lane, gauges)| (*lane, gauges.snapshot()))
                .collect(),
        }
    }

    /// Validate and stage a new event.
    pub async fn publish(&self, event: Event) -> Result<DeliveryId, PipelineError> {
        event.validate()?;
        Ok(self.staging.publish(event).await?)
    }

    /// Stop claiming, drain every stage for up to `shutdown_grace_ms`, then
    /// abort whatever is left and hand this instance's claims back to pending.
    pub async fn shutdown(&self) -> Result<ShutdownReport, PipelineError> {
        let stages = self
            .stages
            .lock()
            .map_err(|_| PipelineError::Shutdown("stage registry poisoned".to_string()))?
            .take()
            .ok_or_else(|| PipelineError::Shutdown("pipeline already shut down".to_string()))?;

        info!(worker_id = %self.worker_id, "pipeline shutting down");
        let _ = self.shutdown_tx.send(true);

        let (delivery, trailing) = stages.into_ordered();
        let aborts: Vec<AbortHandle> = delivery
            .iter()
            .chain(&trailing)
            .map(JoinHandle::abort_handle)
            .collect();
        let grace = self.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            for task in delivery {
                let _ = task.await;
            }
            let _ = self.settled_tx.send(true);
            for task in trailing {
                let _ = task.await;
            }
        })
        .await
        .is_ok();
        let _ = self.settled_tx.send(true);

        let mut aborted_tasks = 0;
        if !drained {
            for abort in aborts.iter().filter(|a| !a.is_finished()) {
                abort.abort();
                aborted_tasks += 1;
            }
            warn!(aborted_tasks, grace_ms = self.config.shutdown_grace_ms, "shutdown grace elapsed");
        }

        let released = self.staging.release_owned(&self.worker_id).await?;
        if released > 0 {
            warn!(released, "released claims left by shutdown");
        }
        info!(drained, released, "pipeline stopped");

        Ok(ShutdownReport {
            drained,
            aborted_tasks,
            released,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let mut config = PipelineConfig::default();
        config.processor.workers = 0;
        let err = Pipeline::builder(config).start().unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[tokio::test]
    async fn idle_pipeline_shuts_down_cleanly_once() {
        let handle = Pipeline::builder(PipelineConfig::default()).start().unwrap();
        let report = handle.shutdown().await.unwrap();
        assert!(report.drained);
        assert_eq!(report.released, 0);
        assert!(matches!(handle.shutdown().await, Err(PipelineError::Shutdown(_))));
    }

    #[tokio::test]
    async fn stats_cover_both_lanes() {
        let handle = Pipeline::builder(PipelineConfig::default()).start().unwrap();
        let stats = handle.stats();
        assert_eq!(stats.lanes.len(), 2);
        assert_eq!(stats.counters, CounterSnapshot::default());

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["delivered"], 0);
        assert!(json["lanes"]["fast"].is_object());
        handle.shutdown().await.unwrap();
    }
}
