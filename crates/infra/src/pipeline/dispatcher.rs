//! Per-lane batching by partition key.
//!
//! One dispatcher task runs per lane. It keeps a buffer per event `source`
//! and flushes a buffer when it reaches `batch_size` or when its oldest event
//! has waited `batch_timeout`, whichever comes first.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use herald_events::Lane;

use super::{Batch, ProcessedEvent};
use crate::config::LaneConfig;

/// Live depth counters for one lane.
#[derive(Debug, Default)]
pub struct LaneGauges {
    buffered: AtomicUsize,
    queued_batches: AtomicUsize,
    in_flight: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LaneSnapshot {
    /// Events waiting in partition buffers.
    pub buffered: usize,
    /// Flushed batches waiting for a handler worker.
    pub queued_batches: usize,
    /// Batches currently inside a handler call.
    pub in_flight: usize,
}

impl LaneGauges {
    pub fn snapshot(&self) -> LaneSnapshot {
        LaneSnapshot {
            buffered: self.buffered.load(Ordering::Relaxed),
            queued_batches: self.queued_batches.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn batch_started(&self) {
        let _ = self
            .queued_batches
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn batch_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct Partition {
    events: Vec<ProcessedEvent>,
    opened_at: Instant,
}

/// Buffers for one lane. Pure bookkeeping; the caller supplies the clock.
#[derive(Debug)]
pub struct BatchBuffer {
    lane: Lane,
    batch_size: usize,
    batch_timeout: Duration,
    partitions: HashMap<String, Partition>,
    buffered: usize,
}

impl BatchBuffer {
    pub fn new(lane: Lane, batch_size: usize, batch_timeout: Duration) -> Self {
        Self {
            lane,
            batch_size: batch_size.max(1),
            batch_timeout,
            partitions: HashMap::new(),
            buffered: 0,
        }
    }

    pub fn from_config(lane: Lane, config: &LaneConfig) -> Self {
        Self::new(lane, config.batch_size, config.batch_timeout())
    }

    /// Events currently buffered across all partitions.
    pub fn len(&self) -> usize {
        self.buffered
    }

    pub fn is_empty(&self) -> bool {
        self.buffered == 0
    }

    /// Add an event; returns a full batch if this push filled its partition.
    pub fn push(&mut self, event: ProcessedEvent, now: Instant) -> Option<Batch> {
        let source = event.event.source().to_string();
        let partition = self.partitions.entry(source.clone()).or_insert_with(|| Partition {
            events: Vec::new(),
            opened_at: now,
        });
        partition.events.push(event);
        self.buffered += 1;

        if partition.events.len() >= self.batch_size {
            self.flush(&source)
        } else {
            None
        }
    }

    /// Earliest instant at which some partition times out.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.partitions
            .values()
            .map(|p| p.opened_at + self.batch_timeout)
            .min()
    }

    /// Flush every partition whose window has elapsed at `now`.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Batch> {
        let expired: Vec<String> = self
            .partitions
            .iter()
            .filter(|(_, p)| p.opened_at + self.batch_timeout <= now)
            .map(|(source, _)| source.clone())
            .collect();
        expired.iter().filter_map(|source| self.flush(source)).collect()
    }

    /// Flush everything, oldest partition first.
    pub fn drain(&mut self) -> Vec<Batch> {
        let mut sources: Vec<(Instant, String)> = self
            .partitions
            .iter()
            .map(|(source, p)| (p.opened_at, source.clone()))
            .collect();
        sources.sort();
        sources
            .into_iter()
            .filter_map(|(_, source)| self.flush(&source))
            .collect()
    }

    fn flush(&mut self, source: &str) -> Option<Batch> {
        let partition = self.partitions.remove(source)?;
        self.buffered -= partition.events.len();
        Some(Batch {
            lane: self.lane,
            source: source.to_string(),
            events: partition.events,
        })
    }
}

/// Dispatcher loop for one lane.
///
/// Ends after its input closes and every buffer has been flushed. Blocks only
/// on the lane's own batch channel, so a slow lane never stalls the other.
pub(crate) async fn run_dispatcher(
    mut buffer: BatchBuffer,
    mut input: mpsc::Receiver<ProcessedEvent>,
    output: mpsc::Sender<Batch>,
    gauges: Arc<LaneGauges>,
) {
    let lane = buffer.lane;
    loop {
        let deadline = buffer.next_deadline();
        let ready = tokio::select! {
            maybe_event = input.recv() => match maybe_event {
                Some(event) => {
                    gauges.buffered.fetch_add(1, Ordering::Relaxed);
                    buffer.push(event, Instant::now()).into_iter().collect::<Vec<_>>()
                }
                None => break,
            },
            _ = sleep_until_opt(deadline) => buffer.take_expired(Instant::now()),
        };

        for batch in ready {
            if !send_batch(&output, batch, &gauges).await {
                return;
            }
        }
    }

    for batch in buffer.drain() {
        if !send_batch(&output, batch, &gauges).await {
            return;
        }
    }
    debug!(lane = %lane, "dispatcher drained");
}

async fn send_batch(output: &mpsc::Sender<Batch>, batch: Batch, gauges: &LaneGauges) -> bool {
    let count = batch.events.len();
    gauges.buffered.fetch_sub(count, Ordering::Relaxed);
    gauges.queued_batches.fetch_add(1, Ordering::Relaxed);
    if output.send(batch).await.is_err() {
        gauges.queued_batches.fetch_sub(1, Ordering::Relaxed);
        return false;
    }
    true
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::{Claim, ClaimToken};
    use herald_core::{CorrelationId, DeliveryId};
    use herald_events::{Category, Event, EventName, Priority};
    use serde_json::json;

    fn processed(source: &str) -> ProcessedEvent {
        let event = Event::new(
            EventName::new("chat.message.sent").unwrap(),
            source,
            Category::User,
            Priority::Normal,
            CorrelationId::new("corr").unwrap(),
            json!({}),
        );
        ProcessedEvent::new(Claim::new(DeliveryId::new(), ClaimToken::new()), event)
    }

    #[test]
    fn flushes_when_partition_is_full() {
        let mut buffer = BatchBuffer::new(Lane::Standard, 3, Duration::from_secs(2));
        let now = Instant::now();

        assert!(buffer.push(processed("a"), now).is_none());
        assert!(buffer.push(processed("b"), now).is_none());
        assert!(buffer.push(processed("a"), now).is_none());
        let batch = buffer.push(processed("a"), now).unwrap();

        assert_eq!(batch.source, "a");
        assert_eq!(batch.events.len(), 3);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn window_runs_from_oldest_event() {
        let mut buffer = BatchBuffer::new(Lane::Fast, 10, Duration::from_millis(500));
        let start = Instant::now();
        buffer.push(processed("a"), start);
        buffer.push(processed("a"), start + Duration::from_millis(400));
        buffer.push(processed("b"), start + Duration::from_millis(300));

        assert_eq!(buffer.next_deadline(), Some(start + Duration::from_millis(500)));
        assert!(buffer.take_expired(start + Duration::from_millis(499)).is_empty());

        let expired = buffer.take_expired(start + Duration::from_millis(500));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].events.len(), 2);
        assert_eq!(buffer.next_deadline(), Some(start + Duration::from_millis(800)));
    }

    #[test]
    fn drain_preserves_per_source_order() {
        let mut buffer = BatchBuffer::new(Lane::Standard, 10, Duration::from_secs(2));
        let now = Instant::now();
        let first = processed("a");
        let second = processed("a");
        let ids = vec![first.claim, second.claim];
        buffer.push(first, now);
        buffer.push(second, now);
        buffer.push(processed("b"), now + Duration::from_millis(1));

        let batches = buffer.drain();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].source, "a");
        let drained: Vec<_> = batches[0].events.iter().map(|e| e.claim).collect();
        assert_eq!(drained, ids);
        assert!(buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dispatcher_flushes_on_timeout_and_on_close() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let gauges = Arc::new(LaneGauges::default());
        let buffer = BatchBuffer::new(Lane::Fast, 10, Duration::from_millis(500));
        let task = tokio::spawn(run_dispatcher(buffer, in_rx, out_tx, gauges.clone()));

        in_tx.send(processed("a")).await.unwrap();
        let started = Instant::now();
        let batch = out_rx.recv().await.unwrap();
        assert_eq!(batch.events.len(), 1);
        assert!(started.elapsed() >= Duration::from_millis(500));

        in_tx.send(processed("b")).await.unwrap();
        in_tx.send(processed("b")).await.unwrap();
        drop(in_tx);
        let batch = out_rx.recv().await.unwrap();
        assert_eq!(batch.events.len(), 2);
        task.await.unwrap();

        assert!(out_rx.recv().await.is_none());
        assert_eq!(gauges.snapshot().buffered, 0);
        assert_eq!(gauges.snapshot().queued_batches, 2);
    }
}
