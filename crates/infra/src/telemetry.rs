//! Fire-and-forget telemetry signals.
//!
//! Stages emit into a bounded queue with `try_send`; a background task drains
//! it into the configured [`TelemetrySink`]. A full queue or a stuck sink only
//! increments a drop counter and never blocks the pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use herald_core::EventId;
use herald_events::Lane;

/// Default capacity of the signal queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// How a dispatched batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    /// Every event succeeded.
    Delivered,
    /// Some events failed.
    Partial,
    /// Every event failed.
    Failed,
    TimedOut,
    Crashed,
}

impl BatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchOutcome::Delivered => "delivered",
            BatchOutcome::Partial => "partial",
            BatchOutcome::Failed => "failed",
            BatchOutcome::TimedOut => "timed_out",
            BatchOutcome::Crashed => "crashed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    Retry {
        event_id: EventId,
        attempt: u32,
        delay_ms: u64,
    },
    Dedup {
        event_id: EventId,
    },
    Dlq {
        event_id: EventId,
        reason: String,
    },
    Batch {
        lane: Lane,
        count: usize,
        duration_ms: u64,
        outcome: BatchOutcome,
    },
}

/// Receiver of telemetry signals.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, signal: &Signal);
}

/// Renders signals as `tracing` events under the `herald::telemetry` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, signal: &Signal) {
        match signal {
            Signal::Retry {
                event_id,
                attempt,
                delay_ms,
            } => info!(target: "herald::telemetry", signal = "retry", event_id = %event_id, attempt, delay_ms),
            Signal::Dedup { event_id } => {
                info!(target: "herald::telemetry", signal = "dedup", event_id = %event_id)
            }
            Signal::Dlq { event_id, reason } => {
                info!(target: "herald::telemetry", signal = "dlq", event_id = %event_id, reason = %reason)
            }
            Signal::Batch {
                lane,
                count,
                duration_ms,
                outcome,
            } => info!(
                target: "herald::telemetry",
                signal = "batch",
                lane = %lane,
                count,
                duration_ms,
                outcome = outcome.as_str()
            ),
        }
    }
}

/// Keeps every signal in memory. Used by tests and local tooling.
#[derive(Debug, Default)]
pub struct CollectingSink {
    signals: Mutex<Vec<Signal>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn count(&self, predicate: impl Fn(&Signal) -> bool) -> usize {
        self.signals
            .lock()
            .map(|s| s.iter().filter(|signal| predicate(signal)).count())
            .unwrap_or(0)
    }
}

impl TelemetrySink for CollectingSink {
    fn emit(&self, signal: &Signal) {
        if let Ok(mut signals) = self.signals.lock() {
            signals.push(signal.clone());
        }
    }
}

/// Cloneable emitting side of the telemetry queue.
#[derive(Debug, Clone)]
pub struct Telemetry {
    tx: Option<mpsc::Sender<Signal>>,
    dropped: Arc<AtomicU64>,
}

impl Telemetry {
    /// Start the forwarding task. It ends once every `Telemetry` clone is dropped.
    pub fn spawn(sink: Arc<dyn TelemetrySink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Signal>(capacity.max(1));
        let task = tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                sink.emit(&signal);
            }
        });
        (Self::sending(tx), task)
    }

    /// Like [`Telemetry::spawn`], but the task also ends when `stop` flips:
    /// the queue is closed, whatever was already queued reaches the sink, and
    /// later emits count as dropped.
    pub fn spawn_until(
        sink: Arc<dyn TelemetrySink>,
        capacity: usize,
        mut stop: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Signal>(capacity.max(1));
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = rx.recv() => match next {
                        Some(signal) => sink.emit(&signal),
                        None => return,
                    },
                    _ = stop.wait_for(|stop| *stop) => break,
                }
            }
            rx.close();
            while let Some(signal) = rx.recv().await {
                sink.emit(&signal);
            }
        });
        (Self::sending(tx), task)
    }

    fn sending(tx: mpsc::Sender<Signal>) -> Self {
        Self {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A handle that discards everything.
    pub fn noop() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn emit(&self, signal: Signal) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.try_send(signal).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Signals lost to a full or closed queue.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
