//! Claims ready rows from staging and feeds the processors.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use herald_core::WorkerId;

use super::{PipelineCounters, doubling_pause};
use crate::config::ProducerConfig;
use crate::staging::{Claim, ClaimedEvent, StagingStore};

pub(crate) struct Producer {
    pub worker_id: WorkerId,
    pub config: ProducerConfig,
    pub staging: Arc<dyn StagingStore>,
    pub output: mpsc::Sender<ClaimedEvent>,
    pub counters: Arc<PipelineCounters>,
}

impl Producer {
    /// Poll until `shutdown` flips. Dropping `self` at the end closes the
    /// processor channel, which starts the drain.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let poll_interval = self.config.poll_interval();
        let mut consecutive_errors: u32 = 0;

        info!(worker_id = %self.worker_id, "producer started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self
                .staging
                .claim(&self.worker_id, self.config.max_batch_size)
                .await
            {
                Ok(claimed) if claimed.is_empty() => {
                    consecutive_errors = 0;
                    Some(poll_interval)
                }
                Ok(claimed) => {
                    consecutive_errors = 0;
                    let full = claimed.len() >= self.config.max_batch_size;
                    self.counters.record_claimed(claimed.len() as u64);
                    debug!(count = claimed.len(), "claimed events");
                    if !self.forward(claimed, &mut shutdown).await {
                        break;
                    }
                    // A full claim means more is probably ready.
                    if full { None } else { Some(poll_interval) }
                }
                Err(err) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let pause = doubling_pause(poll_interval, consecutive_errors);
                    warn!(error = %err, pause_ms = pause.as_millis() as u64, "claim failed");
                    Some(pause)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
        info!(worker_id = %self.worker_id, "producer stopped");
    }

    /// Hand claimed events to the processors, waiting for capacity.
    ///
    /// Returns `false` when shutdown interrupted the hand-off; everything not
    /// yet sent has then been released.
    async fn forward(&self, claimed: Vec<ClaimedEvent>, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut pending = claimed.into_iter();
        while let Some(event) = pending.next() {
            let claim = event.claim;
            let sent = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => false,
                res = self.output.send(event) => res.is_ok(),
            };
            if !sent {
                let unsent: Vec<Claim> = std::iter::once(claim)
                    .chain(pending.by_ref().map(|e| e.claim))
                    .collect();
                self.release(&unsent).await;
                return false;
            }
        }
        true
    }

    async fn release(&self, claims: &[Claim]) {
        match self.staging.release(claims).await {
            Ok(n) => {
                debug!(count = n, "released unsent events");
                self.counters.record_released(n as u64);
            }
            Err(err) => error!(count = claims.len(), error = %err, "failed to release unsent events"),
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender means the handle is gone; treat it as shutdown.
    let _ = shutdown.wait_for(|stop| *stop).await;
}
