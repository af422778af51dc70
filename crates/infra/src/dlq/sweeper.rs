//! Periodic replay of dead letters whose last failure was transient.

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{DlqFilter, DlqReasonKind, DlqRouter};
use crate::chrono_duration;
use crate::config::DlqSweepConfig;
use crate::error::StoreError;

/// Replays `max_retries_exceeded` records that failed transiently, are older
/// than `min_age`, and have not been auto-replayed `max_auto_replays` times.
#[derive(Debug, Clone)]
pub struct DlqSweeper {
    router: DlqRouter,
    config: DlqSweepConfig,
}

impl DlqSweeper {
    pub fn new(router: DlqRouter, config: DlqSweepConfig) -> Self {
        Self { router, config }
    }

    /// One pass; returns how many records were replayed.
    pub async fn sweep_once(&self) -> Result<usize, StoreError> {
        let filter = DlqFilter {
            reason: Some(DlqReasonKind::MaxRetriesExceeded),
            since: None,
            until: Some(Utc::now() - chrono_duration(self.config.min_age())),
            limit: Some(self.config.max_per_sweep),
        };

        let candidates = self.router.list(&filter).await?;
        let mut replayed = 0;
        for record in candidates {
            if !record.is_transient() || record.event.replays() >= self.config.max_auto_replays {
                continue;
            }
            match self.router.replay(&record.event_id).await {
                Ok(receipt) => {
                    debug!(event_id = %receipt.original_event_id, new_event_id = %receipt.new_event_id, "swept");
                    replayed += 1;
                }
                // Replayed or deleted by an operator since the listing.
                Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        if replayed > 0 {
            info!(replayed, "dead-letter sweep replayed records");
        }
        Ok(replayed)
    }

    /// Sweep every `interval` until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        warn!(error = %err, "dead-letter sweep failed");
                    }
                }
            }
        }
    }
}
