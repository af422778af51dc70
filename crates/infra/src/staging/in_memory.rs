use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use herald_core::{DeliveryId, WorkerId};
use herald_events::Event;

use super::{Claim, ClaimToken, ClaimedEvent, StagingStats, StagingStore, stale};
use crate::chrono_duration;
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct Held {
    owner: WorkerId,
    token: ClaimToken,
    at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Row {
    seq: u64,
    event: Event,
    not_before: DateTime<Utc>,
    claim: Option<Held>,
}

impl Row {
    fn held_by(&self, token: ClaimToken) -> bool {
        matches!(&self.claim, Some(held) if held.token == token)
    }
}

#[derive(Debug, Default)]
struct State {
    rows: HashMap<DeliveryId, Row>,
    next_seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Read-only view of a staged row, for tests and debugging.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedEntry {
    pub delivery_id: DeliveryId,
    pub event: Event,
    pub not_before: DateTime<Utc>,
    pub claimed_by: Option<WorkerId>,
}

/// In-memory staging store for tests/dev.
///
/// A single mutex guards all rows, so claims are trivially exclusive within
/// the process. The lock is never held across an await.
#[derive(Debug, Default)]
pub struct InMemoryStagingStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl InMemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage: every operation fails with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn get(&self, delivery_id: DeliveryId) -> Option<StagedEntry> {
        let state = self.state.lock().ok()?;
        state.rows.get(&delivery_id).map(|row| entry(delivery_id, row))
    }

    /// All rows in claim order.
    pub fn entries(&self) -> Vec<StagedEntry> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let mut rows: Vec<(&DeliveryId, &Row)> = state.rows.iter().collect();
        rows.sort_by_key(|(_, row)| row.seq);
        rows.into_iter().map(|(id, row)| entry(*id, row)).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make a scheduled row claimable now.
    #[cfg(test)]
    pub(crate) fn make_due(&self, delivery_id: DeliveryId) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(row) = state.rows.get_mut(&delivery_id) {
                row.not_before = Utc::now();
            }
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("staging store offline"));
        }
        self.state.lock().map_err(|_| StoreError::poisoned())
    }
}

fn entry(delivery_id: DeliveryId, row: &Row) -> StagedEntry {
    StagedEntry {
        delivery_id,
        event: row.event.clone(),
        not_before: row.not_before,
        claimed_by: row.claim.as_ref().map(|held| held.owner.clone()),
    }
}

#[async_trait::async_trait]
impl StagingStore for InMemoryStagingStore {
    async fn publish(&self, event: Event) -> Result<DeliveryId, StoreError> {
        let mut state = self.lock()?;
        let delivery_id = DeliveryId::new();
        let seq = state.next_seq();
        state.rows.insert(
            delivery_id,
            Row {
                seq,
                event,
                not_before: Utc::now(),
                claim: None,
            },
        );
        Ok(delivery_id)
    }

    async fn claim(&self, owner: &WorkerId, max_n: usize) -> Result<Vec<ClaimedEvent>, StoreError> {
        let mut state = self.lock()?;
        let now = Utc::now();

        let mut due: Vec<(u64, DeliveryId)> = state
            .rows
            .iter()
            .filter(|(_, row)| row.claim.is_none() && row.not_before <= now)
            .map(|(id, row)| (row.seq, *id))
            .collect();
        due.sort_unstable();
        due.truncate(max_n);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, delivery_id) in due {
            if let Some(row) = state.rows.get_mut(&delivery_id) {
                let token = ClaimToken::new();
                row.claim = Some(Held {
                    owner: owner.clone(),
                    token,
                    at: now,
                });
                claimed.push(ClaimedEvent {
                    claim: Claim::new(delivery_id, token),
                    event: row.event.clone(),
                    claimed_at: now,
                    malformed: None,
                });
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, claim: Claim) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        match state.rows.get(&claim.delivery_id) {
            None => Ok(()),
            Some(row) if row.held_by(claim.token) => {
                state.rows.remove(&claim.delivery_id);
                Ok(())
            }
            Some(_) => Err(stale(claim)),
        }
    }

    async fn reinsert(&self, claim: Claim, event: Event, not_before: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        // Retries queue behind rows staged since the original publication.
        let seq = state.next_seq();
        match state.rows.get_mut(&claim.delivery_id) {
            Some(row) if row.held_by(claim.token) => {
                *row = Row {
                    seq,
                    event,
                    not_before,
                    claim: None,
                };
                Ok(())
            }
            _ => Err(stale(claim)),
        }
    }

    async fn release(&self, claims: &[Claim]) -> Result<usize, StoreError> {
        let mut state = self.lock()?;
        let mut released = 0;
        for claim in claims {
            if let Some(row) = state.rows.get_mut(&claim.delivery_id) {
                if row.held_by(claim.token) {
                    row.claim = None;
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    async fn renew(&self, claims: &[Claim]) -> Result<usize, StoreError> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let mut renewed = 0;
        for claim in claims {
            if let Some(Held { token, at, .. }) = state
                .rows
                .get_mut(&claim.delivery_id)
                .and_then(|row| row.claim.as_mut())
            {
                if *token == claim.token {
                    *at = now;
                    renewed += 1;
                }
            }
        }
        Ok(renewed)
    }

    async fn release_owned(&self, owner: &WorkerId) -> Result<usize, StoreError> {
        let mut state = self.lock()?;
        let mut released = 0;
        for row in state.rows.values_mut() {
            if matches!(&row.claim, Some(held) if &held.owner == owner) {
                row.claim = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn release_expired(&self, lease: Duration) -> Result<usize, StoreError> {
        let mut state = self.lock()?;
        let cutoff = Utc::now() - chrono_duration(lease);
        let mut released = 0;
        for row in state.rows.values_mut() {
            if matches!(&row.claim, Some(held) if held.at <= cutoff) {
                row.claim = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn stats(&self) -> Result<StagingStats, StoreError> {
        let state = self.lock()?;
        let now = Utc::now();
        let mut stats = StagingStats::default();
        for row in state.rows.values() {
            if row.claim.is_some() {
                stats.claimed += 1;
            } else if row.not_before > now {
                stats.scheduled += 1;
            } else {
                stats.pending += 1;
            }
        }
        Ok(stats)
    }
}
