//! Lease keeping for the claims this instance holds.
//!
//! [`LeasedStaging`] wraps the staging store every stage uses. Claims enter
//! the held set when they are claimed and leave it when a stage settles them,
//! whatever the outcome. The maintenance task renews the whole held set well
//! inside the lease, so an event that sits in a channel or a slow batch is
//! never reclaimed by the expiry sweep while this instance is still working
//! on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use herald_core::{DeliveryId, WorkerId};
use herald_events::Event;

use crate::error::StoreError;
use crate::idempotency::IdempotencyStore;
use crate::staging::{Claim, ClaimToken, ClaimedEvent, StagingStats, StagingStore};

/// Staging store decorator that remembers which claims are in flight.
pub(crate) struct LeasedStaging {
    inner: Arc<dyn StagingStore>,
    held: Mutex<HashMap<DeliveryId, ClaimToken>>,
}

impl LeasedStaging {
    pub(crate) fn new(inner: Arc<dyn StagingStore>) -> Self {
        Self {
            inner,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Claims currently in flight.
    pub(crate) fn held(&self) -> Vec<Claim> {
        self.held
            .lock()
            .map(|held| held.iter().map(|(id, token)| Claim::new(*id, *token)).collect())
            .unwrap_or_default()
    }

    /// Restart the lease of every held claim. Returns `(held, renewed)`;
    /// a shortfall means some claims were lost to another owner.
    pub(crate) async fn renew_held(&self) -> Result<(usize, usize), StoreError> {
        let held = self.held();
        if held.is_empty() {
            return Ok((0, 0));
        }
        let renewed = self.inner.renew(&held).await?;
        Ok((held.len(), renewed))
    }

    fn track(&self, claims: impl IntoIterator<Item = Claim>) {
        if let Ok(mut held) = self.held.lock() {
            held.extend(claims.into_iter().map(|c| (c.delivery_id, c.token)));
        }
    }

    fn forget(&self, claims: &[Claim]) {
        if let Ok(mut held) = self.held.lock() {
            for claim in claims {
                if held.get(&claim.delivery_id) == Some(&claim.token) {
                    held.remove(&claim.delivery_id);
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl StagingStore for LeasedStaging {
    async fn publish(&self, event: Event) -> Result<DeliveryId, StoreError> {
        self.inner.publish(event).await
    }

    async fn claim(&self, owner: &WorkerId, max_n: usize) -> Result<Vec<ClaimedEvent>, StoreError> {
        let claimed = self.inner.claim(owner, max_n).await?;
        self.track(claimed.iter().map(|c| c.claim));
        Ok(claimed)
    }

    async fn ack(&self, claim: Claim) -> Result<(), StoreError> {
        let result = self.inner.ack(claim).await;
        self.forget(&[claim]);
        result
    }

    async fn reinsert(&self, claim: Claim, event: Event, not_before: DateTime<Utc>) -> Result<(), StoreError> {
        let result = self.inner.reinsert(claim, event, not_before).await;
        self.forget(&[claim]);
        result
    }

    async fn release(&self, claims: &[Claim]) -> Result<usize, StoreError> {
        let result = self.inner.release(claims).await;
        self.forget(claims);
        result
    }

    async fn renew(&self, claims: &[Claim]) -> Result<usize, StoreError> {
        self.inner.renew(claims).await
    }

    async fn release_owned(&self, owner: &WorkerId) -> Result<usize, StoreError> {
        let released = self.inner.release_owned(owner).await?;
        if let Ok(mut held) = self.held.lock() {
            held.clear();
        }
        Ok(released)
    }

    async fn release_expired(&self, lease: Duration) -> Result<usize, StoreError> {
        self.inner.release_expired(lease).await
    }

    async fn stats(&self) -> Result<StagingStats, StoreError> {
        self.inner.stats().await
    }
}

/// Periodic upkeep: lease renewal, the expiry sweep for claims abandoned by
/// crashed instances, and purging expired idempotency records.
pub(crate) struct Maintenance {
    pub leases: Arc<LeasedStaging>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub lease: Duration,
    pub purge_interval: Duration,
}

impl Maintenance {
    /// Renewal runs three times per lease so one missed tick never lets a
    /// held claim expire.
    pub(crate) fn renew_interval(&self) -> Duration {
        (self.lease / 3).max(Duration::from_millis(1))
    }

    pub(crate) async fn run(self, mut stop: watch::Receiver<bool>) {
        let renew_every = self.renew_interval();
        let mut renew = tokio::time::interval_at(Instant::now() + renew_every, renew_every);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let purge_every = self.purge_interval.max(Duration::from_millis(1));
        let mut purge = tokio::time::interval_at(Instant::now() + purge_every, purge_every);
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(renew_ms = renew_every.as_millis() as u64, "maintenance started");
        loop {
            tokio::select! {
                _ = async { let _ = stop.wait_for(|stop| *stop).await; } => break,
                _ = renew.tick() => self.keep_leases().await,
                _ = purge.tick() => self.purge_idempotency().await,
            }
        }
        info!("maintenance stopped");
    }

    async fn keep_leases(&self) {
        match self.leases.renew_held().await {
            Ok((held, renewed)) if renewed < held => {
                warn!(held, renewed, "some in-flight claims were lost before renewal")
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "lease renewal failed"),
        }
        match self.leases.release_expired(self.lease).await {
            Ok(0) => {}
            Ok(n) => warn!(count = n, lease_ms = self.lease.as_millis() as u64, "released expired claims"),
            Err(err) => warn!(error = %err, "lease sweep failed"),
        }
    }

    async fn purge_idempotency(&self) {
        match self.idempotency.purge_expired().await {
            Ok(0) => {}
            Ok(n) => debug!(count = n, "purged expired idempotency records"),
            Err(err) => warn!(error = %err, "idempotency purge failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::{IdempotencyKey, InMemoryIdempotencyStore};
    use crate::staging::InMemoryStagingStore;
    use herald_core::{CorrelationId, EventId};
    use herald_events::{Category, EventName, Priority};
    use serde_json::json;

    fn event(id: &str) -> Event {
        Event::new(
            EventName::new("report.export.requested").unwrap(),
            "reports",
            Category::Domain,
            Priority::Low,
            CorrelationId::new("corr-1").unwrap(),
            json!({}),
        )
        .with_id(EventId::new(id).unwrap())
    }

    fn owner() -> WorkerId {
        WorkerId::new("node-a").unwrap()
    }

    #[tokio::test]
    async fn settled_claims_leave_the_held_set() {
        let inner = InMemoryStagingStore::arc();
        let leased = LeasedStaging::new(inner.clone());
        for id in ["a", "b", "c"] {
            leased.publish(event(id)).await.unwrap();
        }
        let claimed = leased.claim(&owner(), 10).await.unwrap();
        assert_eq!(leased.held().len(), 3);

        leased.ack(claimed[0].claim).await.unwrap();
        leased
            .reinsert(claimed[1].claim, claimed[1].event.clone(), Utc::now())
            .await
            .unwrap();
        assert_eq!(leased.held(), vec![claimed[2].claim]);

        leased.release(&[claimed[2].claim]).await.unwrap();
        assert!(leased.held().is_empty());
        assert_eq!(inner.stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn failed_settlement_still_stops_renewal() {
        let inner = InMemoryStagingStore::arc();
        let leased = LeasedStaging::new(inner.clone());
        leased.publish(event("a")).await.unwrap();
        let claimed = leased.claim(&owner(), 1).await.unwrap().remove(0);

        inner.set_unavailable(true);
        assert!(leased.ack(claimed.claim).await.is_err());
        inner.set_unavailable(false);
        assert!(leased.held().is_empty());
        assert_eq!(leased.renew_held().await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn renewal_outlives_the_expiry_sweep() {
        let inner = InMemoryStagingStore::arc();
        let leased = Arc::new(LeasedStaging::new(inner.clone()));
        leased.publish(event("slow")).await.unwrap();
        leased.claim(&owner(), 1).await.unwrap();

        let maintenance = Maintenance {
            leases: leased.clone(),
            idempotency: InMemoryIdempotencyStore::arc(),
            lease: Duration::from_millis(60),
            purge_interval: Duration::from_secs(60),
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(maintenance.run(stop_rx));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(inner.stats().await.unwrap().claimed, 1);
        assert_eq!(leased.held().len(), 1);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_claims_are_swept_after_the_lease() {
        let inner = InMemoryStagingStore::arc();
        inner.publish(event("orphan")).await.unwrap();
        inner.claim(&WorkerId::new("crashed").unwrap(), 1).await.unwrap();

        let maintenance = Maintenance {
            leases: Arc::new(LeasedStaging::new(inner.clone())),
            idempotency: InMemoryIdempotencyStore::arc(),
            lease: Duration::from_millis(30),
            purge_interval: Duration::from_secs(60),
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(maintenance.run(stop_rx));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(inner.stats().await.unwrap().pending, 1);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn expired_idempotency_records_are_purged() {
        let dedup = InMemoryIdempotencyStore::arc();
        for i in 0..10 {
            let key = IdempotencyKey::new(
                EventId::new(format!("evt-{i}")).unwrap(),
                CorrelationId::new("corr-1").unwrap(),
            );
            dedup
                .insert_if_absent(&key, DeliveryId::new(), Duration::from_millis(1))
                .await
                .unwrap();
        }

        let maintenance = Maintenance {
            leases: Arc::new(LeasedStaging::new(InMemoryStagingStore::arc())),
            idempotency: dedup.clone(),
            lease: Duration::from_secs(60),
            purge_interval: Duration::from_millis(10),
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(maintenance.run(stop_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(dedup.is_empty());

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
