use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::warn;

use herald_core::EventId;

use super::{DlqFilter, DlqRecord, DlqStats, DlqStore};
use crate::error::StoreError;

/// In-memory dead-letter store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDlqStore {
    records: RwLock<HashMap<EventId, DlqRecord>>,
    unavailable: AtomicBool,
}

impl InMemoryDlqStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage: every call fails with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::unavailable("dead-letter store offline"))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl DlqStore for InMemoryDlqStore {
    async fn insert(&self, record: DlqRecord) -> Result<(), StoreError> {
        self.check()?;
        let mut records = self.records.write().map_err(|_| StoreError::poisoned())?;
        if let Some(previous) = records.insert(record.event_id.clone(), record) {
            warn!(event_id = %previous.event_id, "replaced existing dead-letter record");
        }
        Ok(())
    }

    async fn get(&self, event_id: &EventId) -> Result<Option<DlqRecord>, StoreError> {
        self.check()?;
        let records = self.records.read().map_err(|_| StoreError::poisoned())?;
        Ok(records.get(event_id).cloned())
    }

    async fn list(&self, filter: &DlqFilter) -> Result<Vec<DlqRecord>, StoreError> {
        self.check()?;
        let records = self.records.read().map_err(|_| StoreError::poisoned())?;
        let mut matching: Vec<DlqRecord> = records
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.failed_at
                .cmp(&b.failed_at)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        matching.truncate(filter.effective_limit());
        Ok(matching)
    }

    async fn take(&self, event_id: &EventId) -> Result<Option<DlqRecord>, StoreError> {
        self.check()?;
        let mut records = self.records.write().map_err(|_| StoreError::poisoned())?;
        Ok(records.remove(event_id))
    }

    async fn stats(&self) -> Result<DlqStats, StoreError> {
        self.check()?;
        let records = self.records.read().map_err(|_| StoreError::poisoned())?;
        let mut stats = DlqStats {
            total: records.len(),
            ..Default::default()
        };
        for record in records.values() {
            *stats.by_reason.entry(record.reason.kind()).or_default() += 1;
            stats.oldest_failed_at = Some(match stats.oldest_failed_at {
                Some(oldest) => oldest.min(record.failed_at),
                None => record.failed_at,
            });
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::{DlqReason, DlqReasonKind};
    use chrono::{Duration, Utc};
    use herald_core::CorrelationId;
    use herald_events::{Category, Event, EventName, Priority};
    use serde_json::json;

    fn record(id: &str, reason: DlqReason, age_secs: i64) -> DlqRecord {
        let event = Event::new(
            EventName::new("integration.http.sent").unwrap(),
            "gateway",
            Category::Integration,
            Priority::Normal,
            CorrelationId::new("corr-1").unwrap(),
            json!({}),
        )
        .with_id(EventId::new(id).unwrap());
        DlqRecord::new(event, reason, Utc::now() - Duration::seconds(age_secs))
    }

    #[tokio::test]
    async fn list_filters_and_orders_oldest_first() {
        let store = InMemoryDlqStore::new();
        store.insert(record("evt-new", DlqReason::MaxRetriesExceeded, 1)).await.unwrap();
        store.insert(record("evt-old", DlqReason::MaxRetriesExceeded, 100)).await.unwrap();
        store.insert(record("evt-bad", DlqReason::InvalidSchema("x".into()), 50)).await.unwrap();

        let all = store.list(&DlqFilter::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.event_id.as_str()).collect();
        assert_eq!(ids, vec!["evt-old", "evt-bad", "evt-new"]);

        let exhausted = store
            .list(&DlqFilter::reason(DlqReasonKind::MaxRetriesExceeded))
            .await
            .unwrap();
        assert_eq!(exhausted.len(), 2);

        let limited = store
            .list(&DlqFilter { limit: Some(1), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(limited[0].event_id.as_str(), "evt-old");
    }

    #[tokio::test]
    async fn take_is_single_shot() {
        let store = InMemoryDlqStore::new();
        store.insert(record("evt-1", DlqReason::UnknownHandler, 0)).await.unwrap();
        let id = EventId::new("evt-1").unwrap();

        assert!(store.take(&id).await.unwrap().is_some());
        assert!(store.take(&id).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn stats_count_by_reason() {
        let store = InMemoryDlqStore::new();
        store.insert(record("a", DlqReason::MaxRetriesExceeded, 10)).await.unwrap();
        store.insert(record("b", DlqReason::MaxRetriesExceeded, 5)).await.unwrap();
        store.insert(record("c", DlqReason::Rejected("no".into()), 1)).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_reason[&DlqReasonKind::MaxRetriesExceeded], 2);
        assert_eq!(stats.by_reason[&DlqReasonKind::Rejected], 1);
        assert!(stats.oldest_failed_at.is_some());
    }
}
