use crate::core::record::JobRecord;
use crate::core::store::{Claim, JobFilter, Query, QueueSwap, RecordStore, StoreError};
use crate::core::{DateTime, JobId};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A non-durable [`RecordStore`] kept in process memory. Useful for tests and for embedding the
/// coordinator where persistence isn't needed. Clones share the same rows.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    rows: Arc<RwLock<BTreeMap<JobId, JobRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<JobId, JobRecord>>, StoreError> {
        self.rows
            .read()
            .map_err(|_| anyhow::anyhow!("Lock is poisoned").into())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<JobId, JobRecord>>, StoreError> {
        self.rows
            .write()
            .map_err(|_| anyhow::anyhow!("Lock is poisoned").into())
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryStore {
    async fn find_by_job_id(&self, job_id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.read()?.get(job_id).cloned())
    }

    async fn create(&self, record: &JobRecord) -> Result<JobRecord, StoreError> {
        let mut rows = self.write()?;
        if rows.contains_key(&record.job_id) {
            return Err(StoreError::DuplicateKey(record.job_id.clone()));
        }
        rows.insert(record.job_id.clone(), record.clone());
        Ok(record.clone())
    }

    async fn update(&self, record: &JobRecord) -> Result<JobRecord, StoreError> {
        let mut rows = self.write()?;
        match rows.get_mut(&record.job_id) {
            Some(row) => {
                *row = record.clone();
                Ok(record.clone())
            }
            None => Err(StoreError::NotFound(record.job_id.clone())),
        }
    }

    async fn delete(&self, job_id: &JobId) -> Result<(), StoreError> {
        self.write()?.remove(job_id);
        Ok(())
    }

    async fn delete_where(&self, filter: &JobFilter, now: DateTime) -> Result<u64, StoreError> {
        let mut rows = self.write()?;
        let before = rows.len();
        rows.retain(|_, record| !filter.matches(record, now));
        Ok((before - rows.len()) as u64)
    }

    async fn count_at(&self, filter: &JobFilter, now: DateTime) -> Result<u64, StoreError> {
        let rows = self.read()?;
        Ok(rows.values().filter(|r| filter.matches(r, now)).count() as u64)
    }

    async fn query_at(&self, query: &Query, now: DateTime) -> Result<Vec<JobRecord>, StoreError> {
        let mut selected: Vec<JobRecord> = self
            .read()?
            .values()
            .filter(|r| query.filter.matches(r, now))
            .cloned()
            .collect();
        query.effective_order().sort(&mut selected, now);
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(selected.into_iter().skip(offset).take(limit).collect())
    }

    async fn swap_queue(&self, swap: &QueueSwap) -> Result<Claim, StoreError> {
        let mut rows = self.write()?;
        match rows.get_mut(&swap.job_id) {
            Some(row) if row.queue_name == swap.from_queue => {
                row.queue_name = swap.to_queue.clone();
                row.scheduled_at = swap.scheduled_at;
                Ok(Claim::Claimed)
            }
            _ => Ok(Claim::Lost),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::{Duration, Utc};
    use crate::core::ordering::Order;

    fn record(id: &str, priority: Option<i32>, enqueued_at: DateTime) -> JobRecord {
        JobRecord {
            job_id: JobId::from(id),
            job_class: "test".to_string(),
            arguments: "[]".to_string(),
            queue_name: "default".to_string(),
            priority,
            executions: 0,
            exception_executions: "{}".to_string(),
            enqueued_at,
            scheduled_at: None,
            locale: "en".to_string(),
            timezone: "UTC".to_string(),
        }
    }

    #[tokio::test]
    async fn crud() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let r = record("a", None, now);

        store.create(&r).await.unwrap();
        assert!(matches!(
            store.create(&r).await,
            Err(StoreError::DuplicateKey(_))
        ));

        let mut updated = r.clone();
        updated.executions = 1;
        store.update(&updated).await.unwrap();
        assert_eq!(store.find_by_job_id(&r.job_id).await.unwrap(), Some(updated));

        store.delete(&r.job_id).await.unwrap();
        store.delete(&r.job_id).await.unwrap();
        assert!(matches!(store.update(&r).await, Err(StoreError::NotFound(_))));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pages_through_a_single_order() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.create(&record("a", None, now - Duration::seconds(3))).await.unwrap();
        store.create(&record("b", Some(1), now - Duration::seconds(2))).await.unwrap();
        store.create(&record("c", Some(1), now - Duration::seconds(1))).await.unwrap();

        let query = Query::ready().limit(2);
        let first = store.query(&query).await.unwrap();
        let second = store.query(&query.clone().offset(2)).await.unwrap();
        let ids: Vec<_> = first
            .iter()
            .chain(second.iter())
            .map(|r| r.job_id.as_str())
            .collect();
        assert_eq!(ids, ["b", "c", "a"]);

        let implicit = store.query(&Query::default().order(Order::Implicit)).await.unwrap();
        assert_eq!(implicit[0].job_id.as_str(), "a");
    }

    #[tokio::test]
    async fn swap_queue_succeeds_once() {
        let store = MemoryStore::new();
        let r = record("a", None, Utc::now());
        store.create(&r).await.unwrap();
        let swap = QueueSwap {
            job_id: r.job_id.clone(),
            from_queue: "default".to_string(),
            to_queue: "claimed-default".to_string(),
            scheduled_at: Some(Utc::now()),
        };
        assert_eq!(store.swap_queue(&swap).await.unwrap(), Claim::Claimed);
        assert_eq!(store.swap_queue(&swap).await.unwrap(), Claim::Lost);
    }
}
