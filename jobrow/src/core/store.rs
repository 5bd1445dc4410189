use crate::core::codec::CodecError;
use crate::core::ordering::{self, Order};
use crate::core::record::JobRecord;
use crate::core::{DateTime, JobId, Utc};
use async_trait::async_trait;
use thiserror::Error;

/// Durable table of job records keyed by `job_id`.
///
/// Apart from [`RecordStore::swap_queue`], every mutation is a blind overwrite; the store
/// provides no locking beyond what the storage engine guarantees for single-row conditional
/// updates.
///
/// Methods taking `now` evaluate the due predicate against it; the variants without it use the
/// current time, so re-running a query re-evaluates "now".
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// At most one record, since `job_id` is unique.
    async fn find_by_job_id(&self, job_id: &JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Insert a new record. Fails with [`StoreError::DuplicateKey`] if the `job_id` is taken.
    async fn create(&self, record: &JobRecord) -> Result<JobRecord, StoreError>;

    /// Overwrite the record with the same `job_id`. Fails with [`StoreError::NotFound`] if the row
    /// has been deleted.
    async fn update(&self, record: &JobRecord) -> Result<JobRecord, StoreError>;

    /// Delete a record. Deleting a missing record is a no-op.
    async fn delete(&self, job_id: &JobId) -> Result<(), StoreError>;

    /// Delete every record matching the filter, returning how many were removed.
    async fn delete_where(&self, filter: &JobFilter, now: DateTime) -> Result<u64, StoreError>;

    async fn count_at(&self, filter: &JobFilter, now: DateTime) -> Result<u64, StoreError>;

    async fn query_at(&self, query: &Query, now: DateTime) -> Result<Vec<JobRecord>, StoreError>;

    /// Conditionally move a record from one queue to another, setting `scheduled_at`. Succeeds for
    /// exactly one of several concurrent callers observing the same `from_queue`.
    async fn swap_queue(&self, swap: &QueueSwap) -> Result<Claim, StoreError>;

    async fn delete_all(&self) -> Result<u64, StoreError> {
        self.delete_where(&JobFilter::default(), Utc::now()).await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.count_at(&JobFilter::default(), Utc::now()).await
    }

    async fn filtered_count(&self, filter: &JobFilter) -> Result<u64, StoreError> {
        self.count_at(filter, Utc::now()).await
    }

    async fn query(&self, query: &Query) -> Result<Vec<JobRecord>, StoreError> {
        self.query_at(query, Utc::now()).await
    }
}

/// Outcome of a conditional queue swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Exactly one row was updated.
    Claimed,
    /// No row matched: someone else moved or removed it first.
    Lost,
}

/// Arguments of [`RecordStore::swap_queue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSwap {
    pub job_id: JobId,
    /// The queue the caller observed.
    pub from_queue: String,
    pub to_queue: String,
    pub scheduled_at: Option<DateTime>,
}

/// Criteria for selecting records. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub job_id: Option<JobId>,
    /// Any of these classes.
    pub job_classes: Vec<String>,
    /// Any of these queues.
    pub queue_names: Vec<String>,
    /// Only records that are due.
    pub due: bool,
    /// Skip records whose queue starts with this prefix, e.g. claimed ones.
    pub exclude_queue_prefix: Option<String>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn due() -> Self {
        Self {
            due: true,
            ..Self::default()
        }
    }

    pub fn job_id(job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Self::default()
        }
    }

    pub fn with_job_class(mut self, job_class: impl Into<String>) -> Self {
        self.job_classes.push(job_class.into());
        self
    }

    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_names.push(queue_name.into());
        self
    }

    pub fn only_due(mut self) -> Self {
        self.due = true;
        self
    }

    pub fn without_queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.exclude_queue_prefix = Some(prefix.into());
        self
    }

    /// In-memory evaluation, matching what backends do in SQL.
    pub fn matches(&self, record: &JobRecord, now: DateTime) -> bool {
        self.job_id.as_ref().map_or(true, |id| &record.job_id == id)
            && (self.job_classes.is_empty() || self.job_classes.contains(&record.job_class))
            && (self.queue_names.is_empty() || self.queue_names.contains(&record.queue_name))
            && (!self.due || ordering::is_due(record.scheduled_at, now))
            && self
                .exclude_queue_prefix
                .as_ref()
                .map_or(true, |prefix| !record.queue_name.starts_with(prefix.as_str()))
    }
}

/// A filtered, ordered, paged selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub filter: JobFilter,
    /// `None` orders [`Order::ByDueDate`].
    pub order: Option<Order>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Query {
    pub fn new(filter: JobFilter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    /// Due records in [`Order::Ready`].
    pub fn ready() -> Self {
        Self::new(JobFilter::due()).order(Order::Ready)
    }

    /// Every record, due ones first.
    pub fn ordered() -> Self {
        Self::new(JobFilter::all()).order(Order::ByDueDate)
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn effective_order(&self) -> Order {
        self.order.unwrap_or_default()
    }
}

/// Errors related to record store operation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    #[error("Job by that ID already exists: {0}")]
    DuplicateKey(JobId),
    #[error("Job by that ID does not exist: {0}")]
    NotFound(JobId),
    /// A stored column could not be read back.
    #[error(transparent)]
    InvalidFieldValue(#[from] CodecError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::Duration;

    fn record(queue_name: &str, scheduled_at: Option<DateTime>) -> JobRecord {
        JobRecord {
            job_id: JobId::from("job"),
            job_class: "mailer".to_string(),
            arguments: "[]".to_string(),
            queue_name: queue_name.to_string(),
            priority: None,
            executions: 0,
            exception_executions: "{}".to_string(),
            enqueued_at: Utc::now(),
            scheduled_at,
            locale: "en".to_string(),
            timezone: "UTC".to_string(),
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let now = Utc::now();
        let future = record("default", Some(now + Duration::days(1)));
        assert!(JobFilter::all().matches(&future, now));
        assert!(!JobFilter::due().matches(&future, now));
    }

    #[test]
    fn filters_combine() {
        let now = Utc::now();
        let r = record("q1", None);
        assert!(JobFilter::all().with_queue("q1").with_queue("q2").matches(&r, now));
        assert!(!JobFilter::all().with_queue("q2").matches(&r, now));
        assert!(JobFilter::job_id("job").with_job_class("mailer").matches(&r, now));
        assert!(!JobFilter::job_id("other").matches(&r, now));
        assert!(!JobFilter::all().with_job_class("billing").matches(&r, now));
    }

    #[test]
    fn excluded_queue_prefix() {
        let now = Utc::now();
        let filter = JobFilter::all().without_queue_prefix("claimed-");
        assert!(filter.matches(&record("default", None), now));
        assert!(filter.matches(&record("Claimed-default", None), now));
        assert!(!filter.matches(&record("claimed-default", None), now));
    }

    #[test]
    fn unordered_queries_order_by_due_date() {
        assert_eq!(Query::default().effective_order(), Order::ByDueDate);
        assert_eq!(Query::ready().effective_order(), Order::Ready);
        assert!(Query::ready().filter.due);
    }
}
