use crate::core::config::WorkerConfig;
use crate::core::coordinator::{Coordinator, CoordinatorError, Outcome};
use crate::core::mixins::LogError;
use crate::core::ordering::Order;
use crate::core::store::{JobFilter, Query, RecordStore};
use crate::core::{CancellationToken, Duration};
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::sync::Semaphore;

pub const JITTER_INTERVAL_MS: [i64; 10] = [0, 1, 1, 2, 3, 5, 8, 13, 21, 34];

/// How many ready jobs one poll looks at before giving up.
const POLL_BATCH: usize = 10;

/// A bridge between registered jobs and the record store.
///
/// ## Implementation
///
/// - It creates a semaphore with permits count equal to desired concurrency
/// - For every available permit, a listener is spawned that:
///     - Takes the first ready job from the configured queues and executes it with a claim
///     - Sleeps for the poll interval plus random jitter when nothing is ready
///     - Gives back the permit once cancelled
///
/// Claimed jobs are never selected, so any number of workers can share a store.
///
/// ## Examples
/// See `jobrow-sqlite` for examples.
pub struct Worker<S> {
    coordinator: Arc<Coordinator<S>>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
}

impl<S> Worker<S>
where
    S: RecordStore + 'static,
{
    pub fn new(coordinator: Coordinator<S>, config: WorkerConfig) -> Self {
        Self::with_shared(Arc::new(coordinator), config)
    }

    /// Create a worker around a coordinator that is also used elsewhere, e.g. to enqueue jobs.
    pub fn with_shared(coordinator: Arc<Coordinator<S>>, config: WorkerConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            coordinator,
            config,
            semaphore: Arc::new(Semaphore::new(concurrency)),
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator<S>> {
        &self.coordinator
    }

    /// Jobs this worker is willing to take: due, unclaimed, of a registered class, from one of its
    /// queues.
    pub fn filter(&self) -> JobFilter {
        worker_filter(&self.coordinator, &self.config)
    }

    /// Execute the first ready job. Returns `None` when nothing was executed.
    pub async fn poll_once(&self) -> Result<Option<Outcome>, CoordinatorError> {
        next_outcome(&self.coordinator, &self.filter(), &CancellationToken::new()).await
    }

    /// Execute ready jobs until none are left. Jobs rescheduled for a retry are not due yet, so
    /// they aren't picked up again.
    pub async fn work_off(&self) -> Result<Vec<Outcome>, CoordinatorError> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.poll_once().await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Run listeners until `cancellation_token` is cancelled, then wait for the jobs in flight to
    /// finish. Jobs receive a child of the token, so they can wind down as well.
    pub async fn run(&self, cancellation_token: CancellationToken) -> Result<(), CoordinatorError> {
        let concurrency = self.config.concurrency.max(1);
        let filter = self.filter();
        tracing::info!(
            concurrency,
            job_classes = ?filter.job_classes,
            queues = ?filter.queue_names,
            "Starting worker"
        );
        for _ in 0..concurrency {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| anyhow::anyhow!("Semaphore closed while running: {e}"))
                .map_err(crate::core::store::StoreError::from)?;
            let coordinator = self.coordinator.clone();
            let filter = filter.clone();
            let token = cancellation_token.clone();
            let interval = self.config.poll_interval();
            tokio::spawn(async move {
                let _permit = permit;
                listen(coordinator, filter, interval, token).await;
            });
        }

        cancellation_token.cancelled().await;
        let permits = u32::try_from(concurrency).unwrap_or(u32::MAX);
        let _drained = self
            .semaphore
            .acquire_many(permits)
            .await
            .map_err(|e| anyhow::anyhow!("Semaphore closed while draining: {e}"))
            .map_err(crate::core::store::StoreError::from)?;
        tracing::info!("Worker stopped");
        Ok(())
    }
}

fn worker_filter<S: RecordStore>(coordinator: &Coordinator<S>, config: &WorkerConfig) -> JobFilter {
    JobFilter {
        job_classes: coordinator
            .registry()
            .types()
            .into_iter()
            .map(str::to_string)
            .collect(),
        queue_names: config.queues.clone(),
        exclude_queue_prefix: Some(coordinator.config().claim_prefix.clone())
            .filter(|prefix| !prefix.is_empty()),
        ..JobFilter::due()
    }
}

async fn next_outcome<S: RecordStore>(
    coordinator: &Coordinator<S>,
    filter: &JobFilter,
    cancellation_token: &CancellationToken,
) -> Result<Option<Outcome>, CoordinatorError> {
    let query = Query::new(filter.clone())
        .order(Order::Ready)
        .limit(POLL_BATCH);
    for mut handle in coordinator.query(&query).await? {
        match coordinator
            .execute_with_token(&mut handle, cancellation_token.child_token())
            .await?
        {
            Outcome::Skipped => continue,
            outcome => return Ok(Some(outcome)),
        }
    }
    Ok(None)
}

/// Poll and execute one job at a time until cancelled.
async fn listen<S: RecordStore>(
    coordinator: Arc<Coordinator<S>>,
    filter: JobFilter,
    poll_interval: Duration,
    cancellation_token: CancellationToken,
) {
    while !cancellation_token.is_cancelled() {
        let result = next_outcome(&coordinator, &filter, &cancellation_token).await;
        result.log_error("Failed to execute next job");
        let sleep_for = match result {
            Ok(Some(_)) => continue,
            Ok(None) => poll_interval + get_random_jitter(),
            Err(_) => {
                tracing::warn!("Suspending worker for 5 seconds");
                Duration::seconds(5)
            }
        };
        tokio::select! {
            _ = cancellation_token.cancelled() => break,
            _ = tokio::time::sleep(sleep_for.to_std().unwrap_or_default()) => {}
        }
    }
}

fn get_random_jitter() -> Duration {
    JITTER_INTERVAL_MS
        .choose(&mut rand::thread_rng())
        .map(|ms| Duration::milliseconds(*ms))
        .unwrap_or_else(|| Duration::milliseconds(5)) // Always takes a happy path technically
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::job::{Job, JobContext};
    use crate::core::memory::MemoryStore;
    use crate::core::registry::JobRegistry;
    use crate::core::Utc;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Count {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for Count {
        type Args = ();
        type Error = anyhow::Error;

        async fn perform(&self, _ctx: JobContext, _args: ()) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name() -> &'static str {
            "count"
        }
    }

    fn worker(store: MemoryStore, job: Count, config: WorkerConfig) -> Worker<MemoryStore> {
        let mut registry = JobRegistry::default();
        registry.add_job(job);
        Worker::new(Coordinator::new(store, registry), config)
    }

    #[tokio::test]
    async fn work_off_drains_ready_jobs_from_its_queues() {
        let store = MemoryStore::new();
        let job = Count::default();
        let worker = worker(store.clone(), job.clone(), WorkerConfig::default());
        let coordinator = worker.coordinator();

        for _ in 0..3 {
            coordinator.perform_later::<Count>(()).await.unwrap();
        }
        coordinator
            .perform_at::<Count>((), Utc::now() + Duration::hours(1))
            .await
            .unwrap();
        let mut elsewhere = coordinator.build::<Count>(&()).unwrap();
        elsewhere.job_mut().queue_name = "other".to_string();
        coordinator.enqueue(&mut elsewhere).await.unwrap();

        let outcomes = worker.work_off().await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(job.runs.load(Ordering::SeqCst), 3);
        assert_eq!(store.count().await.unwrap(), 2);
        assert!(worker.poll_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claimed_jobs_do_not_hide_ready_ones() {
        let store = MemoryStore::new();
        let job = Count::default();
        let config = WorkerConfig {
            queues: vec![],
            ..WorkerConfig::default()
        };
        let worker = worker(store.clone(), job.clone(), config);
        let coordinator = worker.coordinator();

        // Held by workers that never came back.
        for _ in 0..POLL_BATCH {
            let handle = coordinator.perform_later::<Count>(()).await.unwrap();
            assert!(coordinator.claim(&handle).await.unwrap().is_some());
        }
        coordinator.perform_later::<Count>(()).await.unwrap();

        assert!(worker.poll_once().await.unwrap().is_some());
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
        assert_eq!(store.count().await.unwrap(), POLL_BATCH as u64);
        assert!(worker.poll_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_stops_when_cancelled() {
        let store = MemoryStore::new();
        let job = Count::default();
        let config = WorkerConfig {
            poll_interval_ms: 10,
            concurrency: 2,
            ..WorkerConfig::default()
        };
        let worker = Arc::new(worker(store.clone(), job.clone(), config));
        for _ in 0..5 {
            worker.coordinator().perform_later::<Count>(()).await.unwrap();
        }

        let token = CancellationToken::new();
        let handle = {
            let worker = worker.clone();
            let token = token.clone();
            tokio::spawn(async move { worker.run(token).await })
        };

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while store.count().await.unwrap() > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        token.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(job.runs.load(Ordering::SeqCst), 5);
    }
}
