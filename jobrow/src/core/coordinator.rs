use crate::core::codec::{CodecError, Codecs};
use crate::core::config::{DiscardPolicy, QueueConfig};
use crate::core::hooks::HookRegistry;
use crate::core::job::{Job, JobContext, JobError};
use crate::core::job_handle::{DoubleBinding, ExecutionHandle, JobInstance};
use crate::core::registry::{BoxedJob, JobRegistry};
use crate::core::store::{Claim, JobFilter, Query, QueueSwap, RecordStore, StoreError};
use crate::core::{CancellationToken, DateTime, JobId, Utc};
use chrono::SubsecRound;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

/// Result of executing one job.
#[derive(Debug)]
pub enum Outcome {
    /// The job succeeded and its record was deleted.
    Completed,
    /// The job failed within its attempt budget; the record was updated and rescheduled.
    Retrying {
        executions: u32,
        scheduled_at: DateTime,
    },
    /// The job failed for the last time and was discarded.
    Discarded { error: JobError },
    /// Another worker claimed the job first. Nothing was executed.
    Skipped,
}

/// Fatal coordinator errors. Job failures are not errors, they are reported as an [`Outcome`].
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    DoubleBinding(#[from] DoubleBinding),
    /// After execution the record was neither destroyed nor left retry-incremented and otherwise
    /// unchanged. The executor and the store have desynchronized.
    #[error("Job {job_id} was neither destroyed nor updated after execution: {reason}")]
    InvariantViolation { job_id: JobId, reason: String },
    #[error("Job {0} has no record to execute")]
    NotEnqueued(JobId),
    #[error("Claim on job {0} was passed with another job")]
    ForeignClaim(JobId),
    #[error("after_discard hook failed")]
    Hook(#[source] anyhow::Error),
}

/// A claim held on a record, returned by [`Coordinator::claim`]. Remembers where the record was
/// before it was claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldClaim {
    job_id: JobId,
    queue_name: String,
    scheduled_at: Option<DateTime>,
}

impl HeldClaim {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// The queue the record is returned to on release.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

/// Applies enqueues and execution outcomes to a [`RecordStore`].
///
/// This is the queue adapter handed to producers and workers; nothing about it is global.
pub struct Coordinator<S> {
    store: S,
    registry: Arc<JobRegistry>,
    hooks: Arc<HookRegistry>,
    codecs: Codecs,
    config: QueueConfig,
}

impl<S> Coordinator<S>
where
    S: RecordStore,
{
    pub fn new(store: S, registry: JobRegistry) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            hooks: Arc::new(HookRegistry::default()),
            codecs: Codecs::default(),
            config: QueueConfig::default(),
        }
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn with_codecs(mut self, codecs: Codecs) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn codecs(&self) -> &Codecs {
        &self.codecs
    }

    /// Build an unbound handle for a new job of type `J`.
    pub fn build<J>(&self, args: &J::Args) -> Result<ExecutionHandle, CoordinatorError>
    where
        J: Job + 'static,
        J::Args: Serialize,
    {
        let job = JobInstance::new::<J>(args, &self.config)?;
        Ok(ExecutionHandle::new(job))
    }

    /// Enqueue a new job of type `J` for immediate execution.
    pub async fn perform_later<J>(&self, args: J::Args) -> Result<ExecutionHandle, CoordinatorError>
    where
        J: Job + 'static,
        J::Args: Serialize,
    {
        let mut handle = self.build::<J>(&args)?;
        self.enqueue(&mut handle).await?;
        Ok(handle)
    }

    /// Enqueue a new job of type `J` to run no earlier than `scheduled_at`.
    pub async fn perform_at<J>(
        &self,
        args: J::Args,
        scheduled_at: DateTime,
    ) -> Result<ExecutionHandle, CoordinatorError>
    where
        J: Job + 'static,
        J::Args: Serialize,
    {
        let mut handle = self.build::<J>(&args)?;
        self.enqueue_at(&mut handle, Some(scheduled_at)).await?;
        Ok(handle)
    }

    pub async fn enqueue(&self, handle: &mut ExecutionHandle) -> Result<(), CoordinatorError> {
        self.enqueue_at(handle, None).await
    }

    /// Create or update the record for this job and bind the handle to it.
    ///
    /// - A bound handle updates its row in place. If the row was deleted in the meantime it is
    ///   recreated and the handle rebound to it.
    /// - An unbound handle updates the row with the same `job_id` if there is one, creates it
    ///   otherwise, and gets bound.
    ///
    /// Enqueuing the same job any number of times never produces a second row.
    #[instrument(skip_all, err, fields(job_id = %handle.id(), scheduled_at = ?scheduled_at))]
    pub async fn enqueue_at(
        &self,
        handle: &mut ExecutionHandle,
        scheduled_at: Option<DateTime>,
    ) -> Result<(), CoordinatorError> {
        {
            let job = handle.job_mut();
            job.enqueued_at = timestamp(Utc::now());
            job.scheduled_at = scheduled_at.map(timestamp);
        }
        let record = handle.job().to_record(&self.codecs)?;

        if handle.is_bound() {
            let persisted = match self.store.update(&record).await {
                Ok(persisted) => persisted,
                Err(StoreError::NotFound(_)) => {
                    tracing::debug!("Bound record is gone, recreating it");
                    self.store.create(&record).await?
                }
                Err(e) => return Err(e.into()),
            };
            handle.rebind(persisted);
        } else {
            let persisted = match self.store.find_by_job_id(&record.job_id).await? {
                Some(_) => self.store.update(&record).await?,
                None => match self.store.create(&record).await {
                    Ok(persisted) => persisted,
                    Err(StoreError::DuplicateKey(_)) => self.store.update(&record).await?,
                    Err(e) => return Err(e.into()),
                },
            };
            handle.bind(persisted)?;
        }
        Ok(())
    }

    pub async fn execute(&self, handle: &mut ExecutionHandle) -> Result<Outcome, CoordinatorError> {
        self.execute_with_token(handle, CancellationToken::new()).await
    }

    /// Execute the job bound to `handle` and apply the outcome to its record:
    ///
    /// - success deletes the record
    /// - a failure within the attempt budget re-enqueues it with a backoff
    /// - the last allowed failure discards it
    ///
    /// With `claim_before_perform` the record is claimed first; losing the claim skips the job.
    /// A claim is released before any failure is handled, so discard hooks observe the original
    /// queue. To execute a job you already claimed, use [`Coordinator::execute_claimed`].
    #[instrument(skip_all, err, fields(job_id = %handle.id()))]
    pub async fn execute_with_token(
        &self,
        handle: &mut ExecutionHandle,
        cancellation_token: CancellationToken,
    ) -> Result<Outcome, CoordinatorError> {
        let job = self.registry.resolve(&handle.job().job_class)?;
        self.ensure_bound(handle).await?;

        let claim = if self.config.claim_before_perform {
            if self.config.is_claimed(&handle.job().queue_name) {
                tracing::debug!("Job is already claimed, skipping");
                return Ok(Outcome::Skipped);
            }
            match self.claim(handle).await? {
                Some(claim) => Some(claim),
                None => {
                    tracing::debug!("Lost the claim, skipping");
                    return Ok(Outcome::Skipped);
                }
            }
        } else {
            None
        };
        self.perform(job, handle, claim, cancellation_token).await
    }

    /// Execute a job whose claim the caller already holds, from [`Coordinator::claim`].
    ///
    /// The outcome is applied exactly as in [`Coordinator::execute`], including releasing the
    /// claim before a failure is handled. `claim_before_perform` is not consulted.
    #[instrument(skip_all, err, fields(job_id = %handle.id()))]
    pub async fn execute_claimed(
        &self,
        handle: &mut ExecutionHandle,
        claim: HeldClaim,
        cancellation_token: CancellationToken,
    ) -> Result<Outcome, CoordinatorError> {
        if &claim.job_id != handle.id() {
            return Err(CoordinatorError::ForeignClaim(claim.job_id));
        }
        let job = self.registry.resolve(&handle.job().job_class)?;
        self.ensure_bound(handle).await?;
        self.perform(job, handle, Some(claim), cancellation_token).await
    }

    async fn ensure_bound(&self, handle: &mut ExecutionHandle) -> Result<(), CoordinatorError> {
        if handle.is_destroyed() {
            return Err(CoordinatorError::NotEnqueued(handle.id().clone()));
        }
        if !handle.is_bound() {
            match self.store.find_by_job_id(handle.id()).await? {
                Some(record) => handle.bind(record)?,
                None => return Err(CoordinatorError::NotEnqueued(handle.id().clone())),
            }
        }
        Ok(())
    }

    async fn perform(
        &self,
        job: &BoxedJob,
        handle: &mut ExecutionHandle,
        claim: Option<HeldClaim>,
        cancellation_token: CancellationToken,
    ) -> Result<Outcome, CoordinatorError> {
        let queue_name = match &claim {
            Some(claim) => claim.queue_name.clone(),
            None => handle.job().queue_name.clone(),
        };
        handle.job_mut().executions += 1;
        let executions = handle.job().executions;
        let ctx = JobContext {
            job_id: handle.id().clone(),
            job_class: handle.job().job_class.clone(),
            queue_name: queue_name.clone(),
            executions,
            locale: handle.job().locale.clone(),
            timezone: handle.job().timezone.clone(),
            cancellation_token,
        };

        let outcome = match job.perform(ctx, handle.job().arguments.clone()).await {
            Ok(()) => {
                self.complete(handle).await?;
                Outcome::Completed
            }
            Err(error) => {
                tracing::error!("Error during job execution: {}", error);
                if let Some(claim) = &claim {
                    self.release(claim).await?;
                    handle.job_mut().queue_name = queue_name;
                }
                *handle
                    .job_mut()
                    .exception_executions
                    .entry(error.kind().to_string())
                    .or_insert(0) += 1;

                if executions < job.max_attempts() {
                    let retry_at = Utc::now() + job.backoff(executions);
                    self.enqueue_at(handle, Some(retry_at)).await?;
                    let scheduled_at = handle.job().scheduled_at.unwrap_or(retry_at);
                    tracing::warn!(%scheduled_at, executions, "Retrying job {}", handle.id());
                    Outcome::Retrying {
                        executions,
                        scheduled_at,
                    }
                } else {
                    tracing::warn!(executions, "Discarding job {}", handle.id());
                    self.discard_inner(handle, Some(&error), true).await?;
                    Outcome::Discarded { error }
                }
            }
        };

        self.verify_settled(handle, executions).await?;
        Ok(outcome)
    }

    /// Claim the record bound to `handle` by moving it to the claimed queue. Exactly one of
    /// several concurrent claims on the same record succeeds; the others get `None`.
    ///
    /// The returned claim is given back with [`Coordinator::execute_claimed`] or
    /// [`Coordinator::release`]. Until then no worker will execute the record.
    #[instrument(skip_all, err, fields(job_id = %handle.id()))]
    pub async fn claim(
        &self,
        handle: &ExecutionHandle,
    ) -> Result<Option<HeldClaim>, CoordinatorError> {
        let queue_name = &handle.job().queue_name;
        if self.config.is_claimed(queue_name) {
            return Ok(None);
        }
        let swap = QueueSwap {
            job_id: handle.id().clone(),
            from_queue: queue_name.clone(),
            to_queue: self.config.claimed_queue_name(queue_name),
            scheduled_at: Some(timestamp(Utc::now())),
        };
        Ok(match self.store.swap_queue(&swap).await? {
            Claim::Claimed => Some(HeldClaim {
                job_id: swap.job_id,
                queue_name: swap.from_queue,
                scheduled_at: handle.job().scheduled_at,
            }),
            Claim::Lost => None,
        })
    }

    /// Give up a claim without executing the job, restoring its original queue and schedule.
    #[instrument(skip_all, err, fields(job_id = %claim.job_id))]
    pub async fn release(&self, claim: &HeldClaim) -> Result<(), CoordinatorError> {
        let swap = QueueSwap {
            job_id: claim.job_id.clone(),
            from_queue: self.config.claimed_queue_name(&claim.queue_name),
            to_queue: claim.queue_name.clone(),
            scheduled_at: claim.scheduled_at,
        };
        if self.store.swap_queue(&swap).await? == Claim::Lost {
            tracing::warn!("Claim on job {} was gone before release", claim.job_id);
        }
        Ok(())
    }

    async fn complete(&self, handle: &mut ExecutionHandle) -> Result<(), CoordinatorError> {
        self.store.delete(handle.id()).await?;
        handle.mark_destroyed();
        Ok(())
    }

    /// Discard a job: run the `after_discard` hooks (unless `run_hooks` is false), then delete or
    /// retain the record according to the configured [`DiscardPolicy`].
    pub async fn discard(
        &self,
        handle: &mut ExecutionHandle,
        run_hooks: bool,
    ) -> Result<(), CoordinatorError> {
        self.discard_inner(handle, None, run_hooks).await
    }

    #[instrument(skip_all, err, fields(job_id = %handle.id()))]
    async fn discard_inner(
        &self,
        handle: &mut ExecutionHandle,
        error: Option<&JobError>,
        run_hooks: bool,
    ) -> Result<(), CoordinatorError> {
        let hooks = if run_hooks {
            self.hooks.run_after_discard(handle.job(), error).await
        } else {
            Ok(())
        };
        match &self.config.discard {
            DiscardPolicy::Delete => self.delete(handle).await?,
            DiscardPolicy::Retain { queue_name } => {
                handle.job_mut().queue_name = queue_name.clone();
                self.enqueue_at(handle, None).await?;
            }
        }
        hooks.map_err(CoordinatorError::Hook)
    }

    /// Delete the record of this job, if it still exists.
    pub async fn delete(&self, handle: &mut ExecutionHandle) -> Result<(), CoordinatorError> {
        self.complete(handle).await
    }

    /// Delete every matching record without running hooks.
    pub async fn discard_all(&self, filter: &JobFilter) -> Result<u64, CoordinatorError> {
        Ok(self.store.delete_where(filter, Utc::now()).await?)
    }

    /// The record must be gone, or exist with exactly `executions` and match what this handle
    /// last wrote.
    async fn verify_settled(
        &self,
        handle: &ExecutionHandle,
        executions: u32,
    ) -> Result<(), CoordinatorError> {
        let violation = |reason: String| CoordinatorError::InvariantViolation {
            job_id: handle.id().clone(),
            reason,
        };
        match self.store.find_by_job_id(handle.id()).await? {
            None => Ok(()),
            Some(row) if row.executions != executions => Err(violation(format!(
                "expected {} executions, found {}",
                executions, row.executions
            ))),
            Some(row) if handle.record() != Some(&row) => {
                Err(violation("record was changed by someone else".to_string()))
            }
            Some(_) => Ok(()),
        }
    }

    /// Materialize the job with this id.
    pub async fn find(&self, job_id: &JobId) -> Result<Option<ExecutionHandle>, CoordinatorError> {
        self.store
            .find_by_job_id(job_id)
            .await?
            .map(|record| ExecutionHandle::materialize(record, &self.codecs))
            .transpose()
            .map_err(CoordinatorError::from)
    }

    pub async fn query(&self, query: &Query) -> Result<Vec<ExecutionHandle>, CoordinatorError> {
        self.store
            .query(query)
            .await?
            .into_iter()
            .map(|record| {
                ExecutionHandle::materialize(record, &self.codecs).map_err(CoordinatorError::from)
            })
            .collect()
    }

    /// Due jobs, by priority, then schedule, then enqueue time.
    pub async fn ready(&self) -> Result<Vec<ExecutionHandle>, CoordinatorError> {
        self.query(&Query::ready()).await
    }

    /// Same selection as [`Coordinator::ready`].
    pub async fn due(&self) -> Result<Vec<ExecutionHandle>, CoordinatorError> {
        self.ready().await
    }

    /// Every job, due ones first.
    pub async fn ordered(&self) -> Result<Vec<ExecutionHandle>, CoordinatorError> {
        self.query(&Query::ordered()).await
    }

    /// Jobs in any of the given queues.
    pub async fn queue(
        &self,
        queue_names: &[&str],
    ) -> Result<Vec<ExecutionHandle>, CoordinatorError> {
        let filter = JobFilter {
            queue_names: queue_names.iter().map(|q| q.to_string()).collect(),
            ..JobFilter::default()
        };
        self.query(&Query::new(filter)).await
    }

    pub async fn first(&self, query: &Query) -> Result<Option<ExecutionHandle>, CoordinatorError> {
        Ok(self.first_n(query, 1).await?.into_iter().next())
    }

    pub async fn first_n(
        &self,
        query: &Query,
        limit: usize,
    ) -> Result<Vec<ExecutionHandle>, CoordinatorError> {
        self.query(&query.clone().limit(limit)).await
    }

    pub async fn last(&self, query: &Query) -> Result<Option<ExecutionHandle>, CoordinatorError> {
        Ok(self.last_n(query, 1).await?.pop())
    }

    pub async fn last_n(
        &self,
        query: &Query,
        limit: usize,
    ) -> Result<Vec<ExecutionHandle>, CoordinatorError> {
        let mut handles = self.query(query).await?;
        let skip = handles.len().saturating_sub(limit);
        Ok(handles.split_off(skip))
    }

    pub async fn count(&self, filter: &JobFilter) -> Result<u64, CoordinatorError> {
        Ok(self.store.filtered_count(filter).await?)
    }

    /// Count matching jobs for which `predicate` holds.
    pub async fn count_where<F>(
        &self,
        filter: &JobFilter,
        predicate: F,
    ) -> Result<u64, CoordinatorError>
    where
        F: Fn(&JobInstance) -> bool,
    {
        let handles = self.query(&Query::new(filter.clone())).await?;
        Ok(handles.iter().filter(|h| predicate(h.job())).count() as u64)
    }

    /// Execute every job the query selects. With a `batch_size`, jobs are fetched that many at a
    /// time until the query only returns jobs that were already executed.
    pub async fn perform_all(
        &self,
        query: &Query,
        batch_size: Option<usize>,
    ) -> Result<Vec<Outcome>, CoordinatorError> {
        let mut outcomes = Vec::new();
        let Some(batch_size) = batch_size else {
            for mut handle in self.query(query).await? {
                outcomes.push(self.execute(&mut handle).await?);
            }
            return Ok(outcomes);
        };

        let mut seen = HashSet::new();
        let mut offset = 0;
        loop {
            let page = query.clone().limit(batch_size.max(1)).offset(offset);
            let batch = self.query(&page).await?;
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len();
            let mut executed = false;
            for mut handle in batch {
                if seen.insert(handle.id().clone()) {
                    executed = true;
                    outcomes.push(self.execute(&mut handle).await?);
                }
            }
            if !executed {
                offset += batch_len;
            }
        }
        Ok(outcomes)
    }
}

/// Timestamps are persisted with microsecond precision.
fn timestamp(at: DateTime) -> DateTime {
    at.trunc_subsecs(6)
}
