use crate::core::{CancellationToken, Duration, JobId};
use async_trait::async_trait;
use thiserror::Error;

/// A job interface. `Args` should implement `serde::{Serialize, Deserialize}` if you're planning
/// to register the job with a [`JobRegistry`](crate::core::registry::JobRegistry).
///
/// Arguments are persisted as a JSON array: tuples and sequences map element-wise, any other
/// value is stored as a single-element array.
///
/// ## Example
/// ```rust
/// use jobrow::prelude::{Job, JobContext};
/// use async_trait::async_trait;
/// struct SendEmail;
///
/// #[async_trait::async_trait]
/// impl Job for SendEmail {
///     type Args = (String, String);
///     type Error = anyhow::Error;
///
///     fn name() -> &'static str {
///         "send_email"
///     }
///
///     async fn perform(&self, ctx: JobContext, (to, body): Self::Args) -> Result<(), Self::Error> {
///         tokio::select! {
///             _ = ctx.cancellation_token.cancelled() => Ok(()),
///             _ = async { /* ..deliver `body` to `to` */ } => Ok(()),
///         }
///     }
/// }
/// ```
/// ## Services
/// If your job requires external services (i.e. database client, REST client, etc.), add
/// them directly as your struct fields.
#[async_trait]
pub trait Job: Send + Sync {
    /// What is the input to this job.
    type Args: Send;
    /// What error is returned
    type Error: Send;

    /// Run the job. Listen for `ctx.cancellation_token.cancelled()` in order to handle shutdown
    /// requests gracefully.
    async fn perform(&self, ctx: JobContext, args: Self::Args) -> Result<(), Self::Error>;

    /// Total number of executions allowed before the job is discarded.
    fn max_attempts(&self) -> u32 {
        5
    }

    /// How long to wait before the next attempt, given the number of executions so far.
    fn backoff(&self, executions: u32) -> Duration {
        polynomial_backoff(executions)
    }

    /// Queue this job is enqueued into unless the caller overrides it.
    fn queue_name() -> Option<&'static str>
    where
        Self: Sized,
    {
        None
    }

    /// Priority this job is enqueued with unless the caller overrides it. Lower runs first.
    fn priority() -> Option<i32>
    where
        Self: Sized,
    {
        None
    }

    /// Stable key stored in the `job_class` column.
    fn name() -> &'static str
    where
        Self: Sized;
}

/// `executions^4 + 2` seconds.
pub fn polynomial_backoff(executions: u32) -> Duration {
    let executions = i64::from(executions.min(1_000));
    Duration::seconds(executions.pow(4) + 2)
}

/// Metadata handed to a job while it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_class: String,
    pub queue_name: String,
    /// Includes the current attempt.
    pub executions: u32,
    pub locale: String,
    pub timezone: String,
    pub cancellation_token: CancellationToken,
}

/// Errors returned by a registered job once wrapped.
#[derive(Error, Debug)]
pub enum JobError {
    /// Stored arguments don't fit the job's `Args` type.
    #[error("Failed to decode job arguments")]
    DecodeError {
        #[from]
        source: serde_json::Error,
    },

    /// Error originated in the job implementation. `kind` keys the retry bookkeeping.
    #[error("{source}")]
    Failed {
        kind: String,
        source: anyhow::Error,
    },
}

impl JobError {
    pub fn failed(kind: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        JobError::Failed {
            kind: kind.into(),
            source: source.into(),
        }
    }

    /// Key used in `exception_executions`.
    pub fn kind(&self) -> &str {
        match self {
            JobError::DecodeError { .. } => "serde_json::Error",
            JobError::Failed { kind, .. } => kind,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_grows_polynomially() {
        assert_eq!(polynomial_backoff(0), Duration::seconds(2));
        assert_eq!(polynomial_backoff(1), Duration::seconds(3));
        assert_eq!(polynomial_backoff(3), Duration::seconds(83));
    }

    #[test]
    fn failed_errors_carry_their_kind() {
        let error = JobError::failed("timeout", anyhow::anyhow!("took too long"));
        assert_eq!(error.kind(), "timeout");
        assert_eq!(error.to_string(), "took too long");
    }
}
