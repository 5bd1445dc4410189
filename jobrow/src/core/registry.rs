use crate::core::codec::CodecError;
use crate::core::job::{Job, JobContext, JobError};
use crate::core::{Duration, Value};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use tracing::instrument;

/// Shorthand for boxed trait object for a WrappedJob.
pub type BoxedJob = Box<dyn Job<Args = Vec<Value>, Error = JobError>>;

/// Object-safe implementation of a job that can be stored in the registry. Generally speaking,
/// you don't need to directly use this type, `JobRegistry` takes care of everything related to it.
pub struct WrappedJob<J: Job> {
    job: J,
    _args: PhantomData<fn() -> J::Args>,
}

impl<J> WrappedJob<J>
where
    J: Job + 'static,
    J::Args: Serialize + DeserializeOwned,
    J::Error: Into<anyhow::Error>,
{
    pub fn new(job: J) -> Self {
        Self {
            job,
            _args: PhantomData,
        }
    }

    pub fn boxed(self) -> BoxedJob {
        Box::new(self) as BoxedJob
    }
}

#[async_trait]
impl<J> Job for WrappedJob<J>
where
    J: Job + 'static,
    J::Args: Serialize + DeserializeOwned,
    J::Error: Into<anyhow::Error>,
{
    type Args = Vec<Value>;
    type Error = JobError;

    #[instrument(skip_all, err, fields(job_id = %ctx.job_id, job_class = %Self::name()))]
    async fn perform(&self, ctx: JobContext, args: Self::Args) -> Result<(), Self::Error> {
        let args = decode_arguments::<J::Args>(args)?;
        self.job
            .perform(ctx, args)
            .await
            .map_err(|e| JobError::failed(std::any::type_name::<J::Error>(), e))
    }

    fn max_attempts(&self) -> u32 {
        self.job.max_attempts()
    }

    fn backoff(&self, executions: u32) -> Duration {
        self.job.backoff(executions)
    }

    fn name() -> &'static str {
        J::name()
    }
}

impl<J> From<J> for WrappedJob<J>
where
    J: Job + 'static,
    J::Args: Serialize + DeserializeOwned,
    J::Error: Into<anyhow::Error>,
{
    fn from(job: J) -> Self {
        Self::new(job)
    }
}

/// Turn typed job arguments into the stored argument sequence.
pub fn encode_arguments<A: Serialize>(args: &A) -> Result<Vec<Value>, CodecError> {
    match serde_json::to_value(args).map_err(|e| CodecError::invalid("arguments", e))? {
        Value::Array(items) => Ok(items),
        other => Ok(vec![other]),
    }
}

/// Inverse of [`encode_arguments`].
pub fn decode_arguments<A: DeserializeOwned>(mut args: Vec<Value>) -> Result<A, serde_json::Error> {
    match serde_json::from_value(Value::Array(args.clone())) {
        Ok(decoded) => Ok(decoded),
        Err(_) if args.len() == 1 => serde_json::from_value(args.remove(0)),
        Err(e) => Err(e),
    }
}

/// Maps `job_class` keys to registered jobs. Acts as the codec for the `job_class` column: a job
/// is stored under [`Job::name`] and resolved back through [`JobRegistry::resolve`].
///
/// ## Example
/// ```rust
/// use jobrow::prelude::{Job, JobContext, JobRegistry};
/// use async_trait::async_trait;
/// struct MyJob;
///
/// #[async_trait::async_trait]
/// impl Job for MyJob {
///     type Args = (u8, String);
///     type Error = anyhow::Error;
///
///     fn name() -> &'static str {
///         "my_job"
///     }
///
///     async fn perform(&self, _ctx: JobContext, _args: Self::Args) -> Result<(), Self::Error> {
///         // ..do work
///         Ok(())
///     }
/// }
///
/// let registry = {
///     let mut r = JobRegistry::default();
///     r.add_job(MyJob);
///     r
/// };
/// assert!(registry.resolve("my_job").is_ok());
///```
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<&'static str, BoxedJob>,
}

impl JobRegistry {
    /// Register a job with the registry. If a job by that name is already present, it gets replaced.
    pub fn add_job<J>(&mut self, job: J)
    where
        J: Job + 'static,
        J::Args: Serialize + DeserializeOwned,
        J::Error: Into<anyhow::Error>,
    {
        let name = J::name();
        if self.jobs.insert(name, WrappedJob::new(job).boxed()).is_some() {
            tracing::warn!(job_class = name, "Replacing previously registered job");
        }
    }

    pub fn types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.jobs.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn contains(&self, job_class: &str) -> bool {
        self.jobs.contains_key(job_class)
    }

    /// Resolve a stored `job_class` key. Unknown keys are an invalid field value.
    pub fn resolve(&self, job_class: &str) -> Result<&BoxedJob, CodecError> {
        self.jobs.get(job_class).ok_or_else(|| {
            CodecError::invalid("job_class", format!("no job registered as {job_class:?}"))
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::{CancellationToken, JobId};
    use serde::Deserialize;
    use serde_json::json;
    use std::convert::Infallible;

    fn context() -> JobContext {
        JobContext {
            job_id: JobId::new(),
            job_class: "example".to_string(),
            queue_name: "default".to_string(),
            executions: 1,
            locale: "en".to_string(),
            timezone: "UTC".to_string(),
            cancellation_token: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn it_is_object_safe_and_wrappable() {
        struct Example;

        #[async_trait::async_trait]
        impl Job for Example {
            type Args = Vec<i32>;
            type Error = Infallible;

            async fn perform(&self, _ctx: JobContext, _args: Self::Args) -> Result<(), Infallible> {
                Ok(())
            }
            fn name() -> &'static str {
                "example"
            }
        }

        let args = vec![1, 2, 3];

        let job: Box<dyn Job<Args = _, Error = _>> = Box::new(Example);
        job.perform(context(), args.clone()).await.unwrap();

        let wrapped: BoxedJob = WrappedJob::new(Example).boxed();
        wrapped
            .perform(context(), encode_arguments(&args).unwrap())
            .await
            .unwrap();

        let result = wrapped.perform(context(), vec![json!("nope")]).await;
        assert!(matches!(result, Err(JobError::DecodeError { .. })));
    }

    #[test]
    fn structs_are_stored_as_a_single_argument() {
        #[derive(Serialize, Deserialize, Debug, PartialEq)]
        struct Payload {
            to: String,
            attempts: u8,
        }

        let payload = Payload {
            to: "a@example.com".to_string(),
            attempts: 2,
        };
        let encoded = encode_arguments(&payload).unwrap();
        assert_eq!(encoded, vec![json!({"to": "a@example.com", "attempts": 2})]);
        assert_eq!(decode_arguments::<Payload>(encoded).unwrap(), payload);

        let encoded = encode_arguments(&("a".to_string(), 1)).unwrap();
        assert_eq!(encoded, vec![json!("a"), json!(1)]);
        assert_eq!(
            decode_arguments::<(String, i32)>(encoded).unwrap(),
            ("a".to_string(), 1)
        );
    }

    #[test]
    fn unknown_job_class_is_an_invalid_field_value() {
        let registry = JobRegistry::default();
        assert!(matches!(
            registry.resolve("missing"),
            Err(CodecError::InvalidFieldValue {
                field: "job_class",
                ..
            })
        ));
    }
}
