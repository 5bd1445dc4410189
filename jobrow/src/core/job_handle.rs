use crate::core::codec::{CodecError, Codecs};
use crate::core::config::QueueConfig;
use crate::core::job::Job;
use crate::core::record::JobRecord;
use crate::core::registry::encode_arguments;
use crate::core::{DateTime, JobId, Utc, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// The in-memory job object: every record field, decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInstance {
    pub job_id: JobId,
    pub job_class: String,
    pub arguments: Vec<Value>,
    pub queue_name: String,
    pub priority: Option<i32>,
    pub executions: u32,
    pub exception_executions: BTreeMap<String, u32>,
    pub enqueued_at: DateTime,
    pub scheduled_at: Option<DateTime>,
    pub locale: String,
    pub timezone: String,
}

impl JobInstance {
    /// Build a fresh job with a new id. Queue and priority come from the job definition, falling
    /// back to the configuration.
    pub fn new<J>(args: &J::Args, config: &QueueConfig) -> Result<Self, CodecError>
    where
        J: Job + 'static,
        J::Args: Serialize,
    {
        Ok(Self {
            job_id: JobId::new(),
            job_class: J::name().to_string(),
            arguments: encode_arguments(args)?,
            queue_name: J::queue_name()
                .map(str::to_string)
                .unwrap_or_else(|| config.default_queue_name.clone()),
            priority: J::priority(),
            executions: 0,
            exception_executions: BTreeMap::new(),
            enqueued_at: Utc::now(),
            scheduled_at: None,
            locale: config.default_locale.clone(),
            timezone: config.default_timezone.clone(),
        })
    }

    pub fn with_job_id(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = job_id.into();
        self
    }

    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn with_priority(mut self, priority: Option<i32>) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    /// Materialize a job object from a stored record.
    pub fn from_record(record: &JobRecord, codecs: &Codecs) -> Result<Self, CodecError> {
        Ok(Self {
            job_id: record.job_id.clone(),
            job_class: record.job_class.clone(),
            arguments: record.decode_arguments(codecs.arguments.as_ref())?,
            queue_name: record.queue_name.clone(),
            priority: record.priority,
            executions: record.executions,
            exception_executions: record
                .decode_exception_executions(codecs.exception_executions.as_ref())?,
            enqueued_at: record.enqueued_at,
            scheduled_at: record.scheduled_at,
            locale: record.locale.clone(),
            timezone: record.timezone.clone(),
        })
    }

    /// Serialize into the column values of a record.
    pub fn to_record(&self, codecs: &Codecs) -> Result<JobRecord, CodecError> {
        if self.job_class.is_empty() {
            return Err(CodecError::invalid("job_class", "must not be empty"));
        }
        let exception_executions = serde_json::to_value(&self.exception_executions)
            .map_err(|e| CodecError::invalid("exception_executions", e))?;
        Ok(JobRecord {
            job_id: self.job_id.clone(),
            job_class: self.job_class.clone(),
            arguments: codecs
                .arguments
                .dump(&Value::Array(self.arguments.clone()))?,
            queue_name: self.queue_name.clone(),
            priority: self.priority,
            executions: self.executions,
            exception_executions: codecs.exception_executions.dump(&exception_executions)?,
            enqueued_at: self.enqueued_at,
            scheduled_at: self.scheduled_at,
            locale: self.locale.clone(),
            timezone: self.timezone.clone(),
        })
    }
}

/// A job object was bound to a record a second time.
#[derive(Error, Debug)]
#[error("Job {0} is already bound to a record")]
pub struct DoubleBinding(pub JobId);

/// Binds one job object to the record it was materialized from or persisted to.
///
/// Outcomes (success, retry, discard) are applied through the handle, so they act on the bound
/// row without re-querying, and re-enqueuing a bound handle updates that row instead of inserting
/// a second one. A handle is bound at most once.
#[derive(Debug)]
pub struct ExecutionHandle {
    job: JobInstance,
    record: Option<JobRecord>,
    destroyed: bool,
}

impl ExecutionHandle {
    /// An unbound handle, as for a job that was never enqueued.
    pub fn new(job: JobInstance) -> Self {
        Self {
            job,
            record: None,
            destroyed: false,
        }
    }

    /// A handle bound to the record it was read from.
    pub fn materialize(record: JobRecord, codecs: &Codecs) -> Result<Self, CodecError> {
        let job = JobInstance::from_record(&record, codecs)?;
        Ok(Self {
            job,
            record: Some(record),
            destroyed: false,
        })
    }

    pub fn id(&self) -> &JobId {
        &self.job.job_id
    }

    pub fn job(&self) -> &JobInstance {
        &self.job
    }

    pub fn job_mut(&mut self) -> &mut JobInstance {
        &mut self.job
    }

    pub fn into_job(self) -> JobInstance {
        self.job
    }

    /// Last known state of the bound row.
    pub fn record(&self) -> Option<&JobRecord> {
        self.record.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.record.is_some()
    }

    /// The bound row was deleted through this handle.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Bind this handle to `record`. Binding an already bound handle is a programming error.
    pub fn bind(&mut self, record: JobRecord) -> Result<(), DoubleBinding> {
        if self.record.is_some() {
            return Err(DoubleBinding(self.job.job_id.clone()));
        }
        self.record = Some(record);
        self.destroyed = false;
        Ok(())
    }

    /// Point an already bound handle at the latest state of its row.
    pub(crate) fn rebind(&mut self, record: JobRecord) {
        self.record = Some(record);
        self.destroyed = false;
    }

    pub(crate) fn mark_destroyed(&mut self) {
        self.destroyed = true;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::job::JobContext;
    use async_trait::async_trait;
    use serde_json::json;

    struct Greet;

    #[async_trait]
    impl Job for Greet {
        type Args = (String,);
        type Error = anyhow::Error;

        async fn perform(&self, _ctx: JobContext, _args: Self::Args) -> anyhow::Result<()> {
            Ok(())
        }

        fn queue_name() -> Option<&'static str> {
            Some("mailers")
        }

        fn name() -> &'static str {
            "greet"
        }
    }

    #[test]
    fn new_jobs_take_defaults_from_definition_and_config() {
        let config = QueueConfig::default();
        let job = JobInstance::new::<Greet>(&("hi".to_string(),), &config).unwrap();
        assert_eq!(job.job_class, "greet");
        assert_eq!(job.queue_name, "mailers");
        assert_eq!(job.arguments, vec![json!("hi")]);
        assert_eq!(job.executions, 0);
        assert_eq!(job.locale, "en");
        assert_eq!(job.timezone, "UTC");
    }

    #[test]
    fn record_round_trip_keeps_raw_arguments_available() {
        let codecs = Codecs::default();
        let mut job = JobInstance::new::<Greet>(&("hi".to_string(),), &QueueConfig::default())
            .unwrap()
            .with_priority(Some(3));
        job.exception_executions.insert("boom".to_string(), 2);

        let record = job.to_record(&codecs).unwrap();
        assert_eq!(record.raw_arguments(), r#"["hi"]"#);
        assert_eq!(record.exception_executions, r#"{"boom":2}"#);
        assert_eq!(JobInstance::from_record(&record, &codecs).unwrap(), job);
    }

    #[test]
    fn binding_twice_fails() {
        let codecs = Codecs::default();
        let job = JobInstance::new::<Greet>(&("hi".to_string(),), &QueueConfig::default()).unwrap();
        let record = job.to_record(&codecs).unwrap();

        let mut handle = ExecutionHandle::new(job);
        assert!(!handle.is_bound());
        handle.bind(record.clone()).unwrap();
        assert!(handle.is_bound());

        let err = handle.bind(record).unwrap_err();
        assert_eq!(&err.0, handle.id());
    }
}
