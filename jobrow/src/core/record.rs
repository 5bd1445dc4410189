use crate::core::codec::{ArgumentCodec, CodecError, ExceptionExecutionsCodec};
use crate::core::ordering;
use crate::core::{DateTime, JobId, Value};
use std::collections::BTreeMap;

/// Default queue used when neither the job nor the configuration names one.
pub const DEFAULT_QUEUE_NAME: &str = "default";

/// A persisted row. One row exists per in-flight job.
///
/// `arguments` and `exception_executions` hold the serialized column text exactly as stored;
/// use the codecs (or the `decode_*` helpers) to get structured values back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub job_id: JobId,
    pub job_class: String,
    pub arguments: String,
    pub queue_name: String,
    pub priority: Option<i32>,
    pub executions: u32,
    pub exception_executions: String,
    pub enqueued_at: DateTime,
    pub scheduled_at: Option<DateTime>,
    pub locale: String,
    pub timezone: String,
}

impl JobRecord {
    /// `scheduled_at` is absent or not in the future relative to `now`.
    pub fn is_due(&self, now: DateTime) -> bool {
        ordering::is_due(self.scheduled_at, now)
    }

    /// Serialized argument text as stored in the table.
    pub fn raw_arguments(&self) -> &str {
        &self.arguments
    }

    pub fn decode_arguments(&self, codec: &dyn ArgumentCodec) -> Result<Vec<Value>, CodecError> {
        codec.load(&self.arguments)
    }

    pub fn decode_exception_executions(
        &self,
        codec: &dyn ExceptionExecutionsCodec,
    ) -> Result<BTreeMap<String, u32>, CodecError> {
        codec.load(&self.exception_executions)
    }
}
