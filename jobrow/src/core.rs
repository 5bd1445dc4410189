use serde::{Deserialize, Serialize};
use std::fmt;

pub type DateTime = chrono::DateTime<chrono::Utc>;
pub use chrono::{Duration, Utc};
pub use serde_json;
pub use serde_json::Value;
pub use tokio_util::sync::CancellationToken;

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod hooks;
pub mod job;
pub mod job_handle;
pub mod memory;
pub mod mixins;
pub mod ordering;
pub mod record;
pub mod registry;
pub mod store;

/// Stable identity of a job. Assigned once, when the job object is first built, and carried
/// through every re-enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh, globally unique id.
    pub fn new() -> Self {
        Self(xid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
