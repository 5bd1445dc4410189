//! Queue configuration.
//!
//! Every field has a default, so an empty TOML document is a valid configuration:
//!
//! ```toml
//! table_name = "jobs"
//! default_queue_name = "default"
//! claim_before_perform = true
//!
//! [discard]
//! policy = "retain"
//! queue_name = "discarded"
//! ```
use crate::core::record::DEFAULT_QUEUE_NAME;
use crate::core::Duration;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Table holding the job records.
    pub table_name: String,
    pub default_queue_name: String,
    pub default_locale: String,
    pub default_timezone: String,
    /// Prefix a worker prepends to `queue_name` while it holds the claim on a job.
    pub claim_prefix: String,
    /// Claim a job with a conditional update before performing it.
    pub claim_before_perform: bool,
    pub discard: DiscardPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            table_name: "jobs".to_string(),
            default_queue_name: DEFAULT_QUEUE_NAME.to_string(),
            default_locale: "en".to_string(),
            default_timezone: "UTC".to_string(),
            claim_prefix: "claimed-".to_string(),
            claim_before_perform: true,
            discard: DiscardPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    /// Queue name a claimed job is moved to.
    pub fn claimed_queue_name(&self, queue_name: &str) -> String {
        format!("{}{}", self.claim_prefix, queue_name)
    }

    pub fn is_claimed(&self, queue_name: &str) -> bool {
        !self.claim_prefix.is_empty() && queue_name.starts_with(&self.claim_prefix)
    }
}

/// What happens to the record of a discarded job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum DiscardPolicy {
    /// Delete the record.
    #[default]
    Delete,
    /// Keep the record, moved into `queue_name` and no longer scheduled.
    Retain { queue_name: String },
}

/// Settings of a polling [`Worker`](crate::runner::worker::Worker).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// How long an idle worker sleeps before polling again. Some jitter is added on top.
    pub poll_interval_ms: u64,
    /// Number of jobs executed in parallel.
    pub concurrency: usize,
    /// Queues to take jobs from. Empty means every queue.
    pub queues: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            concurrency: 1,
            queues: vec![DEFAULT_QUEUE_NAME.to_string()],
        }
    }
}

impl WorkerConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::milliseconds(i64::try_from(self.poll_interval_ms).unwrap_or(i64::MAX))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = QueueConfig::from_toml_str("").unwrap();
        assert_eq!(config, QueueConfig::default());
        assert_eq!(config.table_name, "jobs");
        assert_eq!(config.discard, DiscardPolicy::Delete);
    }

    #[test]
    fn parses_retain_policy() {
        let config = QueueConfig::from_toml_str(
            r#"
            table_name = "my_jobs"
            claim_before_perform = false

            [discard]
            policy = "retain"
            queue_name = "discarded"
            "#,
        )
        .unwrap();
        assert_eq!(config.table_name, "my_jobs");
        assert!(!config.claim_before_perform);
        assert_eq!(
            config.discard,
            DiscardPolicy::Retain {
                queue_name: "discarded".to_string()
            }
        );
    }

    #[test]
    fn claimed_queue_names() {
        let config = QueueConfig::default();
        assert_eq!(config.claimed_queue_name("default"), "claimed-default");
        assert!(config.is_claimed("claimed-default"));
        assert!(!config.is_claimed("default"));
    }

    #[test]
    fn worker_defaults_poll_the_default_queue() {
        let config = WorkerConfig::from_toml_str("concurrency = 4").unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.queues, vec!["default".to_string()]);
        assert_eq!(config.poll_interval(), Duration::seconds(1));
    }
}
