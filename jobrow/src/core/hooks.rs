use crate::core::job::JobError;
use crate::core::job_handle::JobInstance;
use async_trait::async_trait;

/// Observer notified when a job is discarded, before its record is removed or retained.
#[async_trait]
pub trait DiscardHook: Send + Sync {
    /// `error` is the failure that exhausted the job's attempts, or `None` for an explicit discard.
    async fn after_discard(&self, job: &JobInstance, error: Option<&JobError>)
        -> anyhow::Result<()>;
}

/// Adapts a plain closure into a [`DiscardHook`].
pub struct FnHook<F>(pub F);

#[async_trait]
impl<F> DiscardHook for FnHook<F>
where
    F: Fn(&JobInstance, Option<&JobError>) -> anyhow::Result<()> + Send + Sync,
{
    async fn after_discard(
        &self,
        job: &JobInstance,
        error: Option<&JobError>,
    ) -> anyhow::Result<()> {
        (self.0)(job, error)
    }
}

#[derive(Default)]
pub struct HookRegistry {
    after_discard: Vec<Box<dyn DiscardHook>>,
}

impl HookRegistry {
    pub fn on_discard<H: DiscardHook + 'static>(&mut self, hook: H) -> &mut Self {
        self.after_discard.push(Box::new(hook));
        self
    }

    pub fn on_discard_fn<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&JobInstance, Option<&JobError>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_discard(FnHook(f))
    }

    /// Runs every hook even if some fail; the last failure is returned.
    pub async fn run_after_discard(
        &self,
        job: &JobInstance,
        error: Option<&JobError>,
    ) -> anyhow::Result<()> {
        let mut last_error = None;
        for hook in &self.after_discard {
            if let Err(e) = hook.after_discard(job, error).await {
                tracing::error!(job_id = %job.job_id, "after_discard hook failed: {:#}", e);
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::config::QueueConfig;
    use crate::core::{JobId, Utc};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    fn job() -> JobInstance {
        let config = QueueConfig::default();
        JobInstance {
            job_id: JobId::new(),
            job_class: "test".to_string(),
            arguments: vec![],
            queue_name: config.default_queue_name,
            priority: None,
            executions: 0,
            exception_executions: BTreeMap::new(),
            enqueued_at: Utc::now(),
            scheduled_at: None,
            locale: config.default_locale,
            timezone: config.default_timezone,
        }
    }

    #[tokio::test]
    async fn runs_all_hooks_and_returns_last_error() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = HookRegistry::default();
        for name in ["first", "second", "third"] {
            let calls = calls.clone();
            hooks.on_discard_fn(move |_job, _error| {
                calls.lock().unwrap().push(name);
                if name == "third" {
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("{name} failed"))
                }
            });
        }

        let err = hooks.run_after_discard(&job(), None).await.unwrap_err();
        assert_eq!(err.to_string(), "second failed");
        assert_eq!(*calls.lock().unwrap(), ["first", "second", "third"]);
    }
}
