#![doc = include_str!("../README.md")]

pub mod core;

/// Default implementation of a polling worker.
#[cfg(feature = "runner")]
pub mod runner {
    pub mod worker;
}

/// Re-exports to simplify importing this crate types.
pub mod prelude {
    pub use super::core::{
        codec::{ArgumentCodec, CodecError, Codecs, ExceptionExecutionsCodec},
        config::{DiscardPolicy, QueueConfig, WorkerConfig},
        coordinator::{Coordinator, CoordinatorError, HeldClaim, Outcome},
        hooks::{DiscardHook, HookRegistry},
        job::{Job, JobContext, JobError},
        job_handle::{DoubleBinding, ExecutionHandle, JobInstance},
        memory::MemoryStore,
        ordering::Order,
        record::JobRecord,
        registry::JobRegistry,
        store::{Claim, JobFilter, Query, QueueSwap, RecordStore, StoreError},
        CancellationToken, DateTime, Duration, JobId, Utc,
    };
    #[cfg(feature = "runner")]
    pub use super::runner::worker::Worker;
}
