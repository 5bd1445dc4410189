//! Selection order over job records.
//!
//! Sort keys, ascending:
//!
//! 1. due records before future ones (only in [`Order::ByDueDate`])
//! 2. `priority`, nulls last
//! 3. `scheduled_at`, nulls last
//! 4. `enqueued_at`
//! 5. `job_id`, so that paging through equal keys is deterministic
//!
//! Backends must express the same order as a single sort over the whole table.
use crate::core::record::JobRecord;
use crate::core::DateTime;
use std::cmp::Ordering;

/// `scheduled_at IS NULL OR scheduled_at <= now`
pub fn is_due(scheduled_at: Option<DateTime>, now: DateTime) -> bool {
    scheduled_at.map_or(true, |at| at <= now)
}

/// Ascending comparison where `None` sorts after every present value.
pub fn cmp_nulls_last<T: Ord>(a: &Option<T>, b: &Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// How records are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// `enqueued_at`, then `job_id`.
    Implicit,
    /// Priority, schedule and enqueue time. Used for due-only selections.
    Ready,
    /// Due records first, then as [`Order::Ready`]. Used when no order is requested.
    #[default]
    ByDueDate,
}

impl Order {
    pub fn compare(&self, a: &JobRecord, b: &JobRecord, now: DateTime) -> Ordering {
        match self {
            Order::Implicit => a
                .enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.job_id.cmp(&b.job_id)),
            Order::Ready => compare_ready(a, b),
            Order::ByDueDate => {
                // `false < true`, so due records (not future) come first.
                let a_future = !a.is_due(now);
                let b_future = !b.is_due(now);
                a_future
                    .cmp(&b_future)
                    .then_with(|| compare_ready(a, b))
            }
        }
    }

    pub fn sort(&self, records: &mut [JobRecord], now: DateTime) {
        records.sort_by(|a, b| self.compare(a, b, now));
    }
}

fn compare_ready(a: &JobRecord, b: &JobRecord) -> Ordering {
    cmp_nulls_last(&a.priority, &b.priority)
        .then_with(|| cmp_nulls_last(&a.scheduled_at, &b.scheduled_at))
        .then_with(|| a.enqueued_at.cmp(&b.enqueued_at))
        .then_with(|| a.job_id.cmp(&b.job_id))
}
