use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::ScheduleEntry;

/// Durable schedule state consulted by the job registry.
///
/// The registry never trusts its in-memory timers across a restart: on
/// startup it re-arms every entry returned by [`JobStore::list_active`].
pub trait JobStore: Send + Sync {
    /// Persist the schedule columns of `entry`. The task row must exist.
    fn upsert(&self, entry: &ScheduleEntry) -> Result<()>;

    /// Drop the persisted fire time so the entry is no longer armed.
    fn remove(&self, task_id: &str) -> Result<()>;

    /// Every entry whose `is_active` predicate holds at `now`.
    fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>>;
}
