//! Per-task single-flight admission on top of a bounded worker pool.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

/// What caused a run request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A timer expired for the fire time it was armed with.
    Scheduled { fire_at: DateTime<Utc> },
    /// An out-of-band "run now".
    Manual,
}

/// The coordinator's answer to a run request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A run was queued for a worker slot.
    Started,
    /// A run for the task is queued but not started; this trigger is folded into it.
    Coalesced,
    /// A run for the task is executing; this trigger is dropped.
    Busy,
    /// The fire arrived later than the grace window and was not run.
    Misfired { late_by: chrono::Duration },
    /// The coordinator is shutting down.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    Queued,
    Running,
}

pub struct ExecutionCoordinator {
    in_flight: Arc<DashMap<String, RunPhase>>,
    slots: Arc<Semaphore>,
    workers: usize,
    grace: chrono::Duration,
    closed: AtomicBool,
}

impl ExecutionCoordinator {
    pub fn new(workers: usize, misfire_grace: Duration) -> Self {
        let workers = workers.max(1);
        Self {
            in_flight: Arc::new(DashMap::new()),
            slots: Arc::new(Semaphore::new(workers)),
            workers,
            grace: chrono::Duration::from_std(misfire_grace)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            closed: AtomicBool::new(false),
        }
    }

    /// Admit or reject one run of `task_id`.
    ///
    /// On `Started`, `job` runs on a worker slot. Once it finishes (or
    /// panics) the task is released, so a new trigger can be admitted, and
    /// then `on_settled` runs while the slot is still held.
    pub fn submit<Fut, S>(
        &self,
        task_id: &str,
        trigger: Trigger,
        now: DateTime<Utc>,
        job: Fut,
        on_settled: S,
    ) -> Admission
    where
        Fut: Future<Output = ()> + Send + 'static,
        S: FnOnce() + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Admission::Closed;
        }

        match self.in_flight.entry(task_id.to_string()) {
            Entry::Occupied(e) => {
                let admission = match e.get() {
                    RunPhase::Queued => Admission::Coalesced,
                    RunPhase::Running => Admission::Busy,
                };
                debug!(task_id, ?trigger, ?admission, "trigger not admitted");
                return admission;
            }
            Entry::Vacant(e) => {
                if let Trigger::Scheduled { fire_at } = trigger {
                    let late_by = now - fire_at;
                    if late_by > self.grace {
                        warn!(task_id, %fire_at, late_secs = late_by.num_seconds(), "misfire");
                        return Admission::Misfired { late_by };
                    }
                }
                e.insert(RunPhase::Queued);
            }
        }

        let in_flight = Arc::clone(&self.in_flight);
        let slots = Arc::clone(&self.slots);
        let id = task_id.to_string();
        tokio::spawn(async move {
            let permit = match slots.acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    in_flight.remove(&id);
                    return;
                }
            };
            if let Some(mut phase) = in_flight.get_mut(&id) {
                *phase = RunPhase::Running;
            }
            // A panicking run must still release the task.
            if let Err(e) = tokio::spawn(job).await {
                error!(task_id = %id, "task run aborted: {e}");
            }
            in_flight.remove(&id);
            on_settled();
            drop(permit);
        });
        Admission::Started
    }

    pub fn is_in_flight(&self, task_id: &str) -> bool {
        self.in_flight.contains_key(task_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Reject every later `submit` with [`Admission::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    /// Wait until every admitted run has settled, up to `timeout`.
    /// Returns `false` on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let all = u32::try_from(self.workers).unwrap_or(u32::MAX);
        let settled = async {
            loop {
                match self.slots.acquire_many(all).await {
                    // Holding every slot with nothing queued means nothing runs.
                    Ok(_permits) if self.in_flight.is_empty() => return true,
                    Ok(_) => {}
                    Err(_) => return false,
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, settled).await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn coordinator(workers: usize) -> ExecutionCoordinator {
        ExecutionCoordinator::new(workers, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn second_trigger_is_not_started_while_first_runs() {
        let c = coordinator(4);
        let release = Arc::new(Notify::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let (r, n) = (Arc::clone(&release), Arc::clone(&runs));
        let first = c.submit(
            "t",
            Trigger::Manual,
            Utc::now(),
            async move {
                n.fetch_add(1, Ordering::SeqCst);
                r.notified().await;
            },
            || {},
        );
        assert_eq!(first, Admission::Started);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let n = Arc::clone(&runs);
        let second = c.submit(
            "t",
            Trigger::Scheduled { fire_at: Utc::now() },
            Utc::now(),
            async move {
                n.fetch_add(1, Ordering::SeqCst);
            },
            || {},
        );
        assert_eq!(second, Admission::Busy);

        release.notify_one();
        assert!(c.drain(Duration::from_secs(1)).await);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!c.is_in_flight("t"));
    }

    #[tokio::test]
    async fn queued_trigger_coalesces() {
        let c = coordinator(1);
        let release = Arc::new(Notify::new());
        let r = Arc::clone(&release);
        c.submit("a", Trigger::Manual, Utc::now(), async move { r.notified().await }, || {});
        tokio::time::sleep(Duration::from_millis(20)).await;

        // "b" waits for the only slot, so it stays queued
        assert_eq!(
            c.submit("b", Trigger::Manual, Utc::now(), async {}, || {}),
            Admission::Started
        );
        assert_eq!(
            c.submit("b", Trigger::Manual, Utc::now(), async {}, || {}),
            Admission::Coalesced
        );
        release.notify_one();
        assert!(c.drain(Duration::from_secs(1)).await);
        assert_eq!(c.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn late_fire_is_a_misfire() {
        let c = coordinator(2);
        let now = Utc::now();
        let admission = c.submit(
            "t",
            Trigger::Scheduled {
                fire_at: now - chrono::Duration::seconds(90),
            },
            now,
            async {},
            || {},
        );
        assert!(matches!(admission, Admission::Misfired { late_by } if late_by.num_seconds() == 90));

        let on_time = c.submit(
            "t",
            Trigger::Scheduled {
                fire_at: now - chrono::Duration::seconds(30),
            },
            now,
            async {},
            || {},
        );
        assert_eq!(on_time, Admission::Started);
    }

    #[tokio::test]
    async fn panicking_run_releases_task_and_settles() {
        let c = coordinator(2);
        let settled = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&settled);
        c.submit(
            "t",
            Trigger::Manual,
            Utc::now(),
            async { panic!("generator exploded") },
            move || {
                s.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert!(c.drain(Duration::from_secs(1)).await);
        assert_eq!(settled.load(Ordering::SeqCst), 1);
        assert!(!c.is_in_flight("t"));
    }

    #[tokio::test]
    async fn closed_coordinator_rejects() {
        let c = coordinator(1);
        c.close();
        assert_eq!(
            c.submit("t", Trigger::Manual, Utc::now(), async {}, || {}),
            Admission::Closed
        );
        c.reopen();
        assert_eq!(
            c.submit("t", Trigger::Manual, Utc::now(), async {}, || {}),
            Admission::Started
        );
    }
}
