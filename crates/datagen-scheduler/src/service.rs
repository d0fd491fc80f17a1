//! Process-scoped scheduler: owns the timer registry and the coordinator,
//! recovers armed tasks from the job store on start, and re-arms every task
//! after each run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use datagen_core::config::SchedulerConfig;
use datagen_generator::DataGenerator;

use crate::coordinator::{Admission, ExecutionCoordinator, Trigger};
use crate::error::Result;
use crate::job_store::JobStore;
use crate::output::OutputDispatcher;
use crate::pipeline::ExecutionPipeline;
use crate::registry::{FireCallback, JobRegistry};
use crate::store::TaskStore;
use crate::types::{ScheduleEntry, ScheduledTask};

/// Where [`SchedulerService::rearm`] takes the next fire time from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmBasis {
    /// The persisted `next_run_at`, even if it has already passed.
    Stored,
    /// The persisted `next_run_at` if it is still ahead, else recomputed.
    Upcoming,
    /// Always recomputed from now.
    Fresh,
}

pub struct SchedulerService {
    store: Arc<TaskStore>,
    job_store: Arc<dyn JobStore>,
    registry: JobRegistry,
    coordinator: ExecutionCoordinator,
    pipeline: Arc<ExecutionPipeline>,
    dispatcher: Arc<OutputDispatcher>,
    /// Held whenever a task's schedule columns or its timer change.
    schedule_lock: Arc<Mutex<()>>,
    default_timezone: String,
    shutdown_timeout: Duration,
    running: AtomicBool,
    me: Weak<SchedulerService>,
}

impl SchedulerService {
    pub fn new(
        config: &SchedulerConfig,
        store: Arc<TaskStore>,
        generator: Arc<dyn DataGenerator>,
        dispatcher: Arc<OutputDispatcher>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let weak = me.clone();
            let on_fire: FireCallback = Arc::new(move |task_id, fire_at| {
                if let Some(service) = weak.upgrade() {
                    service.on_timer(&task_id, fire_at);
                }
            });
            let schedule_lock = Arc::new(Mutex::new(()));
            let pipeline = Arc::new(ExecutionPipeline::new(
                Arc::clone(&store),
                generator,
                Arc::clone(&dispatcher),
                Arc::clone(&schedule_lock),
            ));
            let job_store: Arc<dyn JobStore> = store.clone();
            Self {
                store,
                job_store,
                registry: JobRegistry::new(on_fire),
                coordinator: ExecutionCoordinator::new(
                    config.workers,
                    Duration::from_secs(config.misfire_grace_secs),
                ),
                pipeline,
                dispatcher,
                schedule_lock,
                default_timezone: config.default_timezone.clone(),
                shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
                running: AtomicBool::new(false),
                me: me.clone(),
            }
        })
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<OutputDispatcher> {
        &self.dispatcher
    }

    pub fn default_timezone(&self) -> &str {
        &self.default_timezone
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Open admission, close runs a previous process left unfinished, and
    /// arm every active task found in the job store. Returns the number of
    /// armed tasks.
    pub fn start(&self) -> Result<usize> {
        self.coordinator.reopen();
        self.running.store(true, Ordering::Release);

        let _guard = self.lock_schedule();
        let now = Utc::now();
        if self.coordinator.in_flight_count() == 0 {
            let closed = self.store.fail_interrupted_runs(now)?;
            if closed > 0 {
                warn!(closed, "closed runs interrupted by a previous shutdown");
            }
        }
        let entries = self.job_store.list_active(now)?;
        let mut armed = 0;
        for entry in &entries {
            match self.apply_entry(entry, ArmBasis::Stored, now) {
                Ok(Some(_)) => armed += 1,
                Ok(None) => {}
                Err(e) => error!(task_id = %entry.task_id, "cannot recover schedule: {e}"),
            }
        }
        info!(recovered = armed, "scheduler started");
        Ok(armed)
    }

    /// Cancel all timers, stop admitting runs and wait for in-flight runs
    /// up to the configured shutdown timeout. Returns whether every run
    /// settled in time.
    pub async fn stop(&self) -> bool {
        self.running.store(false, Ordering::Release);
        self.registry.disarm_all();
        self.coordinator.close();
        let in_flight = self.coordinator.in_flight_count();
        let drained = self.coordinator.drain(self.shutdown_timeout).await;
        if drained {
            info!(in_flight, "scheduler stopped");
        } else {
            warn!(
                in_flight = self.coordinator.in_flight_count(),
                timeout_secs = self.shutdown_timeout.as_secs(),
                "scheduler stopped with runs still in flight"
            );
        }
        drained
    }

    /// Submit one run of `task_id` to the coordinator.
    pub fn trigger(&self, task_id: &str, trigger: Trigger) -> Admission {
        let Some(me) = self.me.upgrade() else {
            return Admission::Closed;
        };
        let now = Utc::now();
        let fire_at = match trigger {
            Trigger::Scheduled { fire_at } => fire_at,
            Trigger::Manual => now,
        };

        let pipeline = Arc::clone(&self.pipeline);
        let id = task_id.to_string();
        let job = async move {
            if let Err(e) = pipeline.execute(&id, fire_at).await {
                error!(task_id = %id, "run could not be recorded: {e}");
            }
        };
        let id = task_id.to_string();
        let settled = move || me.after_run(&id);

        let admission = self.coordinator.submit(task_id, trigger, now, job, settled);
        debug!(task_id, ?trigger, ?admission, "run requested");
        admission
    }

    /// Recompute and persist the timer for `task_id` from the store.
    /// Returns the armed fire time, or `None` when the task is gone or not
    /// schedulable.
    pub fn rearm(&self, task_id: &str, basis: ArmBasis) -> Result<Option<DateTime<Utc>>> {
        let _guard = self.lock_schedule();
        match self.store.get_task(task_id)? {
            Some(task) => self.apply_entry(&task.schedule_entry(), basis, Utc::now()),
            None => {
                self.registry.disarm(task_id);
                Ok(None)
            }
        }
    }

    /// Bring the registry in line with `task` as just persisted.
    /// Caller holds [`Self::lock_schedule`].
    pub(crate) fn sync_timer(&self, task: &ScheduledTask) {
        match task.next_run_at {
            Some(at) if self.is_running() && task.is_active(Utc::now()) => {
                self.registry.arm(&task.id, at)
            }
            _ => {
                self.registry.disarm(&task.id);
            }
        }
    }

    pub(crate) fn disarm(&self, task_id: &str) -> bool {
        self.registry.disarm(task_id)
    }

    pub(crate) fn lock_schedule(&self) -> MutexGuard<'_, ()> {
        self.schedule_lock.lock().unwrap()
    }

    pub fn is_armed(&self, task_id: &str) -> bool {
        self.registry.is_armed(task_id)
    }

    pub fn armed_fire_time(&self, task_id: &str) -> Option<DateTime<Utc>> {
        self.registry.fire_time(task_id)
    }

    pub fn armed_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_in_flight(&self, task_id: &str) -> bool {
        self.coordinator.is_in_flight(task_id)
    }

    fn on_timer(&self, task_id: &str, fire_at: DateTime<Utc>) {
        if !self.is_running() {
            return;
        }
        match self.trigger(task_id, Trigger::Scheduled { fire_at }) {
            Admission::Misfired { .. } => {
                if let Err(e) = self.rearm(task_id, ArmBasis::Fresh) {
                    error!(task_id, "re-arm after misfire failed: {e}");
                }
            }
            // the run already in flight re-arms when it settles
            Admission::Busy | Admission::Coalesced => {}
            Admission::Started | Admission::Closed => {}
        }
    }

    fn after_run(&self, task_id: &str) {
        if !self.is_running() {
            return;
        }
        if let Err(e) = self.rearm(task_id, ArmBasis::Upcoming) {
            error!(task_id, "re-arm after run failed: {e}");
        }
    }

    /// Caller holds [`Self::lock_schedule`].
    fn apply_entry(
        &self,
        entry: &ScheduleEntry,
        basis: ArmBasis,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let stored = match basis {
            ArmBasis::Stored => entry.next_run_at,
            ArmBasis::Upcoming => entry.next_run_at.filter(|at| *at > now),
            ArmBasis::Fresh => None,
        };
        let next = match stored {
            Some(at) if entry.is_active(now) => Some(at),
            _ => entry.next_fire_after(now, now)?,
        };

        match next {
            Some(at) => {
                if entry.next_run_at != Some(at) {
                    let mut updated = entry.clone();
                    updated.next_run_at = Some(at);
                    self.job_store.upsert(&updated)?;
                }
                if self.is_running() {
                    self.registry.arm(&entry.task_id, at);
                }
            }
            None => {
                self.registry.disarm(&entry.task_id);
                if entry.next_run_at.is_some() {
                    self.job_store.remove(&entry.task_id)?;
                }
            }
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewTask, TaskStatus};
    use datagen_core::config::OutputConfig;
    use datagen_core::types::FieldSpec;
    use datagen_generator::BuiltinGenerator;

    fn service() -> Arc<SchedulerService> {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let dispatcher = Arc::new(OutputDispatcher::new(&OutputConfig::default()).unwrap());
        SchedulerService::new(
            &SchedulerConfig::default(),
            store,
            Arc::new(BuiltinGenerator::new()),
            dispatcher,
        )
    }

    fn insert(service: &SchedulerService, cron: &str) -> ScheduledTask {
        let spec = NewTask::new("orders", cron, vec![FieldSpec::new("id", "uuid")]);
        let task = ScheduledTask::new("alice", spec, "UTC".into(), Utc::now());
        service.store().insert_task(&task).unwrap();
        task
    }

    #[tokio::test]
    async fn start_arms_and_persists_active_tasks() {
        let svc = service();
        let task = insert(&svc, "0 3 * * *");
        assert!(task.next_run_at.is_none());

        assert_eq!(svc.start().unwrap(), 1);
        let stored = svc.store().get_task(&task.id).unwrap().unwrap();
        assert!(stored.next_run_at.is_some());
        assert_eq!(svc.armed_fire_time(&task.id), stored.next_run_at);

        svc.stop().await;
        assert_eq!(svc.armed_count(), 0);
    }

    #[tokio::test]
    async fn start_skips_paused_tasks() {
        let svc = service();
        let task = insert(&svc, "0 3 * * *");
        svc.store()
            .update_task(&task.id, |t| {
                t.status = TaskStatus::Paused;
                t.is_enabled = false;
                Ok(())
            })
            .unwrap();

        assert_eq!(svc.start().unwrap(), 0);
        assert!(!svc.is_armed(&task.id));
        svc.stop().await;
    }

    #[tokio::test]
    async fn rearm_of_missing_task_disarms() {
        let svc = service();
        svc.start().unwrap();
        let task = insert(&svc, "0 3 * * *");
        assert!(svc.rearm(&task.id, ArmBasis::Fresh).unwrap().is_some());
        assert!(svc.is_armed(&task.id));

        svc.store().delete_task(&task.id).unwrap();
        assert!(svc.rearm(&task.id, ArmBasis::Fresh).unwrap().is_none());
        assert!(!svc.is_armed(&task.id));
        svc.stop().await;
    }

    #[tokio::test]
    async fn stopped_service_rejects_runs() {
        let svc = service();
        svc.start().unwrap();
        let task = insert(&svc, "0 3 * * *");
        assert!(svc.stop().await);
        assert_eq!(svc.trigger(&task.id, Trigger::Manual), Admission::Closed);
    }

    #[tokio::test]
    async fn manual_trigger_runs_and_rearms() {
        let svc = service();
        svc.start().unwrap();
        let task = insert(&svc, "0 3 * * *");

        assert_eq!(svc.trigger(&task.id, Trigger::Manual), Admission::Started);
        for _ in 0..100 {
            if svc.is_armed(&task.id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let stored = svc.store().get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.run_count, 1);
        assert!(svc.is_armed(&task.id));
        assert_eq!(svc.armed_fire_time(&task.id), stored.next_run_at);
        svc.stop().await;
    }
}
