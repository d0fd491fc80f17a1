//! One admitted run of a task: generate, deliver, record.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use datagen_core::types::Row;
use datagen_generator::DataGenerator;

use crate::error::Result;
use crate::output::OutputDispatcher;
use crate::store::TaskStore;
use crate::types::{ExecutionLog, ExecutionStatus, OutputStatus, ScheduledTask};

/// The finalised log and the task as it stands after accounting.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub log: ExecutionLog,
    pub task: ScheduledTask,
}

pub struct ExecutionPipeline {
    store: Arc<TaskStore>,
    generator: Arc<dyn DataGenerator>,
    dispatcher: Arc<OutputDispatcher>,
    /// Shared with the scheduler service; held while schedule columns change.
    schedule_lock: Arc<Mutex<()>>,
}

impl ExecutionPipeline {
    pub fn new(
        store: Arc<TaskStore>,
        generator: Arc<dyn DataGenerator>,
        dispatcher: Arc<OutputDispatcher>,
        schedule_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            store,
            generator,
            dispatcher,
            schedule_lock,
        }
    }

    /// Run `task_id` once for the fire at `fire_at`.
    ///
    /// Generation and delivery failures are recorded on the log, not
    /// returned. `Ok(None)` means the task is gone or no longer active and
    /// nothing was recorded. `Err` is reserved for store failures.
    pub async fn execute(&self, task_id: &str, fire_at: DateTime<Utc>) -> Result<Option<RunReport>> {
        let started_at = Utc::now();
        let Some(task) = self.store.get_task(task_id)? else {
            debug!(task_id, "fire for deleted task ignored");
            return Ok(None);
        };
        if !task.is_active(started_at) {
            info!(task_id, status = %task.status, "task not active, run skipped");
            return Ok(None);
        }

        let mut log = self.store.begin_run(task_id, started_at)?;
        let clock = Instant::now();

        match self.generate(&task).await {
            Ok(rows) => {
                log.status = ExecutionStatus::Success;
                log.rows_generated = Some(rows.len() as u32);
                log.data_size_bytes =
                    Some(serde_json::to_vec(&rows).map_or(0, |body| body.len() as u64));
                if let Some(outcome) = self.dispatcher.deliver(&task, &rows).await {
                    if outcome.status == OutputStatus::Failed {
                        warn!(task_id, kind = task.output.kind(), message = %outcome.message, "delivery failed");
                    }
                    log.output_status = Some(outcome.status);
                    log.output_message = Some(outcome.message);
                }
            }
            Err(message) => {
                warn!(task_id, error = %message, "generation failed");
                log.status = ExecutionStatus::Failed;
                log.error_message = Some(message);
            }
        }

        let finished_at = Utc::now();
        log.finished_at = Some(finished_at);
        log.duration_ms = Some(clock.elapsed().as_millis() as i64);
        // Never schedule the next fire at or before the one just handled.
        let basis = fire_at.max(finished_at);

        let updated = {
            let _guard = self.schedule_lock.lock().unwrap();
            self.store.finalize_run(&log, |t| {
                t.record_run(log.status, log.error_message.as_deref(), finished_at);
                t.next_run_at = match t.next_fire_after(finished_at, basis) {
                    Ok(next) => next,
                    Err(e) => {
                        error!(task_id = %t.id, "cannot compute next fire: {e}");
                        None
                    }
                };
            })?
        };

        let Some(task) = updated else {
            debug!(task_id, "task deleted during run");
            return Ok(None);
        };
        info!(
            task_id,
            status = %log.status,
            rows = log.rows_generated.unwrap_or(0),
            duration_ms = log.duration_ms.unwrap_or(0),
            run_count = task.run_count,
            next_run_at = ?task.next_run_at,
            "run finished"
        );
        Ok(Some(RunReport { log, task }))
    }

    /// Generation is CPU-bound; keep it off the async workers.
    async fn generate(&self, task: &ScheduledTask) -> std::result::Result<Vec<Row>, String> {
        let generator = Arc::clone(&self.generator);
        let fields = task.fields.clone();
        let count = task.row_count;
        match tokio::task::spawn_blocking(move || generator.generate(&fields, count)).await {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("generator panicked: {e}")),
        }
    }
}
