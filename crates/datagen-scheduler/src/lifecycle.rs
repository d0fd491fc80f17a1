//! The only mutation entry points into the scheduler core.
//!
//! Every operation on an existing task takes the caller's owner id. All
//! validation happens here, before anything is persisted.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::coordinator::{Admission, Trigger};
use crate::cron;
use crate::error::{Result, SchedulerError};
use crate::output::{DeliveryOutcome, ALLOWED_METHODS};
use crate::service::SchedulerService;
use crate::types::{
    ExecutionLog, NewTask, OutputSpec, Page, ScheduledTask, TaskFilter, TaskStats, TaskStatus,
    TaskUpdate,
};

/// Largest batch a single run may generate.
pub const MAX_ROW_COUNT: u32 = 10_000;
const MAX_NAME_LEN: usize = 100;

pub struct TaskLifecycle {
    service: Arc<SchedulerService>,
}

impl TaskLifecycle {
    pub fn new(service: Arc<SchedulerService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<SchedulerService> {
        &self.service
    }

    /// Validate, persist and arm a new task.
    pub fn create(&self, owner_id: &str, spec: NewTask) -> Result<ScheduledTask> {
        validate_name(&spec.name)?;
        validate_cron(&spec.cron_expression)?;
        validate_fields(&spec.fields)?;
        validate_row_count(spec.row_count)?;
        validate_output(&spec.output)?;
        let timezone = spec
            .timezone
            .clone()
            .unwrap_or_else(|| self.service.default_timezone().to_string());
        cron::parse_timezone(&timezone)?;

        let now = Utc::now();
        let mut task = ScheduledTask::new(owner_id, spec, timezone, now);
        task.next_run_at = task.next_fire_after(now, now)?;

        let _guard = self.service.lock_schedule();
        self.service.store().insert_task(&task)?;
        self.service.sync_timer(&task);
        info!(
            task_id = %task.id,
            name = %task.name,
            cron = %task.cron_expression,
            next_run_at = ?task.next_run_at,
            "task created"
        );
        Ok(task)
    }

    /// Apply a partial update and re-arm in the same critical section.
    /// On any validation error nothing changes and the old schedule stays armed.
    pub fn update(&self, owner_id: &str, id: &str, update: TaskUpdate) -> Result<ScheduledTask> {
        if let Some(name) = &update.name {
            validate_name(name)?;
        }
        if let Some(expr) = &update.cron_expression {
            validate_cron(expr)?;
        }
        if let Some(tz) = &update.timezone {
            cron::parse_timezone(tz)?;
        }
        if let Some(fields) = &update.fields {
            validate_fields(fields)?;
        }
        if let Some(count) = update.row_count {
            validate_row_count(count)?;
        }
        if let Some(output) = &update.output {
            validate_output(output)?;
        }

        let now = Utc::now();
        let _guard = self.service.lock_schedule();
        let task = self
            .service
            .store()
            .update_task(id, |t| {
                ensure_owner(t, owner_id)?;
                let TaskUpdate {
                    name,
                    description,
                    cron_expression,
                    timezone,
                    fields,
                    row_count,
                    export_format,
                    table_name,
                    output,
                    max_runs,
                    expires_at,
                } = update;
                if let Some(v) = name {
                    t.name = v;
                }
                if let Some(v) = description {
                    t.description = v;
                }
                if let Some(v) = cron_expression {
                    t.cron_expression = v;
                }
                if let Some(v) = timezone {
                    t.timezone = v;
                }
                if let Some(v) = fields {
                    t.fields = v;
                }
                if let Some(v) = row_count {
                    t.row_count = v;
                }
                if let Some(v) = export_format {
                    t.export_format = v;
                }
                if let Some(v) = table_name {
                    t.table_name = v;
                }
                if let Some(v) = output {
                    t.output = v;
                }
                if let Some(v) = max_runs {
                    t.max_runs = v;
                }
                if let Some(v) = expires_at {
                    t.expires_at = v;
                }
                t.updated_at = now;
                if t.complete_if_exhausted() {
                    info!(task_id = %t.id, run_count = t.run_count, "max_runs lowered to run count, task completed");
                }
                t.next_run_at = t.next_fire_after(now, now)?;
                Ok(())
            })?
            .ok_or_else(|| not_found(id))?;
        self.service.sync_timer(&task);
        info!(task_id = %task.id, next_run_at = ?task.next_run_at, "task updated");
        Ok(task)
    }

    /// Disable the task and clear its fire time.
    pub fn pause(&self, owner_id: &str, id: &str) -> Result<ScheduledTask> {
        let now = Utc::now();
        let _guard = self.service.lock_schedule();
        let task = self
            .service
            .store()
            .update_task(id, |t| {
                ensure_owner(t, owner_id)?;
                ensure_not_completed(t)?;
                t.status = TaskStatus::Paused;
                t.is_enabled = false;
                t.next_run_at = None;
                t.updated_at = now;
                Ok(())
            })?
            .ok_or_else(|| not_found(id))?;
        self.service.sync_timer(&task);
        info!(task_id = %task.id, "task paused");
        Ok(task)
    }

    /// Re-enable the task with a fire time computed from now.
    pub fn resume(&self, owner_id: &str, id: &str) -> Result<ScheduledTask> {
        let now = Utc::now();
        let _guard = self.service.lock_schedule();
        let task = self
            .service
            .store()
            .update_task(id, |t| {
                ensure_owner(t, owner_id)?;
                ensure_not_completed(t)?;
                t.status = TaskStatus::Active;
                t.is_enabled = true;
                t.updated_at = now;
                t.next_run_at = t.next_fire_after(now, now)?;
                Ok(())
            })?
            .ok_or_else(|| not_found(id))?;
        self.service.sync_timer(&task);
        info!(task_id = %task.id, next_run_at = ?task.next_run_at, "task resumed");
        Ok(task)
    }

    /// Disarm, then delete the task with all of its logs.
    pub fn delete(&self, owner_id: &str, id: &str) -> Result<()> {
        let _guard = self.service.lock_schedule();
        self.owned(owner_id, id)?;
        self.service.disarm(id);
        self.service.store().delete_task(id)?;
        info!(task_id = id, "task deleted");
        Ok(())
    }

    /// Out-of-band run through the same admission path as a timer fire.
    pub fn run_now(&self, owner_id: &str, id: &str) -> Result<Admission> {
        let task = self.owned(owner_id, id)?;
        if !task.is_active(Utc::now()) {
            return Err(SchedulerError::TaskInactive {
                id: id.to_string(),
                status: if task.is_enabled {
                    task.status.to_string()
                } else {
                    "disabled".to_string()
                },
            });
        }
        let admission = self.service.trigger(id, Trigger::Manual);
        info!(task_id = id, ?admission, "manual run requested");
        Ok(admission)
    }

    pub fn get(&self, owner_id: &str, id: &str) -> Result<ScheduledTask> {
        self.owned(owner_id, id)
    }

    pub fn list(&self, owner_id: &str, filter: &TaskFilter) -> Result<Page<ScheduledTask>> {
        self.service.store().list_tasks(owner_id, filter)
    }

    /// Execution logs of one task, newest first.
    pub fn logs(&self, owner_id: &str, id: &str, page: u32, page_size: u32) -> Result<Page<ExecutionLog>> {
        self.owned(owner_id, id)?;
        self.service.store().list_logs(id, page, page_size)
    }

    pub fn stats(&self, owner_id: &str) -> Result<TaskStats> {
        let tasks = self.service.store().owner_tasks(owner_id)?;
        Ok(TaskStats::from_tasks(&tasks))
    }

    /// Send a sample batch through `output` without touching any task.
    pub async fn test_output(&self, output: &OutputSpec) -> Result<DeliveryOutcome> {
        validate_output(output)?;
        self.service
            .dispatcher()
            .test_delivery(output)
            .await
            .ok_or_else(|| SchedulerError::Validation("no output configured".into()))
    }

    fn owned(&self, owner_id: &str, id: &str) -> Result<ScheduledTask> {
        let task = self
            .service
            .store()
            .get_task(id)?
            .ok_or_else(|| not_found(id))?;
        ensure_owner(&task, owner_id)?;
        Ok(task)
    }
}

fn not_found(id: &str) -> SchedulerError {
    SchedulerError::TaskNotFound { id: id.to_string() }
}

fn ensure_owner(task: &ScheduledTask, owner_id: &str) -> Result<()> {
    if task.owner_id != owner_id {
        return Err(SchedulerError::PermissionDenied {
            id: task.id.clone(),
        });
    }
    Ok(())
}

fn ensure_not_completed(task: &ScheduledTask) -> Result<()> {
    if task.status == TaskStatus::Completed {
        return Err(SchedulerError::Validation(format!(
            "task {} is completed",
            task.id
        )));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SchedulerError::Validation("name must not be empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(SchedulerError::Validation(format!(
            "name longer than {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_cron(expression: &str) -> Result<()> {
    cron::next_fire_time(expression, chrono_tz::Tz::UTC, Utc::now()).map(|_| ())
}

fn validate_fields(fields: &[datagen_core::types::FieldSpec]) -> Result<()> {
    if fields.is_empty() {
        return Err(SchedulerError::Validation("at least one field is required".into()));
    }
    if let Some(f) = fields.iter().find(|f| f.name.trim().is_empty()) {
        return Err(SchedulerError::Validation(format!(
            "field of type {} has no name",
            f.field_type
        )));
    }
    Ok(())
}

fn validate_row_count(count: u32) -> Result<()> {
    if !(1..=MAX_ROW_COUNT).contains(&count) {
        return Err(SchedulerError::Validation(format!(
            "row_count must be between 1 and {MAX_ROW_COUNT}"
        )));
    }
    Ok(())
}

fn validate_output(output: &OutputSpec) -> Result<()> {
    match output {
        OutputSpec::None | OutputSpec::Storage(_) => Ok(()),
        OutputSpec::Webhook(spec) => {
            let url = reqwest::Url::parse(&spec.url)
                .map_err(|e| SchedulerError::Validation(format!("invalid webhook url: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(SchedulerError::Validation(format!(
                    "webhook url must be http or https, got {}",
                    url.scheme()
                )));
            }
            let method = spec.method.to_ascii_uppercase();
            if !ALLOWED_METHODS.contains(&method.as_str()) {
                return Err(SchedulerError::Validation(format!(
                    "unsupported webhook method {}",
                    spec.method
                )));
            }
            Ok(())
        }
        OutputSpec::Email(spec) => {
            if spec.recipients.is_empty() {
                return Err(SchedulerError::Validation("email output needs a recipient".into()));
            }
            match spec.recipients.iter().find(|r| !r.contains('@')) {
                Some(bad) => Err(SchedulerError::Validation(format!(
                    "invalid email recipient {bad}"
                ))),
                None => Ok(()),
            }
        }
    }
}
