use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use datagen_core::types::{ExportFormat, FieldSpec};
use serde::{Deserialize, Deserializer, Serialize};

/// Lifecycle state of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Schedulable; the registry keeps a timer armed while `is_active` holds.
    Active,
    /// Stopped by the owner; resumable.
    Paused,
    /// Set by an operator only, never by the pipeline.
    Error,
    /// `max_runs` reached. Terminal.
    Completed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Error => "error",
            TaskStatus::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(TaskStatus::Active),
            "paused" => Ok(TaskStatus::Paused),
            "error" => Ok(TaskStatus::Error),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Outcome of one execution. `Running` only appears on a log row that has
/// not been finalised yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Outcome of handing a batch to the output sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    Success,
    Failed,
    /// The sink kind has no delivery path (e.g. email).
    Skipped,
}

impl std::fmt::Display for OutputStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutputStatus::Success => "success",
            OutputStatus::Failed => "failed",
            OutputStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OutputStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(OutputStatus::Success),
            "failed" => Ok(OutputStatus::Failed),
            "skipped" => Ok(OutputStatus::Skipped),
            other => Err(format!("unknown output status: {other}")),
        }
    }
}

/// Where a task's generated batch goes after each run.
///
/// Stored as two columns: `output_type` (the tag) and `output_config`
/// (the variant body as JSON).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputSpec {
    #[default]
    None,
    Webhook(WebhookSpec),
    Email(EmailSpec),
    Storage(StorageSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSpec {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// HMAC-SHA256 key for `X-Webhook-Signature`. No signature when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl WebhookSpec {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            method: default_method(),
            headers: BTreeMap::new(),
            secret: None,
        }
    }
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailSpec {
    #[serde(default)]
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageSpec {
    /// Export directory; falls back to `output.storage_dir` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
}

impl OutputSpec {
    /// Value of the `output_type` column.
    pub fn kind(&self) -> &'static str {
        match self {
            OutputSpec::None => "none",
            OutputSpec::Webhook(_) => "webhook",
            OutputSpec::Email(_) => "email",
            OutputSpec::Storage(_) => "storage",
        }
    }

    /// Value of the `output_config` column (`None` for the `none` sink).
    pub fn config_json(&self) -> serde_json::Result<Option<String>> {
        match self {
            OutputSpec::None => Ok(None),
            OutputSpec::Webhook(c) => serde_json::to_string(c).map(Some),
            OutputSpec::Email(c) => serde_json::to_string(c).map(Some),
            OutputSpec::Storage(c) => serde_json::to_string(c).map(Some),
        }
    }

    /// Rebuild from the two stored columns.
    pub fn from_parts(kind: &str, config: Option<&str>) -> std::result::Result<Self, String> {
        let body = config.unwrap_or("{}");
        let parsed = match kind {
            "none" => return Ok(OutputSpec::None),
            "webhook" => serde_json::from_str(body).map(OutputSpec::Webhook),
            "email" => serde_json::from_str(body).map(OutputSpec::Email),
            "storage" => serde_json::from_str(body).map(OutputSpec::Storage),
            other => return Err(format!("unknown output type: {other}")),
        };
        parsed.map_err(|e| format!("bad {kind} output config: {e}"))
    }
}

/// A persisted recurring data-generation task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// UUID v4 string, primary key.
    pub id: String,
    pub owner_id: String,
    pub project_id: Option<String>,
    pub template_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    /// Standard 5-field cron expression.
    pub cron_expression: String,
    /// IANA timezone the cron expression is evaluated in.
    pub timezone: String,
    pub fields: Vec<FieldSpec>,
    pub row_count: u32,
    pub export_format: ExportFormat,
    pub table_name: Option<String>,
    pub output: OutputSpec,
    pub status: TaskStatus,
    pub is_enabled: bool,
    /// Unlimited when `None`.
    pub max_runs: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub run_count: u32,
    pub success_count: u32,
    pub fail_count: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<ExecutionStatus>,
    pub last_error: Option<String>,
    /// `None` whenever the task is not schedulable.
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    /// A fresh active task with zeroed accounting and no fire time yet.
    pub fn new(owner_id: &str, spec: NewTask, timezone: String, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            project_id: spec.project_id,
            template_id: spec.template_id,
            name: spec.name,
            description: spec.description,
            cron_expression: spec.cron_expression,
            timezone,
            fields: spec.fields,
            row_count: spec.row_count,
            export_format: spec.export_format,
            table_name: spec.table_name,
            output: spec.output,
            status: TaskStatus::Active,
            is_enabled: true,
            max_runs: spec.max_runs,
            expires_at: spec.expires_at,
            run_count: 0,
            success_count: 0,
            fail_count: 0,
            last_run_at: None,
            last_run_status: None,
            last_error: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the registry should keep a timer armed for this task at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        schedulable(
            self.is_enabled,
            self.status,
            self.expires_at,
            self.run_count,
            self.max_runs,
            now,
        )
    }

    /// Next fire strictly after `after`, or `None` when the task is not
    /// schedulable at `now` or the fire would fall past `expires_at`.
    pub fn next_fire_after(
        &self,
        now: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> crate::error::Result<Option<DateTime<Utc>>> {
        if !self.is_active(now) {
            return Ok(None);
        }
        next_fire(&self.cron_expression, &self.timezone, self.expires_at, after)
    }

    /// Apply one finished run to the accounting columns.
    ///
    /// Moves the task to `Completed` once `run_count` reaches `max_runs`.
    pub fn record_run(
        &mut self,
        status: ExecutionStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) {
        self.run_count += 1;
        if status == ExecutionStatus::Success {
            self.success_count += 1;
            self.last_error = None;
        } else {
            self.fail_count += 1;
            self.last_error = error.map(String::from);
        }
        self.last_run_at = Some(at);
        self.last_run_status = Some(status);
        self.complete_if_exhausted();
        self.updated_at = at;
    }

    /// Move to `Completed` when `run_count` has reached `max_runs`.
    pub fn complete_if_exhausted(&mut self) -> bool {
        if self.max_runs.is_some_and(|max| self.run_count >= max) {
            self.status = TaskStatus::Completed;
            return true;
        }
        false
    }

    /// The subset of columns needed to re-arm the task after a restart.
    pub fn schedule_entry(&self) -> ScheduleEntry {
        ScheduleEntry {
            task_id: self.id.clone(),
            cron_expression: self.cron_expression.clone(),
            timezone: self.timezone.clone(),
            is_enabled: self.is_enabled,
            status: self.status,
            next_run_at: self.next_run_at,
            run_count: self.run_count,
            max_runs: self.max_runs,
            expires_at: self.expires_at,
        }
    }
}

/// Durable schedule state of one task, as seen by the job registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub task_id: String,
    pub cron_expression: String,
    pub timezone: String,
    pub is_enabled: bool,
    pub status: TaskStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: u32,
    pub max_runs: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        schedulable(
            self.is_enabled,
            self.status,
            self.expires_at,
            self.run_count,
            self.max_runs,
            now,
        )
    }

    /// Same rules as [`ScheduledTask::next_fire_after`].
    pub fn next_fire_after(
        &self,
        now: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> crate::error::Result<Option<DateTime<Utc>>> {
        if !self.is_active(now) {
            return Ok(None);
        }
        next_fire(&self.cron_expression, &self.timezone, self.expires_at, after)
    }
}

fn next_fire(
    expression: &str,
    timezone: &str,
    expires_at: Option<DateTime<Utc>>,
    after: DateTime<Utc>,
) -> crate::error::Result<Option<DateTime<Utc>>> {
    let tz = crate::cron::parse_timezone(timezone)?;
    let next = crate::cron::next_fire_time(expression, tz, after)?;
    Ok(Some(next).filter(|at| !expires_at.is_some_and(|exp| *at >= exp)))
}

fn schedulable(
    is_enabled: bool,
    status: TaskStatus,
    expires_at: Option<DateTime<Utc>>,
    run_count: u32,
    max_runs: Option<u32>,
    now: DateTime<Utc>,
) -> bool {
    is_enabled
        && status == TaskStatus::Active
        && !expires_at.is_some_and(|exp| now >= exp)
        && !max_runs.is_some_and(|max| run_count >= max)
}

/// One run attempt of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: i64,
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: ExecutionStatus,
    pub rows_generated: Option<u32>,
    pub data_size_bytes: Option<u64>,
    pub error_message: Option<String>,
    /// `None` when generation failed and no delivery was attempted.
    pub output_status: Option<OutputStatus>,
    pub output_message: Option<String>,
}

/// Input of `TaskLifecycle::create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
    pub cron_expression: String,
    /// Falls back to `scheduler.default_timezone`.
    #[serde(default)]
    pub timezone: Option<String>,
    pub fields: Vec<FieldSpec>,
    #[serde(default = "default_row_count")]
    pub row_count: u32,
    #[serde(default)]
    pub export_format: ExportFormat,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub output: OutputSpec,
    #[serde(default)]
    pub max_runs: Option<u32>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(name: &str, cron_expression: &str, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            project_id: None,
            template_id: None,
            cron_expression: cron_expression.to_string(),
            timezone: None,
            fields,
            row_count: default_row_count(),
            export_format: ExportFormat::default(),
            table_name: None,
            output: OutputSpec::None,
            max_runs: None,
            expires_at: None,
        }
    }
}

pub const DEFAULT_ROW_COUNT: u32 = 100;

fn default_row_count() -> u32 {
    DEFAULT_ROW_COUNT
}

/// Partial update for `TaskLifecycle::update`. Absent fields are left alone;
/// `Some(None)` clears a nullable column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub fields: Option<Vec<FieldSpec>>,
    #[serde(default)]
    pub row_count: Option<u32>,
    #[serde(default)]
    pub export_format: Option<ExportFormat>,
    #[serde(default, deserialize_with = "double_option")]
    pub table_name: Option<Option<String>>,
    #[serde(default)]
    pub output: Option<OutputSpec>,
    #[serde(default, deserialize_with = "double_option")]
    pub max_runs: Option<Option<u32>>,
    #[serde(default, deserialize_with = "double_option")]
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

/// Distinguishes an explicit `null` from a missing key.
fn double_option<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Filter and pagination for `TaskLifecycle::list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            project_id: None,
            status: None,
            page: default_page(),
            page_size: default_page_size(),
        }
    }
}

impl TaskFilter {
    /// `(limit, offset)` for the page, with 1-based pages.
    pub fn limit_offset(&self) -> (u32, u32) {
        page_bounds(self.page, self.page_size)
    }
}

pub(crate) fn page_bounds(page: u32, page_size: u32) -> (u32, u32) {
    let size = page_size.max(1);
    (size, page.max(1).saturating_sub(1).saturating_mul(size))
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

/// One page of a listing plus the unpaginated total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

/// Per-owner aggregates returned by `TaskLifecycle::stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total_tasks: u64,
    pub active_tasks: u64,
    pub paused_tasks: u64,
    pub error_tasks: u64,
    pub completed_tasks: u64,
    pub total_runs: u64,
    pub total_success: u64,
    pub total_fail: u64,
    /// Percentage rounded to one decimal; 0 when nothing has run.
    pub success_rate: f64,
}

impl TaskStats {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a ScheduledTask>) -> Self {
        let mut stats = TaskStats::default();
        for task in tasks {
            stats.total_tasks += 1;
            if task.status == TaskStatus::Active && task.is_enabled {
                stats.active_tasks += 1;
            }
            if task.status == TaskStatus::Paused || !task.is_enabled {
                stats.paused_tasks += 1;
            }
            match task.status {
                TaskStatus::Error => stats.error_tasks += 1,
                TaskStatus::Completed => stats.completed_tasks += 1,
                _ => {}
            }
            stats.total_runs += u64::from(task.run_count);
            stats.total_success += u64::from(task.success_count);
            stats.total_fail += u64::from(task.fail_count);
        }
        if stats.total_runs > 0 {
            let rate = stats.total_success as f64 / stats.total_runs as f64 * 100.0;
            stats.success_rate = (rate * 10.0).round() / 10.0;
        }
        stats
    }
}
