//! SQLite-backed schedule store and execution log store.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::db::init_db;
use crate::error::Result;
use crate::job_store::JobStore;
use crate::types::{
    page_bounds, ExecutionLog, ExecutionStatus, OutputSpec, Page, ScheduleEntry, ScheduledTask,
    TaskFilter, TaskStatus,
};

const TASK_COLUMNS: &str = "id, owner_id, project_id, template_id, name, description,
    cron_expression, timezone, fields_config, row_count, export_format, table_name,
    output_type, output_config, status, is_enabled, max_runs, expires_at,
    run_count, success_count, fail_count, last_run_at, last_run_status, last_error,
    next_run_at, created_at, updated_at";

const LOG_COLUMNS: &str = "id, task_id, started_at, finished_at, duration_ms, status,
    rows_generated, data_size_bytes, error_message, output_status, output_message";

const ENTRY_COLUMNS: &str = "id, cron_expression, timezone, is_enabled, status,
    next_run_at, run_count, max_runs, expires_at";

/// Error text recorded on runs that never finished.
pub const INTERRUPTED_MESSAGE: &str = "interrupted: scheduler stopped before the run finished";

/// Persists scheduled tasks and their execution logs.
///
/// All access goes through one `Mutex<Connection>`, so every method is a
/// single atomic step from the point of view of other callers.
pub struct TaskStore {
    db: Mutex<Connection>,
}

impl TaskStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    pub fn insert_task(&self, task: &ScheduledTask) -> Result<()> {
        let db = self.db.lock().unwrap();
        write_task(&db, task)?;
        debug!(task_id = %task.id, "task row inserted");
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let db = self.db.lock().unwrap();
        load_task(&db, id)
    }

    /// Read-modify-write one task in a transaction.
    ///
    /// Returns `Ok(None)` if the task does not exist. If `f` fails nothing
    /// is written and its error is returned.
    pub fn update_task<F>(&self, id: &str, f: F) -> Result<Option<ScheduledTask>>
    where
        F: FnOnce(&mut ScheduledTask) -> Result<()>,
    {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let Some(mut task) = load_task(&tx, id)? else {
            return Ok(None);
        };
        f(&mut task)?;
        write_task(&tx, &task)?;
        tx.commit()?;
        Ok(Some(task))
    }

    /// Delete a task and all of its logs. Returns `false` if it did not exist.
    pub fn delete_task(&self, id: &str) -> Result<bool> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let logs = tx.execute("DELETE FROM task_execution_logs WHERE task_id = ?1", [id])?;
        let n = tx.execute("DELETE FROM scheduled_tasks WHERE id = ?1", [id])?;
        tx.commit()?;
        if n > 0 {
            info!(task_id = %id, logs, "task deleted");
        }
        Ok(n > 0)
    }

    /// One page of `owner_id`'s tasks, newest first.
    pub fn list_tasks(&self, owner_id: &str, filter: &TaskFilter) -> Result<Page<ScheduledTask>> {
        let mut clauses = vec!["owner_id = ?"];
        let mut args = vec![Value::Text(owner_id.to_string())];
        if let Some(project) = &filter.project_id {
            clauses.push("project_id = ?");
            args.push(Value::Text(project.clone()));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            args.push(Value::Text(status.to_string()));
        }
        let where_sql = clauses.join(" AND ");

        let db = self.db.lock().unwrap();
        let total: i64 = db.query_row(
            &format!("SELECT COUNT(*) FROM scheduled_tasks WHERE {where_sql}"),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let (limit, offset) = filter.limit_offset();
        args.push(Value::Integer(i64::from(limit)));
        args.push(Value::Integer(i64::from(offset)));
        let mut stmt = db.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE {where_sql}
             ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        ))?;
        let items = stmt
            .query_map(params_from_iter(args.iter()), row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total as u64,
        })
    }

    /// Every task owned by `owner_id`, for aggregate statistics.
    pub fn owner_tasks(&self, owner_id: &str) -> Result<Vec<ScheduledTask>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE owner_id = ?1"
        ))?;
        let tasks = stmt
            .query_map([owner_id], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Open a log row in the `running` state.
    pub fn begin_run(&self, task_id: &str, started_at: DateTime<Utc>) -> Result<ExecutionLog> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO task_execution_logs (task_id, started_at, status)
             VALUES (?1, ?2, ?3)",
            params![task_id, ts(started_at), ExecutionStatus::Running.to_string()],
        )?;
        Ok(ExecutionLog {
            id: db.last_insert_rowid(),
            task_id: task_id.to_string(),
            started_at,
            finished_at: None,
            duration_ms: None,
            status: ExecutionStatus::Running,
            rows_generated: None,
            data_size_bytes: None,
            error_message: None,
            output_status: None,
            output_message: None,
        })
    }

    /// Close every log row still marked running, as left behind by a process
    /// that died mid-run. Returns the number of rows closed.
    pub fn fail_interrupted_runs(&self, at: DateTime<Utc>) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let closed = db.execute(
            "UPDATE task_execution_logs SET finished_at = ?1, status = ?2, error_message = ?3
             WHERE status = ?4",
            params![
                ts(at),
                ExecutionStatus::Failed.to_string(),
                INTERRUPTED_MESSAGE,
                ExecutionStatus::Running.to_string(),
            ],
        )?;
        Ok(closed)
    }

    /// Finalise `log` and apply `account` to its task in one transaction.
    ///
    /// Returns `Ok(None)` when the task was deleted while the run was in
    /// flight; the log row went with it.
    pub fn finalize_run<F>(&self, log: &ExecutionLog, account: F) -> Result<Option<ScheduledTask>>
    where
        F: FnOnce(&mut ScheduledTask),
    {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let Some(mut task) = load_task(&tx, &log.task_id)? else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE task_execution_logs SET finished_at = ?1, duration_ms = ?2, status = ?3,
                rows_generated = ?4, data_size_bytes = ?5, error_message = ?6,
                output_status = ?7, output_message = ?8
             WHERE id = ?9",
            params![
                log.finished_at.map(ts),
                log.duration_ms,
                log.status.to_string(),
                log.rows_generated,
                log.data_size_bytes.map(|n| n as i64),
                log.error_message,
                log.output_status.map(|s| s.to_string()),
                log.output_message,
                log.id,
            ],
        )?;
        account(&mut task);
        write_task(&tx, &task)?;
        tx.commit()?;
        Ok(Some(task))
    }

    /// One page of a task's logs, newest first.
    pub fn list_logs(&self, task_id: &str, page: u32, page_size: u32) -> Result<Page<ExecutionLog>> {
        let db = self.db.lock().unwrap();
        let total: i64 = db.query_row(
            "SELECT COUNT(*) FROM task_execution_logs WHERE task_id = ?1",
            [task_id],
            |row| row.get(0),
        )?;
        let (limit, offset) = page_bounds(page, page_size);
        let mut stmt = db.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM task_execution_logs WHERE task_id = ?1
             ORDER BY started_at DESC, id DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let items = stmt
            .query_map(params![task_id, limit, offset], row_to_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Page {
            items,
            total: total as u64,
        })
    }
}

impl JobStore for TaskStore {
    /// Writes the schedule columns only; accounting stays with the pipeline.
    fn upsert(&self, entry: &ScheduleEntry) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE scheduled_tasks SET cron_expression = ?1, timezone = ?2, is_enabled = ?3,
                status = ?4, next_run_at = ?5, max_runs = ?6, expires_at = ?7
             WHERE id = ?8",
            params![
                entry.cron_expression,
                entry.timezone,
                entry.is_enabled,
                entry.status.to_string(),
                entry.next_run_at.map(ts),
                entry.max_runs,
                entry.expires_at.map(ts),
                entry.task_id,
            ],
        )?;
        Ok(())
    }

    fn remove(&self, task_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE scheduled_tasks SET next_run_at = NULL WHERE id = ?1",
            [task_id],
        )?;
        Ok(())
    }

    fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM scheduled_tasks
             WHERE is_enabled = 1 AND status = 'active'"
        ))?;
        let entries = stmt
            .query_map([], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries.into_iter().filter(|e| e.is_active(now)).collect())
    }
}

// --- row mapping -------------------------------------------------------------

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e.to_string()))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get_ref(idx)? {
        rusqlite::types::ValueRef::Null => Ok(None),
        _ => ts_col(row, idx).map(Some),
    }
}

fn parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| conversion_err(idx, e.to_string()))
}

fn opt_parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse::<T>().map_err(|e| conversion_err(idx, e.to_string())))
        .transpose()
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let fields_json: String = row.get(8)?;
    let output_type: String = row.get(12)?;
    let output_config: Option<String> = row.get(13)?;
    Ok(ScheduledTask {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        project_id: row.get(2)?,
        template_id: row.get(3)?,
        name: row.get(4)?,
        description: row.get(5)?,
        cron_expression: row.get(6)?,
        timezone: row.get(7)?,
        fields: serde_json::from_str(&fields_json).map_err(|e| conversion_err(8, e.to_string()))?,
        row_count: row.get(9)?,
        export_format: parsed_col(row, 10)?,
        table_name: row.get(11)?,
        output: OutputSpec::from_parts(&output_type, output_config.as_deref())
            .map_err(|e| conversion_err(13, e))?,
        status: parsed_col(row, 14)?,
        is_enabled: row.get(15)?,
        max_runs: row.get(16)?,
        expires_at: opt_ts_col(row, 17)?,
        run_count: row.get(18)?,
        success_count: row.get(19)?,
        fail_count: row.get(20)?,
        last_run_at: opt_ts_col(row, 21)?,
        last_run_status: opt_parsed_col(row, 22)?,
        last_error: row.get(23)?,
        next_run_at: opt_ts_col(row, 24)?,
        created_at: ts_col(row, 25)?,
        updated_at: ts_col(row, 26)?,
    })
}

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<ExecutionLog> {
    Ok(ExecutionLog {
        id: row.get(0)?,
        task_id: row.get(1)?,
        started_at: ts_col(row, 2)?,
        finished_at: opt_ts_col(row, 3)?,
        duration_ms: row.get(4)?,
        status: parsed_col(row, 5)?,
        rows_generated: row.get(6)?,
        data_size_bytes: row.get::<_, Option<i64>>(7)?.map(|n| n as u64),
        error_message: row.get(8)?,
        output_status: opt_parsed_col(row, 9)?,
        output_message: row.get(10)?,
    })
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<ScheduleEntry> {
    Ok(ScheduleEntry {
        task_id: row.get(0)?,
        cron_expression: row.get(1)?,
        timezone: row.get(2)?,
        is_enabled: row.get(3)?,
        status: parsed_col::<TaskStatus>(row, 4)?,
        next_run_at: opt_ts_col(row, 5)?,
        run_count: row.get(6)?,
        max_runs: row.get(7)?,
        expires_at: opt_ts_col(row, 8)?,
    })
}

fn load_task(conn: &Connection, id: &str) -> Result<Option<ScheduledTask>> {
    let task = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
            [id],
            row_to_task,
        )
        .optional()?;
    Ok(task)
}

/// Insert or fully overwrite a task row. Never a `REPLACE`, which would
/// cascade-delete the task's logs.
fn write_task(conn: &Connection, task: &ScheduledTask) -> Result<()> {
    let fields = serde_json::to_string(&task.fields)?;
    let output_config = task.output.config_json()?;
    conn.execute(
        &format!(
            "INSERT INTO scheduled_tasks ({TASK_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                     ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)
             ON CONFLICT (id) DO UPDATE SET
                project_id = excluded.project_id,
                template_id = excluded.template_id,
                name = excluded.name,
                description = excluded.description,
                cron_expression = excluded.cron_expression,
                timezone = excluded.timezone,
                fields_config = excluded.fields_config,
                row_count = excluded.row_count,
                export_format = excluded.export_format,
                table_name = excluded.table_name,
                output_type = excluded.output_type,
                output_config = excluded.output_config,
                status = excluded.status,
                is_enabled = excluded.is_enabled,
                max_runs = excluded.max_runs,
                expires_at = excluded.expires_at,
                run_count = excluded.run_count,
                success_count = excluded.success_count,
                fail_count = excluded.fail_count,
                last_run_at = excluded.last_run_at,
                last_run_status = excluded.last_run_status,
                last_error = excluded.last_error,
                next_run_at = excluded.next_run_at,
                updated_at = excluded.updated_at"
        ),
        params![
            task.id,
            task.owner_id,
            task.project_id,
            task.template_id,
            task.name,
            task.description,
            task.cron_expression,
            task.timezone,
            fields,
            task.row_count,
            task.export_format.to_string(),
            task.table_name,
            task.output.kind(),
            output_config,
            task.status.to_string(),
            task.is_enabled,
            task.max_runs,
            task.expires_at.map(ts),
            task.run_count,
            task.success_count,
            task.fail_count,
            task.last_run_at.map(ts),
            task.last_run_status.map(|s| s.to_string()),
            task.last_error,
            task.next_run_at.map(ts),
            ts(task.created_at),
            ts(task.updated_at),
        ],
    )?;
    Ok(())
}
