use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates `scheduled_tasks` and `task_execution_logs` (idempotent). Logs
/// reference their task with `ON DELETE CASCADE`; the store also deletes
/// them explicitly so the cascade holds even when `foreign_keys` is off.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS scheduled_tasks (
            id              TEXT    NOT NULL PRIMARY KEY,
            owner_id        TEXT    NOT NULL,
            project_id      TEXT,
            template_id     TEXT,
            name            TEXT    NOT NULL,
            description     TEXT,
            cron_expression TEXT    NOT NULL,
            timezone        TEXT    NOT NULL,
            fields_config   TEXT    NOT NULL,   -- JSON array of field specs
            row_count       INTEGER NOT NULL,
            export_format   TEXT    NOT NULL DEFAULT 'json',
            table_name      TEXT,
            output_type     TEXT    NOT NULL DEFAULT 'none',
            output_config   TEXT,               -- JSON sink settings or NULL
            status          TEXT    NOT NULL DEFAULT 'active',
            is_enabled      INTEGER NOT NULL DEFAULT 1,
            max_runs        INTEGER,            -- NULL means unlimited
            expires_at      TEXT,
            run_count       INTEGER NOT NULL DEFAULT 0,
            success_count   INTEGER NOT NULL DEFAULT 0,
            fail_count      INTEGER NOT NULL DEFAULT 0,
            last_run_at     TEXT,
            last_run_status TEXT,
            last_error      TEXT,
            next_run_at     TEXT,               -- NULL when not schedulable
            created_at      TEXT    NOT NULL,
            updated_at      TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_tasks_owner ON scheduled_tasks (owner_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON scheduled_tasks (status);

        CREATE TABLE IF NOT EXISTS task_execution_logs (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id         TEXT    NOT NULL
                            REFERENCES scheduled_tasks (id) ON DELETE CASCADE,
            started_at      TEXT    NOT NULL,
            finished_at     TEXT,
            duration_ms     INTEGER,
            status          TEXT    NOT NULL,
            rows_generated  INTEGER,
            data_size_bytes INTEGER,
            error_message   TEXT,
            output_status   TEXT,
            output_message  TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_logs_task ON task_execution_logs (task_id, started_at);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('scheduled_tasks', 'task_execution_logs')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(n, 2);
    }
}
