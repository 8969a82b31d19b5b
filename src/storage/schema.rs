//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Schedule Store, Execution Record Store and run-log tables.
pub fn migrate_store(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS periodic_task_config (
            id INTEGER PRIMARY KEY,
            task_name TEXT NOT NULL UNIQUE,
            task_path TEXT NOT NULL DEFAULT '',
            task_enabled INTEGER NOT NULL DEFAULT 1,
            task_interval INTEGER,
            task_crontab_minute TEXT,
            task_crontab_hour TEXT,
            task_crontab_day_of_week TEXT,
            task_crontab_day_of_month TEXT,
            task_crontab_month_of_year TEXT,
            task_args TEXT,
            task_kwargs TEXT,
            task_extra_config TEXT,
            task_last_run_time TEXT,
            task_run_count INTEGER NOT NULL DEFAULT 0,
            task_description TEXT,
            create_by TEXT,
            update_by TEXT,
            create_time TEXT NOT NULL,
            update_time TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS task_execution_log (
            id INTEGER PRIMARY KEY,
            task_id TEXT NOT NULL UNIQUE,
            task_name TEXT NOT NULL,
            status TEXT NOT NULL,
            start_time TEXT NOT NULL,
            complete_time TEXT,
            task_args TEXT,
            task_kwargs TEXT,
            result TEXT,
            traceback TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS periodic_task_run_log (
            id INTEGER PRIMARY KEY,
            config_id INTEGER,
            task_name TEXT NOT NULL,
            execution_time TEXT NOT NULL,
            status TEXT NOT NULL,
            result TEXT,
            error_message TEXT,
            duration_ms INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_periodic_task_enabled ON periodic_task_config(task_enabled);
        CREATE INDEX IF NOT EXISTS idx_execution_log_start ON task_execution_log(start_time);
        CREATE INDEX IF NOT EXISTS idx_run_log_name_time ON periodic_task_run_log(task_name, execution_time);",
    )?;

    Ok(())
}

/// Broker queue table.
pub fn migrate_broker(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS task_queue (
            id INTEGER PRIMARY KEY,
            task_id TEXT NOT NULL,
            task_name TEXT NOT NULL,
            task_path TEXT NOT NULL,
            queue TEXT NOT NULL,
            args_json TEXT NOT NULL DEFAULT '[]',
            kwargs_json TEXT NOT NULL DEFAULT '{}',
            retries INTEGER NOT NULL DEFAULT 0,
            eta TEXT,
            expires_at TEXT,
            claimed INTEGER NOT NULL DEFAULT 0,
            claimed_at TEXT,
            enqueued_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_task_queue_pending ON task_queue(queue, claimed, id);",
    )?;

    // Broker files created before claim tracking.
    let has_claimed_at = conn
        .prepare("SELECT 1 FROM pragma_table_info('task_queue') WHERE name = 'claimed_at'")?
        .exists([])?;
    if !has_claimed_at {
        conn.execute_batch("ALTER TABLE task_queue ADD COLUMN claimed_at TEXT")?;
    }

    Ok(())
}
