//! Schedule Store: the `periodic_task_config` table.
//!
//! The scheduler only reads this table. Executors bump the run bookkeeping
//! columns; everything else is owned by whoever manages the rows.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::{Pool, StoreHandle};

const COLUMNS: &str = "id, task_name, task_path, task_enabled, task_interval,
    task_crontab_minute, task_crontab_hour, task_crontab_day_of_week,
    task_crontab_day_of_month, task_crontab_month_of_year,
    task_args, task_kwargs, task_extra_config, task_last_run_time, task_run_count,
    task_description, create_by, update_by, create_time, update_time";

/// One schedulable job as persisted. Timestamps are store-local strings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodicTaskConfig {
    pub id: i64,
    pub task_name: String,
    pub task_path: String,
    pub task_enabled: bool,
    pub task_interval: Option<i64>,
    pub crontab_minute: Option<String>,
    pub crontab_hour: Option<String>,
    pub crontab_day_of_week: Option<String>,
    pub crontab_day_of_month: Option<String>,
    pub crontab_month_of_year: Option<String>,
    pub task_args: Option<String>,
    pub task_kwargs: Option<String>,
    pub task_extra_config: Option<String>,
    pub task_last_run_time: Option<String>,
    pub task_run_count: i64,
    pub task_description: Option<String>,
    pub create_by: Option<String>,
    pub update_by: Option<String>,
    pub create_time: String,
    pub update_time: String,
}

impl PeriodicTaskConfig {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_name: row.get(1)?,
            task_path: row.get(2)?,
            task_enabled: row.get::<_, i64>(3)? != 0,
            task_interval: row.get(4)?,
            crontab_minute: row.get(5)?,
            crontab_hour: row.get(6)?,
            crontab_day_of_week: row.get(7)?,
            crontab_day_of_month: row.get(8)?,
            crontab_month_of_year: row.get(9)?,
            task_args: row.get(10)?,
            task_kwargs: row.get(11)?,
            task_extra_config: row.get(12)?,
            task_last_run_time: row.get(13)?,
            task_run_count: row.get(14)?,
            task_description: row.get(15)?,
            create_by: row.get(16)?,
            update_by: row.get(17)?,
            create_time: row.get(18)?,
            update_time: row.get(19)?,
        })
    }

    /// Whether any crontab component carries a value.
    pub fn has_crontab(&self) -> bool {
        [
            &self.crontab_minute,
            &self.crontab_hour,
            &self.crontab_day_of_week,
            &self.crontab_day_of_month,
            &self.crontab_month_of_year,
        ]
        .iter()
        .any(|f| f.as_deref().is_some_and(|v| !v.trim().is_empty()))
    }
}

/// Fields supplied when creating a row.
#[derive(Debug, Clone, Default)]
pub struct NewPeriodicTask {
    pub task_name: String,
    pub task_path: String,
    pub task_enabled: bool,
    pub task_interval: Option<i64>,
    pub crontab_minute: Option<String>,
    pub crontab_hour: Option<String>,
    pub crontab_day_of_week: Option<String>,
    pub crontab_day_of_month: Option<String>,
    pub crontab_month_of_year: Option<String>,
    pub task_args: Option<String>,
    pub task_kwargs: Option<String>,
    pub task_extra_config: Option<String>,
    pub task_last_run_time: Option<String>,
    pub task_description: Option<String>,
    pub create_by: Option<String>,
}

/// Cheap fingerprint of the enabled rows, polled to detect staleness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleVersion {
    /// Latest `update_time` among enabled rows, as stored.
    pub latest_update: Option<String>,
    pub enabled_count: usize,
}

/// Read side the schedule loader depends on.
pub trait ScheduleSource: Send + Sync {
    fn enabled_rows(&self) -> Result<Vec<PeriodicTaskConfig>>;

    fn version(&self) -> Result<ScheduleVersion>;
}

/// Data access for `periodic_task_config`.
#[derive(Clone)]
pub struct ScheduleStore {
    pool: Pool,
}

impl ScheduleStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Insert a row; `now_local` becomes both create and update time.
    pub fn insert(&self, task: &NewPeriodicTask, now_local: &str) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO periodic_task_config (
                task_name, task_path, task_enabled, task_interval,
                task_crontab_minute, task_crontab_hour, task_crontab_day_of_week,
                task_crontab_day_of_month, task_crontab_month_of_year,
                task_args, task_kwargs, task_extra_config, task_last_run_time,
                task_description, create_by, update_by, create_time, update_time
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15, ?16, ?16)",
            params![
                task.task_name,
                task.task_path,
                task.task_enabled as i64,
                task.task_interval,
                task.crontab_minute,
                task.crontab_hour,
                task.crontab_day_of_week,
                task.crontab_day_of_month,
                task.crontab_month_of_year,
                task.task_args,
                task.task_kwargs,
                task.task_extra_config,
                task.task_last_run_time,
                task.task_description,
                task.create_by,
                now_local,
            ],
        )
        .with_context(|| format!("Failed to insert periodic task '{}'", task.task_name))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list(&self) -> Result<Vec<PeriodicTaskConfig>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM periodic_task_config ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([], PeriodicTaskConfig::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get(&self, id: i64) -> Result<Option<PeriodicTaskConfig>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM periodic_task_config WHERE id = ?1"),
                params![id],
                PeriodicTaskConfig::from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<PeriodicTaskConfig>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM periodic_task_config WHERE task_name = ?1"),
                params![name],
                PeriodicTaskConfig::from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Enable or disable a row by name.
    pub fn set_enabled(&self, name: &str, enabled: bool, now_local: &str) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE periodic_task_config SET task_enabled = ?1, update_time = ?2 WHERE task_name = ?3",
            params![enabled as i64, now_local, name],
        )?;
        if changed == 0 {
            anyhow::bail!("Periodic task '{}' not found", name);
        }
        Ok(())
    }

    /// Successful run: stamp the last run time and count the attempt.
    /// `update_time` is left alone so bookkeeping never triggers a reload.
    pub fn record_success(&self, id: i64, last_run_local: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE periodic_task_config
             SET task_last_run_time = ?1, task_run_count = task_run_count + 1
             WHERE id = ?2",
            params![last_run_local, id],
        )?;
        Ok(())
    }

    /// Terminal failure: the attempt counts, the last run time does not move.
    pub fn record_attempt(&self, id: i64) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE periodic_task_config SET task_run_count = task_run_count + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }
}

impl ScheduleSource for ScheduleStore {
    fn enabled_rows(&self) -> Result<Vec<PeriodicTaskConfig>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM periodic_task_config WHERE task_enabled = 1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([], PeriodicTaskConfig::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn version(&self) -> Result<ScheduleVersion> {
        let conn = self.pool.get()?;
        let (latest_update, enabled_count) = conn.query_row(
            "SELECT MAX(update_time), COUNT(*) FROM periodic_task_config WHERE task_enabled = 1",
            [],
            |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(ScheduleVersion {
            latest_update,
            enabled_count: enabled_count.max(0) as usize,
        })
    }
}

impl ScheduleSource for StoreHandle {
    fn enabled_rows(&self) -> Result<Vec<PeriodicTaskConfig>> {
        ScheduleStore::new(self.pool()?).enabled_rows()
    }

    fn version(&self) -> Result<ScheduleVersion> {
        ScheduleStore::new(self.pool()?).version()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_store_pool;

    fn store() -> (tempfile::TempDir, ScheduleStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_store_pool(&dir.path().join("store.db")).unwrap();
        (dir, ScheduleStore::new(pool))
    }

    fn interval_task(name: &str, enabled: bool) -> NewPeriodicTask {
        NewPeriodicTask {
            task_name: name.to_string(),
            task_path: "tasks.health_check".to_string(),
            task_enabled: enabled,
            task_interval: Some(60),
            ..Default::default()
        }
    }

    #[test]
    fn test_enabled_rows_skip_disabled() {
        let (_dir, store) = store();
        store.insert(&interval_task("a", true), "2024-01-01 08:00:00").unwrap();
        store.insert(&interval_task("b", false), "2024-01-01 08:00:00").unwrap();

        let rows = store.enabled_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].task_name, "a");
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_version_ignores_disabled() {
        let (_dir, store) = store();
        assert_eq!(
            store.version().unwrap(),
            ScheduleVersion {
                latest_update: None,
                enabled_count: 0
            }
        );

        store.insert(&interval_task("a", true), "2024-01-01 08:00:00").unwrap();
        store.insert(&interval_task("b", false), "2024-01-02 08:00:00").unwrap();
        let version = store.version().unwrap();
        assert_eq!(version.latest_update.as_deref(), Some("2024-01-01 08:00:00"));
        assert_eq!(version.enabled_count, 1);
    }

    #[test]
    fn test_run_bookkeeping() {
        let (_dir, store) = store();
        let id = store.insert(&interval_task("a", true), "2024-01-01 08:00:00").unwrap();

        store.record_success(id, "2024-01-01 09:00:00").unwrap();
        store.record_attempt(id).unwrap();

        let row = store.get(id).unwrap().unwrap();
        assert_eq!(row.task_run_count, 2);
        assert_eq!(row.task_last_run_time.as_deref(), Some("2024-01-01 09:00:00"));
        assert_eq!(row.update_time, "2024-01-01 08:00:00");
    }

    #[test]
    fn test_set_enabled_unknown_name() {
        let (_dir, store) = store();
        assert!(store.set_enabled("missing", true, "2024-01-01 08:00:00").is_err());
    }

    #[test]
    fn test_has_crontab() {
        let (_dir, store) = store();
        let mut task = interval_task("c", true);
        task.task_interval = None;
        task.crontab_minute = Some("*/5".to_string());
        let id = store.insert(&task, "2024-01-01 08:00:00").unwrap();
        assert!(store.get(id).unwrap().unwrap().has_crontab());
        assert!(store.get_by_name("c").unwrap().is_some());
    }
}
