//! Execution Record Store: one `task_execution_log` row per task id.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::Pool;
use crate::clock::format_instant;

/// Lifecycle state recorded for an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Started,
    Success,
    Failure,
    Retry,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Started => "STARTED",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failure => "FAILURE",
            ExecutionStatus::Retry => "RETRY",
            ExecutionStatus::Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub task_id: String,
    pub task_name: String,
    pub status: String,
    pub start_time: String,
    pub complete_time: Option<String>,
    pub task_args: Option<String>,
    pub task_kwargs: Option<String>,
    pub result: Option<String>,
    pub traceback: Option<String>,
    pub retry_count: i64,
}

impl ExecutionRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            task_name: row.get(2)?,
            status: row.get(3)?,
            start_time: row.get(4)?,
            complete_time: row.get(5)?,
            task_args: row.get(6)?,
            task_kwargs: row.get(7)?,
            result: row.get(8)?,
            traceback: row.get(9)?,
            retry_count: row.get(10)?,
        })
    }
}

const COLUMNS: &str = "id, task_id, task_name, status, start_time, complete_time,
    task_args, task_kwargs, result, traceback, retry_count";

#[derive(Clone)]
pub struct ExecutionStore {
    pool: Pool,
}

impl ExecutionStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn find(&self, task_id: &str) -> Result<Option<ExecutionRecord>> {
        let conn = self.pool.get()?;
        let record = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM task_execution_log WHERE task_id = ?1"),
                params![task_id],
                ExecutionRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Record a start. A second start for the same task id is a retry: the
    /// counter goes up and the record goes back to STARTED.
    pub fn upsert_started(
        &self,
        task_id: &str,
        task_name: &str,
        args_json: &str,
        kwargs_json: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        let start_time = format_instant(at);
        let updated = conn.execute(
            "UPDATE task_execution_log
             SET retry_count = retry_count + 1, status = ?1, start_time = ?2,
                 complete_time = NULL, traceback = NULL
             WHERE task_id = ?3",
            params![ExecutionStatus::Started.as_str(), start_time, task_id],
        )?;
        if updated == 0 {
            conn.execute(
                "INSERT INTO task_execution_log
                    (task_id, task_name, status, start_time, task_args, task_kwargs, retry_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                params![
                    task_id,
                    task_name,
                    ExecutionStatus::Started.as_str(),
                    start_time,
                    args_json,
                    kwargs_json
                ],
            )?;
        }
        Ok(())
    }

    pub fn complete(
        &self,
        task_id: &str,
        status: ExecutionStatus,
        result: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE task_execution_log SET status = ?1, complete_time = ?2, result = ?3
             WHERE task_id = ?4",
            params![status.as_str(), format_instant(at), result, task_id],
        )?;
        Ok(())
    }

    pub fn fail(&self, task_id: &str, traceback: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE task_execution_log SET status = ?1, complete_time = ?2, traceback = ?3
             WHERE task_id = ?4",
            params![
                ExecutionStatus::Failure.as_str(),
                format_instant(at),
                traceback,
                task_id
            ],
        )?;
        Ok(())
    }

    /// Most recent records first.
    pub fn recent(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM task_execution_log ORDER BY start_time DESC, id DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], ExecutionRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete records started before `cutoff`. Returns the number removed.
    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM task_execution_log WHERE start_time < ?1",
            params![format_instant(cutoff)],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_store_pool;
    use chrono::TimeZone;

    fn store() -> (tempfile::TempDir, ExecutionStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_store_pool(&dir.path().join("store.db")).unwrap();
        (dir, ExecutionStore::new(pool))
    }

    fn t(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn test_second_start_counts_as_retry() {
        let (_dir, store) = store();
        store.upsert_started("abc", "job", "[]", "{}", t(1)).unwrap();
        store.fail("abc", "boom", t(1)).unwrap();
        store.upsert_started("abc", "job", "[]", "{}", t(2)).unwrap();

        let record = store.find("abc").unwrap().unwrap();
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.status, "STARTED");
        assert_eq!(record.traceback, None);
        assert_eq!(record.task_args.as_deref(), Some("[]"));
    }

    #[test]
    fn test_complete_and_purge() {
        let (_dir, store) = store();
        store.upsert_started("old", "job", "[]", "{}", t(1)).unwrap();
        store.upsert_started("new", "job", "[]", "{}", t(5)).unwrap();
        store
            .complete("new", ExecutionStatus::Success, "{\"ok\":true}", t(6))
            .unwrap();

        assert_eq!(store.find("new").unwrap().unwrap().status, "SUCCESS");
        assert_eq!(store.purge_before(t(3)).unwrap(), 1);
        let remaining = store.recent(10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].task_id, "new");
    }
}
