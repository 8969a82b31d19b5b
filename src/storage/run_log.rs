//! Append-only run-log of periodic task outcomes.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::Serialize;

use super::Pool;
use crate::clock::format_instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Failure,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failure => "failure",
        }
    }
}

/// Entry to append; never updated once written.
#[derive(Debug, Clone)]
pub struct NewRunLog {
    pub config_id: Option<i64>,
    pub task_name: String,
    pub execution_time: DateTime<Utc>,
    pub status: RunOutcome,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunLogEntry {
    pub id: i64,
    pub config_id: Option<i64>,
    pub task_name: String,
    pub execution_time: String,
    pub status: String,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
}

impl RunLogEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            config_id: row.get(1)?,
            task_name: row.get(2)?,
            execution_time: row.get(3)?,
            status: row.get(4)?,
            result: row.get(5)?,
            error_message: row.get(6)?,
            duration_ms: row.get(7)?,
        })
    }
}

#[derive(Clone)]
pub struct RunLogStore {
    pool: Pool,
}

impl RunLogStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn append(&self, entry: &NewRunLog) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO periodic_task_run_log
                (config_id, task_name, execution_time, status, result, error_message, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.config_id,
                entry.task_name,
                format_instant(entry.execution_time),
                entry.status.as_str(),
                entry.result,
                entry.error_message,
                entry.duration_ms
            ],
        )?;
        Ok(())
    }

    /// Most recent entries first, optionally for one task.
    pub fn recent(&self, task_name: Option<&str>, limit: usize) -> Result<Vec<RunLogEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, config_id, task_name, execution_time, status, result, error_message, duration_ms
             FROM periodic_task_run_log
             WHERE ?1 IS NULL OR task_name = ?1
             ORDER BY execution_time DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![task_name, limit as i64], RunLogEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM periodic_task_run_log WHERE execution_time < ?1",
            params![format_instant(cutoff)],
        )?;
        Ok(removed)
    }
}
