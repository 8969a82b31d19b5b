//! In-process system tasks, looked up by their registered task path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tracing::{error, info};

use super::{Executor, ExecutorError, TaskOutcome};
use crate::scheduler::queue::QueueName;
use crate::storage::executions::ExecutionStore;
use crate::storage::queue::{Broker, TaskMessage};
use crate::storage::run_log::{NewRunLog, RunLogStore, RunOutcome};
use crate::storage::StoreHandle;

pub const HEALTH_CHECK_PATH: &str = "tasks.health_check";
pub const CLEANUP_HISTORY_PATH: &str = "tasks.cleanup_history";

const DEFAULT_RETENTION_DAYS: i64 = 30;

#[async_trait::async_trait]
pub trait SystemTask: Send + Sync {
    /// Identifier rows use in `task_path`.
    fn path(&self) -> &'static str;

    async fn run(&self, message: &TaskMessage) -> Result<Value, ExecutorError>;
}

#[derive(Default, Clone)]
pub struct SystemTaskRegistry {
    tasks: BTreeMap<&'static str, Arc<dyn SystemTask>>,
}

impl SystemTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in tasks.
    pub fn with_builtins(store: StoreHandle, broker: Broker) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HealthCheckTask {
            store: store.clone(),
            broker,
        }));
        registry.register(Arc::new(CleanupHistoryTask { store }));
        registry
    }

    pub fn register(&mut self, task: Arc<dyn SystemTask>) {
        self.tasks.insert(task.path(), task);
    }

    pub fn paths(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tasks.keys().copied()
    }
}

#[async_trait::async_trait]
impl Executor for SystemTaskRegistry {
    async fn execute(&self, message: &TaskMessage) -> TaskOutcome {
        let Some(task) = self.tasks.get(message.task_path.as_str()) else {
            error!(task=%message.task_name, path=%message.task_path, "No executor for task path");
            return TaskOutcome::failure(ExecutorError::UnknownTask(message.task_path.clone()));
        };
        match task.run(message).await {
            Ok(result) => TaskOutcome::success(result),
            Err(e) => {
                error!(task=%message.task_name, path=%message.task_path, error=%e, "System task failed");
                TaskOutcome::failure(e)
            }
        }
    }
}

/// Checks the store and the broker and records the result in the run-log.
pub struct HealthCheckTask {
    store: StoreHandle,
    broker: Broker,
}

#[async_trait::async_trait]
impl SystemTask for HealthCheckTask {
    fn path(&self) -> &'static str {
        HEALTH_CHECK_PATH
    }

    async fn run(&self, message: &TaskMessage) -> Result<Value, ExecutorError> {
        let started_at = Utc::now();
        let timer = Instant::now();

        let pool = self.store.pool();
        let store = match &pool {
            Err(_) => Err("unavailable".to_string()),
            Ok(pool) => pool
                .get()
                .map_err(|e| e.to_string())
                .and_then(|conn| {
                    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                        .map_err(|e| e.to_string())
                })
                .map(|_| ()),
        };

        let mut depths = serde_json::Map::new();
        let mut broker_error = None;
        for queue in QueueName::ALL {
            match self.broker.depth(queue) {
                Ok(depth) => {
                    depths.insert(queue.as_str().to_string(), json!(depth));
                }
                Err(e) => broker_error = Some(format!("{e:#}")),
            }
        }

        let healthy = store.is_ok() && broker_error.is_none();
        let summary = json!({
            "healthy": healthy,
            "store": store.as_ref().map(|_| "ok").unwrap_or_else(|e| e.as_str()),
            "broker": broker_error.as_deref().unwrap_or("ok"),
            "queue_depths": depths,
        });
        let duration_ms = timer.elapsed().as_millis() as i64;

        if let Ok(pool) = &pool {
            let entry = NewRunLog {
                config_id: None,
                task_name: message.task_name.clone(),
                execution_time: started_at,
                status: if healthy { RunOutcome::Success } else { RunOutcome::Failure },
                result: Some(summary.to_string()),
                error_message: (!healthy).then(|| summary.to_string()),
                duration_ms: Some(duration_ms),
            };
            if let Err(e) = RunLogStore::new(pool.clone()).append(&entry) {
                tracing::warn!(task=%message.task_name, "Failed to write run-log: {:#}", e);
            }
        }

        if healthy {
            info!(task=%message.task_name, duration_ms, "Health check passed");
            Ok(summary)
        } else {
            Err(ExecutorError::Task(format!("health check failed: {summary}")))
        }
    }
}

/// Deletes execution records and run-log entries older than `days`.
pub struct CleanupHistoryTask {
    store: StoreHandle,
}

#[async_trait::async_trait]
impl SystemTask for CleanupHistoryTask {
    fn path(&self) -> &'static str {
        CLEANUP_HISTORY_PATH
    }

    async fn run(&self, message: &TaskMessage) -> Result<Value, ExecutorError> {
        let pool = self.store.pool().map_err(|_| ExecutorError::StoreUnavailable)?;
        let days = match message.kwargs.get("days") {
            None | Some(Value::Null) => DEFAULT_RETENTION_DAYS,
            Some(v) => v
                .as_i64()
                .filter(|d| *d >= 0)
                .ok_or_else(|| ExecutorError::InvalidArguments("days must be a non-negative integer".into()))?,
        };
        let cutoff = Utc::now() - Duration::days(days);

        let executions = ExecutionStore::new(pool.clone())
            .purge_before(cutoff)
            .map_err(ExecutorError::Store)?;
        let run_logs = RunLogStore::new(pool.clone())
            .purge_before(cutoff)
            .map_err(ExecutorError::Store)?;

        info!(days, executions, run_logs, "History cleaned up");
        Ok(json!({
            "days": days,
            "executions_removed": executions,
            "run_logs_removed": run_logs,
        }))
    }
}
