//! Execution Tracker: lifecycle hooks around every task invocation.
//!
//! Hook failures are logged and swallowed; bookkeeping never changes the
//! outcome of the task it observes.

use std::fmt::Display;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::executors::{Executor, TaskOutcome};
use crate::storage::executions::{ExecutionStatus, ExecutionStore};
use crate::storage::queue::TaskMessage;
use crate::storage::StoreHandle;

/// Task names with this prefix belong to agentbeat itself and are not tracked.
pub const INTERNAL_TASK_PREFIX: &str = "agentbeat.";

pub fn is_internal(task_name: &str) -> bool {
    task_name.starts_with(INTERNAL_TASK_PREFIX)
}

/// A result that may or may not serialize to JSON.
pub trait ResultRepr: Display {
    fn to_json(&self) -> serde_json::Result<String>;
}

impl<T: Serialize + Display + ?Sized> ResultRepr for T {
    fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// JSON when possible, the display form otherwise. Never fails.
pub fn encode_result(result: &dyn ResultRepr) -> String {
    match result.to_json() {
        Ok(json) => json,
        Err(e) => {
            debug!(error = %e, "Result is not JSON-serializable, storing text form");
            result.to_string()
        }
    }
}

pub trait ExecutionObserver: Send + Sync {
    fn on_start(&self, task_id: &str, task_name: &str, args: &[Value], kwargs: &Map<String, Value>) -> Result<()>;

    fn on_complete(&self, task_id: &str, status: ExecutionStatus, result: &dyn ResultRepr) -> Result<()>;

    fn on_failure(&self, task_id: &str, traceback: &str) -> Result<()>;
}

/// Observer that records nothing.
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {
    fn on_start(&self, _: &str, _: &str, _: &[Value], _: &Map<String, Value>) -> Result<()> {
        Ok(())
    }

    fn on_complete(&self, _: &str, _: ExecutionStatus, _: &dyn ResultRepr) -> Result<()> {
        Ok(())
    }

    fn on_failure(&self, _: &str, _: &str) -> Result<()> {
        Ok(())
    }
}

/// Persists lifecycle events to the Execution Record Store.
pub struct ExecutionTracker {
    store: StoreHandle,
}

impl ExecutionTracker {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    fn executions(&self) -> Result<ExecutionStore> {
        Ok(ExecutionStore::new(self.store.pool()?))
    }
}

impl ExecutionObserver for ExecutionTracker {
    fn on_start(&self, task_id: &str, task_name: &str, args: &[Value], kwargs: &Map<String, Value>) -> Result<()> {
        let args = encode_result(&Value::Array(args.to_vec()));
        let kwargs = encode_result(&Value::Object(kwargs.clone()));
        self.executions()?
            .upsert_started(task_id, task_name, &args, &kwargs, Utc::now())
    }

    fn on_complete(&self, task_id: &str, status: ExecutionStatus, result: &dyn ResultRepr) -> Result<()> {
        self.executions()?
            .complete(task_id, status, &encode_result(result), Utc::now())
    }

    fn on_failure(&self, task_id: &str, traceback: &str) -> Result<()> {
        self.executions()?.fail(task_id, traceback, Utc::now())
    }
}

/// Run `message` through `executor`, reporting to `observer` around it.
pub async fn run_tracked(
    observer: &dyn ExecutionObserver,
    executor: &dyn Executor,
    message: &TaskMessage,
) -> TaskOutcome {
    if is_internal(&message.task_name) {
        return executor.execute(message).await;
    }

    if let Err(e) = observer.on_start(&message.task_id, &message.task_name, &message.args, &message.kwargs) {
        warn!(task=%message.task_name, task_id=%message.task_id, "Tracker pre-run hook failed: {:#}", e);
    }

    let outcome = executor.execute(message).await;

    let recorded = match &outcome {
        TaskOutcome::Success { result } => observer.on_complete(&message.task_id, ExecutionStatus::Success, result),
        TaskOutcome::Skipped { .. } => observer.on_complete(&message.task_id, ExecutionStatus::Skipped, &outcome),
        TaskOutcome::Retry { .. } => observer.on_complete(&message.task_id, ExecutionStatus::Retry, &outcome),
        TaskOutcome::Failure { error } => observer.on_failure(&message.task_id, error),
    };
    if let Err(e) = recorded {
        warn!(task=%message.task_name, task_id=%message.task_id, "Tracker post-run hook failed: {:#}", e);
    }

    outcome
}
