//! Task-type resolution: a stored row becomes a concrete executor call.

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use tracing::info;

use super::queue::QueueName;
use super::task_config::{
    parse_args, parse_kwargs, ExtraConfig, HttpTaskConfig, SystemTaskConfig, TaskConfigError,
    TaskKind,
};
use crate::storage::periodic_tasks::{PeriodicTaskConfig, ScheduleStore};
use crate::storage::queue::{Broker, TaskMessage};

/// Entry point of the agent executor. Its only argument is the row id.
pub const AGENT_TASK_PATH: &str = "tasks.run_agent_periodic_task";

/// Entry point of the generic HTTP executor: `[url, method, headers, body]`.
pub const HTTP_TASK_PATH: &str = "tasks.execute_http_task";

/// `(executor task path, args, kwargs)` for one row.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchTarget {
    pub task_path: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

/// Resolve a row's decoded extra config into the call an executor will receive.
pub fn resolve(row: &PeriodicTaskConfig, kind: &TaskKind) -> Result<DispatchTarget, TaskConfigError> {
    match kind {
        // Late binding: the executor re-reads the row by id at run time.
        TaskKind::Agent(_) => Ok(DispatchTarget {
            task_path: AGENT_TASK_PATH.to_string(),
            args: vec![json!(row.id)],
            kwargs: Map::new(),
        }),
        TaskKind::Http(cfg) => resolve_http(row, cfg),
        TaskKind::System(cfg) => resolve_system(row, cfg),
    }
}

fn resolve_http(row: &PeriodicTaskConfig, cfg: &HttpTaskConfig) -> Result<DispatchTarget, TaskConfigError> {
    // Older rows keep the request in flat task_kwargs.
    let legacy = parse_kwargs(row.task_kwargs.as_deref())?;
    let legacy_str = |key: &str| legacy.get(key).and_then(Value::as_str).map(str::to_string);

    let url = cfg
        .url
        .clone()
        .or_else(|| legacy_str("url"))
        .filter(|u| !u.trim().is_empty())
        .ok_or(TaskConfigError::MissingField("url"))?;
    let method = cfg
        .method
        .clone()
        .or_else(|| legacy_str("method"))
        .unwrap_or_else(|| "GET".to_string());
    let headers = cfg
        .headers
        .clone()
        .map(Value::Object)
        .or_else(|| legacy.get("headers").cloned())
        .unwrap_or(Value::Null);
    let body = cfg
        .data
        .clone()
        .or_else(|| legacy.get("data").cloned())
        .or_else(|| legacy.get("body").cloned())
        .unwrap_or(Value::Null);

    let mut kwargs = Map::new();
    let timeout = cfg
        .timeout
        .map(Value::from)
        .or_else(|| legacy.get("timeout").filter(|t| t.is_number()).cloned());
    if let Some(timeout) = timeout {
        kwargs.insert("timeout".to_string(), timeout);
    }

    Ok(DispatchTarget {
        task_path: HTTP_TASK_PATH.to_string(),
        args: vec![Value::String(url), Value::String(method), headers, body],
        kwargs,
    })
}

fn resolve_system(row: &PeriodicTaskConfig, cfg: &SystemTaskConfig) -> Result<DispatchTarget, TaskConfigError> {
    if row.task_path.trim().is_empty() {
        return Err(TaskConfigError::MissingField("task_path"));
    }
    let mut kwargs = parse_kwargs(row.task_kwargs.as_deref())?;
    kwargs.extend(cfg.extra.iter().map(|(k, v)| (k.clone(), v.clone())));

    Ok(DispatchTarget {
        task_path: row.task_path.clone(),
        args: parse_args(row.task_args.as_deref())?,
        kwargs,
    })
}

/// Enqueue a row immediately, bypassing its predicate and the dispatch TTL.
pub fn run_now(store: &ScheduleStore, broker: &Broker, row_id: i64) -> Result<TaskMessage> {
    let row = store
        .get(row_id)?
        .with_context(|| format!("Periodic task {row_id} not found"))?;
    let message = message_for_row(&row)?;
    broker.enqueue(&message)?;
    info!(task=%row.task_name, task_id=%message.task_id, queue=%message.queue, "Run-now dispatched");
    Ok(message)
}

/// Build an un-expiring message for a row, as run-now does.
pub fn message_for_row(row: &PeriodicTaskConfig) -> Result<TaskMessage, TaskConfigError> {
    let extra = ExtraConfig::parse(row.task_extra_config.as_deref())?;
    let target = resolve(row, &extra.kind)?;
    let queue = QueueName::resolve(&row.task_name, extra.queue.as_deref());
    Ok(TaskMessage::new(
        &row.task_name,
        &target.task_path,
        queue,
        target.args,
        target.kwargs,
    ))
}
