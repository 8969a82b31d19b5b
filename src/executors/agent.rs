//! Agent task executor: drives the thread/completion protocol of an external
//! agent runtime for one periodic task row.
//!
//! The row is re-read on every execution, so edits to an agent's configuration
//! apply without waiting for a schedule reload.

use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::{Executor, ExecutorError, TaskOutcome};
use crate::clock::StoreClock;
use crate::config::AgentConfig;
use crate::scheduler::task_config::{AgentTaskConfig, ExtraConfig, TaskConfigError, TaskKind};
use crate::storage::periodic_tasks::{PeriodicTaskConfig, ScheduleStore};
use crate::storage::queue::TaskMessage;
use crate::storage::run_log::{NewRunLog, RunLogStore, RunOutcome};
use crate::storage::{Pool, StoreHandle};

/// Completion timeout for a message of `chars` characters.
pub fn completion_timeout(chars: usize) -> Duration {
    match chars {
        0..=499 => Duration::from_secs(120),
        500..=1999 => Duration::from_secs(180),
        _ => Duration::from_secs(300),
    }
}

const THREAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Stores the agent executor writes to.
#[derive(Clone)]
pub struct AgentStores {
    pub schedule: ScheduleStore,
    pub run_log: RunLogStore,
}

impl AgentStores {
    pub fn new(pool: Pool) -> Self {
        Self {
            schedule: ScheduleStore::new(pool.clone()),
            run_log: RunLogStore::new(pool),
        }
    }
}

pub struct AgentExecutor {
    client: Client,
    store: StoreHandle,
    clock: StoreClock,
    config: AgentConfig,
}

/// A successful exchange with the runtime.
struct Completion {
    thread_id: String,
    data: Value,
}

impl AgentExecutor {
    pub fn new(client: Client, store: StoreHandle, clock: StoreClock, config: AgentConfig) -> Self {
        Self {
            client,
            store,
            clock,
            config,
        }
    }

    fn load(&self, stores: &AgentStores, message: &TaskMessage) -> Result<Option<(PeriodicTaskConfig, AgentTaskConfig)>, ExecutorError> {
        let id = message
            .args
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| ExecutorError::InvalidArguments("expected [row_id]".to_string()))?;
        let row = stores
            .schedule
            .get(id)
            .map_err(ExecutorError::Store)?
            .ok_or(ExecutorError::MissingRow(id))?;
        if !row.task_enabled {
            return Ok(None);
        }

        let extra = ExtraConfig::parse(row.task_extra_config.as_deref())?;
        let cfg = match extra.kind {
            TaskKind::Agent(cfg) => cfg,
            other => {
                return Err(ExecutorError::Config(TaskConfigError::UnknownTaskType(format!(
                    "{} (expected agent)",
                    other.task_type()
                ))))
            }
        };
        Ok(Some((row, cfg)))
    }

    async fn converse(&self, cfg: &AgentTaskConfig, query: &str) -> Result<Completion, ExecutorError> {
        let base = cfg.agent_url.trim_end_matches('/');
        let user = cfg.user.as_deref().unwrap_or(&self.config.default_user);

        let thread_id = match cfg.thread() {
            Some(thread) => thread.to_string(),
            None => self.create_thread(base, cfg, user).await?,
        };

        let timeout = cfg
            .task_timeout
            .map(Duration::from_secs)
            .unwrap_or_else(|| completion_timeout(query.chars().count()));

        let body: Value = self
            .client
            .post(format!("{base}/threads/{thread_id}/completion"))
            .bearer_auth(&cfg.agent_key)
            .timeout(timeout)
            .json(&json!({
                "agent_id": cfg.agent_id,
                "user_name": user,
                "query": query,
                "config": {},
                "chat_mode": "agent",
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let status = body.get("status").cloned().unwrap_or(Value::Null);
        if !is_success_status(&status) {
            let message = body
                .get("message")
                .or_else(|| body.get("msg"))
                .and_then(Value::as_str)
                .unwrap_or("no message")
                .to_string();
            return Err(ExecutorError::Application {
                status: status.to_string(),
                message,
            });
        }

        Ok(Completion {
            thread_id,
            data: body.get("data").cloned().unwrap_or(Value::Null),
        })
    }

    async fn create_thread(&self, base: &str, cfg: &AgentTaskConfig, user: &str) -> Result<String, ExecutorError> {
        let body: Value = self
            .client
            .post(format!("{base}/threads"))
            .bearer_auth(&cfg.agent_key)
            .timeout(THREAD_TIMEOUT)
            .json(&json!({ "agent_id": cfg.agent_id, "user_name": user }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let thread = body
            .get("thread_id")
            .or_else(|| body.pointer("/data/thread_id"))
            .and_then(|t| match t {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
        thread.ok_or_else(|| ExecutorError::Application {
            status: body.get("status").cloned().unwrap_or(Value::Null).to_string(),
            message: "thread creation returned no thread_id".to_string(),
        })
    }

    fn write_run_log(&self, stores: &AgentStores, entry: NewRunLog) {
        if let Err(e) = stores.run_log.append(&entry) {
            warn!(task=%entry.task_name, "Failed to write run-log: {:#}", e);
        }
    }
}

/// Application-level success as reported in the completion body.
fn is_success_status(status: &Value) -> bool {
    match status {
        Value::Number(n) => matches!(n.as_i64(), Some(0) | Some(200)),
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "success" | "ok" | "0" | "200"),
        _ => false,
    }
}

#[async_trait::async_trait]
impl Executor for AgentExecutor {
    async fn execute(&self, message: &TaskMessage) -> TaskOutcome {
        let Ok(pool) = self.store.pool() else {
            return TaskOutcome::failure(ExecutorError::StoreUnavailable);
        };
        let stores = &AgentStores::new(pool);

        let (row, cfg) = match self.load(stores, message) {
            Ok(Some(loaded)) => loaded,
            Ok(None) => {
                info!(task=%message.task_name, "Agent task disabled, skipping");
                return TaskOutcome::Skipped {
                    reason: "task disabled".to_string(),
                };
            }
            Err(e) => {
                error!(task=%message.task_name, error=%e, "Agent task not runnable");
                return TaskOutcome::failure(e);
            }
        };

        let query = cfg
            .message
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| format!("Scheduled task: {}", row.task_name));
        let started_at = Utc::now();
        let timer = Instant::now();
        let result = self.converse(&cfg, &query).await;
        let duration_ms = timer.elapsed().as_millis() as i64;

        match result {
            Ok(done) => {
                info!(task=%row.task_name, agent=%cfg.agent_id, thread=%done.thread_id, duration_ms, "Agent task completed");
                if let Err(e) = stores
                    .schedule
                    .record_success(row.id, &self.clock.format_local(Utc::now()))
                {
                    warn!(task=%row.task_name, "Failed to record run: {:#}", e);
                }
                let result = json!({
                    "agent_id": cfg.agent_id,
                    "thread_id": done.thread_id,
                    "data": done.data,
                });
                self.write_run_log(
                    stores,
                    NewRunLog {
                        config_id: Some(row.id),
                        task_name: row.task_name.clone(),
                        execution_time: started_at,
                        status: RunOutcome::Success,
                        result: Some(result.to_string()),
                        error_message: None,
                        duration_ms: Some(duration_ms),
                    },
                );
                TaskOutcome::success(result)
            }
            Err(e) => {
                self.write_run_log(
                    stores,
                    NewRunLog {
                        config_id: Some(row.id),
                        task_name: row.task_name.clone(),
                        execution_time: started_at,
                        status: RunOutcome::Failure,
                        result: None,
                        error_message: Some(e.to_string()),
                        duration_ms: Some(duration_ms),
                    },
                );

                let max_retries = cfg.max_retries.unwrap_or(self.config.default_max_retries);
                let outcome = TaskOutcome::retry_or_fail(e, message.retries, max_retries);
                match &outcome {
                    TaskOutcome::Retry { countdown_secs, reason } => {
                        warn!(task=%row.task_name, retries = message.retries, max_retries, countdown_secs, %reason, "Agent task failed, retrying");
                    }
                    _ => {
                        error!(task=%row.task_name, retries = message.retries, "Agent task failed");
                        if let Err(e) = stores.schedule.record_attempt(row.id) {
                            warn!(task=%row.task_name, "Failed to record attempt: {:#}", e);
                        }
                    }
                }
                outcome
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_store_pool;
    use crate::storage::periodic_tasks::NewPeriodicTask;
    use crate::scheduler::dispatch::AGENT_TASK_PATH;
    use crate::scheduler::queue::QueueName;
    use serde_json::Map;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn setup(extra: &str) -> (tempfile::TempDir, AgentStores, i64) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_store_pool(&dir.path().join("store.db")).unwrap();
        let stores = AgentStores::new(pool);
        let id = stores
            .schedule
            .insert(
                &NewPeriodicTask {
                    task_name: "report".to_string(),
                    task_path: String::new(),
                    task_enabled: true,
                    task_interval: Some(3600),
                    task_extra_config: Some(extra.to_string()),
                    ..Default::default()
                },
                "2024-01-01 08:00:00",
            )
            .unwrap();
        (dir, stores, id)
    }

    fn executor(stores: &AgentStores) -> AgentExecutor {
        AgentExecutor::new(
            Client::new(),
            StoreHandle::ready(stores.schedule.pool().clone()),
            StoreClock::utc(),
            AgentConfig::default(),
        )
    }

    fn message(id: i64, retries: u32) -> TaskMessage {
        let mut msg = TaskMessage::new("report", AGENT_TASK_PATH, QueueName::PriorityLow, vec![json!(id)], Map::new());
        msg.retries = retries;
        msg
    }

    fn extra(url: &str, more: &str) -> String {
        format!(r#"{{"task_type":"agent","agent_id":"a1","agent_url":"{url}","agent_key":"secret"{more}}}"#)
    }

    #[test]
    fn test_completion_timeout_scales() {
        assert_eq!(completion_timeout(10), Duration::from_secs(120));
        assert_eq!(completion_timeout(500), Duration::from_secs(180));
        assert_eq!(completion_timeout(5000), Duration::from_secs(300));
    }

    #[test]
    fn test_success_status_codes() {
        assert!(is_success_status(&json!(0)));
        assert!(is_success_status(&json!(200)));
        assert!(is_success_status(&json!("success")));
        assert!(!is_success_status(&json!(500)));
        assert!(!is_success_status(&Value::Null));
    }

    #[tokio::test]
    async fn test_creates_thread_then_completes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/threads"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"thread_id": "t-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/threads/t-1/completion"))
            .and(body_partial_json(json!({"agent_id": "a1", "query": "Scheduled task: report", "chat_mode": "agent"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": 0, "data": "done"})))
            .expect(1)
            .mount(&server)
            .await;

        let (_dir, stores, id) = setup(&extra(&server.uri(), ""));
        let outcome = executor(&stores).execute(&message(id, 0)).await;

        let TaskOutcome::Success { result } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(result["thread_id"], "t-1");
        let row = stores.schedule.get(id).unwrap().unwrap();
        assert_eq!(row.task_run_count, 1);
        assert!(row.task_last_run_time.is_some());
        let logs = stores.run_log.recent(Some("report"), 10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "success");
    }

    #[tokio::test]
    async fn test_retries_then_fails_terminally() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/threads/fixed/completion"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (_dir, stores, id) = setup(&extra(&server.uri(), r#","thread_id":"fixed","max_retries":2"#));
        let executor = executor(&stores);

        let mut countdowns = Vec::new();
        let mut retries = 0;
        let terminal = loop {
            match executor.execute(&message(id, retries)).await {
                TaskOutcome::Retry { countdown_secs, .. } => {
                    countdowns.push(countdown_secs);
                    retries += 1;
                }
                other => break other,
            }
        };

        assert_eq!(countdowns, vec![60, 120]);
        assert!(matches!(terminal, TaskOutcome::Failure { .. }));
        let row = stores.schedule.get(id).unwrap().unwrap();
        assert_eq!(row.task_run_count, 1);
        assert_eq!(row.task_last_run_time, None);
        assert_eq!(stores.run_log.recent(Some("report"), 10).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_application_error_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/threads/fixed/completion"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": 500, "message": "model down"})))
            .mount(&server)
            .await;

        let (_dir, stores, id) = setup(&extra(&server.uri(), r#","thread_id":"fixed","max_retries":0"#));
        let outcome = executor(&stores).execute(&message(id, 0)).await;
        let TaskOutcome::Failure { error } = outcome else {
            panic!("expected failure");
        };
        assert!(error.contains("model down"));
    }

    #[tokio::test]
    async fn test_disabled_row_is_skipped() {
        let (_dir, stores, id) = setup(&extra("http://127.0.0.1:9", ""));
        stores.schedule.set_enabled("report", false, "2024-01-01 09:00:00").unwrap();

        let outcome = executor(&stores).execute(&message(id, 0)).await;
        assert!(matches!(outcome, TaskOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_missing_row_and_bad_config_fail_without_retry() {
        let (_dir, stores, _id) = setup(&extra("http://127.0.0.1:9", ""));
        let outcome = executor(&stores).execute(&message(999, 0)).await;
        assert!(matches!(outcome, TaskOutcome::Failure { .. }));

        let (_dir, stores, id) = setup(r#"{"task_type":"agent","agent_id":"a1","agent_url":"http://x"}"#);
        let outcome = executor(&stores).execute(&message(id, 0)).await;
        assert!(matches!(outcome, TaskOutcome::Failure { .. }));
    }
}
