//! Task executors and the router that picks one per message.

pub mod agent;
pub mod http;
pub mod system;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::scheduler::dispatch::{AGENT_TASK_PATH, HTTP_TASK_PATH};
use crate::scheduler::task_config::TaskConfigError;
use crate::storage::queue::TaskMessage;

pub use self::agent::AgentExecutor;
pub use self::http::HttpExecutor;
pub use self::system::SystemTaskRegistry;

/// What one execution produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success { result: Value },
    /// Nothing to do; not an error and never retried.
    Skipped { reason: String },
    /// Run again after `countdown_secs` with the same task id.
    Retry { countdown_secs: u64, reason: String },
    /// Terminal. `error` holds the full cause chain.
    Failure { error: String },
}

impl TaskOutcome {
    pub fn success(result: Value) -> Self {
        TaskOutcome::Success { result }
    }

    pub fn failure(err: ExecutorError) -> Self {
        TaskOutcome::Failure {
            error: format!("{:?}", anyhow::Error::new(err)),
        }
    }

    /// Retry when `retries` is below `max_retries`, otherwise fail.
    pub fn retry_or_fail(err: ExecutorError, retries: u32, max_retries: u32) -> Self {
        if err.is_retryable() && retries < max_retries {
            TaskOutcome::Retry {
                countdown_secs: linear_backoff(retries),
                reason: err.to_string(),
            }
        } else {
            Self::failure(err)
        }
    }
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskOutcome::Success { result } => write!(f, "success: {result}"),
            TaskOutcome::Skipped { reason } => write!(f, "skipped: {reason}"),
            TaskOutcome::Retry {
                countdown_secs,
                reason,
            } => write!(f, "retry in {countdown_secs}s: {reason}"),
            TaskOutcome::Failure { error } => write!(f, "failure: {error}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("configuration error: {0}")]
    Config(#[from] TaskConfigError),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("agent runtime returned status {status}: {message}")]
    Application { status: String, message: String },

    #[error("periodic task {0} not found")]
    MissingRow(i64),

    #[error("invalid task arguments: {0}")]
    InvalidArguments(String),

    #[error("no executor registered for '{0}'")]
    UnknownTask(String),

    #[error("store unavailable")]
    StoreUnavailable,

    #[error("store error: {0:#}")]
    Store(anyhow::Error),

    #[error("{0}")]
    Task(String),
}

impl ExecutorError {
    /// Network and runtime failures are transient; everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutorError::Request(_) | ExecutorError::Application { .. }
        )
    }
}

/// Delay before retry number `retries + 1`.
pub fn linear_backoff(retries: u32) -> u64 {
    60 * (u64::from(retries) + 1)
}

#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, message: &TaskMessage) -> TaskOutcome;
}

/// Routes a message to an executor by its task path.
pub struct TaskRouter {
    agent: AgentExecutor,
    http: HttpExecutor,
    system: SystemTaskRegistry,
}

impl TaskRouter {
    pub fn new(agent: AgentExecutor, http: HttpExecutor, system: SystemTaskRegistry) -> Self {
        Self {
            agent,
            http,
            system,
        }
    }
}

#[async_trait::async_trait]
impl Executor for TaskRouter {
    async fn execute(&self, message: &TaskMessage) -> TaskOutcome {
        match message.task_path.as_str() {
            AGENT_TASK_PATH => self.agent.execute(message).await,
            HTTP_TASK_PATH => self.http.execute(message).await,
            _ => self.system.execute(message).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff() {
        assert_eq!(linear_backoff(0), 60);
        assert_eq!(linear_backoff(1), 120);
        assert_eq!(linear_backoff(4), 300);
    }

    #[test]
    fn test_retry_bound() {
        let err = || ExecutorError::Application {
            status: "500".into(),
            message: "boom".into(),
        };
        assert_eq!(
            TaskOutcome::retry_or_fail(err(), 0, 1),
            TaskOutcome::Retry {
                countdown_secs: 60,
                reason: err().to_string()
            }
        );
        assert!(matches!(
            TaskOutcome::retry_or_fail(err(), 1, 1),
            TaskOutcome::Failure { .. }
        ));
    }

    #[test]
    fn test_config_errors_never_retry() {
        let outcome = TaskOutcome::retry_or_fail(
            ExecutorError::Config(TaskConfigError::MissingField("agent_key")),
            0,
            5,
        );
        let TaskOutcome::Failure { error } = outcome else {
            panic!("expected failure");
        };
        assert!(error.contains("agent_key"));
    }
}
