//! Typed decoding of a row's `task_extra_config` blob.
//!
//! The blob is decoded once into a tagged union keyed by `task_type`; the
//! optional `queue` key is routing metadata shared by every variant.

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Configuration problems. None of these are ever retried.
#[derive(Debug, Error)]
pub enum TaskConfigError {
    #[error("{field} is not valid JSON: {source}")]
    MalformedJson {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{field} must be a JSON {expected}")]
    WrongShape {
        field: &'static str,
        expected: &'static str,
    },

    #[error("task_extra_config has no task_type")]
    MissingTaskType,

    #[error("unknown task_type '{0}'")]
    UnknownTaskType(String),

    #[error("invalid {task_type} task config: {source}")]
    InvalidFields {
        task_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("row has neither task_interval nor crontab fields")]
    Unschedulable,

    #[error("task_interval must be positive, got {0}")]
    InvalidInterval(i64),

    #[error("invalid crontab '{expr}': {reason}")]
    InvalidCrontab { expr: String, reason: String },
}

/// Tag of a task's executor family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Agent,
    Http,
    System,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Agent => "agent",
            TaskType::Http => "http",
            TaskType::System => "system",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `task_type = "agent"`: drive an external agent runtime.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentTaskConfig {
    #[serde(deserialize_with = "string_or_number")]
    pub agent_id: String,
    pub agent_url: String,
    pub agent_key: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub task_timeout: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl AgentTaskConfig {
    /// Required fields must be present and non-blank.
    pub fn validate(&self) -> Result<(), TaskConfigError> {
        for (name, value) in [
            ("agent_id", &self.agent_id),
            ("agent_url", &self.agent_url),
            ("agent_key", &self.agent_key),
        ] {
            if value.trim().is_empty() {
                return Err(TaskConfigError::MissingField(name));
            }
        }
        Ok(())
    }

    /// Configured thread to reuse, if any.
    pub fn thread(&self) -> Option<&str> {
        self.thread_id.as_deref().filter(|t| !t.trim().is_empty())
    }
}

/// `task_type = "http"`: one parameterized HTTP call.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HttpTaskConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<Map<String, Value>>,
    #[serde(default)]
    pub data: Option<Value>,
    /// Seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// `task_type = "system"`: every remaining key is merged into kwargs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemTaskConfig {
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    Agent(AgentTaskConfig),
    Http(HttpTaskConfig),
    System(SystemTaskConfig),
}

impl TaskKind {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskKind::Agent(_) => TaskType::Agent,
            TaskKind::Http(_) => TaskType::Http,
            TaskKind::System(_) => TaskType::System,
        }
    }
}

/// Decoded `task_extra_config`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtraConfig {
    pub kind: TaskKind,
    /// Raw requested queue; validated by `QueueName::resolve`.
    pub queue: Option<String>,
}

impl ExtraConfig {
    /// Decode a stored blob. A missing or blank blob is a plain system task.
    pub fn parse(raw: Option<&str>) -> Result<Self, TaskConfigError> {
        let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
            return Ok(Self {
                kind: TaskKind::System(SystemTaskConfig::default()),
                queue: None,
            });
        };

        let value: Value = serde_json::from_str(raw).map_err(|source| {
            TaskConfigError::MalformedJson {
                field: "task_extra_config",
                source,
            }
        })?;
        let Value::Object(mut obj) = value else {
            return Err(TaskConfigError::WrongShape {
                field: "task_extra_config",
                expected: "object",
            });
        };

        let queue = obj.remove("queue").and_then(|q| match q {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        });

        let kind = match obj.remove("task_type") {
            None | Some(Value::Null) => return Err(TaskConfigError::MissingTaskType),
            Some(Value::String(tag)) => match tag.as_str() {
                "agent" => {
                    let cfg: AgentTaskConfig = decode("agent", obj)?;
                    cfg.validate()?;
                    TaskKind::Agent(cfg)
                }
                "http" => TaskKind::Http(decode("http", obj)?),
                "system" => TaskKind::System(SystemTaskConfig { extra: obj }),
                _ => return Err(TaskConfigError::UnknownTaskType(tag)),
            },
            Some(other) => return Err(TaskConfigError::UnknownTaskType(other.to_string())),
        };

        Ok(Self { kind, queue })
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    task_type: &'static str,
    obj: Map<String, Value>,
) -> Result<T, TaskConfigError> {
    serde_json::from_value(Value::Object(obj))
        .map_err(|source| TaskConfigError::InvalidFields { task_type, source })
}

fn string_or_number<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    match Value::deserialize(de)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn opt_string_or_number<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(de)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// Decode the stored `task_args` column (JSON array, optional).
pub fn parse_args(raw: Option<&str>) -> Result<Vec<Value>, TaskConfigError> {
    match raw.filter(|r| !r.trim().is_empty()) {
        None => Ok(Vec::new()),
        Some(raw) => match serde_json::from_str(raw) {
            Ok(Value::Array(items)) => Ok(items),
            Ok(Value::Null) => Ok(Vec::new()),
            Ok(_) => Err(TaskConfigError::WrongShape {
                field: "task_args",
                expected: "array",
            }),
            Err(source) => Err(TaskConfigError::MalformedJson {
                field: "task_args",
                source,
            }),
        },
    }
}

/// Decode the stored `task_kwargs` column (JSON object, optional).
pub fn parse_kwargs(raw: Option<&str>) -> Result<Map<String, Value>, TaskConfigError> {
    match raw.filter(|r| !r.trim().is_empty()) {
        None => Ok(Map::new()),
        Some(raw) => match serde_json::from_str(raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(Value::Null) => Ok(Map::new()),
            Ok(_) => Err(TaskConfigError::WrongShape {
                field: "task_kwargs",
                expected: "object",
            }),
            Err(source) => Err(TaskConfigError::MalformedJson {
                field: "task_kwargs",
                source,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_config() {
        let extra = ExtraConfig::parse(Some(
            r#"{"task_type":"agent","agent_id":42,"agent_url":"http://a","agent_key":"k",
                "message":"daily report","max_retries":2,"queue":"priority_high"}"#,
        ))
        .unwrap();
        assert_eq!(extra.queue.as_deref(), Some("priority_high"));
        let TaskKind::Agent(cfg) = extra.kind else {
            panic!("expected agent config");
        };
        assert_eq!(cfg.agent_id, "42");
        assert_eq!(cfg.max_retries, Some(2));
        assert_eq!(cfg.thread(), None);
    }

    #[test]
    fn test_agent_missing_key_is_config_error() {
        let err = ExtraConfig::parse(Some(
            r#"{"task_type":"agent","agent_id":"a","agent_url":"http://a"}"#,
        ))
        .unwrap_err();
        assert!(matches!(err, TaskConfigError::InvalidFields { task_type: "agent", .. }));

        let err = ExtraConfig::parse(Some(
            r#"{"task_type":"agent","agent_id":"a","agent_url":"http://a","agent_key":" "}"#,
        ))
        .unwrap_err();
        assert!(matches!(err, TaskConfigError::MissingField("agent_key")));
    }

    #[test]
    fn test_system_keeps_extra_keys_without_routing_metadata() {
        let extra = ExtraConfig::parse(Some(
            r#"{"task_type":"system","days":7,"queue":"system"}"#,
        ))
        .unwrap();
        let TaskKind::System(cfg) = extra.kind else {
            panic!("expected system config");
        };
        assert_eq!(cfg.extra.len(), 1);
        assert_eq!(cfg.extra["days"], 7);
    }

    #[test]
    fn test_missing_blob_is_plain_system_task() {
        let extra = ExtraConfig::parse(None).unwrap();
        assert_eq!(extra.kind.task_type(), TaskType::System);
        assert_eq!(ExtraConfig::parse(Some("  ")).unwrap(), extra);
    }

    #[test]
    fn test_rejects_bad_blobs() {
        assert!(matches!(
            ExtraConfig::parse(Some("{not json")),
            Err(TaskConfigError::MalformedJson { .. })
        ));
        assert!(matches!(
            ExtraConfig::parse(Some("[1,2]")),
            Err(TaskConfigError::WrongShape { .. })
        ));
        assert!(matches!(
            ExtraConfig::parse(Some(r#"{"url":"http://x"}"#)),
            Err(TaskConfigError::MissingTaskType)
        ));
        assert!(matches!(
            ExtraConfig::parse(Some(r#"{"task_type":"shell"}"#)),
            Err(TaskConfigError::UnknownTaskType(t)) if t == "shell"
        ));
    }

    #[test]
    fn test_stored_args_and_kwargs() {
        assert_eq!(parse_args(None).unwrap(), Vec::<Value>::new());
        assert_eq!(parse_args(Some("[1,\"a\"]")).unwrap().len(), 2);
        assert!(parse_args(Some("{}")).is_err());
        assert_eq!(parse_kwargs(Some("{\"a\":1}")).unwrap()["a"], 1);
        assert!(parse_kwargs(Some("[")).is_err());
    }
}
