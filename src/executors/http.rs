//! Generic HTTP task executor.
//!
//! Args are `[url, method, headers, body]`; kwargs may carry `timeout`
//! (seconds). Non-2xx responses count as request errors and are retried.

use std::time::Duration;

use reqwest::{Client, Method};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::{Executor, ExecutorError, TaskOutcome};
use crate::config::HttpConfig;
use crate::storage::queue::TaskMessage;

/// A decoded HTTP call.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequestSpec {
    pub url: String,
    pub method: Method,
    pub headers: Map<String, Value>,
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
}

impl HttpRequestSpec {
    pub fn from_message(message: &TaskMessage) -> Result<Self, ExecutorError> {
        let bad = |what: &str| ExecutorError::InvalidArguments(what.to_string());

        let url = message
            .args
            .first()
            .and_then(Value::as_str)
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| bad("url must be a non-empty string"))?
            .to_string();
        let method = match message.args.get(1) {
            None | Some(Value::Null) => Method::GET,
            Some(Value::String(m)) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|_| bad("invalid HTTP method"))?,
            Some(_) => return Err(bad("method must be a string")),
        };
        let headers = match message.args.get(2) {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(h)) => h.clone(),
            Some(_) => return Err(bad("headers must be an object")),
        };
        let body = message.args.get(3).filter(|b| !b.is_null()).cloned();
        let timeout = match message.kwargs.get("timeout") {
            None | Some(Value::Null) => None,
            Some(t) => {
                let secs = t
                    .as_f64()
                    .filter(|s| s.is_finite() && *s > 0.0)
                    .ok_or_else(|| bad("timeout must be a positive number"))?;
                Some(Duration::from_secs_f64(secs))
            }
        };

        Ok(Self {
            url,
            method,
            headers,
            body,
            timeout,
        })
    }
}

pub struct HttpExecutor {
    client: Client,
    config: HttpConfig,
}

impl HttpExecutor {
    pub fn new(client: Client, config: HttpConfig) -> Self {
        Self { client, config }
    }

    async fn send(&self, spec: &HttpRequestSpec) -> Result<Value, ExecutorError> {
        let timeout = spec
            .timeout
            .unwrap_or(Duration::from_secs(self.config.default_timeout_secs));
        let mut request = self
            .client
            .request(spec.method.clone(), &spec.url)
            .timeout(timeout);
        for (name, value) in &spec.headers {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            request = request.header(name.as_str(), value);
        }
        request = match &spec.body {
            None => request,
            Some(Value::String(raw)) => request.body(raw.clone()),
            Some(body) => request.json(body),
        };

        let response = request.send().await?.error_for_status()?;
        let status_code = response.status().as_u16();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()),
                )
            })
            .collect();
        let body = response.text().await?;

        Ok(json!({
            "status_code": status_code,
            "headers": headers,
            "body": body,
        }))
    }
}

#[async_trait::async_trait]
impl Executor for HttpExecutor {
    async fn execute(&self, message: &TaskMessage) -> TaskOutcome {
        let spec = match HttpRequestSpec::from_message(message) {
            Ok(spec) => spec,
            Err(e) => return TaskOutcome::failure(e),
        };

        match self.send(&spec).await {
            Ok(result) => {
                info!(task=%message.task_name, url=%spec.url, method=%spec.method, status=%result["status_code"], "HTTP task completed");
                TaskOutcome::success(result)
            }
            Err(e) => {
                warn!(task=%message.task_name, url=%spec.url, retries = message.retries, error=%e, "HTTP task failed");
                TaskOutcome::retry_or_fail(e, message.retries, self.config.max_retries)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::dispatch::HTTP_TASK_PATH;
    use crate::scheduler::queue::QueueName;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message(args: Vec<Value>, retries: u32) -> TaskMessage {
        let mut msg = TaskMessage::new("ping", HTTP_TASK_PATH, QueueName::PriorityLow, args, Map::new());
        msg.retries = retries;
        msg
    }

    fn executor() -> HttpExecutor {
        HttpExecutor::new(Client::new(), HttpConfig::default())
    }

    #[test]
    fn test_decodes_args() {
        let mut msg = message(
            vec![json!("http://x/y"), json!("post"), json!({"X-A": "1"}), json!({"k": 1})],
            0,
        );
        msg.kwargs.insert("timeout".to_string(), json!(2.5));
        let spec = HttpRequestSpec::from_message(&msg).unwrap();
        assert_eq!(spec.method, Method::POST);
        assert_eq!(spec.headers["X-A"], "1");
        assert_eq!(spec.body, Some(json!({"k": 1})));
        assert_eq!(spec.timeout, Some(Duration::from_millis(2500)));

        let bare = HttpRequestSpec::from_message(&message(
            vec![json!("http://x/y"), json!("GET"), Value::Null, Value::Null],
            0,
        ))
        .unwrap();
        assert!(bare.headers.is_empty());
        assert_eq!(bare.body, None);
    }

    #[test]
    fn test_rejects_bad_args() {
        assert!(HttpRequestSpec::from_message(&message(vec![], 0)).is_err());
        assert!(HttpRequestSpec::from_message(&message(vec![json!("http://x"), json!(5)], 0)).is_err());
    }

    #[tokio::test]
    async fn test_success_returns_status_headers_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("x-token", "abc"))
            .and(body_json(json!({"event": "tick"})))
            .respond_with(ResponseTemplate::new(201).set_body_string("created"))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = executor()
            .execute(&message(
                vec![
                    json!(format!("{}/hook", server.uri())),
                    json!("POST"),
                    json!({"x-token": "abc"}),
                    json!({"event": "tick"}),
                ],
                0,
            ))
            .await;

        let TaskOutcome::Success { result } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(result["status_code"], 201);
        assert_eq!(result["body"], "created");
    }

    #[tokio::test]
    async fn test_non_2xx_is_retried_up_to_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let args = vec![json!(server.uri()), json!("GET"), Value::Null, Value::Null];
        let first = executor().execute(&message(args.clone(), 0)).await;
        assert!(matches!(first, TaskOutcome::Retry { countdown_secs: 60, .. }));
        let third = executor().execute(&message(args.clone(), 2)).await;
        assert!(matches!(third, TaskOutcome::Retry { countdown_secs: 180, .. }));
        let last = executor().execute(&message(args, 3)).await;
        assert!(matches!(last, TaskOutcome::Failure { .. }));
    }
}
