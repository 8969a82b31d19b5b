//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use super::state::AppState;
use crate::clock::format_instant;
use crate::scheduler::dispatch;
use crate::scheduler::QueueName;
use crate::storage::executions::ExecutionStore;
use crate::storage::periodic_tasks::ScheduleStore;
use crate::storage::run_log::RunLogStore;
use crate::storage::{Pool, StoreHandle};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/schedules", get(list_schedules))
        .route("/schedules/refresh", post(refresh_schedules))
        .route("/tasks/{id}/run", post(run_task_now))
        .route("/executions", get(list_executions))
        .route("/run-logs", get(list_run_logs))
}

/// Error body in the same envelope as successful responses.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub(super) fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        error!("API request failed: {:#}", err);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "data": null,
            "meta": { "error": self.message }
        }));
        (self.status, body).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn require_store(state: &AppState) -> Result<Pool, ApiError> {
    state
        .store
        .pool()
        .map_err(|_| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "store unavailable"))
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let store_ok = state.store.pool().is_ok_and(|pool| pool.get().is_ok());
    let depths: serde_json::Map<String, Value> = QueueName::ALL
        .iter()
        .map(|q| {
            let depth = state.broker.depth(*q).map(Value::from).unwrap_or(Value::Null);
            (q.as_str().to_string(), depth)
        })
        .collect();
    let broker_ok = depths.values().all(|d| !d.is_null());

    Json(json!({
        "data": {
            "status": if store_ok && broker_ok { "ok" } else { "degraded" },
            "store": store_ok,
            "broker": broker_ok,
            "queue_depths": depths,
        },
        "meta": {
            "timestamp": format_instant(chrono::Utc::now()),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn list_schedules(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.schedule.borrow().clone();
    let entries: Vec<&crate::scheduler::ScheduleEntry> = snapshot.entries().collect();
    Json(json!({
        "data": entries,
        "meta": {
            "total": entries.len(),
            "loaded_at": snapshot.loaded_at().map(format_instant),
        }
    }))
}

async fn refresh_schedules(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    state.refresh.request();
    info!("Schedule refresh requested via API");
    (
        StatusCode::ACCEPTED,
        Json(json!({ "data": { "refresh_requested": true }, "meta": {} })),
    )
}

async fn run_task_now(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let store = ScheduleStore::new(require_store(&state)?);
    let row = store
        .get(id)
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("periodic task {id} not found")))?;
    let message = dispatch::message_for_row(&row)
        .map_err(|e| ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    state.broker.enqueue(&message).map_err(ApiError::internal)?;
    info!(task=%row.task_name, task_id=%message.task_id, queue=%message.queue, "Run-now dispatched");

    Ok(Json(json!({
        "data": {
            "task_id": message.task_id,
            "task_name": message.task_name,
            "task_path": message.task_path,
            "queue": message.queue,
        },
        "meta": {}
    })))
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

async fn list_executions(State(state): State<AppState>, Query(params): Query<LimitParams>) -> ApiResult {
    let store = ExecutionStore::new(require_store(&state)?);
    let records = store
        .recent(clamp_limit(params.limit))
        .map_err(ApiError::internal)?;
    Ok(Json(json!({ "data": records, "meta": { "total": records.len() } })))
}

#[derive(Debug, Deserialize)]
struct RunLogParams {
    task_name: Option<String>,
    limit: Option<usize>,
}

async fn list_run_logs(State(state): State<AppState>, Query(params): Query<RunLogParams>) -> ApiResult {
    let store = RunLogStore::new(require_store(&state)?);
    let entries = store
        .recent(params.task_name.as_deref(), clamp_limit(params.limit))
        .map_err(ApiError::internal)?;
    Ok(Json(json!({ "data": entries, "meta": { "total": entries.len() } })))
}
