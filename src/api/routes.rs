//! API route definitions.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::state::AppState;
use super::{ApiError, CLIENT_KEY_HEADER};
use crate::jobs::{JobId, JobRequest, USER_PRIORITY};
use crate::resources::DataProfile;
use crate::scheduler::{JobStatus, Notifier, SchedulerError};
use crate::storage;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/clients", post(register_client))
        .route("/clients/{key}", delete(unregister_client))
        .route("/clients/{key}/events", get(client_events))
        .route("/scheduler", get(scheduler_snapshot))
        .route("/jobs", post(submit_job))
        .route("/jobs/{id}", get(job_status).delete(cancel_job))
        .route("/jobs/{id}/results", get(job_results))
        .route("/settings/battery", put(set_battery))
        .route("/settings/checkin-interval", put(set_checkin_interval))
        .route("/settings/data-profile", put(set_data_profile))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

fn envelope(data: Value) -> Json<Value> {
    Json(json!({ "data": data, "meta": meta() }))
}

/// The registered client named by the key header.
fn client_key(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let key = headers
        .get(CLIENT_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "missing client key"))?;
    if !state.clients.is_registered(key) {
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "unknown client key"));
    }
    Ok(key.to_string())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    envelope(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "clients": state.clients.client_count(),
        "running": state.scheduler.is_running(),
    }))
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

async fn register_client(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let key = uuid::Uuid::new_v4().to_string();
    let rx = state.clients.register(&key);
    state
        .inboxes
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(key.clone(), rx);
    (StatusCode::CREATED, envelope(json!({ "key": key })))
}

async fn unregister_client(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .inboxes
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&key);
    if state.clients.unregister(&key) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("unknown client"))
    }
}

/// Drain the events queued for a client since its last poll.
async fn client_events(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let mut inboxes = state.inboxes.lock().unwrap_or_else(|e| e.into_inner());
    let rx = inboxes
        .get_mut(&key)
        .ok_or_else(|| ApiError::not_found("unknown client"))?;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    let total = events.len();
    let data = serde_json::to_value(events).map_err(ApiError::internal)?;
    Ok(Json(json!({ "data": data, "meta": { "total": total } })))
}

async fn scheduler_snapshot(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let snapshot = state.scheduler.snapshot();
    Ok(envelope(serde_json::to_value(snapshot).map_err(ApiError::internal)?))
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<JobRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let submitter = client_key(&state, &headers)?;
    if request.priority.is_none() {
        request.priority = Some(USER_PRIORITY);
    }
    let id = state
        .scheduler
        .submit(&submitter, request)
        .map_err(|e| match e {
            SchedulerError::ReservedSubmitter(_) => ApiError::new(StatusCode::FORBIDDEN, e.to_string()),
            other => ApiError::bad_request(other.to_string()),
        })?;
    let status = state.scheduler.query_status(&id);
    info!(job_id = %id, client = %submitter, %status, "job submitted over api");
    Ok((
        StatusCode::CREATED,
        envelope(json!({ "job_id": id, "status": status })),
    ))
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = JobId::from(id);
    match state.scheduler.query_status(&id) {
        JobStatus::NotFound => Err(ApiError::not_found("unknown job")),
        status => Ok(envelope(json!({
            "job_id": id,
            "status": status,
            "owner": state.scheduler.owner(&id),
        }))),
    }
}

async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let submitter = client_key(&state, &headers)?;
    let id = JobId::from(id);
    let cancelled = state.scheduler.cancel(&id, &submitter);
    Ok(envelope(json!({
        "job_id": id,
        "cancelled": cancelled,
        "status": state.scheduler.query_status(&id),
    })))
}

async fn job_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = JobId::from(id);
    let pool = state.pool.clone();
    let lookup = id.clone();
    let results = tokio::task::spawn_blocking(move || storage::results_for_job(&pool, &lookup))
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::internal)?;
    if results.is_empty() && state.scheduler.query_status(&id) == JobStatus::NotFound {
        return Err(ApiError::not_found("unknown job"));
    }
    let total = results.len();
    let data = serde_json::to_value(results).map_err(ApiError::internal)?;
    Ok(Json(json!({ "data": data, "meta": { "total": total } })))
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BatterySetting {
    #[serde(default)]
    forced: bool,
    percent: u8,
}

#[derive(Debug, Deserialize)]
struct IntervalSetting {
    #[serde(default)]
    forced: bool,
    seconds: u64,
}

#[derive(Debug, Deserialize)]
struct ProfileSetting {
    #[serde(default)]
    forced: bool,
    profile: DataProfile,
}

async fn set_battery(
    State(state): State<AppState>,
    Json(body): Json<BatterySetting>,
) -> Json<Value> {
    let applied = state.scheduler.set_battery_threshold(body.forced, body.percent);
    envelope(json!({ "percent": applied }))
}

async fn set_checkin_interval(
    State(state): State<AppState>,
    Json(body): Json<IntervalSetting>,
) -> Json<Value> {
    let applied = state.scheduler.set_checkin_interval(body.forced, body.seconds);
    envelope(json!({ "seconds": applied }))
}

async fn set_data_profile(
    State(state): State<AppState>,
    Json(body): Json<ProfileSetting>,
) -> Json<Value> {
    let applied = state.scheduler.set_data_usage_profile(body.forced, body.profile);
    envelope(json!({ "profile": applied }))
}
