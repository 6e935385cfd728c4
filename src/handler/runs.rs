use crate::{
    app::AppState,
    dialer::{DialScheduler, Lead, RunStatus},
    slots::StoreError,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/runs", post(create_run))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/resume", post(resume_run))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest {
    pub tenant_id: String,
    pub leads: Vec<Lead>,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn store_error(e: StoreError) -> Response {
    match e {
        StoreError::Invalid(message) => error_response(StatusCode::BAD_REQUEST, message),
        StoreError::NotFound(what) => {
            error_response(StatusCode::NOT_FOUND, format!("{} not found", what))
        }
        other => {
            warn!("run store failure: {}", other);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

fn scheduler(state: &AppState) -> Result<&Arc<DialScheduler>, Response> {
    state.dialer.as_ref().ok_or_else(|| {
        error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "outbound dialer is disabled".to_string(),
        )
    })
}

fn status_response(run_id: &str, status: Option<RunStatus>) -> Response {
    match status {
        Some(status) => {
            Json(serde_json::json!({ "runId": run_id, "status": status })).into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, format!("run {} not found", run_id)),
    }
}

async fn create_run(State(state): State<AppState>, Json(request): Json<CreateRunRequest>) -> Response {
    let scheduler = match scheduler(&state) {
        Ok(scheduler) => scheduler,
        Err(response) => return response,
    };
    match scheduler.create_run(&request.tenant_id, &request.leads) {
        Ok(run) => (StatusCode::CREATED, Json(run)).into_response(),
        Err(e) => store_error(e),
    }
}

async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let scheduler = match scheduler(&state) {
        Ok(scheduler) => scheduler,
        Err(response) => return response,
    };
    match scheduler.run_summary(&id) {
        Ok(Some((run, counts))) => {
            Json(serde_json::json!({ "run": run, "jobs": counts })).into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("run {} not found", id)),
        Err(e) => store_error(e),
    }
}

async fn cancel_run(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let scheduler = match scheduler(&state) {
        Ok(scheduler) => scheduler,
        Err(response) => return response,
    };
    match scheduler.cancel_run(&id) {
        Ok(status) => status_response(&id, status),
        Err(e) => store_error(e),
    }
}

async fn resume_run(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let scheduler = match scheduler(&state) {
        Ok(scheduler) => scheduler,
        Err(response) => return response,
    };
    match scheduler.resume_run(&id) {
        Ok(status) => status_response(&id, status),
        Err(e) => store_error(e),
    }
}
