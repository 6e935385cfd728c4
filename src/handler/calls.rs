use crate::app::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::info;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/calls", get(list_calls))
        .route("/calls/{id}/hangup", post(hangup_call))
}

async fn list_calls(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({ "calls": state.calls.list() })).into_response()
}

async fn hangup_call(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.calls.hangup(&id).await {
        Some(issued) => {
            info!(call_id = id, issued, "hangup requested");
            Json(serde_json::json!({ "callId": id, "issued": issued })).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("call {} not found", id) })),
        )
            .into_response(),
    }
}
