use crate::app::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

pub mod calls;
pub mod middleware;
pub mod runs;
pub mod telephony;

pub fn router(metrics_path: &str) -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route(metrics_path, get(render_metrics))
        .merge(telephony::router())
        .merge(calls::router())
        .merge(runs::router())
}

async fn health(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "calls": state.calls.registry().count(),
        "dialer": state.dialer.as_ref().map(|d| d.worker_id().to_string()),
    }))
    .into_response()
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
