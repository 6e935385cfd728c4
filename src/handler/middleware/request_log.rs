use super::clientaddr::ClientAddr;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header::CONTENT_LENGTH, Request},
    middleware::Next,
    response::Response,
};
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tracing::info;

fn should_skip_logging(path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        if let Some(prefix) = pattern.strip_suffix('*') {
            path.starts_with(prefix)
        } else {
            path == pattern
        }
    })
}

/// Logs one `http.access` line per request once the handler returns.
pub async fn log_requests(
    State(skip_paths): State<Arc<Vec<String>>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let started_at = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().to_string();
    let path = req.uri().path().to_string();
    let connect_info = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let client = ClientAddr::from_http_parts(req.headers(), connect_info);

    let response = next.run(req).await;

    if !should_skip_logging(&path, skip_paths.as_slice()) {
        let body_len = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("-");
        info!(
            target: "http.access",
            method = method.as_str(),
            status = response.status().as_u16(),
            body_len,
            cost_ms = started_at.elapsed().as_secs_f64() * 1_000.0,
            uri = uri.as_str(),
            client_ip = %client.ip(),
        );
    }
    response
}
