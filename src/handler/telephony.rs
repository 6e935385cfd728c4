//! Telephony vendor surface: the bidirectional media websocket and the
//! out-of-band status callback.
use super::middleware::clientaddr::ClientAddr;
use crate::{
    app::AppState,
    call::{StreamStart, TelephonyInput, TelephonyStatus},
    media::pacer::MediaSink,
    CallDirection,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MEDIA_CHANNEL_SIZE: usize = 256;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/telephony/stream", get(stream_handler))
        .route("/telephony/status", post(status_handler))
}

/// Vendor to engine messages on the media websocket.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamMessage {
    Connected {},
    Start {
        start: StartPayload,
    },
    Media {
        media: MediaPayload,
    },
    Mark {},
    Stop {},
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    pub call_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub direction: Option<CallDirection>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
pub struct MediaPayload {
    /// base64 of the encoded frame
    pub payload: String,
}

/// Engine to vendor messages.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundMessage<'a> {
    #[serde(rename_all = "camelCase")]
    Media {
        call_id: &'a str,
        media: MediaPayload,
    },
    #[serde(rename_all = "camelCase")]
    Clear { call_id: &'a str },
}

impl From<StartPayload> for StreamStart {
    fn from(start: StartPayload) -> Self {
        StreamStart {
            call_id: start.call_id,
            tenant_id: start.tenant_id.unwrap_or_else(|| "default".to_string()),
            direction: start.direction,
            caller: start.from,
            callee: start.to,
            job_id: start.job_id,
        }
    }
}

pub async fn stream_handler(
    client: ClientAddr,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = handle_stream(socket, state).await {
            warn!(%client, "telephony stream ended with error: {}", e);
        }
    })
}

async fn handle_stream(socket: WebSocket, state: AppState) -> Result<()> {
    let (sender, mut receiver) = socket.split();
    let timeout = Duration::from_secs(state.config.lifecycle.start_timeout_secs.max(1));
    let start = match tokio::time::timeout(timeout, wait_for_start(&mut receiver)).await {
        Ok(start) => start?,
        Err(_) => {
            warn!("telephony stream sent no start event in time");
            return Ok(());
        }
    };
    let handle = state.calls.attach(start)?;
    let call_id = handle.call_id().to_string();
    info!(call_id, "telephony stream attached");

    let (media_tx, media_rx) = mpsc::channel(MEDIA_CHANNEL_SIZE);
    let reader = tokio::spawn(read_media(
        call_id.clone(),
        receiver,
        media_tx,
        handle.lifecycle.token().clone(),
    ));
    let sink = WebSocketSink::new(call_id, sender);
    let result = state.calls.run(handle, media_rx, sink).await;
    reader.abort();
    result
}

async fn wait_for_start(receiver: &mut SplitStream<WebSocket>) -> Result<StreamStart> {
    while let Some(message) = receiver.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<StreamMessage>(text.as_str()) {
            Ok(StreamMessage::Start { start }) => return Ok(start.into()),
            Ok(StreamMessage::Stop {}) => break,
            Ok(other) => debug!(?other, "ignoring message before start"),
            Err(e) => debug!("unparsable stream message: {}", e),
        }
    }
    Err(anyhow!("stream closed before start"))
}

async fn read_media(
    call_id: String,
    mut receiver: SplitStream<WebSocket>,
    media_tx: mpsc::Sender<TelephonyInput>,
    token: CancellationToken,
) {
    loop {
        let message = select! {
            _ = token.cancelled() => return,
            message = receiver.next() => message,
        };
        let input = match message {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<StreamMessage>(text.as_str()) {
                    Ok(StreamMessage::Media { media }) => match STANDARD.decode(&media.payload) {
                        Ok(payload) => TelephonyInput::Media(Bytes::from(payload)),
                        Err(e) => {
                            debug!(call_id, "bad media payload: {}", e);
                            continue;
                        }
                    },
                    Ok(StreamMessage::Stop {}) => TelephonyInput::Stop,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(call_id, "unparsable stream message: {}", e);
                        continue;
                    }
                }
            }
            Some(Ok(Message::Binary(payload))) => TelephonyInput::Media(payload),
            Some(Ok(Message::Close(_))) | None => TelephonyInput::Stop,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(call_id, "telephony stream read failed: {}", e);
                TelephonyInput::Stop
            }
        };
        let stop = input == TelephonyInput::Stop;
        if media_tx.send(input).await.is_err() || stop {
            return;
        }
    }
}

/// Egress side of the media websocket.
pub struct WebSocketSink {
    call_id: String,
    sender: SplitSink<WebSocket, Message>,
}

impl WebSocketSink {
    pub fn new(call_id: String, sender: SplitSink<WebSocket, Message>) -> Self {
        Self { call_id, sender }
    }

    async fn send_json(&mut self, message: &OutboundMessage<'_>) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.sender.send(Message::Text(text.into())).await?;
        Ok(())
    }
}

#[async_trait]
impl MediaSink for WebSocketSink {
    async fn send_media(&mut self, payload: Bytes) -> Result<()> {
        let call_id = self.call_id.clone();
        self.send_json(&OutboundMessage::Media {
            call_id: &call_id,
            media: MediaPayload {
                payload: STANDARD.encode(&payload),
            },
        })
        .await
    }

    async fn send_clear(&mut self) -> Result<()> {
        let call_id = self.call_id.clone();
        self.send_json(&OutboundMessage::Clear { call_id: &call_id })
            .await
    }

    async fn close(&mut self) -> Result<()> {
        self.sender.close().await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCallback {
    pub call_id: String,
    pub status: String,
}

pub async fn status_handler(
    State(state): State<AppState>,
    Json(callback): Json<StatusCallback>,
) -> Response {
    let Some(status) = TelephonyStatus::parse(&callback.status) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": format!("unknown status {}", callback.status) })),
        )
            .into_response();
    };
    match state.calls.on_status(&callback.call_id, status).await {
        Ok(true) => return Json(serde_json::json!({ "handled": "call" })).into_response(),
        Ok(false) => {}
        Err(e) => {
            warn!(call_id = callback.call_id, "status callback failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    }
    if let Some(dialer) = &state.dialer {
        match dialer.on_status_unknown_call(&callback.call_id, status) {
            Ok(true) => return Json(serde_json::json!({ "handled": "job" })).into_response(),
            Ok(false) => {}
            Err(e) => {
                warn!(call_id = callback.call_id, "status callback failed: {}", e);
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }
        }
    }
    debug!(call_id = callback.call_id, "status for unknown call");
    Json(serde_json::json!({ "handled": null })).into_response()
}
