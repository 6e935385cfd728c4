//! Conversational AI backend.
//!
//! Every backend notification is translated into one [`BackendEvent`]
//! variant and delivered through a single channel; the call's conversation
//! task dispatches them in one `match`.
use crate::PcmBuf;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub mod fallback;
pub mod mock;
pub mod realtime;

pub const EVENT_CHANNEL_SIZE: usize = 512;
pub const COMMAND_CHANNEL_SIZE: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend connect failed: {0}")]
    Connect(String),
    #[error("backend send failed: {0}")]
    Send(String),
    #[error("backend protocol error: {0}")]
    Protocol(String),
    #[error("backend connection closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Completed,
    Cancelled,
    Failed,
    Incomplete,
}

impl ResponseStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "completed" => ResponseStatus::Completed,
            "cancelled" => ResponseStatus::Cancelled,
            "incomplete" => ResponseStatus::Incomplete,
            _ => ResponseStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    SessionReady,
    SpeechStarted,
    SpeechStopped,
    InputTranscript {
        text: String,
        confidence: Option<f32>,
        is_final: bool,
    },
    ResponseStarted {
        response_id: String,
    },
    AudioChunk {
        response_id: String,
        pcm: PcmBuf,
    },
    /// Text of what the AI is saying; `is_final` carries the full transcript
    OutputTranscript {
        response_id: String,
        text: String,
        is_final: bool,
    },
    AudioDone {
        response_id: String,
    },
    ResponseDone {
        response_id: String,
        status: ResponseStatus,
    },
    /// A cancel request took effect, or found nothing left to cancel
    CancelAck {
        response_id: Option<String>,
    },
    FunctionCall {
        response_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    Error {
        code: Option<String>,
        message: String,
    },
    Closed {
        reason: Option<String>,
    },
}

impl BackendEvent {
    pub fn response_id(&self) -> Option<&str> {
        match self {
            BackendEvent::ResponseStarted { response_id }
            | BackendEvent::AudioChunk { response_id, .. }
            | BackendEvent::OutputTranscript { response_id, .. }
            | BackendEvent::AudioDone { response_id }
            | BackendEvent::ResponseDone { response_id, .. }
            | BackendEvent::FunctionCall { response_id, .. } => Some(response_id),
            BackendEvent::CancelAck { response_id } => response_id.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCommand {
    /// Caller audio at the backend sample rate
    AppendAudio(PcmBuf),
    CreateResponse { instructions: Option<String> },
    CancelResponse { response_id: Option<String> },
    Close,
}

#[derive(Debug, Clone)]
pub struct BackendSessionOption {
    pub call_id: String,
    pub instructions: String,
    pub voice: String,
    pub sample_rate: u32,
    pub transcription_model: Option<String>,
}

pub struct BackendConnection {
    pub commands: mpsc::Sender<BackendCommand>,
    pub events: mpsc::Receiver<BackendEvent>,
}

#[async_trait]
pub trait AiBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn connect(&self, option: &BackendSessionOption)
        -> Result<BackendConnection, BackendError>;
}

/// Connect, retrying transient failures with linear backoff.
pub async fn connect_with_retry(
    backend: &dyn AiBackend,
    option: &BackendSessionOption,
    max_retries: u32,
    backoff: Duration,
) -> Result<BackendConnection, BackendError> {
    let mut attempt = 0;
    loop {
        match backend.connect(option).await {
            Ok(connection) => {
                if attempt > 0 {
                    crate::metrics::call::backend_reconnect(true);
                    info!(
                        call_id = option.call_id,
                        backend = backend.name(),
                        attempt,
                        "backend connected after retry"
                    );
                }
                return Ok(connection);
            }
            Err(e) if attempt < max_retries => {
                attempt += 1;
                warn!(
                    call_id = option.call_id,
                    backend = backend.name(),
                    attempt,
                    "backend connect failed: {}",
                    e
                );
                tokio::time::sleep(backoff * attempt).await;
            }
            Err(e) => {
                if attempt > 0 {
                    crate::metrics::call::backend_reconnect(false);
                }
                return Err(e);
            }
        }
    }
}
