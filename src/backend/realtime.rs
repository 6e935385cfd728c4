//! Websocket client for OpenAI-realtime style speech-to-speech backends.
use super::{
    AiBackend, BackendCommand, BackendConnection, BackendError, BackendEvent,
    BackendSessionOption, ResponseStatus, COMMAND_CHANNEL_SIZE, EVENT_CHANNEL_SIZE,
};
use crate::config::BackendConfig;
use crate::media::codecs::{bytes_to_samples, samples_to_bytes};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, info, warn};

pub struct RealtimeBackend {
    config: BackendConfig,
}

impl RealtimeBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    fn api_key(&self) -> Option<String> {
        self.config
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }
}

#[derive(Debug, Deserialize)]
struct ResponseInfo {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorInfo {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct LogProb {
    logprob: f64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "session.updated")]
    SessionUpdated {},
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {},
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {},
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptCompleted {
        transcript: String,
        #[serde(default)]
        logprobs: Option<Vec<LogProb>>,
    },
    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseInfo },
    #[serde(rename = "response.audio.delta")]
    AudioDelta { response_id: String, delta: String },
    #[serde(rename = "response.audio.done")]
    AudioDone { response_id: String },
    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta { response_id: String, delta: String },
    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone {
        response_id: String,
        transcript: String,
    },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallDone {
        response_id: String,
        name: String,
        arguments: String,
    },
    #[serde(rename = "response.done")]
    ResponseDone { response: ResponseInfo },
    #[serde(rename = "error")]
    Error { error: ErrorInfo },
    #[serde(other)]
    Unknown,
}

/// Translate one server text frame. Unknown event types map to nothing.
pub fn parse_server_event(text: &str) -> Result<Option<BackendEvent>, BackendError> {
    let event: ServerEvent =
        serde_json::from_str(text).map_err(|e| BackendError::Protocol(e.to_string()))?;
    let event = match event {
        ServerEvent::SessionUpdated {} => BackendEvent::SessionReady,
        ServerEvent::SpeechStarted {} => BackendEvent::SpeechStarted,
        ServerEvent::SpeechStopped {} => BackendEvent::SpeechStopped,
        ServerEvent::InputTranscriptCompleted {
            transcript,
            logprobs,
        } => BackendEvent::InputTranscript {
            text: transcript,
            confidence: logprobs.filter(|p| !p.is_empty()).map(|p| {
                let mean = p.iter().map(|l| l.logprob).sum::<f64>() / p.len() as f64;
                mean.exp() as f32
            }),
            is_final: true,
        },
        ServerEvent::ResponseCreated { response } => BackendEvent::ResponseStarted {
            response_id: response.id,
        },
        ServerEvent::AudioDelta { response_id, delta } => {
            let bytes = STANDARD
                .decode(delta.as_bytes())
                .map_err(|e| BackendError::Protocol(format!("audio delta: {}", e)))?;
            BackendEvent::AudioChunk {
                response_id,
                pcm: bytes_to_samples(&bytes),
            }
        }
        ServerEvent::AudioDone { response_id } => BackendEvent::AudioDone { response_id },
        ServerEvent::TranscriptDelta { response_id, delta } => BackendEvent::OutputTranscript {
            response_id,
            text: delta,
            is_final: false,
        },
        ServerEvent::TranscriptDone {
            response_id,
            transcript,
        } => BackendEvent::OutputTranscript {
            response_id,
            text: transcript,
            is_final: true,
        },
        ServerEvent::FunctionCallDone {
            response_id,
            name,
            arguments,
        } => BackendEvent::FunctionCall {
            response_id,
            name,
            arguments: serde_json::from_str(&arguments)
                .unwrap_or(serde_json::Value::String(arguments)),
        },
        // a cancelled status is only an acknowledgement if we asked for it,
        // which the call's turn tracker decides
        ServerEvent::ResponseDone { response } => BackendEvent::ResponseDone {
            response_id: response.id,
            status: ResponseStatus::parse(response.status.as_deref().unwrap_or("completed")),
        },
        ServerEvent::Error { error } => {
            if error.code.as_deref() == Some("response_cancel_not_active") {
                BackendEvent::CancelAck { response_id: None }
            } else {
                BackendEvent::Error {
                    code: error.code,
                    message: error.message,
                }
            }
        }
        ServerEvent::Unknown => return Ok(None),
    };
    Ok(Some(event))
}

pub fn session_update(option: &BackendSessionOption) -> serde_json::Value {
    let mut session = json!({
        "modalities": ["audio", "text"],
        "instructions": option.instructions,
        "voice": option.voice,
        "input_audio_format": "pcm16",
        "output_audio_format": "pcm16",
        // barge-in is decided locally
        "turn_detection": {
            "type": "server_vad",
            "create_response": true,
            "interrupt_response": false,
        },
    });
    if let Some(model) = &option.transcription_model {
        session["input_audio_transcription"] = json!({ "model": model });
    }
    json!({ "type": "session.update", "session": session })
}

pub fn encode_command(command: &BackendCommand) -> Option<serde_json::Value> {
    let value = match command {
        BackendCommand::AppendAudio(pcm) => json!({
            "type": "input_audio_buffer.append",
            "audio": STANDARD.encode(samples_to_bytes(pcm)),
        }),
        BackendCommand::CreateResponse { instructions } => match instructions {
            Some(instructions) => json!({
                "type": "response.create",
                "response": { "instructions": instructions },
            }),
            None => json!({ "type": "response.create" }),
        },
        BackendCommand::CancelResponse { response_id } => match response_id {
            Some(id) => json!({ "type": "response.cancel", "response_id": id }),
            None => json!({ "type": "response.cancel" }),
        },
        BackendCommand::Close => return None,
    };
    Some(value)
}

#[async_trait]
impl AiBackend for RealtimeBackend {
    fn name(&self) -> &str {
        "realtime"
    }

    async fn connect(
        &self,
        option: &BackendSessionOption,
    ) -> Result<BackendConnection, BackendError> {
        let url = if self.config.url.contains('?') {
            self.config.url.clone()
        } else {
            format!("{}?model={}", self.config.url, self.config.model)
        };
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| BackendError::Connect(e.to_string()))?;
        if let Some(api_key) = self.api_key() {
            let value = HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| BackendError::Connect(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| BackendError::Connect(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        ws_sender
            .send(Message::Text(session_update(option).to_string().into()))
            .await
            .map_err(|e| BackendError::Send(e.to_string()))?;
        info!(call_id = option.call_id, url, "realtime backend connected");

        let (command_tx, mut command_rx) = mpsc::channel::<BackendCommand>(COMMAND_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel::<BackendEvent>(EVENT_CHANNEL_SIZE);

        let call_id = option.call_id.clone();
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let Some(value) = encode_command(&command) else {
                    break;
                };
                if let Err(e) = ws_sender.send(Message::Text(value.to_string().into())).await {
                    warn!(call_id, "realtime send failed: {}", e);
                    break;
                }
            }
            ws_sender.close().await.ok();
            debug!(call_id, "realtime writer finished");
        });

        let call_id = option.call_id.clone();
        tokio::spawn(async move {
            let mut reason = None;
            while let Some(message) = ws_receiver.next().await {
                match message {
                    Ok(Message::Text(text)) => match parse_server_event(&text) {
                        Ok(Some(event)) => {
                            if event_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(call_id, "realtime event ignored: {}", e),
                    },
                    Ok(Message::Close(frame)) => {
                        reason = frame.map(|f| f.reason.as_str().to_string());
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        reason = Some(e.to_string());
                        break;
                    }
                }
            }
            info!(call_id, ?reason, "realtime backend closed");
            event_tx.send(BackendEvent::Closed { reason }).await.ok();
        });

        Ok(BackendConnection {
            commands: command_tx,
            events: event_rx,
        })
    }
}
