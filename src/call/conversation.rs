//! Per-call router between the AI backend, the turn tracker and the
//! outbound queue. One task owns all of it, so none of it is locked.
use super::{
    closing::ClosingDetector,
    lifecycle::{HangupReason, LifecycleController},
    session::CallSessionRef,
};
use crate::{
    backend::{
        connect_with_retry, fallback::load_fallback_audio, AiBackend, BackendCommand,
        BackendEvent, BackendSessionOption, ResponseStatus,
    },
    callrecord::{Speaker, TranscriptLine},
    config::Config,
    media::{queue::OutboundFrameQueue, transport::Downlink},
    turn::{TurnDecision, TurnInput, TurnState, TurnTracker, VoiceSource},
    AudioFrame,
};
use anyhow::Result;
use chrono::Utc;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    select,
    sync::{mpsc, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name of the backend tool that asks to end the call.
pub const END_CALL_FUNCTION: &str = "end_call";

pub type UplinkSender = watch::Sender<Option<mpsc::Sender<BackendCommand>>>;
pub type UplinkReceiver = watch::Receiver<Option<mpsc::Sender<BackendCommand>>>;

/// Requests from the lifecycle monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum CallControl {
    Nudge { attempt: u32 },
}

#[derive(Debug, Default)]
pub struct ConversationReport {
    pub transcript: Vec<TranscriptLine>,
    pub extracted_fields: HashMap<String, serde_json::Value>,
    pub interruptions: u32,
    pub reconnects: u32,
}

pub struct Conversation {
    session: CallSessionRef,
    lifecycle: Arc<LifecycleController>,
    config: Arc<Config>,
    backend: Arc<dyn AiBackend>,
    option: BackendSessionOption,
    queue: Arc<OutboundFrameQueue>,
    downlink: Downlink,
    tracker: TurnTracker,
    closing: ClosingDetector,
    commands: Option<mpsc::Sender<BackendCommand>>,
    uplink: UplinkSender,
    agent_text: HashMap<String, String>,
    report: ConversationReport,
    fallback_started: bool,
}

impl Conversation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: CallSessionRef,
        lifecycle: Arc<LifecycleController>,
        config: Arc<Config>,
        backend: Arc<dyn AiBackend>,
        option: BackendSessionOption,
        queue: Arc<OutboundFrameQueue>,
        downlink: Downlink,
        uplink: UplinkSender,
    ) -> Result<Self> {
        let closing = ClosingDetector::new(
            &config.lifecycle.closing_phrases,
            Duration::from_millis(config.lifecycle.closing_grace_ms),
        )?;
        Ok(Self {
            tracker: TurnTracker::new(&config.turn),
            session,
            lifecycle,
            config,
            backend,
            option,
            queue,
            downlink,
            closing,
            commands: None,
            uplink,
            agent_text: HashMap::new(),
            report: ConversationReport::default(),
            fallback_started: false,
        })
    }

    pub async fn serve(
        mut self,
        token: CancellationToken,
        mut events: Option<mpsc::Receiver<BackendEvent>>,
        commands: Option<mpsc::Sender<BackendCommand>>,
        mut turn_rx: mpsc::Receiver<TurnInput>,
        mut control_rx: mpsc::Receiver<CallControl>,
    ) -> ConversationReport {
        match commands {
            Some(commands) => {
                self.attach_backend(commands);
                self.request_greeting();
            }
            None => self.start_fallback(),
        }
        let mut ticker = tokio::time::interval(Duration::from_millis(
            self.config.lifecycle.poll_interval_ms.max(10),
        ));

        loop {
            select! {
                _ = token.cancelled() => break,
                event = next_event(&mut events) => match event {
                    Some(BackendEvent::Closed { reason }) => {
                        warn!(call_id = self.session.call_id, ?reason, "backend session closed");
                        events = self.recover_backend().await;
                    }
                    Some(event) => self.on_backend_event(event),
                    None => {
                        warn!(call_id = self.session.call_id, "backend event stream ended");
                        events = self.recover_backend().await;
                    }
                },
                Some(input) = turn_rx.recv() => self.on_turn_input(input),
                Some(control) = control_rx.recv() => self.on_control(control),
                _ = ticker.tick() => self.on_tick().await,
            }
        }

        if let Some(commands) = self.commands.take() {
            commands.try_send(BackendCommand::Close).ok();
        }
        self.uplink.send_replace(None);
        self.report.interruptions = self.tracker.interruptions();
        self.report
    }

    fn attach_backend(&mut self, commands: mpsc::Sender<BackendCommand>) {
        self.uplink.send_replace(Some(commands.clone()));
        self.commands = Some(commands);
    }

    fn send_command(&self, command: BackendCommand) {
        let Some(commands) = &self.commands else {
            return;
        };
        if let Err(e) = commands.try_send(command) {
            warn!(call_id = self.session.call_id, "backend command dropped: {}", e);
        }
    }

    fn request_greeting(&self) {
        let Some(instructions) = &self.config.backend.greeting_instructions else {
            return;
        };
        info!(call_id = self.session.call_id, "requesting greeting");
        self.send_command(BackendCommand::CreateResponse {
            instructions: Some(instructions.clone()),
        });
    }

    /// Reconnect after the backend dropped mid-call. Gives up into the
    /// fallback prompt when every retry fails.
    async fn recover_backend(&mut self) -> Option<mpsc::Receiver<BackendEvent>> {
        self.commands = None;
        self.uplink.send_replace(None);
        if self.fallback_started {
            return None;
        }
        let backend = &self.config.backend;
        let result = connect_with_retry(
            self.backend.as_ref(),
            &self.option,
            backend.max_retries.max(1),
            Duration::from_millis(backend.retry_backoff_ms),
        )
        .await;
        match result {
            Ok(connection) => {
                self.report.reconnects += 1;
                info!(call_id = self.session.call_id, "backend session restored");
                self.attach_backend(connection.commands);
                Some(connection.events)
            }
            Err(e) => {
                warn!(call_id = self.session.call_id, "backend unavailable: {}", e);
                crate::metrics::call::backend_reconnect(false);
                self.start_fallback();
                None
            }
        }
    }

    /// Queue the fallback prompt. The call is closed once it has played.
    fn start_fallback(&mut self) {
        if self.fallback_started {
            return;
        }
        self.fallback_started = true;
        crate::metrics::call::fallback_played();
        self.queue.flush();
        self.downlink.reset();
        let Some(path) = self.config.backend.fallback_audio.as_deref() else {
            info!(call_id = self.session.call_id, "no fallback prompt configured");
            return;
        };
        match load_fallback_audio(path, self.option.sample_rate) {
            Ok(pcm) => {
                info!(call_id = self.session.call_id, path, "playing fallback prompt");
                let frames = self.downlink.push(&pcm);
                self.enqueue(frames);
                let tail = self.downlink.finish();
                self.enqueue(tail);
            }
            Err(e) => warn!(call_id = self.session.call_id, path, "fallback prompt: {}", e),
        }
    }

    fn enqueue(&self, frames: Vec<AudioFrame>) {
        for frame in frames {
            let outcome = self.queue.push(frame);
            if outcome.dropped > 0 {
                debug!(
                    call_id = self.session.call_id,
                    dropped = outcome.dropped,
                    "outbound queue overflow"
                );
            }
        }
    }

    fn on_backend_event(&mut self, event: BackendEvent) {
        let now = Instant::now();
        match event {
            BackendEvent::SessionReady => {
                debug!(call_id = self.session.call_id, "backend session ready");
            }
            BackendEvent::SpeechStarted => self.dispatch(TurnInput::VoiceStarted {
                at: now,
                source: VoiceSource::Backend,
            }),
            BackendEvent::SpeechStopped => self.dispatch(TurnInput::VoiceStopped {
                at: now,
                source: VoiceSource::Backend,
            }),
            BackendEvent::InputTranscript {
                text,
                confidence,
                is_final,
            } => {
                if is_final && !text.trim().is_empty() {
                    self.session.touch_inbound(now);
                    self.report.transcript.push(TranscriptLine {
                        speaker: Speaker::Caller,
                        text: text.trim().to_string(),
                        timestamp: Utc::now(),
                    });
                }
                self.dispatch(TurnInput::UserTranscript {
                    at: now,
                    text,
                    confidence,
                    is_final,
                });
            }
            BackendEvent::ResponseStarted { response_id } => {
                self.dispatch(TurnInput::ResponseStarted {
                    at: now,
                    response_id,
                });
            }
            BackendEvent::AudioChunk { response_id, pcm } => {
                if self.tracker.is_cancelled(&response_id) {
                    return;
                }
                self.dispatch(TurnInput::ResponseAudio {
                    at: now,
                    response_id,
                });
                let frames = self.downlink.push(&pcm);
                self.enqueue(frames);
            }
            BackendEvent::OutputTranscript {
                response_id,
                text,
                is_final,
            } => {
                if self.tracker.is_cancelled(&response_id) {
                    return;
                }
                let spoken = if is_final {
                    self.agent_text.remove(&response_id);
                    text
                } else {
                    let buffer = self.agent_text.entry(response_id.clone()).or_default();
                    buffer.push_str(&text);
                    buffer.clone()
                };
                self.closing.on_transcript(&response_id, &spoken);
                if is_final && !spoken.trim().is_empty() {
                    self.report.transcript.push(TranscriptLine {
                        speaker: Speaker::Agent,
                        text: spoken.trim().to_string(),
                        timestamp: Utc::now(),
                    });
                }
            }
            BackendEvent::AudioDone { response_id } => {
                if self.tracker.is_cancelled(&response_id) {
                    return;
                }
                let tail = self.downlink.finish();
                self.enqueue(tail);
                self.closing.on_audio_done(&response_id);
                self.dispatch(TurnInput::ResponseAudioDone {
                    at: now,
                    response_id,
                });
            }
            BackendEvent::ResponseDone {
                response_id,
                status,
            } => {
                self.agent_text.remove(&response_id);
                if status == ResponseStatus::Failed {
                    warn!(call_id = self.session.call_id, response_id, "response failed");
                }
                if self.tracker.is_cancelled(&response_id) {
                    debug!(call_id = self.session.call_id, response_id, "cancel acknowledged");
                    return;
                }
                let tail = self.downlink.finish();
                self.enqueue(tail);
                self.closing.on_response_done(&response_id);
                self.dispatch(TurnInput::ResponseDone {
                    at: now,
                    response_id,
                });
            }
            BackendEvent::CancelAck { response_id } => {
                debug!(call_id = self.session.call_id, ?response_id, "cancel acknowledged");
            }
            BackendEvent::FunctionCall {
                response_id,
                name,
                arguments,
            } => self.on_function_call(&response_id, name, arguments),
            BackendEvent::Error { code, message } => {
                warn!(call_id = self.session.call_id, ?code, "backend error: {}", message);
            }
            BackendEvent::Closed { .. } => {}
        }
    }

    fn on_function_call(&mut self, response_id: &str, name: String, arguments: serde_json::Value) {
        info!(call_id = self.session.call_id, response_id, name, "function call");
        if name == END_CALL_FUNCTION {
            self.closing.bind(response_id);
            return;
        }
        match arguments {
            serde_json::Value::Object(fields) => {
                for (key, value) in fields {
                    self.report.extracted_fields.insert(key, value);
                }
            }
            other => {
                self.report.extracted_fields.insert(name, other);
            }
        }
    }

    fn on_turn_input(&mut self, input: TurnInput) {
        if matches!(input, TurnInput::PlaybackDrained { .. }) && !self.queue.is_empty() {
            // new audio arrived after the pacer saw the queue empty
            return;
        }
        self.dispatch(input);
    }

    fn on_control(&mut self, control: CallControl) {
        match control {
            CallControl::Nudge { attempt } => {
                if self.tracker.state() == TurnState::AiSpeaking {
                    debug!(call_id = self.session.call_id, "ai speaking, nudge skipped");
                    return;
                }
                info!(call_id = self.session.call_id, attempt, "nudging silent caller");
                self.send_command(BackendCommand::CreateResponse {
                    instructions: Some(self.config.lifecycle.nudge_instructions.clone()),
                });
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        let decision = self.tracker.poll(now);
        self.apply(decision, now);

        if self.closing.poll(now, self.queue.is_empty()) {
            self.lifecycle.hangup(HangupReason::ClosingPhrase).await.ok();
            return;
        }
        if self.fallback_started && self.queue.is_empty() {
            self.lifecycle.hangup(HangupReason::BackendFailure).await.ok();
        }
    }

    fn dispatch(&mut self, input: TurnInput) {
        let at = input.at();
        let decision = self.tracker.handle(input);
        self.apply(decision, at);
    }

    fn apply(&mut self, decision: TurnDecision, at: Instant) {
        if let TurnDecision::Interrupt { response_id } = decision {
            info!(
                call_id = self.session.call_id,
                ?response_id,
                "caller barged in, cancelling response"
            );
            if let Some(id) = response_id.as_deref() {
                self.closing.on_cancelled(id);
                self.agent_text.remove(id);
            }
            self.send_command(BackendCommand::CancelResponse { response_id });
            let flushed = self.queue.flush();
            self.downlink.reset();
            debug!(call_id = self.session.call_id, flushed, "outbound queue flushed");
            self.tracker.interruption_applied(at);
        }
        self.session.set_turn_state(self.tracker.state());
        self.session
            .set_greeting_protected(self.tracker.greeting_protected());
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<BackendEvent>>) -> Option<BackendEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
