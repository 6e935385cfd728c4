use super::{
    conversation::{CallControl, Conversation, ConversationReport, UplinkReceiver},
    lifecycle::{HangupReason, LifecycleController, LifecycleState},
    registry::CallHandle,
    session::CallSessionRef,
    watchdog::{SilenceWatchdog, WatchdogAction},
};
use crate::{
    backend::{connect_with_retry, AiBackend, BackendCommand, BackendSessionOption},
    callrecord::{CallOutcome, CallRecord},
    config::Config,
    media::{
        pacer::{EgressPacer, MediaSink},
        queue::OutboundFrameQueue,
        transport::{FrameTransport, Ingress, TransportConfig},
        vad::{create_vad_engine, VoiceDetector, VoiceEvent},
    },
    turn::{TurnInput, VoiceSource},
};
use anyhow::Result;
use bytes::Bytes;
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::{
    join, select,
    sync::{mpsc, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TURN_CHANNEL_SIZE: usize = 512;
const CONTROL_CHANNEL_SIZE: usize = 8;

/// What the telephony websocket delivers once the stream has started.
#[derive(Debug, Clone, PartialEq)]
pub enum TelephonyInput {
    /// One encoded media payload
    Media(Bytes),
    Stop,
}

pub struct ActiveCall {
    handle: CallHandle,
    config: Arc<Config>,
    backend: Arc<dyn AiBackend>,
    transport: FrameTransport,
    queue: Arc<OutboundFrameQueue>,
}

impl ActiveCall {
    pub fn new(handle: CallHandle, config: Arc<Config>, backend: Arc<dyn AiBackend>) -> Self {
        let queue = Arc::new(OutboundFrameQueue::new(
            config.media.queue_capacity,
            config.media.overflow_watermark,
        ));
        Self {
            transport: FrameTransport::new(TransportConfig::from(&config.media)),
            handle,
            config,
            backend,
            queue,
        }
    }

    pub fn session(&self) -> &CallSessionRef {
        &self.handle.session
    }

    pub fn queue(&self) -> &Arc<OutboundFrameQueue> {
        &self.queue
    }

    /// Run the call until it is hung up, then return its record.
    pub async fn serve<S: MediaSink + 'static>(
        self,
        media_rx: mpsc::Receiver<TelephonyInput>,
        sink: S,
    ) -> Result<CallRecord> {
        let session = self.handle.session.clone();
        let lifecycle = self.handle.lifecycle.clone();
        let token = lifecycle.token().clone();
        let start_time = Utc::now();

        lifecycle.on_answered();
        crate::metrics::call::started(&session.direction.to_string());
        info!(
            call_id = session.call_id,
            tenant_id = session.tenant_id,
            direction = %session.direction,
            codec = self.transport.config().codec.name(),
            "call media started"
        );

        let detector = VoiceDetector::new(
            create_vad_engine(
                &self.config.media.vad,
                self.transport.config().telephony_sample_rate,
            )?,
            self.config.media.vad.clone(),
        );
        let downlink = self.transport.downlink()?;
        let ingress = self.transport.ingress()?;
        let (turn_tx, turn_rx) = mpsc::channel(TURN_CHANNEL_SIZE);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_SIZE);
        let (uplink_tx, uplink_rx) = watch::channel(None);
        let option = BackendSessionOption {
            call_id: session.call_id.clone(),
            instructions: self.config.backend.instructions.clone(),
            voice: self.config.backend.voice.clone(),
            sample_rate: self.transport.config().backend_sample_rate,
            transcription_model: self.config.backend.transcription_model.clone(),
        };
        let conversation = Conversation::new(
            session.clone(),
            lifecycle.clone(),
            self.config.clone(),
            self.backend.clone(),
            option.clone(),
            self.queue.clone(),
            downlink,
            uplink_tx,
        )?;

        let pacer = EgressPacer::new(
            self.queue.clone(),
            self.transport.egress(),
            session.clone(),
            self.config.media.ptime(),
        )
        .with_blocked_threshold(Duration::from_millis(
            self.config.media.blocked_write_threshold_ms,
        ))
        .with_turn_sender(turn_tx.clone());
        let pacer_handle = tokio::spawn(pacer.serve(token.clone(), sink));

        let ingress_handle = tokio::spawn(ingress_loop(
            session.clone(),
            lifecycle.clone(),
            token.clone(),
            ingress,
            detector,
            media_rx,
            turn_tx,
            uplink_rx,
        ));

        let connection = connect_with_retry(
            self.backend.as_ref(),
            &option,
            self.config.backend.max_retries,
            Duration::from_millis(self.config.backend.retry_backoff_ms),
        )
        .await;
        let (commands, events) = match connection {
            Ok(connection) => (Some(connection.commands), Some(connection.events)),
            Err(e) => {
                warn!(call_id = session.call_id, "backend connect failed: {}", e);
                (None, None)
            }
        };

        let (report, nudges) = join!(
            conversation.serve(token.clone(), events, commands, turn_rx, control_rx),
            lifecycle_monitor(
                session.clone(),
                lifecycle.clone(),
                self.config.clone(),
                token.clone(),
                control_tx,
            ),
        );

        if let Err(e) = ingress_handle.await {
            warn!(call_id = session.call_id, "ingress task failed: {}", e);
        }
        match pacer_handle.await {
            Ok(Ok(stats)) => debug!(call_id = session.call_id, ?stats, "pacer finished"),
            Ok(Err(e)) => warn!(call_id = session.call_id, "pacer stopped on error: {}", e),
            Err(e) => warn!(call_id = session.call_id, "pacer task failed: {}", e),
        }

        let record = build_record(&self.handle, start_time, report, nudges);
        info!(
            call_id = session.call_id,
            outcome = ?record.outcome,
            hangup_reason = ?record.hangup_reason,
            duration_secs = record.duration_secs,
            interruptions = record.interruptions,
            nudges = record.nudges,
            "call finished"
        );
        Ok(record)
    }
}

#[allow(clippy::too_many_arguments)]
async fn ingress_loop(
    session: CallSessionRef,
    lifecycle: Arc<LifecycleController>,
    token: CancellationToken,
    mut ingress: Ingress,
    mut detector: VoiceDetector,
    mut media_rx: mpsc::Receiver<TelephonyInput>,
    turn_tx: mpsc::Sender<TurnInput>,
    uplink: UplinkReceiver,
) {
    loop {
        let input = select! {
            _ = token.cancelled() => break,
            input = media_rx.recv() => input,
        };
        let raw = match input {
            Some(TelephonyInput::Media(raw)) => raw,
            Some(TelephonyInput::Stop) | None => {
                info!(call_id = session.call_id, "telephony stream stopped");
                lifecycle.hangup(HangupReason::StreamStopped).await.ok();
                break;
            }
        };
        let now = Instant::now();
        for frame in ingress.ingress(&raw) {
            let analysis = detector.process(&frame);
            if analysis.is_voice {
                session.touch_inbound(now);
            }
            if let Some(event) = analysis.event {
                let edge = match event {
                    VoiceEvent::Started { .. } => TurnInput::VoiceStarted {
                        at: now,
                        source: VoiceSource::Local,
                    },
                    VoiceEvent::Stopped { .. } => TurnInput::VoiceStopped {
                        at: now,
                        source: VoiceSource::Local,
                    },
                };
                forward(&turn_tx, edge, "voice_edge");
            }
            forward(
                &turn_tx,
                TurnInput::VoiceFrame {
                    at: now,
                    energy_db: analysis.energy_db,
                    is_voice: analysis.is_voice,
                },
                "voice_frame",
            );

            let pcm = ingress.uplink(&frame);
            if let Some(commands) = uplink.borrow().as_ref() {
                if commands.try_send(BackendCommand::AppendAudio(pcm)).is_err() {
                    crate::metrics::media::ingress_backpressure("uplink");
                }
            }
        }
    }
    debug!(call_id = session.call_id, "ingress loop done");
}

fn forward(turn_tx: &mpsc::Sender<TurnInput>, input: TurnInput, kind: &str) {
    if turn_tx.try_send(input).is_err() {
        crate::metrics::media::ingress_backpressure(kind);
    }
}

/// Silence watchdog. Armed once the call is active; owns no media.
async fn lifecycle_monitor(
    session: CallSessionRef,
    lifecycle: Arc<LifecycleController>,
    config: Arc<Config>,
    token: CancellationToken,
    control_tx: mpsc::Sender<CallControl>,
) -> u32 {
    let settings = &config.lifecycle;
    let mut watchdog = SilenceWatchdog::new(
        Duration::from_secs(settings.silence_timeout_secs),
        settings.max_nudges,
        Duration::from_secs(settings.nudge_cooldown_secs),
    );
    let mut ticker =
        tokio::time::interval(Duration::from_millis(settings.poll_interval_ms.max(10)));
    let mut nudges = 0;

    loop {
        select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now = Instant::now();
        if !watchdog.is_armed() {
            if lifecycle.state() == LifecycleState::Active {
                watchdog.arm(now);
                debug!(call_id = session.call_id, "silence watchdog armed");
            }
            continue;
        }
        match watchdog.poll(now, session.last_inbound(), session.last_outbound()) {
            WatchdogAction::Idle => {}
            WatchdogAction::Nudge { attempt } => {
                nudges += 1;
                crate::metrics::call::nudge();
                info!(call_id = session.call_id, attempt, "caller silent, nudging");
                if control_tx.try_send(CallControl::Nudge { attempt }).is_err() {
                    warn!(call_id = session.call_id, "nudge request dropped");
                }
            }
            WatchdogAction::Disconnect => {
                info!(call_id = session.call_id, "caller silent after nudges, disconnecting");
                lifecycle.hangup(HangupReason::Silence).await.ok();
                break;
            }
        }
    }
    nudges
}

pub fn outcome_for(reason: Option<&HangupReason>) -> CallOutcome {
    use super::lifecycle::TelephonyStatus;
    match reason {
        Some(HangupReason::External(TelephonyStatus::Busy)) => CallOutcome::Busy,
        Some(HangupReason::External(TelephonyStatus::NoAnswer)) => CallOutcome::NoAnswer,
        Some(HangupReason::External(TelephonyStatus::Failed)) => CallOutcome::Failed,
        Some(HangupReason::External(TelephonyStatus::Canceled)) => CallOutcome::Canceled,
        Some(HangupReason::StartTimeout)
        | Some(HangupReason::BackendFailure)
        | Some(HangupReason::Internal)
        | Some(HangupReason::DialFailed) => CallOutcome::Failed,
        _ => CallOutcome::Completed,
    }
}

/// Record for a call; `report` is empty when no media ever flowed.
pub fn build_record(
    handle: &CallHandle,
    start_time: chrono::DateTime<Utc>,
    report: ConversationReport,
    nudges: u32,
) -> CallRecord {
    let session = &handle.session;
    let reason = handle.lifecycle.reason();
    let end_time = Utc::now();
    CallRecord {
        tenant_id: session.tenant_id.clone(),
        call_id: session.call_id.clone(),
        direction: session.direction,
        caller: session.caller.clone(),
        callee: session.callee.clone(),
        job_id: session.job_id.clone(),
        transcript: report.transcript,
        summary: None,
        extracted_fields: report.extracted_fields,
        start_time,
        end_time,
        duration_secs: (end_time - start_time).num_seconds().max(0) as u64,
        outcome: outcome_for(reason.as_ref()),
        hangup_reason: reason.as_ref().map(|r| r.as_str().to_string()),
        interruptions: report.interruptions,
        nudges,
    }
}
