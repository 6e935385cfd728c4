use super::*;
use crate::backend::{mock::MockBackend, BackendCommand, BackendEvent, ResponseStatus};
use crate::media::vad::VadType;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::Instant;

#[derive(Default)]
struct CountingLeg {
    disconnects: AtomicU32,
}

#[async_trait]
impl lifecycle::LegControl for CountingLeg {
    async fn disconnect(&self, _call_id: &str, _reason: &HangupReason) -> anyhow::Result<()> {
        tokio::task::yield_now().await;
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
enum SinkEvent {
    Media(Bytes),
    Clear,
    Closed,
}

struct ChannelSink(mpsc::UnboundedSender<SinkEvent>);

#[async_trait]
impl MediaSink for ChannelSink {
    async fn send_media(&mut self, payload: Bytes) -> anyhow::Result<()> {
        self.0.send(SinkEvent::Media(payload)).ok();
        Ok(())
    }

    async fn send_clear(&mut self) -> anyhow::Result<()> {
        self.0.send(SinkEvent::Clear).ok();
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.0.send(SinkEvent::Closed).ok();
        Ok(())
    }
}

fn controller(direction: CallDirection) -> (Arc<LifecycleController>, Arc<CountingLeg>) {
    let session = Arc::new(CallSession::new(
        "call-1".to_string(),
        "tenant-1".to_string(),
        direction,
    ));
    let leg = Arc::new(CountingLeg::default());
    let lifecycle = Arc::new(LifecycleController::new(
        session,
        leg.clone(),
        CancellationToken::new(),
    ));
    (lifecycle, leg)
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.media.vad.r#type = VadType::Energy;
    config.backend.max_retries = 0;
    config
}

#[tokio::test]
async fn test_hangup_is_single_under_concurrent_triggers() {
    let (lifecycle, leg) = controller(CallDirection::Inbound);
    assert!(lifecycle.on_answered());

    let reasons = [
        HangupReason::ClosingPhrase,
        HangupReason::Silence,
        HangupReason::External(TelephonyStatus::Completed),
        HangupReason::StreamStopped,
        HangupReason::Api,
        HangupReason::Shutdown,
    ];
    let mut tasks = Vec::new();
    for reason in reasons {
        let lifecycle = lifecycle.clone();
        tasks.push(tokio::spawn(async move { lifecycle.hangup(reason).await }));
    }
    let mut issued = 0;
    for task in tasks {
        if task.await.unwrap().unwrap() {
            issued += 1;
        }
    }

    assert_eq!(issued, 1);
    assert_eq!(leg.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(lifecycle.state(), LifecycleState::Ended);
    assert!(lifecycle.token().is_cancelled());
    assert!(lifecycle.reason().is_some());
    assert!(!lifecycle.hangup(HangupReason::Api).await.unwrap());
}

#[tokio::test]
async fn test_busy_before_answer_fails_the_call() {
    let (lifecycle, leg) = controller(CallDirection::Outbound);
    assert_eq!(lifecycle.state(), LifecycleState::Dialing);

    lifecycle
        .on_external_status(TelephonyStatus::Ringing)
        .await
        .unwrap();
    assert_eq!(lifecycle.state(), LifecycleState::Ringing);

    assert!(lifecycle
        .on_external_status(TelephonyStatus::Busy)
        .await
        .unwrap());
    assert_eq!(lifecycle.state(), LifecycleState::Failed);
    assert_eq!(
        lifecycle.reason(),
        Some(HangupReason::External(TelephonyStatus::Busy))
    );
    assert_eq!(
        active_call::outcome_for(lifecycle.reason().as_ref()),
        CallOutcome::Busy
    );
    assert_eq!(leg.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_completed_after_answer_ends_the_call() {
    let (lifecycle, _) = controller(CallDirection::Inbound);
    lifecycle.on_answered();
    lifecycle
        .on_external_status(TelephonyStatus::Completed)
        .await
        .unwrap();
    assert_eq!(lifecycle.state(), LifecycleState::Ended);
    assert!(lifecycle.transition(LifecycleState::Active).is_err());
    assert!(!lifecycle.on_answered());
}

#[test]
fn test_transition_table() {
    use LifecycleState::*;
    assert!(Dialing.can_transition(Ringing));
    assert!(Ringing.can_transition(Active));
    assert!(Active.can_transition(Closing));
    assert!(Closing.can_transition(Ended));
    assert!(Active.can_transition(Failed));
    assert!(!Active.can_transition(Ringing));
    assert!(!Ended.can_transition(Failed));
    assert!(!Failed.can_transition(Active));
}

#[test]
fn test_status_parse() {
    assert_eq!(TelephonyStatus::parse("in-progress"), Some(TelephonyStatus::InProgress));
    assert_eq!(TelephonyStatus::parse("NO_ANSWER"), Some(TelephonyStatus::NoAnswer));
    assert_eq!(TelephonyStatus::parse("bogus"), None);
    assert!(TelephonyStatus::Busy.is_terminal());
    assert!(!TelephonyStatus::Ringing.is_terminal());
}

#[tokio::test(start_paused = true)]
async fn test_session_activity_timestamps() {
    let session = CallSession::new(
        "call-1".to_string(),
        "tenant-1".to_string(),
        CallDirection::Inbound,
    );
    assert_eq!(session.lifecycle_state(), LifecycleState::Ringing);
    assert!(session.last_activity().is_none());

    let start = Instant::now();
    session.touch_inbound(start);
    tokio::time::advance(Duration::from_millis(1500)).await;
    let later = Instant::now();
    session.touch_outbound(later);
    // older timestamps never move activity backwards
    session.touch_inbound(start);

    assert_eq!(session.last_inbound(), Some(start));
    assert_eq!(session.last_outbound(), Some(later));
    assert_eq!(session.last_activity(), Some(later));
    assert!(session.mark_media_started());
    assert!(!session.mark_media_started());
}

#[tokio::test(start_paused = true)]
async fn test_stream_runs_until_stopped() {
    let (backend, backend_ctl) = MockBackend::new();
    let (record_tx, mut record_rx) = mpsc::unbounded_channel();
    let manager = CallManager::new(Arc::new(test_config()), Arc::new(backend))
        .with_callrecord_sender(record_tx);
    let mut events = manager.subscribe();

    let handle = manager
        .attach(StreamStart {
            call_id: "call-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            caller: Some("+15550001".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert!(manager
        .attach(StreamStart {
            call_id: "call-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            ..Default::default()
        })
        .is_err());

    let (media_tx, media_rx) = mpsc::channel(64);
    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
    let runner = manager.clone();
    let run = tokio::spawn(async move {
        runner
            .run(handle, media_rx, ChannelSink(sink_tx))
            .await
    });

    let mut backend_session = backend_ctl.next_session().await.unwrap();
    assert_eq!(backend_session.call_id, "call-1");
    let greeting = backend_session.next_control().await.unwrap();
    assert!(matches!(greeting, BackendCommand::CreateResponse { .. }));
    backend_session.respond("resp-1", 5, 480).await;

    for _ in 0..5 {
        match sink_rx.recv().await {
            Some(SinkEvent::Media(payload)) => assert_eq!(payload.len(), 160),
            other => panic!("unexpected sink event {:?}", other),
        }
    }

    media_tx.send(TelephonyInput::Stop).await.unwrap();
    run.await.unwrap().unwrap();

    let record = record_rx.recv().await.unwrap();
    assert_eq!(record.call_id, "call-1");
    assert_eq!(record.caller.as_deref(), Some("+15550001"));
    assert_eq!(record.hangup_reason.as_deref(), Some("stream_stopped"));
    assert_eq!(record.outcome, CallOutcome::Completed);

    assert!(matches!(events.recv().await.unwrap(), CallEvent::Answered { .. }));
    match events.recv().await.unwrap() {
        CallEvent::Finished {
            call_id, answered, ..
        } => {
            assert_eq!(call_id, "call-1");
            assert!(answered);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(manager.registry().get("call-1").is_none());
}

#[tokio::test]
async fn test_status_ends_unattached_outbound_call() {
    let (backend, _ctl) = MockBackend::new();
    let (record_tx, mut record_rx) = mpsc::unbounded_channel();
    let manager = CallManager::new(Arc::new(test_config()), Arc::new(backend))
        .with_callrecord_sender(record_tx);
    let mut events = manager.subscribe();

    let handle = manager.prepare_outbound(
        "out-1".to_string(),
        "tenant-1".to_string(),
        Some("job-1".to_string()),
        None,
        Some("+15550002".to_string()),
    );
    assert_eq!(handle.session.lifecycle_state(), LifecycleState::Dialing);
    assert_eq!(manager.list().len(), 1);

    assert!(manager.on_status("out-1", TelephonyStatus::Busy).await.unwrap());
    assert_eq!(handle.session.lifecycle_state(), LifecycleState::Failed);
    assert!(!manager.on_status("out-1", TelephonyStatus::Busy).await.unwrap());

    let record = record_rx.recv().await.unwrap();
    assert_eq!(record.outcome, CallOutcome::Busy);
    assert_eq!(record.job_id.as_deref(), Some("job-1"));
    assert_eq!(
        events.recv().await.unwrap(),
        CallEvent::Finished {
            call_id: "out-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            job_id: Some("job-1".to_string()),
            outcome: CallOutcome::Busy,
            answered: false,
        }
    );
    assert!(manager.registry().get("out-1").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_dialed_call_times_out_without_stream() {
    let (backend, _ctl) = MockBackend::new();
    let manager = CallManager::new(Arc::new(test_config()), Arc::new(backend));
    let mut events = manager.subscribe();
    manager.prepare_outbound(
        "out-2".to_string(),
        "tenant-1".to_string(),
        Some("job-2".to_string()),
        None,
        None,
    );

    match events.recv().await.unwrap() {
        CallEvent::Finished {
            outcome, answered, ..
        } => {
            assert_eq!(outcome, CallOutcome::Failed);
            assert!(!answered);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(manager.registry().count(), 0);
}

#[tokio::test]
async fn test_api_hangup() {
    let (backend, _ctl) = MockBackend::new();
    let manager = CallManager::new(Arc::new(test_config()), Arc::new(backend));
    assert_eq!(manager.hangup("missing").await, None);

    manager.prepare_outbound(
        "out-3".to_string(),
        "tenant-1".to_string(),
        None,
        None,
        None,
    );
    assert_eq!(manager.hangup("out-3").await, Some(true));
    assert_eq!(manager.hangup("out-3").await, None);
}

struct LiveCall {
    backend: crate::backend::mock::MockBackendController,
    media_tx: mpsc::Sender<TelephonyInput>,
    sink_rx: mpsc::UnboundedReceiver<SinkEvent>,
    record_rx: mpsc::UnboundedReceiver<CallRecord>,
    run: tokio::task::JoinHandle<Result<()>>,
}

impl LiveCall {
    fn start(config: Config) -> Self {
        let (backend, backend_ctl) = MockBackend::new();
        let (record_tx, record_rx) = mpsc::unbounded_channel();
        let manager = CallManager::new(Arc::new(config), Arc::new(backend))
            .with_callrecord_sender(record_tx);
        let handle = manager
            .attach(StreamStart {
                call_id: "call-1".to_string(),
                tenant_id: "tenant-1".to_string(),
                ..Default::default()
            })
            .unwrap();
        let (media_tx, media_rx) = mpsc::channel(64);
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let run = tokio::spawn(async move {
            manager
                .run(handle, media_rx, ChannelSink(sink_tx))
                .await
        });
        Self {
            backend: backend_ctl,
            media_tx,
            sink_rx,
            record_rx,
            run,
        }
    }

    /// Next backend session, with its greeting request consumed.
    async fn greeted_session(&self) -> crate::backend::mock::MockSession {
        let mut session = self.backend.next_session().await.unwrap();
        let greeting = session.next_control().await.unwrap();
        assert!(matches!(greeting, BackendCommand::CreateResponse { .. }));
        session
    }

    async fn expect_media(&mut self, frames: usize) {
        let mut played = 0;
        while played < frames {
            match self.sink_rx.recv().await {
                Some(SinkEvent::Media(payload)) => {
                    assert_eq!(payload.len(), 160);
                    played += 1;
                }
                Some(SinkEvent::Clear) => {}
                other => panic!("unexpected sink event {:?}", other),
            }
        }
    }

    /// Wait for the call to end on its own and count what it played.
    async fn finish(mut self) -> (CallRecord, usize) {
        self.run.await.unwrap().unwrap();
        let mut played = 0;
        while let Some(event) = self.sink_rx.recv().await {
            if matches!(event, SinkEvent::Media(_)) {
                played += 1;
            }
        }
        (self.record_rx.recv().await.unwrap(), played)
    }
}

async fn say_goodbye(session: &crate::backend::mock::MockSession, status: ResponseStatus) {
    let response_id = "resp-bye".to_string();
    session
        .emit(BackendEvent::ResponseStarted {
            response_id: response_id.clone(),
        })
        .await;
    session
        .emit(BackendEvent::OutputTranscript {
            response_id: response_id.clone(),
            text: "Thanks for calling, goodbye!".to_string(),
            is_final: true,
        })
        .await;
    for _ in 0..3 {
        session
            .emit(BackendEvent::AudioChunk {
                response_id: response_id.clone(),
                pcm: vec![1000; 480],
            })
            .await;
    }
    session
        .emit(BackendEvent::AudioDone {
            response_id: response_id.clone(),
        })
        .await;
    session
        .emit(BackendEvent::ResponseDone {
            response_id,
            status,
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_backend_close_reconnects_mid_call() {
    let mut config = test_config();
    config.backend.max_retries = 2;
    let mut call = LiveCall::start(config);

    let first = call.greeted_session().await;
    first
        .emit(BackendEvent::Closed {
            reason: Some("server restart".to_string()),
        })
        .await;

    // a restored session does not greet again
    let second = call.backend.next_session().await.unwrap();
    assert_eq!(second.call_id, "call-1");
    second.respond("resp-2", 2, 480).await;
    call.expect_media(2).await;

    call.media_tx.send(TelephonyInput::Stop).await.unwrap();
    let (record, _) = call.finish().await;
    assert_eq!(record.hangup_reason.as_deref(), Some("stream_stopped"));
    assert_eq!(record.outcome, CallOutcome::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_failed_reconnect_plays_fallback_and_hangs_up() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sorry.wav");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 24000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for _ in 0..4800 {
        writer.write_sample(2000i16).unwrap();
    }
    writer.finalize().unwrap();

    let mut config = test_config();
    config.backend.max_retries = 2;
    config.backend.retry_backoff_ms = 100;
    config.backend.fallback_audio = Some(path.to_str().unwrap().to_string());
    let call = LiveCall::start(config);

    let first = call.greeted_session().await;
    // the first attempt and both retries are refused
    call.backend.fail_next(3);
    first.emit(BackendEvent::Closed { reason: None }).await;

    let (record, played) = call.finish().await;
    assert_eq!(record.hangup_reason.as_deref(), Some("backend_failure"));
    assert_eq!(record.outcome, CallOutcome::Failed);
    // 200ms of prompt is ten 20ms frames, all played before the hang-up
    assert_eq!(played, 10);
}

#[tokio::test(start_paused = true)]
async fn test_closing_phrase_hangs_up_after_playback() {
    let call = LiveCall::start(test_config());
    let session = call.greeted_session().await;
    say_goodbye(&session, ResponseStatus::Completed).await;

    let (record, played) = call.finish().await;
    assert_eq!(record.hangup_reason.as_deref(), Some("closing_phrase"));
    assert_eq!(record.outcome, CallOutcome::Completed);
    assert_eq!(played, 3);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_status_on_uncancelled_response_still_finishes_it() {
    // the backend may end a response as cancelled on its own; only
    // responses the call cancelled are treated as acknowledgements
    let call = LiveCall::start(test_config());
    let session = call.greeted_session().await;
    say_goodbye(&session, ResponseStatus::Cancelled).await;

    let (record, played) = call.finish().await;
    assert_eq!(record.hangup_reason.as_deref(), Some("closing_phrase"));
    assert_eq!(played, 3);
}
