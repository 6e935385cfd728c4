mod common;

use common::{loud_frame, next_media, test_config, ChannelSink, SinkEvent};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::Instant};
use voicebridge::{
    backend::{mock::MockBackend, BackendCommand, BackendEvent},
    call::{CallManager, StreamStart, TelephonyInput},
    callrecord::Speaker,
};

#[tokio::test]
async fn test_barge_in_cancels_response_and_flushes_playback() {
    let config = test_config();
    let debounce = Duration::from_millis(config.turn.debounce_ms);
    let echo_guard = Duration::from_millis(config.turn.echo_guard_ms);
    let (backend, controller) = MockBackend::new();
    let (record_tx, mut record_rx) = mpsc::unbounded_channel();
    let manager =
        CallManager::new(Arc::new(config), Arc::new(backend)).with_callrecord_sender(record_tx);

    let handle = manager
        .attach(StreamStart {
            call_id: "barge-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            ..Default::default()
        })
        .unwrap();
    let (media_tx, media_rx) = mpsc::channel(256);
    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
    let runner = manager.clone();
    let run =
        tokio::spawn(async move { runner.run(handle, media_rx, ChannelSink(sink_tx)).await });

    let mut backend_session = controller.next_session().await.unwrap();
    assert!(matches!(
        backend_session.next_control().await,
        Some(BackendCommand::CreateResponse { .. })
    ));
    backend_session.respond("greeting", 5, 480).await;
    for _ in 0..5 {
        next_media(&mut sink_rx).await;
    }
    for _ in 0..100 {
        if !manager.list()[0].greeting_protected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!manager.list()[0].greeting_protected);
    tokio::time::sleep(echo_guard + Duration::from_millis(100)).await;

    // a three second answer starts playing
    backend_session
        .emit(BackendEvent::ResponseStarted {
            response_id: "resp-2".to_string(),
        })
        .await;
    for _ in 0..150 {
        backend_session
            .emit(BackendEvent::AudioChunk {
                response_id: "resp-2".to_string(),
                pcm: vec![1000; 480],
            })
            .await;
    }
    for _ in 0..3 {
        next_media(&mut sink_rx).await;
    }

    // "hold on", loud, for 700ms
    let frame = loud_frame();
    for _ in 0..35 {
        media_tx
            .send(TelephonyInput::Media(frame.clone()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let spoken_at = Instant::now();
    backend_session
        .emit(BackendEvent::InputTranscript {
            text: "hold on".to_string(),
            confidence: Some(0.95),
            is_final: true,
        })
        .await;

    let cancel = tokio::time::timeout(debounce, backend_session.next_control())
        .await
        .expect("response not cancelled in time");
    assert_eq!(
        cancel,
        Some(BackendCommand::CancelResponse {
            response_id: Some("resp-2".to_string())
        })
    );
    loop {
        let event = tokio::time::timeout(debounce, sink_rx.recv())
            .await
            .expect("playback not cleared in time");
        if event == Some(SinkEvent::Clear) {
            break;
        }
    }
    assert!(spoken_at.elapsed() < debounce);

    // audio of the cancelled response still in flight is dropped
    for _ in 0..10 {
        backend_session
            .emit(BackendEvent::AudioChunk {
                response_id: "resp-2".to_string(),
                pcm: vec![1000; 480],
            })
            .await;
    }
    backend_session.respond("resp-3", 3, 480).await;
    let mut frames = 0;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(300), sink_rx.recv()).await
    {
        if matches!(event, SinkEvent::Media(_)) {
            frames += 1;
        }
    }
    assert_eq!(frames, 3);

    media_tx.send(TelephonyInput::Stop).await.unwrap();
    run.await.unwrap().unwrap();
    let record = record_rx.recv().await.unwrap();
    assert_eq!(record.interruptions, 1);
    assert!(record
        .transcript
        .iter()
        .any(|line| line.speaker == Speaker::Caller && line.text == "hold on"));
}
