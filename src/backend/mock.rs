//! In-process backend driven by the caller, for tests and local demos.
use super::{
    AiBackend, BackendCommand, BackendConnection, BackendError, BackendEvent,
    BackendSessionOption, COMMAND_CHANNEL_SIZE, EVENT_CHANNEL_SIZE,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// The far side of one mock connection.
pub struct MockSession {
    pub call_id: String,
    pub events: mpsc::Sender<BackendEvent>,
    pub commands: mpsc::Receiver<BackendCommand>,
}

impl MockSession {
    pub async fn emit(&self, event: BackendEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Next command other than audio appends.
    pub async fn next_control(&mut self) -> Option<BackendCommand> {
        while let Some(command) = self.commands.recv().await {
            if !matches!(command, BackendCommand::AppendAudio(_)) {
                return Some(command);
            }
        }
        None
    }

    /// Emit a complete response with `chunks` chunks of `chunk_samples` samples.
    pub async fn respond(&self, response_id: &str, chunks: usize, chunk_samples: usize) {
        self.emit(BackendEvent::ResponseStarted {
            response_id: response_id.to_string(),
        })
        .await;
        for _ in 0..chunks {
            self.emit(BackendEvent::AudioChunk {
                response_id: response_id.to_string(),
                pcm: vec![1000; chunk_samples],
            })
            .await;
        }
        self.emit(BackendEvent::AudioDone {
            response_id: response_id.to_string(),
        })
        .await;
        self.emit(BackendEvent::ResponseDone {
            response_id: response_id.to_string(),
            status: super::ResponseStatus::Completed,
        })
        .await;
    }
}

#[derive(Clone)]
pub struct MockBackend {
    sessions: mpsc::UnboundedSender<MockSession>,
    failures: Arc<AtomicU32>,
}

pub struct MockBackendController {
    sessions: Mutex<mpsc::UnboundedReceiver<MockSession>>,
    failures: Arc<AtomicU32>,
}

impl MockBackend {
    pub fn new() -> (Self, MockBackendController) {
        let (tx, rx) = mpsc::unbounded_channel();
        let failures = Arc::new(AtomicU32::new(0));
        (
            Self {
                sessions: tx,
                failures: failures.clone(),
            },
            MockBackendController {
                sessions: Mutex::new(rx),
                failures,
            },
        )
    }
}

impl MockBackendController {
    pub async fn next_session(&self) -> Option<MockSession> {
        self.sessions.lock().await.recv().await
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl AiBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(
        &self,
        option: &BackendSessionOption,
    ) -> Result<BackendConnection, BackendError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BackendError::Connect("mock connect refused".to_string()));
        }
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        self.sessions
            .send(MockSession {
                call_id: option.call_id.clone(),
                events: event_tx,
                commands: command_rx,
            })
            .map_err(|_| BackendError::Closed)?;
        Ok(BackendConnection {
            commands: command_tx,
            events: event_rx,
        })
    }
}
