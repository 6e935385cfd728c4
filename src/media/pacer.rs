//! Real-time egress: one frame per `ptime`, no matter how fast or slow the
//! backend produces audio.
use super::{queue::OutboundFrameQueue, transport::Egress};
use crate::call::session::CallSession;
use crate::turn::TurnInput;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Frames the pacer may fall behind before it gives up catching up.
const MAX_LAG_FRAMES: u32 = 5;

/// Write side of the telephony leg. Owned exclusively by the pacer.
#[async_trait]
pub trait MediaSink: Send {
    async fn send_media(&mut self, payload: Bytes) -> Result<()>;
    /// Ask the far end to discard audio it has buffered but not played.
    async fn send_clear(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PacerStats {
    pub frames_sent: u64,
    pub blocked_writes: u64,
    pub resyncs: u64,
    pub clears: u64,
}

pub struct EgressPacer {
    queue: Arc<OutboundFrameQueue>,
    egress: Egress,
    session: Arc<CallSession>,
    ptime: Duration,
    blocked_threshold: Duration,
    turn_sender: Option<mpsc::Sender<TurnInput>>,
}

impl EgressPacer {
    pub fn new(
        queue: Arc<OutboundFrameQueue>,
        egress: Egress,
        session: Arc<CallSession>,
        ptime: Duration,
    ) -> Self {
        Self {
            queue,
            egress,
            session,
            ptime,
            blocked_threshold: Duration::from_millis(10),
            turn_sender: None,
        }
    }

    pub fn with_blocked_threshold(mut self, threshold: Duration) -> Self {
        self.blocked_threshold = threshold;
        self
    }

    /// Where to report that queued playback has fully drained.
    pub fn with_turn_sender(mut self, sender: mpsc::Sender<TurnInput>) -> Self {
        self.turn_sender = Some(sender);
        self
    }

    pub async fn serve<S: MediaSink>(
        mut self,
        token: CancellationToken,
        mut sink: S,
    ) -> Result<PacerStats> {
        let mut stats = PacerStats::default();
        let mut playing = false;
        let max_lag = self.ptime * MAX_LAG_FRAMES;
        let codec = self.egress.codec().name();
        let mut deadline = Instant::now() + self.ptime;

        info!(call_id = self.session.call_id, ptime = ?self.ptime, "egress pacer started");
        let result = loop {
            tokio::select! {
                _ = token.cancelled() => break Ok(()),
                _ = sleep_until(deadline) => {}
            }
            let now = Instant::now();
            if now.saturating_duration_since(deadline) > max_lag {
                debug!(
                    call_id = self.session.call_id,
                    lag_ms = now.duration_since(deadline).as_millis() as u64,
                    "pacer fell behind, resyncing"
                );
                deadline = now;
                stats.resyncs += 1;
                crate::metrics::media::pacer_resync();
            }
            deadline += self.ptime;

            if self.queue.take_clear_request() {
                if let Err(e) = self.timed_write(&mut stats, sink.send_clear()).await {
                    break Err(e);
                }
                stats.clears += 1;
            }

            let Some(frame) = self.queue.pop() else {
                if playing {
                    playing = false;
                    self.notify_drained(now);
                }
                continue;
            };

            let payload = self.egress.egress(&frame);
            if let Err(e) = self.timed_write(&mut stats, sink.send_media(payload)).await {
                break Err(e);
            }
            stats.frames_sent += 1;
            crate::metrics::media::frames_sent(codec);
            playing = true;
            self.session.touch_outbound(Instant::now());
            if self.session.mark_media_started() {
                debug!(call_id = self.session.call_id, "first outbound frame sent");
            }
        };

        sink.close().await.ok();
        info!(
            call_id = self.session.call_id,
            frames_sent = stats.frames_sent,
            blocked_writes = stats.blocked_writes,
            resyncs = stats.resyncs,
            "egress pacer stopped"
        );
        result.map(|_| stats)
    }

    async fn timed_write<F>(&self, stats: &mut PacerStats, write: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        let started = Instant::now();
        let result = write.await;
        let elapsed = started.elapsed();
        if elapsed > self.blocked_threshold {
            stats.blocked_writes += 1;
            crate::metrics::media::blocked_write(elapsed.as_secs_f64());
            warn!(
                call_id = self.session.call_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "telephony write blocked the pacer"
            );
        }
        if let Err(e) = &result {
            warn!(call_id = self.session.call_id, "telephony write failed: {}", e);
        }
        result
    }

    fn notify_drained(&self, at: Instant) {
        let Some(sender) = &self.turn_sender else {
            return;
        };
        // never wait on the conversation task from here
        if sender.try_send(TurnInput::PlaybackDrained { at }).is_err() {
            crate::metrics::media::ingress_backpressure("playback_drained");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::transport::{FrameTransport, TransportConfig};
    use crate::{AudioFrame, CallDirection};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<(Instant, Bytes)>>>,
        clears: Arc<Mutex<u32>>,
        write_delay: Option<Duration>,
    }

    #[async_trait]
    impl MediaSink for RecordingSink {
        async fn send_media(&mut self, payload: Bytes) -> Result<()> {
            if let Some(delay) = self.write_delay {
                tokio::time::sleep(delay).await;
            }
            self.sent.lock().unwrap().push((Instant::now(), payload));
            Ok(())
        }

        async fn send_clear(&mut self) -> Result<()> {
            *self.clears.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn setup(queue_len: u64) -> (Arc<OutboundFrameQueue>, EgressPacer) {
        let transport = FrameTransport::new(TransportConfig::default());
        let queue = Arc::new(OutboundFrameQueue::new(250, 0.6));
        for seq in 0..queue_len {
            queue.push(AudioFrame::new(vec![0; 160], seq * 20, 8000));
        }
        let session = Arc::new(CallSession::new(
            "call-1".to_string(),
            "tenant-1".to_string(),
            CallDirection::Inbound,
        ));
        let pacer = EgressPacer::new(
            queue.clone(),
            transport.egress(),
            session,
            Duration::from_millis(20),
        );
        (queue, pacer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_frame_per_interval() {
        let (queue, pacer) = setup(50);
        let sink = RecordingSink::default();
        let sent = sink.sent.clone();
        let token = CancellationToken::new();
        let handle = tokio::spawn(pacer.serve(token.clone(), sink));

        tokio::time::sleep(Duration::from_millis(210)).await;
        let count = sent.lock().unwrap().len();
        assert_eq!(count, 10);
        assert_eq!(queue.len(), 40);

        let times: Vec<Instant> = sent.lock().unwrap().iter().map(|(t, _)| *t).collect();
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_millis(20));
        }
        token.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.frames_sent, 10);
        assert_eq!(stats.blocked_writes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_write_is_counted() {
        let (_queue, pacer) = setup(3);
        let sink = RecordingSink {
            write_delay: Some(Duration::from_millis(15)),
            ..Default::default()
        };
        let token = CancellationToken::new();
        let handle = tokio::spawn(pacer.serve(token.clone(), sink));
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.frames_sent, 3);
        assert_eq!(stats.blocked_writes, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_sends_clear_and_reports_drain() {
        let (queue, pacer) = setup(20);
        let (turn_tx, mut turn_rx) = mpsc::channel(8);
        let pacer = pacer.with_turn_sender(turn_tx);
        let sink = RecordingSink::default();
        let clears = sink.clears.clone();
        let token = CancellationToken::new();
        let handle = tokio::spawn(pacer.serve(token.clone(), sink));

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.flush();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*clears.lock().unwrap(), 1);
        assert!(matches!(
            turn_rx.try_recv(),
            Ok(TurnInput::PlaybackDrained { .. })
        ));
        token.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.clears, 1);
        assert!(stats.frames_sent < 20);
    }
}
