use crate::AudioFrame;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Result of enqueueing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// Older frames discarded to make room
    pub dropped: usize,
    pub len: usize,
}

/// Bounded FIFO between the response router and the egress pacer.
///
/// Invariants: `len() <= capacity()` after every call, and the frame passed
/// to `push` is always retained. On overflow the oldest frames are dropped
/// until the queue is back at the watermark.
pub struct OutboundFrameQueue {
    frames: Mutex<VecDeque<AudioFrame>>,
    capacity: usize,
    watermark: usize,
    clear_requested: AtomicBool,
    dropped_total: AtomicU64,
}

impl OutboundFrameQueue {
    pub fn new(capacity: usize, watermark_ratio: f32) -> Self {
        let capacity = capacity.max(1);
        let watermark = ((capacity as f32 * watermark_ratio.clamp(0.0, 1.0)) as usize)
            .min(capacity - 1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            watermark,
            clear_requested: AtomicBool::new(false),
            dropped_total: AtomicU64::new(0),
        }
    }

    pub fn push(&self, frame: AudioFrame) -> PushOutcome {
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        let mut dropped = 0;
        if frames.len() >= self.capacity {
            while frames.len() > self.watermark {
                frames.pop_front();
                dropped += 1;
            }
        }
        frames.push_back(frame);
        let len = frames.len();
        drop(frames);

        if dropped > 0 {
            self.dropped_total
                .fetch_add(dropped as u64, Ordering::Relaxed);
            crate::metrics::media::queue_dropped(dropped);
        }
        PushOutcome { dropped, len }
    }

    pub fn pop(&self) -> Option<AudioFrame> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Discard everything buffered and ask the pacer to clear the far end.
    pub fn flush(&self) -> usize {
        let flushed = {
            let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
            let n = frames.len();
            frames.clear();
            n
        };
        self.clear_requested.store(true, Ordering::Release);
        crate::metrics::media::queue_flushed(flushed);
        flushed
    }

    pub fn take_clear_request(&self) -> bool {
        self.clear_requested.swap(false, Ordering::AcqRel)
    }

    pub fn len(&self) -> usize {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn watermark(&self) -> usize {
        self.watermark
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}
