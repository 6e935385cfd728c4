use anyhow::Result;
use regex::Regex;
use tokio::time::{Duration, Instant};
use tracing::info;

/// Detects the AI saying goodbye and decides when that goodbye has fully
/// reached the caller.
///
/// A match binds to one response id. The call may close only after that
/// response's audio and the response itself are finished on the backend
/// side, the outbound queue is empty, and a short grace period has passed
/// for audio still buffered at the far end.
pub struct ClosingDetector {
    pattern: Option<Regex>,
    grace: Duration,
    bound: Option<String>,
    audio_done: bool,
    response_done: bool,
    drained_at: Option<Instant>,
}

impl ClosingDetector {
    pub fn new(phrases: &[String], grace: Duration) -> Result<Self> {
        let alternatives: Vec<String> = phrases
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(|p| regex::escape(p).replace(' ', r"\s+"))
            .collect();
        let pattern = if alternatives.is_empty() {
            None
        } else {
            Some(Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|")))?)
        };
        Ok(Self {
            pattern,
            grace,
            bound: None,
            audio_done: false,
            response_done: false,
            drained_at: None,
        })
    }

    pub fn bound_response(&self) -> Option<&str> {
        self.bound.as_deref()
    }

    /// Returns true when this transcript binds the detector.
    pub fn on_transcript(&mut self, response_id: &str, text: &str) -> bool {
        if self.bound.is_some() {
            return false;
        }
        let Some(pattern) = &self.pattern else {
            return false;
        };
        if !pattern.is_match(text) {
            return false;
        }
        info!(response_id, "closing phrase detected");
        self.bind(response_id)
    }

    /// Bind directly, e.g. when the backend asks to end the call.
    pub fn bind(&mut self, response_id: &str) -> bool {
        if self.bound.is_some() {
            return false;
        }
        self.bound = Some(response_id.to_string());
        self.audio_done = false;
        self.response_done = false;
        self.drained_at = None;
        true
    }

    pub fn on_audio_done(&mut self, response_id: &str) {
        if self.is_bound_to(response_id) {
            self.audio_done = true;
        }
    }

    pub fn on_response_done(&mut self, response_id: &str) {
        if self.is_bound_to(response_id) {
            self.audio_done = true;
            self.response_done = true;
        }
    }

    /// The goodbye was interrupted; the conversation continues.
    pub fn on_cancelled(&mut self, response_id: &str) {
        if self.is_bound_to(response_id) {
            info!(response_id, "closing response cancelled");
            self.bound = None;
            self.audio_done = false;
            self.response_done = false;
            self.drained_at = None;
        }
    }

    pub fn poll(&mut self, now: Instant, queue_empty: bool) -> bool {
        if self.bound.is_none() || !self.audio_done || !self.response_done {
            return false;
        }
        if !queue_empty {
            self.drained_at = None;
            return false;
        }
        let drained_at = *self.drained_at.get_or_insert(now);
        now.saturating_duration_since(drained_at) >= self.grace
    }

    fn is_bound_to(&self, response_id: &str) -> bool {
        self.bound.as_deref() == Some(response_id)
    }
}
